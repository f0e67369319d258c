use crate::models::agent::ToolUsage;
use crate::utils::{digits_only, norm_for_match};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

/// Minimum fuzzy title similarity that contributes to the match score.
const TITLE_RATIO_FLOOR: f64 = 0.55;
/// Raw/card `created_at` values closer than this count as the same event.
const CLOSE_CREATED_AT_SECS: i64 = 600;

struct RawTask {
    usage: ToolUsage,
    parsed: serde_json::Value,
    norm_title: String,
    start_digits: String,
}

fn parse_raw_calendar(usage: &ToolUsage) -> Option<serde_json::Value> {
    if usage.kind.to_lowercase() != "calendar" {
        return None;
    }
    let parsed: serde_json::Value = serde_json::from_str(&usage.text).ok()?;
    parsed.get("task_id")?.as_str()?;
    Some(parsed)
}

fn close_in_time(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_seconds().abs() <= CLOSE_CREATED_AT_SECS
}

fn match_score(task: &RawTask, card_title: &str, card_digits: &str, card_created: DateTime<Utc>) -> f64 {
    let mut score = 0.0;

    if !task.norm_title.is_empty() && !card_title.is_empty() {
        if task.norm_title == card_title
            || task.norm_title.contains(card_title)
            || card_title.contains(&task.norm_title)
        {
            score += 0.6;
        }

        let ratio = strsim::normalized_levenshtein(&task.norm_title, card_title);
        if ratio > TITLE_RATIO_FLOOR {
            score += ratio * 0.5;
        }
    }

    if !task.start_digits.is_empty() && card_digits.contains(&task.start_digits) {
        score += 0.5;
    }

    if close_in_time(task.usage.created_at, card_created) {
        score += 0.25;
    }

    score
}

fn card_from_task(task: &RawTask) -> ToolUsage {
    let parsed = &task.parsed;
    let task_id = parsed.get("task_id").and_then(|v| v.as_str()).unwrap_or_default();
    let title = parsed
        .get("title")
        .or_else(|| parsed.get("task_title"))
        .and_then(|v| v.as_str())
        .filter(|t| !t.is_empty())
        .unwrap_or("calendar_event");
    let text = parsed
        .get("start")
        .or_else(|| parsed.get("date"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| parsed.to_string());

    ToolUsage {
        id: format!("cal_{}", task_id),
        tool: "calendar".to_string(),
        kind: "calendar".to_string(),
        icon: task.usage.icon.clone(),
        title: title.to_string(),
        text,
        created_at: task.usage.created_at,
    }
}

/// Fuses raw calendar tool results (JSON payloads carrying `task_id`) with
/// the human-readable cards the agent produced for the same events.
///
/// A card absorbs a raw task when their combined title / date-digit /
/// recency score reaches `accept_threshold`; raw tasks nobody claimed
/// surface as cards of their own. Non-calendar entries pass through
/// untouched.
pub fn merge_calendar_tools(tools: Vec<ToolUsage>, accept_threshold: f64) -> Vec<ToolUsage> {
    let mut raw_tasks: HashMap<String, RawTask> = HashMap::new();
    let mut raw_order: Vec<String> = Vec::new();
    let mut others: Vec<ToolUsage> = Vec::new();

    for usage in tools {
        match parse_raw_calendar(&usage) {
            Some(parsed) => {
                let task_id = parsed["task_id"].as_str().unwrap_or_default().to_string();
                let norm_title = norm_for_match(
                    parsed
                        .get("title")
                        .or_else(|| parsed.get("task_title"))
                        .and_then(|v| v.as_str())
                        .unwrap_or(&usage.title),
                );
                let start_digits = digits_only(
                    parsed
                        .get("start")
                        .or_else(|| parsed.get("date"))
                        .or_else(|| parsed.get("time"))
                        .and_then(|v| v.as_str())
                        .unwrap_or_default(),
                );
                if !raw_tasks.contains_key(&task_id) {
                    raw_order.push(task_id.clone());
                }
                raw_tasks.insert(
                    task_id,
                    RawTask {
                        usage,
                        parsed,
                        norm_title,
                        start_digits,
                    },
                );
            }
            None => others.push(usage),
        }
    }

    let mut used: HashSet<String> = HashSet::new();
    let mut merged: Vec<ToolUsage> = Vec::new();

    for card in others {
        if card.kind.to_lowercase() != "calendar" {
            merged.push(card);
            continue;
        }

        let card_title = norm_for_match(&card.title);
        let card_digits = digits_only(&format!("{}{}", card.text, card.title));

        let best = raw_order
            .iter()
            .filter(|tid| !used.contains(*tid))
            .filter_map(|tid| raw_tasks.get(tid).map(|t| (tid, t)))
            .map(|(tid, task)| {
                (tid.clone(), match_score(task, &card_title, &card_digits, card.created_at))
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((task_id, score)) if score >= accept_threshold => {
                used.insert(task_id.clone());
                let task = &raw_tasks[&task_id];
                let fallback = card_from_task(task);
                merged.push(ToolUsage {
                    id: format!("cal_{}", task_id),
                    tool: "calendar".to_string(),
                    kind: "calendar".to_string(),
                    icon: task.usage.icon.clone().or(card.icon.clone()),
                    title: if card.title.trim().is_empty() {
                        fallback.title
                    } else {
                        card.title.clone()
                    },
                    text: if card.text.trim().is_empty() {
                        fallback.text
                    } else {
                        card.text.clone()
                    },
                    created_at: task.usage.created_at,
                });
            }
            _ => merged.push(card),
        }
    }

    // unmatched raw tasks surface as cards of their own
    for task_id in &raw_order {
        if used.contains(task_id) {
            continue;
        }
        merged.push(card_from_task(&raw_tasks[task_id]));
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(kind: &str, title: &str, text: &str) -> ToolUsage {
        ToolUsage {
            id: format!("t_{}", title.to_lowercase()),
            tool: kind.to_string(),
            kind: kind.to_string(),
            icon: None,
            title: title.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        }
    }

    fn raw_task(task_id: &str, title: &str, start: &str) -> ToolUsage {
        usage(
            "calendar",
            "calendar_create",
            &serde_json::json!({ "task_id": task_id, "title": title, "start": start }).to_string(),
        )
    }

    #[test]
    fn card_and_raw_merge_by_title_and_date() {
        let tools = vec![
            raw_task("42", "Встреча с флористом", "2025-11-03 14:00"),
            usage("calendar", "Встреча с флористом", "Запись создана на 03.11.2025 в 14:00"),
        ];
        let merged = merge_calendar_tools(tools, 0.45);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "cal_42");
        assert_eq!(merged[0].title, "Встреча с флористом");
    }

    #[test]
    fn unmatched_raw_task_becomes_card() {
        let merged = merge_calendar_tools(vec![raw_task("7", "Доставка", "2025-12-01")], 0.45);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "cal_7");
        assert_eq!(merged[0].title, "Доставка");
        assert_eq!(merged[0].text, "2025-12-01");
    }

    #[test]
    fn unrelated_card_stays_separate() {
        let tools = vec![
            raw_task("1", "Совещание отдела продаж", "2025-11-03 09:00"),
            usage("calendar", "Праздничный банкет", "в декабре без даты"),
        ];
        // recency alone (0.25) must not reach the acceptance threshold
        let merged = merge_calendar_tools(tools, 0.45);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().any(|t| t.id == "cal_1"));
        assert!(merged.iter().any(|t| t.title == "Праздничный банкет"));
    }

    #[test]
    fn non_calendar_tools_pass_through() {
        let tools = vec![usage("gmail", "Письмо отправлено", "ok")];
        let merged = merge_calendar_tools(tools, 0.45);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].kind, "gmail");
    }

    #[test]
    fn threshold_is_a_policy_knob() {
        let tools = vec![
            raw_task("9", "Созвон", "2025-11-03 09:00"),
            usage("calendar", "Созвон", "скоро"),
        ];
        // title match alone scores over 0.6; an extreme threshold rejects it
        let strict = merge_calendar_tools(tools.clone(), 2.0);
        assert_eq!(strict.len(), 2);
        let default = merge_calendar_tools(tools, 0.45);
        assert_eq!(default.len(), 1);
    }
}
