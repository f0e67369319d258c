use regex::Regex;
use std::sync::OnceLock;

/// One presentation-ready block: text plus at most one extracted image URL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseBlock {
    pub text: String,
    pub image_url: Option<String>,
}

fn image_url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)https?://\S+\.(?:jpg|jpeg|png|gif|bmp|webp)").expect("static regex")
    })
}

fn markdown_image_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("static regex"))
}

fn markdown_self_link_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[\s*(?P<url>https?://[^\]]+?)\s*\]\(\s*(?P<url2>https?://[^)]+?)\s*\)")
            .expect("static regex")
    })
}

/// Strips formatting glyphs the channels cannot render, collapses whitespace,
/// and rewrites markdown self-links to their bare URL.
pub fn clean_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let mut out = text.replace("**", "");
    for glyph in ['*', '\'', '"', '|', '#', '<', '>', '«', '»'] {
        out = out.replace(glyph, "");
    }
    out = out.replace('—', "-");
    out = out.replace('\t', " ");

    // collapse runs of spaces, keep line structure for paragraph detection
    let collapse = {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r" +").expect("static regex"))
    };
    out = collapse.replace_all(&out, " ").trim().to_string();

    // normalize paragraphs: one or more blank lines become exactly one
    let paragraphs: Vec<String> = {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"\n\s*\n+").expect("static regex"));
        re.split(&out)
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    };
    let joined = paragraphs.join("\n\n");

    markdown_self_link_pattern()
        .replace_all(&joined, |caps: &regex::Captures| {
            let url = caps.name("url").map(|m| m.as_str()).unwrap_or_default();
            let url2 = caps.name("url2").map(|m| m.as_str()).unwrap_or_default();
            if url == url2 {
                url.to_string()
            } else {
                caps.get(0).map(|m| m.as_str()).unwrap_or_default().to_string()
            }
        })
        .into_owned()
}

/// Finds the first image URL in a line, if any.
pub fn extract_image_url(line: &str) -> Option<String> {
    image_url_pattern()
        .find(line)
        .map(|m| m.as_str().trim().to_string())
}

/// Splits the raw response into blocks on `|` separators and paragraph
/// breaks.
pub fn split_into_blocks(text: &str) -> Vec<String> {
    let paragraph = {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"\n\s*\n").expect("static regex"))
    };

    let mut blocks = Vec::new();
    if text.contains('|') {
        for part in text.split('|') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            for sub in paragraph.split(part) {
                let sub = sub.trim();
                if !sub.is_empty() {
                    blocks.push(sub.to_string());
                }
            }
        }
    } else {
        for block in paragraph.split(text) {
            let block = block.trim();
            if !block.is_empty() {
                blocks.push(block.to_string());
            }
        }
    }
    blocks
}

/// Processes one block: pulls out the first image URL, drops markdown image
/// constructs, and cleans the remaining text.
pub fn process_block(block: &str) -> ResponseBlock {
    let mut image_url: Option<String> = None;
    let mut lines = Vec::new();
    for line in block.lines() {
        let trimmed = line.trim();
        if trimmed == "'" || trimmed == "\"\"" {
            continue;
        }
        let mut line = line.to_string();
        if image_url.is_none() {
            if let Some(url) = extract_image_url(&line) {
                line = line.replace(&url, "");
                image_url = Some(url);
            }
        }
        lines.push(line);
    }

    let joined = lines.join("\n");
    let without_md_images = markdown_image_pattern().replace_all(&joined, "");
    let mut text = clean_text(&without_md_images);

    // drop a dangling list hyphen left at the very end
    let trailing_dash = {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"\n\s*-\s*$").expect("static regex"))
    };
    text = trailing_dash.replace(&text, "").into_owned();

    ResponseBlock {
        text,
        image_url,
    }
}

/// Greedy word-safe wrap at `width` characters. Words longer than the width
/// are kept whole.
pub fn wrap_words(text: &str, width: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        if current_len == 0 {
            current.push_str(word);
            current_len = word_len;
        } else if current_len + 1 + word_len <= width {
            current.push(' ');
            current.push_str(word);
            current_len += 1 + word_len;
        } else {
            out.push(std::mem::take(&mut current));
            current.push_str(word);
            current_len = word_len;
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Normalizes a raw agent response into channel blocks.
///
/// Splits on `|` and paragraph breaks, cleans each block, wraps text over
/// `max_length` characters word-safely, and merges image-only blocks into
/// their preceding text block. Project-scoped responses bypass this function
/// entirely (the dispatcher sends them as a single unsplit block).
pub fn split_block_response(raw: &str, max_length: usize) -> Vec<ResponseBlock> {
    if raw.is_empty() {
        tracing::warn!("empty assistant response");
        return Vec::new();
    }

    let mut result = Vec::new();
    for block in split_into_blocks(raw) {
        let processed = process_block(&block);
        let has_image = processed.image_url.as_deref().is_some_and(|u| !u.is_empty());

        if processed.text.chars().count() > max_length {
            for part in wrap_words(&processed.text, max_length) {
                if !part.trim().is_empty() || has_image {
                    result.push(ResponseBlock {
                        text: part,
                        image_url: processed.image_url.clone(),
                    });
                }
            }
        } else if !processed.text.trim().is_empty() || has_image {
            result.push(processed);
        }
    }

    // merge image-only blocks into the preceding text block
    let mut merged: Vec<ResponseBlock> = Vec::new();
    for block in result {
        let image_only = block.text.trim().is_empty() && block.image_url.is_some();
        if image_only {
            if let Some(prev) = merged.last_mut() {
                match (&mut prev.image_url, block.image_url) {
                    (slot @ None, Some(url)) => *slot = Some(url),
                    (Some(existing), Some(url)) => {
                        existing.push(' ');
                        existing.push_str(&url);
                    }
                    _ => {}
                }
                continue;
            }
        }
        merged.push(block);
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_strips_glyphs_and_markdown() {
        assert_eq!(clean_text("**Привет** #мир"), "Привет мир");
        assert_eq!(clean_text("a\t\tb   c"), "a b c");
        assert_eq!(clean_text("тире — дефис"), "тире - дефис");
    }

    #[test]
    fn clean_text_normalizes_paragraphs() {
        assert_eq!(clean_text("a\n\n\n\nb"), "a\n\nb");
    }

    #[test]
    fn clean_text_unwraps_self_links() {
        assert_eq!(
            clean_text("смотрите [https://shop.example/catalog](https://shop.example/catalog)"),
            "смотрите https://shop.example/catalog"
        );
    }

    #[test]
    fn process_block_extracts_first_image() {
        let block = process_block("Вот фото https://cdn.example/rose.jpg\nи ещё https://cdn.example/lily.png");
        assert_eq!(block.image_url.as_deref(), Some("https://cdn.example/rose.jpg"));
        assert!(!block.text.contains("rose.jpg"));
        // the second URL stays in the text
        assert!(block.text.contains("lily.png"));
    }

    #[test]
    fn process_block_drops_markdown_images() {
        let block = process_block("до ![alt](https://cdn.example/x.gif) после");
        assert_eq!(block.text, "до после");
    }

    #[test]
    fn split_on_pipes_and_paragraphs() {
        let blocks = split_into_blocks("один | два\n\nтри");
        assert_eq!(blocks, vec!["один", "два", "три"]);
    }

    #[test]
    fn wrap_words_is_word_safe() {
        let text = "пять слов в этой строке";
        let parts = wrap_words(text, 10);
        assert!(parts.iter().all(|p| p.chars().count() <= 10));
        assert_eq!(parts.join(" "), text);
    }

    #[test]
    fn wrap_words_keeps_long_words_whole() {
        let parts = wrap_words("сверхдлинноеслово и хвост", 5);
        assert!(parts.contains(&"сверхдлинноеслово".to_string()));
    }

    #[test]
    fn long_blocks_are_chunked() {
        let raw = "слово ".repeat(400);
        let blocks = split_block_response(&raw, 999);
        assert!(blocks.len() > 1);
        for block in &blocks {
            assert!(block.text.chars().count() <= 999);
        }
    }

    #[test]
    fn image_only_block_merges_into_previous() {
        let raw = "Наш букет недели\n\nhttps://cdn.example/bouquet.jpg";
        let blocks = split_block_response(raw, 999);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].text, "Наш букет недели");
        assert_eq!(blocks[0].image_url.as_deref(), Some("https://cdn.example/bouquet.jpg"));
    }

    #[test]
    fn empty_response_yields_no_blocks() {
        assert!(split_block_response("", 999).is_empty());
    }

    #[test]
    fn pipes_create_separate_messages() {
        let blocks = split_block_response("Здравствуйте! | Чем могу помочь?", 999);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].text, "Здравствуйте!");
        assert_eq!(blocks[1].text, "Чем могу помочь?");
    }
}
