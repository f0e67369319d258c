use crate::error::{Error, Result};
use crate::services::agent_instance::{AgentRunner, RunnerContent, RunnerMessage, ToolBinding};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;

/// Upper bound on model/tool round-trips for one invocation.
const MAX_TOOL_ROUNDS: usize = 6;

/// Chat-completions agent runner against an OpenAI-compatible API, driving
/// function-calling rounds through the instance's tool bindings.
pub struct OpenAiRunner {
    http: reqwest::Client,
    api_base: String,
    api_key: SecretString,
    model: String,
}

impl OpenAiRunner {
    pub fn new(api_base: &str, api_key: SecretString, model: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
        }
    }

    fn to_wire(message: &RunnerMessage) -> serde_json::Value {
        match &message.content {
            RunnerContent::Text(text) => serde_json::json!({
                "role": message.role,
                "content": text,
            }),
            RunnerContent::Images(data_uris) => {
                let parts: Vec<serde_json::Value> = data_uris
                    .iter()
                    .map(|uri| {
                        serde_json::json!({
                            "type": "image_url",
                            "image_url": { "url": uri },
                        })
                    })
                    .collect();
                serde_json::json!({
                    "role": message.role,
                    "content": parts,
                })
            }
        }
    }

    fn tool_schemas(tools: &[Arc<ToolBinding>]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|binding| {
                let spec = binding.spec();
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": spec.name,
                        "description": spec.description,
                        "parameters": spec.parameters,
                    },
                })
            })
            .collect()
    }

    async fn completion(
        &self,
        messages: &[serde_json::Value],
        tools: &[serde_json::Value],
    ) -> Result<serde_json::Value> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(tools.to_vec());
        }

        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("completion request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Llm(format!(
                "provider returned {}: {}",
                status,
                crate::utils::safe_preview(&body, 300)
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Llm(format!("malformed completion response: {}", e)))
    }
}

#[async_trait]
impl AgentRunner for OpenAiRunner {
    async fn run(
        &self,
        instructions: &str,
        input: Vec<RunnerMessage>,
        tools: &[Arc<ToolBinding>],
    ) -> Result<String> {
        let mut messages: Vec<serde_json::Value> = Vec::with_capacity(input.len() + 1);
        if !instructions.trim().is_empty() {
            messages.push(serde_json::json!({ "role": "system", "content": instructions }));
        }
        messages.extend(input.iter().map(Self::to_wire));

        let schemas = Self::tool_schemas(tools);

        for round in 0..=MAX_TOOL_ROUNDS {
            let response = self.completion(&messages, &schemas).await?;
            let message = response
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .cloned()
                .ok_or_else(|| Error::Llm("completion response has no choices".into()))?;

            let tool_calls = message
                .get("tool_calls")
                .and_then(|t| t.as_array())
                .cloned()
                .unwrap_or_default();

            if tool_calls.is_empty() {
                return Ok(message
                    .get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string());
            }

            if round == MAX_TOOL_ROUNDS {
                return Err(Error::Llm(format!(
                    "tool rounds exceeded {}",
                    MAX_TOOL_ROUNDS
                )));
            }

            messages.push(message.clone());
            for call in tool_calls {
                let call_id = call.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                let name = call
                    .pointer("/function/name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let arguments: serde_json::Value = call
                    .pointer("/function/arguments")
                    .and_then(|v| v.as_str())
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or(serde_json::json!({}));

                let result = match tools.iter().find(|b| b.spec().name == name) {
                    Some(binding) => binding.invoke(arguments).await,
                    None => {
                        tracing::warn!(tool = name, "model requested an unbound tool");
                        serde_json::json!({ "ok": false, "error": "unknown_tool", "tool": name })
                    }
                };

                messages.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": result.to_string(),
                }));
            }
        }

        Err(Error::Llm("agent run did not converge".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_messages_serialize_to_plain_content() {
        let wire = OpenAiRunner::to_wire(&RunnerMessage::user_text("привет"));
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["content"], "привет");
    }

    #[test]
    fn image_messages_serialize_to_parts() {
        let wire = OpenAiRunner::to_wire(&RunnerMessage {
            role: "user".into(),
            content: RunnerContent::Images(vec!["data:image/jpeg;base64,AAAA".into()]),
        });
        assert_eq!(wire["content"][0]["type"], "image_url");
        assert_eq!(
            wire["content"][0]["image_url"]["url"],
            "data:image/jpeg;base64,AAAA"
        );
    }
}
