use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::error::ProviderError;
use crate::tools::{ToolCall, ToolDefinition};
use crate::types::TokenUsage;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct ModelRequest<'a> {
    pub system: &'a str,
    pub prompt: String,
    pub tools: &'a [ToolDefinition],
}

/// One model turn: at most one tool call, plus whatever text came with it.
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    pub tool_call: Option<ToolCall>,
    pub text: Option<String>,
    pub usage: TokenUsage,
}

/// The LLM tool-calling service.
#[async_trait]
pub trait ToolCallingModel: Send + Sync {
    async fn next_tool_call(&self, request: &ModelRequest<'_>) -> Result<ModelTurn>;
}

/// OpenAI-compatible chat-completions client using function tools.
pub struct Brain {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
}

impl Brain {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            anyhow::bail!("OPENAI_API_KEY not set in environment");
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    fn request_body(&self, request: &ModelRequest<'_>) -> Value {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect();

        json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
            "tools": tools,
            "tool_choice": "auto",
            "parallel_tool_calls": false,
            "temperature": 0.2,
        })
    }
}

#[async_trait]
impl ToolCallingModel for Brain {
    async fn next_tool_call(&self, request: &ModelRequest<'_>) -> Result<ModelTurn> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .context("model request failed")?;

        let status = response.status();
        let json_resp: Value = response.json().await.context("model response was not JSON")?;

        if !status.is_success() {
            let message = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error")
                .to_string();
            warn!(status = status.as_u16(), %message, "Model API error");
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            }
            .into());
        }

        let turn = parse_turn(&json_resp)?;
        debug!(
            tool = turn.tool_call.as_ref().map(|c| c.name.as_str()).unwrap_or("<none>"),
            input_tokens = turn.usage.input_tokens,
            output_tokens = turn.usage.output_tokens,
            "Model replied"
        );
        Ok(turn)
    }
}

/// Pull the first tool call, any text, and token usage out of a
/// chat-completions response.
pub fn parse_turn(json_resp: &Value) -> Result<ModelTurn, ProviderError> {
    let message = &json_resp["choices"][0]["message"];
    if message.is_null() {
        return Err(ProviderError::MissingChoice(json_resp.to_string()));
    }

    let tool_call = message["tool_calls"]
        .as_array()
        .and_then(|calls| calls.first())
        .and_then(|call| {
            let name = call["function"]["name"].as_str()?.to_string();
            let raw_args = call["function"]["arguments"].as_str().unwrap_or("{}");
            // Unparseable arguments are passed through as a string so the tool
            // layer reports them as malformed input.
            let input = serde_json::from_str(raw_args)
                .unwrap_or_else(|_| Value::String(raw_args.to_string()));
            Some(ToolCall { name, input })
        });

    let text = message["content"]
        .as_str()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from);

    Ok(ModelTurn {
        tool_call,
        text,
        usage: parse_usage(&json_resp["usage"]),
    })
}

fn parse_usage(usage: &Value) -> TokenUsage {
    let prompt = usage["prompt_tokens"].as_u64().unwrap_or(0);
    let cached = usage["prompt_tokens_details"]["cached_tokens"]
        .as_u64()
        .unwrap_or(0);
    TokenUsage {
        input_tokens: prompt.saturating_sub(cached),
        output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        cache_read_tokens: cached,
        cache_write_tokens: usage["cache_creation_input_tokens"].as_u64().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tool_call_and_usage() {
        let resp = json!({
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "browser_click", "arguments": "{\"ref\":\"s2-e5\"}"}
                }]
            }}],
            "usage": {
                "prompt_tokens": 1200,
                "completion_tokens": 40,
                "prompt_tokens_details": {"cached_tokens": 200}
            }
        });
        let turn = parse_turn(&resp).unwrap();
        let call = turn.tool_call.unwrap();
        assert_eq!(call.name, "browser_click");
        assert_eq!(call.input, json!({"ref": "s2-e5"}));
        assert_eq!(turn.usage.input_tokens, 1000);
        assert_eq!(turn.usage.cache_read_tokens, 200);
        assert_eq!(turn.usage.output_tokens, 40);
        assert!(turn.text.is_none());
    }

    #[test]
    fn text_only_turn_has_no_tool_call() {
        let resp = json!({"choices": [{"message": {"content": "I think the page is loading."}}]});
        let turn = parse_turn(&resp).unwrap();
        assert!(turn.tool_call.is_none());
        assert_eq!(turn.text.as_deref(), Some("I think the page is loading."));
        assert_eq!(turn.usage, TokenUsage::default());
    }

    #[test]
    fn bad_arguments_are_kept_as_a_string() {
        let resp = json!({"choices": [{"message": {"tool_calls": [{
            "function": {"name": "step_complete", "arguments": "{summary: oops"}
        }]}}]});
        let call = parse_turn(&resp).unwrap().tool_call.unwrap();
        assert_eq!(call.input, json!("{summary: oops"));
    }

    #[test]
    fn missing_choices_is_an_error() {
        assert!(matches!(
            parse_turn(&json!({"error": "x"})),
            Err(ProviderError::MissingChoice(_))
        ));
    }

    #[test]
    fn brain_requires_a_key() {
        assert!(Brain::new(&AgentConfig::default()).is_err());
    }
}
