//! Default domain action tools: element interaction by snapshot ref, plus
//! the wallet primitives.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use crate::context::AgentContext;
use crate::tools::{ActionToolkit, ToolCallResult, ToolDefinition};

const MAX_WAIT_MS: u64 = 10_000;
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
const POST_ACTION_SETTLE: Duration = Duration::from_millis(800);

#[derive(Deserialize)]
struct RefInput {
    #[serde(rename = "ref")]
    reference: String,
}

#[derive(Deserialize)]
struct TypeInput {
    #[serde(rename = "ref")]
    reference: String,
    text: String,
    #[serde(default)]
    submit: bool,
}

#[derive(Deserialize)]
struct KeyInput {
    key: String,
}

#[derive(Deserialize)]
struct UrlInput {
    url: String,
}

#[derive(Deserialize)]
struct WaitInput {
    ms: u64,
}

#[derive(Deserialize)]
struct NetworkInput {
    network: String,
}

/// Browser actions over snapshot refs and wallet popup handling.
#[derive(Debug, Clone)]
pub struct BrowserWalletToolkit {
    settle: Duration,
}

impl Default for BrowserWalletToolkit {
    fn default() -> Self {
        Self {
            settle: POST_ACTION_SETTLE,
        }
    }
}

impl BrowserWalletToolkit {
    pub fn with_settle(settle: Duration) -> Self {
        Self { settle }
    }

    async fn run(&self, name: &str, input: &Value, ctx: &mut AgentContext) -> Result<String> {
        match name {
            "browser_click" => {
                let args: RefInput = parse(input)?;
                let node = ctx.resolve_ref(&args.reference)?.clone();
                ctx.page.click(&node.locator.selector).await?;
                tokio::time::sleep(self.settle).await;
                Ok(format!("Clicked {} \"{}\"", node.role, node.name))
            }
            "browser_type" => {
                let args: TypeInput = parse(input)?;
                let node = ctx.resolve_ref(&args.reference)?.clone();
                ctx.page.type_text(&node.locator.selector, &args.text).await?;
                if args.submit {
                    ctx.page.press_key("Enter").await?;
                    tokio::time::sleep(self.settle).await;
                }
                Ok(format!("Typed {} chars into {} \"{}\"", args.text.chars().count(), node.role, node.name))
            }
            "browser_press_key" => {
                let args: KeyInput = parse(input)?;
                ctx.page.press_key(&args.key).await?;
                tokio::time::sleep(self.settle).await;
                Ok(format!("Pressed {}", args.key))
            }
            "browser_navigate" => {
                let args: UrlInput = parse(input)?;
                ctx.page.navigate(&args.url, NAVIGATION_TIMEOUT).await?;
                let title = ctx.page.title().await.unwrap_or_default();
                Ok(format!("Navigated to {} (title: \"{title}\")", args.url))
            }
            "browser_wait" => {
                let args: WaitInput = parse(input)?;
                let ms = args.ms.min(MAX_WAIT_MS);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(format!("Waited {ms}ms"))
            }
            "wallet_approve" => {
                ctx.wallet.approve().await?;
                Ok("Approved wallet connection".to_string())
            }
            "wallet_sign" => {
                ctx.wallet.sign().await?;
                Ok("Signed message in wallet".to_string())
            }
            "wallet_confirm_transaction" => {
                ctx.wallet.confirm_transaction().await?;
                Ok("Confirmed transaction in wallet".to_string())
            }
            "wallet_reject" => {
                ctx.wallet.reject().await?;
                Ok("Rejected wallet request".to_string())
            }
            "wallet_switch_network" => {
                let args: NetworkInput = parse(input)?;
                ctx.wallet.switch_network(&args.network).await?;
                Ok(format!("Switched wallet to {}", args.network))
            }
            other => Err(anyhow!("no action tool named '{other}'")),
        }
    }
}

fn parse<T: for<'de> Deserialize<'de>>(input: &Value) -> Result<T> {
    serde_json::from_value(input.clone()).map_err(|e| anyhow!("invalid input: {e}"))
}

fn ref_schema(extra: Value) -> Value {
    let mut properties = json!({
        "ref": {"type": "string", "description": "Element ref from the current snapshot, e.g. s3-e12"}
    });
    let mut required = vec![json!("ref")];
    if let (Some(props), Some(extra_props)) = (properties.as_object_mut(), extra.as_object()) {
        for (key, schema) in extra_props {
            props.insert(key.clone(), schema.clone());
            if key != "submit" {
                required.push(json!(key));
            }
        }
    }
    json!({"type": "object", "properties": properties, "required": required})
}

fn no_input() -> Value {
    json!({"type": "object", "properties": {}})
}

#[async_trait]
impl ActionToolkit for BrowserWalletToolkit {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                "browser_click",
                "Click an element from the current snapshot.",
                ref_schema(json!({})),
            ),
            ToolDefinition::new(
                "browser_type",
                "Clear an input from the current snapshot and type text into it.",
                ref_schema(json!({
                    "text": {"type": "string"},
                    "submit": {"type": "boolean", "description": "Press Enter afterwards"}
                })),
            ),
            ToolDefinition::new(
                "browser_press_key",
                "Press a keyboard key such as Enter, Escape or Tab.",
                json!({"type": "object", "properties": {"key": {"type": "string"}}, "required": ["key"]}),
            ),
            ToolDefinition::new(
                "browser_navigate",
                "Load a URL in the current tab.",
                json!({"type": "object", "properties": {"url": {"type": "string"}}, "required": ["url"]}),
            ),
            ToolDefinition::new(
                "browser_wait",
                "Wait for the page to settle (max 10000 ms).",
                json!({"type": "object", "properties": {"ms": {"type": "integer", "minimum": 0}}, "required": ["ms"]}),
            ),
            ToolDefinition::new(
                "wallet_approve",
                "Approve the pending wallet connection request popup.",
                no_input(),
            ),
            ToolDefinition::new(
                "wallet_sign",
                "Sign the pending message signature request in the wallet popup.",
                no_input(),
            ),
            ToolDefinition::new(
                "wallet_confirm_transaction",
                "Confirm the pending transaction in the wallet popup.",
                no_input(),
            ),
            ToolDefinition::new(
                "wallet_reject",
                "Reject the pending wallet request.",
                no_input(),
            ),
            ToolDefinition::new(
                "wallet_switch_network",
                "Switch the wallet to a network by its display name, e.g. \"Base\".",
                json!({"type": "object", "properties": {"network": {"type": "string"}}, "required": ["network"]}),
            ),
        ]
    }

    async fn execute(&self, name: &str, input: &Value, ctx: &mut AgentContext) -> ToolCallResult {
        match self.run(name, input, ctx).await {
            Ok(output) => {
                debug!(tool = name, %output, "Action succeeded");
                ToolCallResult::success(output)
            }
            Err(e) => ToolCallResult::failure(format!("{e:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_schema_requires_ref_and_text_but_not_submit() {
        let schema = ref_schema(json!({"text": {"type": "string"}, "submit": {"type": "boolean"}}));
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(required.contains(&"ref"));
        assert!(required.contains(&"text"));
        assert!(!required.contains(&"submit"));
    }

    #[test]
    fn every_definition_has_an_object_schema() {
        let toolkit = BrowserWalletToolkit::default();
        for def in toolkit.definitions() {
            assert_eq!(def.input_schema["type"], "object", "{}", def.name);
        }
    }
}
