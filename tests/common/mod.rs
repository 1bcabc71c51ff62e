#![allow(dead_code)]

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dapp_agent_runner::dom::REF_ATTRIBUTE;
use dapp_agent_runner::tools::ToolCall;
use dapp_agent_runner::types::TokenUsage;
use dapp_agent_runner::{
    AgentContext, BrowserPage, IntentStep, ModelRequest, ModelTurn, ToolCallingModel,
    WalletSurface,
};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How the injected provider answers `wallet_switchEthereumChain`.
#[derive(Debug, Clone)]
pub enum RpcBehavior {
    /// Switches the page's chain to the requested id.
    Switch,
    /// Resolves with `{ok: false}`.
    Reject(String),
    /// The evaluate call itself errors.
    Throw,
}

/// Browser and wallet state shared between `FakePage` and `FakeWallet`.
#[derive(Debug)]
pub struct FakeChain {
    pub title: String,
    pub chain_id: String,
    pub rpc: RpcBehavior,
    /// Chain the wallet UI lands on after a switch; `None` makes it fail.
    pub wallet_switch_to: Option<String>,
    pub selected_address: Option<String>,
    pub has_provider: bool,
    pub screenshot_fails: bool,
    /// (role, name) of every element the snapshot reports.
    pub elements: Vec<(String, String)>,
    pub navigations: Vec<String>,
    pub clicks: Vec<String>,
    pub typed: Vec<(String, String)>,
    pub wallet_calls: Vec<String>,
    pub snapshots: u64,
}

impl Default for FakeChain {
    fn default() -> Self {
        Self {
            title: "Example dApp".to_string(),
            chain_id: "0x1".to_string(),
            rpc: RpcBehavior::Switch,
            wallet_switch_to: None,
            selected_address: None,
            has_provider: true,
            screenshot_fails: false,
            elements: vec![
                ("button".to_string(), "Connect Wallet".to_string()),
                ("textbox".to_string(), "Amount".to_string()),
            ],
            navigations: Vec::new(),
            clicks: Vec::new(),
            typed: Vec::new(),
            wallet_calls: Vec::new(),
            snapshots: 0,
        }
    }
}

pub type Shared = Arc<Mutex<FakeChain>>;

pub struct FakePage {
    pub state: Shared,
}

fn generation_of(script: &str) -> u64 {
    script
        .split("const GEN = ")
        .nth(1)
        .and_then(|rest| rest.split(';').next())
        .and_then(|n| n.trim().parse().ok())
        .unwrap_or(0)
}

fn requested_chain(script: &str) -> String {
    script
        .split("chainId: '")
        .nth(1)
        .and_then(|rest| rest.split('\'').next())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl BrowserPage for FakePage {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if url.contains("unreachable") {
            return Err(anyhow!("net::ERR_NAME_NOT_RESOLVED"));
        }
        state.navigations.push(url.to_string());
        Ok(())
    }

    async fn title(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().title.clone())
    }

    async fn url(&self) -> Result<String> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .navigations
            .last()
            .cloned()
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn evaluate(&self, expression: &str, _await_promise: bool) -> Result<Value> {
        let mut state = self.state.lock().unwrap();
        if expression.contains(REF_ATTRIBUTE) {
            state.snapshots += 1;
            let generation = generation_of(expression);
            let nodes: Vec<Value> = state
                .elements
                .iter()
                .enumerate()
                .map(|(i, (role, name))| {
                    json!({"ref": format!("s{generation}-e{i}"), "role": role, "name": name, "tag": role})
                })
                .collect();
            let url = state.navigations.last().cloned().unwrap_or_default();
            let payload = json!({"url": url, "title": state.title, "nodes": nodes});
            return Ok(Value::String(payload.to_string()));
        }
        if expression.contains("wallet_switchEthereumChain") {
            return match state.rpc.clone() {
                RpcBehavior::Switch => {
                    state.chain_id = requested_chain(expression);
                    Ok(Value::String(json!({"ok": true}).to_string()))
                }
                RpcBehavior::Reject(reason) => {
                    Ok(Value::String(json!({"ok": false, "error": reason}).to_string()))
                }
                RpcBehavior::Throw => Err(anyhow!("Evaluation failed: ethereum provider threw")),
            };
        }
        if expression.contains("selectedAddress") {
            let payload = json!({
                "hasProvider": state.has_provider,
                "selectedAddress": state.selected_address,
                "chainId": state.chain_id,
            });
            return Ok(Value::String(payload.to_string()));
        }
        if expression.contains("eth_chainId") {
            return Ok(Value::String(state.chain_id.clone()));
        }
        Ok(Value::Null)
    }

    async fn screenshot(&self, path: &Path) -> Result<()> {
        if self.state.lock().unwrap().screenshot_fails {
            return Err(anyhow!("Page.captureScreenshot: target closed"));
        }
        tokio::fs::write(path, b"\x89PNG").await?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.state.lock().unwrap().clicks.push(selector.to_string());
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .typed
            .push((selector.to_string(), text.to_string()));
        Ok(())
    }

    async fn press_key(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

pub struct FakeWallet {
    pub state: Shared,
}

impl FakeWallet {
    fn log(&self, call: &str) {
        self.state.lock().unwrap().wallet_calls.push(call.to_string());
    }
}

#[async_trait]
impl WalletSurface for FakeWallet {
    async fn approve(&self) -> Result<()> {
        self.log("approve");
        self.state.lock().unwrap().selected_address =
            Some("0x1111111111111111111111111111111111111111".to_string());
        Ok(())
    }

    async fn sign(&self) -> Result<()> {
        self.log("sign");
        Ok(())
    }

    async fn confirm_transaction(&self) -> Result<()> {
        self.log("confirm_transaction");
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        self.log("reject");
        Ok(())
    }

    async fn switch_network(&self, network_name: &str) -> Result<()> {
        self.log(&format!("switch_network:{network_name}"));
        let mut state = self.state.lock().unwrap();
        match state.wallet_switch_to.clone() {
            Some(chain) => {
                state.chain_id = chain;
                Ok(())
            }
            None => Err(anyhow!("network '{network_name}' not listed in wallet")),
        }
    }
}

/// Replays queued turns. An empty queue answers with no tool call.
#[derive(Default)]
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Result<ModelTurn, String>>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<ModelTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().map(Ok).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn push_error(&self, message: &str) {
        self.turns.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompt(&self, n: usize) -> String {
        self.prompts.lock().unwrap()[n].clone()
    }
}

#[async_trait]
impl ToolCallingModel for ScriptedModel {
    async fn next_tool_call(&self, request: &ModelRequest<'_>) -> Result<ModelTurn> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        match self.turns.lock().unwrap().pop_front() {
            Some(Ok(turn)) => Ok(turn),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(ModelTurn::default()),
        }
    }
}

pub fn call(name: &str, input: Value) -> ModelTurn {
    ModelTurn {
        tool_call: Some(ToolCall {
            name: name.to_string(),
            input,
        }),
        text: None,
        usage: TokenUsage {
            input_tokens: 1_000,
            output_tokens: 100,
            ..TokenUsage::default()
        },
    }
}

pub fn step(id: &str, kind: &str, description: &str, context: Value) -> IntentStep {
    serde_json::from_value(json!({
        "id": id,
        "description": description,
        "type": kind,
        "context": context,
    }))
    .unwrap()
}

pub struct Harness {
    pub state: Shared,
    pub ctx: AgentContext,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(chain: FakeChain) -> Self {
        let state: Shared = Arc::new(Mutex::new(chain));
        let dir = tempfile::tempdir().unwrap();
        let ctx = AgentContext::new(
            Arc::new(FakePage {
                state: state.clone(),
            }),
            Arc::new(FakeWallet {
                state: state.clone(),
            }),
            dir.path().join("artifacts"),
            CancellationToken::new(),
        );
        Self { state, ctx, dir }
    }

    pub fn chain(&self) -> std::sync::MutexGuard<'_, FakeChain> {
        self.state.lock().unwrap()
    }
}
