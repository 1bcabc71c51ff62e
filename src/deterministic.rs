//! Scripted execution for step types that need no model.

use anyhow::{Result, anyhow};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::context::AgentContext;
use crate::error::ResolveError;
use crate::types::{AgentAction, ExecutionMode, IntentStep, StepResult, StepStatus, StepType};

static URL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"'<>()\[\]]+"#).expect("url regex"));

/// keyword (lowercase, matched as whole words) -> (wallet display name, chain id).
/// Multi-word keywords come before their prefixes so "base sepolia" wins over "base".
pub const NETWORKS: &[(&str, &str, u64)] = &[
    ("ethereum mainnet", "Ethereum Mainnet", 1),
    ("ethereum", "Ethereum Mainnet", 1),
    ("mainnet", "Ethereum Mainnet", 1),
    ("sepolia", "Sepolia", 11_155_111),
    ("holesky", "Holesky", 17_000),
    ("base sepolia", "Base Sepolia", 84_532),
    ("base", "Base", 8_453),
    ("op mainnet", "OP Mainnet", 10),
    ("optimism", "OP Mainnet", 10),
    ("arbitrum one", "Arbitrum One", 42_161),
    ("arbitrum", "Arbitrum One", 42_161),
    ("polygon", "Polygon Mainnet", 137),
    ("linea", "Linea", 59_144),
    ("bnb", "BNB Chain", 56),
    ("bsc", "BNB Chain", 56),
    ("avalanche", "Avalanche C-Chain", 43_114),
    ("hardhat", "Hardhat", 31_337),
    ("anvil", "Anvil", 31_337),
    ("localhost", "Localhost 8545", 1_337),
];

const CHAIN_ID_JS: &str = r#"
(async () => {
  if (!window.ethereum) return null;
  return await window.ethereum.request({ method: 'eth_chainId' });
})()
"#;

const WALLET_STATE_JS: &str = r#"
(async () => {
  const eth = window.ethereum;
  if (!eth) return JSON.stringify({ hasProvider: false, selectedAddress: null, chainId: null });
  let address = eth.selectedAddress || null;
  if (!address) {
    try {
      const accounts = await eth.request({ method: 'eth_accounts' });
      address = (accounts && accounts[0]) || null;
    } catch (e) {}
  }
  return JSON.stringify({ hasProvider: true, selectedAddress: address, chainId: eth.chainId || null });
})()
"#;

fn switch_chain_js(chain_id: u64) -> String {
    format!(
        r#"
(async () => {{
  if (!window.ethereum) return JSON.stringify({{ ok: false, error: 'no injected wallet provider' }});
  try {{
    await window.ethereum.request({{ method: 'wallet_switchEthereumChain', params: [{{ chainId: '0x{chain_id:x}' }}] }});
    return JSON.stringify({{ ok: true }});
  }} catch (e) {{
    return JSON.stringify({{ ok: false, error: (e && e.message) || String(e) }});
  }}
}})()
"#
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNetwork {
    pub name: String,
    pub chain_id: Option<u64>,
}

/// Network-switch strategies, tried in order until one succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchStrategy {
    /// `wallet_switchEthereumChain` on the injected provider. Built-in
    /// networks are switched without a popup.
    ProviderRpc,
    /// The wallet automation surface's own network switch (drives the UI).
    WalletUi,
}

impl SwitchStrategy {
    pub fn label(self) -> &'static str {
        match self {
            SwitchStrategy::ProviderRpc => "provider_rpc",
            SwitchStrategy::WalletUi => "dappwright",
        }
    }

    pub fn chain_for(network: &ResolvedNetwork) -> Vec<SwitchStrategy> {
        if network.chain_id.is_some() {
            vec![SwitchStrategy::ProviderRpc, SwitchStrategy::WalletUi]
        } else {
            vec![SwitchStrategy::WalletUi]
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletState {
    has_provider: bool,
    selected_address: Option<String>,
    chain_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcOutcome {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Runs `navigate`, `switch_network` and `verify_state` steps directly
/// against the browser and wallet. Never calls the model.
#[derive(Debug, Clone)]
pub struct DeterministicExecutor {
    pub navigation_timeout: Duration,
    pub navigate_settle: Duration,
    pub switch_settle: Duration,
    pub rpc_timeout: Duration,
}

impl Default for DeterministicExecutor {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(30),
            navigate_settle: Duration::from_millis(2000),
            switch_settle: Duration::from_millis(1500),
            rpc_timeout: Duration::from_secs(10),
        }
    }
}

impl DeterministicExecutor {
    /// No settle waits. Handy when the page is a fake.
    pub fn without_settle() -> Self {
        Self {
            navigate_settle: Duration::ZERO,
            switch_settle: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Always returns a result; `api_calls` is always 0.
    pub async fn execute(
        &self,
        step: &IntentStep,
        index: usize,
        total: usize,
        ctx: &mut AgentContext,
    ) -> StepResult {
        let started = Instant::now();
        info!(step = %step.id, kind = %step.step_type, "Step {}/{} (deterministic): {}", index + 1, total, step.description);

        let result = match &step.step_type {
            StepType::Navigate => self.navigate(step, index, ctx).await,
            StepType::SwitchNetwork => self.switch_network(step, index, ctx).await,
            StepType::VerifyState => self.verify_state(step, index, ctx).await,
            other => StepResult::failed(
                step,
                index,
                ExecutionMode::Deterministic,
                format!("Deterministic executor cannot handle step type '{other}'"),
            ),
        };

        let mut result = result.with_duration(elapsed_ms(started));
        result.api_calls = 0;
        result
    }

    async fn navigate(&self, step: &IntentStep, index: usize, ctx: &mut AgentContext) -> StepResult {
        let url = match resolve_url(step) {
            Ok(url) => url,
            Err(e) => {
                ctx.capture_screenshot(index, &step.step_type, "error").await;
                return StepResult::failed(step, index, ExecutionMode::Deterministic, e.to_string());
            }
        };

        let started = Instant::now();
        let outcome = ctx.page.navigate(&url, self.navigation_timeout).await;
        let mut action = AgentAction {
            tool: "navigate".to_string(),
            input: json!({ "url": url }),
            output: String::new(),
            success: outcome.is_ok(),
            screenshot_before: None,
            screenshot_after: None,
            duration_ms: elapsed_ms(started),
        };

        if let Err(e) = outcome {
            action.output = format!("{e:#}");
            action.screenshot_after = ctx.capture_screenshot(index, &step.step_type, "error").await;
            return StepResult::failed(
                step,
                index,
                ExecutionMode::Deterministic,
                format!("Navigation to {url} failed: {e:#}"),
            )
            .with_actions(vec![action]);
        }

        tokio::time::sleep(self.navigate_settle).await;
        action.screenshot_after = ctx.capture_screenshot(index, &step.step_type, "loaded").await;

        let title = ctx.page.title().await.unwrap_or_else(|e| {
            warn!(error = %e, "Could not read page title");
            String::new()
        });
        let landed = ctx.page.url().await.unwrap_or_else(|_| url.clone());
        action.output = format!("title \"{title}\" at {landed}");

        StepResult::passed(
            step,
            index,
            ExecutionMode::Deterministic,
            format!("Navigated to {url} (page title: \"{title}\")"),
        )
        .with_actions(vec![action])
    }

    async fn switch_network(
        &self,
        step: &IntentStep,
        index: usize,
        ctx: &mut AgentContext,
    ) -> StepResult {
        let network = match resolve_network(step) {
            Ok(network) => network,
            Err(e) => {
                ctx.capture_screenshot(index, &step.step_type, "error").await;
                return StepResult::failed(step, index, ExecutionMode::Deterministic, e.to_string());
            }
        };

        let mut actions = Vec::new();
        let mut errors = Vec::new();
        let mut switched_by = None;

        for strategy in SwitchStrategy::chain_for(&network) {
            let started = Instant::now();
            let outcome = self.attempt_switch(strategy, &network, ctx).await;
            let (success, output) = match &outcome {
                Ok(()) => (true, format!("switched to {}", network.name)),
                Err(e) => (false, format!("{e:#}")),
            };
            actions.push(AgentAction {
                tool: strategy.label().to_string(),
                input: json!({ "network": network.name, "chainId": network.chain_id }),
                output,
                success,
                screenshot_before: None,
                screenshot_after: None,
                duration_ms: elapsed_ms(started),
            });

            match outcome {
                Ok(()) => {
                    switched_by = Some(strategy);
                    break;
                }
                Err(e) => {
                    warn!(step = %step.id, strategy = strategy.label(), error = %format!("{e:#}"), "Network switch strategy failed");
                    errors.push(format!("{}: {e:#}", strategy.label()));
                }
            }
        }

        let Some(strategy) = switched_by else {
            ctx.capture_screenshot(index, &step.step_type, "error").await;
            return StepResult::failed(
                step,
                index,
                ExecutionMode::Deterministic,
                format!(
                    "All network switch strategies failed for {}: {}",
                    network.name,
                    errors.join("; ")
                ),
            )
            .with_actions(actions);
        };

        tokio::time::sleep(self.switch_settle).await;
        if let Some(last) = actions.last_mut() {
            last.screenshot_after = ctx.capture_screenshot(index, &step.step_type, "switched").await;
        }

        let Some(expected) = network.chain_id else {
            return StepResult::passed(
                step,
                index,
                ExecutionMode::Deterministic,
                format!(
                    "Switched to {} via {} (unknown network, chain id not verified)",
                    network.name,
                    strategy.label()
                ),
            )
            .with_actions(actions);
        };

        let result = match read_chain_id(ctx).await {
            Ok(actual) if actual == expected => StepResult::passed(
                step,
                index,
                ExecutionMode::Deterministic,
                format!(
                    "Switched to {} (chain {expected}) via {}",
                    network.name,
                    strategy.label()
                ),
            ),
            Ok(actual) => StepResult::failed(
                step,
                index,
                ExecutionMode::Deterministic,
                format!(
                    "Chain ID mismatch after switching to {}: expected {expected}, got {actual}",
                    network.name
                ),
            ),
            Err(e) => StepResult::failed(
                step,
                index,
                ExecutionMode::Deterministic,
                format!(
                    "Could not verify chain ID after switching to {} (expected {expected}): {e:#}",
                    network.name
                ),
            ),
        };
        result.with_actions(actions)
    }

    async fn attempt_switch(
        &self,
        strategy: SwitchStrategy,
        network: &ResolvedNetwork,
        ctx: &mut AgentContext,
    ) -> Result<()> {
        match strategy {
            SwitchStrategy::ProviderRpc => {
                let chain_id = network
                    .chain_id
                    .ok_or_else(|| anyhow!("no chain id for {}", network.name))?;
                let script = switch_chain_js(chain_id);
                let raw = tokio::time::timeout(self.rpc_timeout, ctx.page.evaluate(&script, true))
                    .await
                    .map_err(|_| anyhow!("provider request timed out after {:?}", self.rpc_timeout))??;
                let outcome: RpcOutcome = serde_json::from_str(raw.as_str().unwrap_or("{}"))
                    .map_err(|e| anyhow!("unexpected provider response {raw}: {e}"))?;
                if outcome.ok {
                    Ok(())
                } else {
                    Err(anyhow!(
                        "wallet_switchEthereumChain rejected: {}",
                        outcome.error.unwrap_or_else(|| "unknown error".into())
                    ))
                }
            }
            SwitchStrategy::WalletUi => ctx.wallet.switch_network(&network.name).await,
        }
    }

    async fn verify_state(&self, step: &IntentStep, index: usize, ctx: &mut AgentContext) -> StepResult {
        let started = Instant::now();
        let outcome = read_wallet_state(ctx).await;
        let screenshot = ctx.capture_screenshot(index, &step.step_type, "state").await;

        let (result, output) = match outcome {
            Ok(state) => match (&state.selected_address, state.has_provider) {
                (Some(address), _) if !address.is_empty() => {
                    let chain = state
                        .chain_id
                        .as_deref()
                        .and_then(parse_chain_id)
                        .map(|id| format!(" on chain {id}"))
                        .unwrap_or_default();
                    let summary = format!("Wallet connected: {address}{chain}");
                    (
                        StepResult::passed(step, index, ExecutionMode::Deterministic, summary.clone()),
                        summary,
                    )
                }
                (_, false) => {
                    let reason = "Wallet not connected: no injected provider (window.ethereum) on the page".to_string();
                    (
                        StepResult::failed(step, index, ExecutionMode::Deterministic, reason.clone()),
                        reason,
                    )
                }
                (_, true) => {
                    let reason = "Wallet not connected: provider present but no selected address".to_string();
                    (
                        StepResult::failed(step, index, ExecutionMode::Deterministic, reason.clone()),
                        reason,
                    )
                }
            },
            Err(e) => {
                let reason = format!("Could not read wallet state: {e:#}");
                (
                    StepResult::failed(step, index, ExecutionMode::Deterministic, reason.clone()),
                    reason,
                )
            }
        };

        let action = AgentAction {
            tool: "read_wallet_state".to_string(),
            input: Value::Null,
            success: result.status == StepStatus::Passed,
            output,
            screenshot_before: None,
            screenshot_after: screenshot,
            duration_ms: elapsed_ms(started),
        };
        result.with_actions(vec![action])
    }
}

/// URL from `context.url`, else the first http(s) URL in the description.
pub fn resolve_url(step: &IntentStep) -> Result<String, ResolveError> {
    if let Some(url) = step.context_str("url") {
        return Ok(url);
    }
    URL_REGEX
        .find(&step.description)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']).to_string())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ResolveError::MissingUrl(step.description.clone()))
}

/// Network from `context.networkName` / `context.network` / `context.chainId`,
/// else a keyword match against the description.
pub fn resolve_network(step: &IntentStep) -> Result<ResolvedNetwork, ResolveError> {
    let context_chain = step.context_str("chainId").as_deref().and_then(parse_chain_id);
    let context_name = step
        .context_str("networkName")
        .or_else(|| step.context_str("network"));

    if let Some(name) = context_name {
        let chain_id = context_chain.or_else(|| lookup_network(&name).map(|(_, id)| id));
        return Ok(ResolvedNetwork { name, chain_id });
    }

    if let Some((display, id)) = lookup_network(&step.description) {
        return Ok(ResolvedNetwork {
            name: display.to_string(),
            chain_id: context_chain.or(Some(id)),
        });
    }

    if let Some(id) = context_chain {
        let name = NETWORKS
            .iter()
            .find(|(_, _, known)| *known == id)
            .map(|(_, display, _)| display.to_string())
            .unwrap_or_else(|| format!("Chain {id}"));
        return Ok(ResolvedNetwork {
            name,
            chain_id: Some(id),
        });
    }

    Err(ResolveError::MissingNetwork(step.description.clone()))
}

/// Longest whole-word keyword match in `text`.
fn lookup_network(text: &str) -> Option<(&'static str, u64)> {
    let words: Vec<String> = text
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect();
    let padded = format!(" {} ", words.join(" "));

    NETWORKS
        .iter()
        .filter(|(keyword, _, _)| padded.contains(&format!(" {keyword} ")))
        .max_by_key(|(keyword, _, _)| keyword.len())
        .map(|(_, display, id)| (*display, *id))
}

/// Accepts `0x2105`, `8453` or a JSON number.
pub fn parse_chain_id(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

async fn read_chain_id(ctx: &AgentContext) -> Result<u64> {
    let raw = ctx.page.evaluate(CHAIN_ID_JS, true).await?;
    let parsed = match &raw {
        Value::String(s) => parse_chain_id(s),
        Value::Number(n) => n.as_u64(),
        _ => None,
    };
    parsed.ok_or_else(|| anyhow!("provider returned no usable chain id ({raw})"))
}

async fn read_wallet_state(ctx: &AgentContext) -> Result<WalletState> {
    let raw = ctx.page.evaluate(WALLET_STATE_JS, true).await?;
    let text = raw
        .as_str()
        .ok_or_else(|| anyhow!("unexpected wallet state payload {raw}"))?;
    Ok(serde_json::from_str(text)?)
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(step_type: StepType, description: &str, context: Option<Value>) -> IntentStep {
        IntentStep {
            id: "s1".into(),
            description: description.into(),
            step_type,
            source_step_indices: vec![0],
            context: context.and_then(|v| v.as_object().cloned()),
        }
    }

    #[test]
    fn url_from_description() {
        let s = step(StepType::Navigate, "Go to https://example.com/app", None);
        assert_eq!(resolve_url(&s).unwrap(), "https://example.com/app");

        let s = step(StepType::Navigate, "Open https://example.com/app?x=1.", None);
        assert_eq!(resolve_url(&s).unwrap(), "https://example.com/app?x=1");
    }

    #[test]
    fn url_context_wins() {
        let s = step(
            StepType::Navigate,
            "Go to https://wrong.example",
            Some(json!({"url": "https://right.example"})),
        );
        assert_eq!(resolve_url(&s).unwrap(), "https://right.example");
    }

    #[test]
    fn missing_url_is_a_resolution_error() {
        let s = step(StepType::Navigate, "Open the app", None);
        assert!(matches!(resolve_url(&s), Err(ResolveError::MissingUrl(_))));
    }

    #[test]
    fn network_from_context_and_description() {
        let s = step(StepType::SwitchNetwork, "switch", Some(json!({"networkName": "Base"})));
        assert_eq!(
            resolve_network(&s).unwrap(),
            ResolvedNetwork {
                name: "Base".into(),
                chain_id: Some(8453)
            }
        );

        let s = step(StepType::SwitchNetwork, "Switch to Base Sepolia testnet", None);
        assert_eq!(resolve_network(&s).unwrap().chain_id, Some(84_532));

        // "base" inside "database" is not a match
        let s = step(StepType::SwitchNetwork, "Switch the database", None);
        assert!(resolve_network(&s).is_err());
    }

    #[test]
    fn unknown_network_name_keeps_chain_unknown() {
        let s = step(
            StepType::SwitchNetwork,
            "switch",
            Some(json!({"networkName": "Zora Devnet"})),
        );
        let network = resolve_network(&s).unwrap();
        assert_eq!(network.chain_id, None);
        assert_eq!(SwitchStrategy::chain_for(&network), vec![SwitchStrategy::WalletUi]);
    }

    #[test]
    fn chain_id_only_context() {
        let s = step(StepType::SwitchNetwork, "switch", Some(json!({"chainId": "0xa4b1"})));
        assert_eq!(
            resolve_network(&s).unwrap(),
            ResolvedNetwork {
                name: "Arbitrum One".into(),
                chain_id: Some(42_161)
            }
        );
    }

    #[test]
    fn chain_id_parsing() {
        assert_eq!(parse_chain_id("0x2105"), Some(8453));
        assert_eq!(parse_chain_id("8453"), Some(8453));
        assert_eq!(parse_chain_id("base"), None);
    }

    #[test]
    fn switch_script_uses_hex_chain_id() {
        assert!(switch_chain_js(8453).contains("chainId: '0x2105'"));
    }
}
