use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The closed set of intent step kinds produced by the recording translator.
///
/// Anything the translator emits that is not in this set is kept verbatim in
/// `Other` so it can still be routed (to the agent loop) instead of failing
/// deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepType {
    Navigate,
    ConnectWallet,
    SignMessage,
    SwitchNetwork,
    ConfirmTransaction,
    FillForm,
    ClickElement,
    VerifyState,
    DismissObstacle,
    Other(String),
}

impl StepType {
    pub fn as_str(&self) -> &str {
        match self {
            StepType::Navigate => "navigate",
            StepType::ConnectWallet => "connect_wallet",
            StepType::SignMessage => "sign_message",
            StepType::SwitchNetwork => "switch_network",
            StepType::ConfirmTransaction => "confirm_transaction",
            StepType::FillForm => "fill_form",
            StepType::ClickElement => "click_element",
            StepType::VerifyState => "verify_state",
            StepType::DismissObstacle => "dismiss_obstacle",
            StepType::Other(raw) => raw,
        }
    }
}

impl From<String> for StepType {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "navigate" => StepType::Navigate,
            "connect_wallet" => StepType::ConnectWallet,
            "sign_message" => StepType::SignMessage,
            "switch_network" => StepType::SwitchNetwork,
            "confirm_transaction" => StepType::ConfirmTransaction,
            "fill_form" => StepType::FillForm,
            "click_element" => StepType::ClickElement,
            "verify_state" => StepType::VerifyState,
            "dismiss_obstacle" => StepType::DismissObstacle,
            _ => StepType::Other(raw),
        }
    }
}

impl From<StepType> for String {
    fn from(step_type: StepType) -> Self {
        step_type.as_str().to_string()
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One semantic unit of test intent. Read-only to the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentStep {
    pub id: String,
    pub description: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub source_step_indices: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
}

impl IntentStep {
    /// Non-empty string value of a context field. Numbers are stringified so
    /// `{"chainId": 8453}` and `{"chainId": "8453"}` read the same.
    pub fn context_str(&self, key: &str) -> Option<String> {
        let value = self.context.as_ref()?.get(key)?;
        let text = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Deterministic,
    Agent,
}

/// One tool invocation (or deterministic strategy attempt) inside a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAction {
    pub tool: String,
    pub input: Value,
    pub output: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_after: Option<String>,
    pub duration_ms: u64,
}

/// Per-step outcome. `api_calls` is always 0 for deterministic steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub index: usize,
    pub description: String,
    pub step_type: StepType,
    pub mode: ExecutionMode,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub api_calls: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub actions: Vec<AgentAction>,
}

impl StepResult {
    fn new(step: &IntentStep, index: usize, mode: ExecutionMode, status: StepStatus) -> Self {
        Self {
            step_id: step.id.clone(),
            index,
            description: step.description.clone(),
            step_type: step.step_type.clone(),
            mode,
            status,
            summary: None,
            error: None,
            api_calls: 0,
            duration_ms: 0,
            actions: Vec::new(),
        }
    }

    pub fn passed(
        step: &IntentStep,
        index: usize,
        mode: ExecutionMode,
        summary: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(step, index, mode, StepStatus::Passed);
        result.summary = Some(summary.into());
        result
    }

    pub fn failed(
        step: &IntentStep,
        index: usize,
        mode: ExecutionMode,
        error: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(step, index, mode, StepStatus::Failed);
        result.error = Some(error.into());
        result
    }

    pub fn skipped(step: &IntentStep, index: usize, mode: ExecutionMode, reason: &str) -> Self {
        let mut result = Self::new(step, index, mode, StepStatus::Skipped);
        result.summary = Some(reason.to_string());
        result
    }

    pub fn with_actions(mut self, actions: Vec<AgentAction>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Token counts reported by the model service for a single call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

/// Cumulative usage for a run. Only `CostTracker` mutates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUsage {
    pub api_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub estimated_cost_usd: f64,
}

/// Terminal declarations emitted by the control tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlSignal {
    StepComplete {
        #[serde(rename = "stepId")]
        step_id: String,
        summary: String,
    },
    StepFailed {
        #[serde(rename = "stepId")]
        step_id: String,
        error: String,
    },
    TestComplete {
        passed: bool,
        summary: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Cancelled,
}

/// Output of one full run, handed to the caller once finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunResult {
    pub passed: bool,
    pub status: RunStatus,
    pub summary: String,
    pub steps: Vec<StepResult>,
    pub duration_ms: u64,
    pub usage: AgentUsage,
    pub artifacts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_type_accepts_kebab_and_snake_case() {
        let kebab: StepType = serde_json::from_value(json!("switch-network")).unwrap();
        let snake: StepType = serde_json::from_value(json!("switch_network")).unwrap();
        assert_eq!(kebab, StepType::SwitchNetwork);
        assert_eq!(snake, StepType::SwitchNetwork);
        assert_eq!(serde_json::to_value(&kebab).unwrap(), json!("switch_network"));
    }

    #[test]
    fn unknown_step_type_is_preserved() {
        let step: IntentStep = serde_json::from_value(json!({
            "id": "s1",
            "description": "Hover the avatar",
            "type": "hover-avatar",
        }))
        .unwrap();
        assert_eq!(step.step_type, StepType::Other("hover-avatar".into()));
        assert!(step.source_step_indices.is_empty());
        assert!(step.context.is_none());
    }

    #[test]
    fn context_str_stringifies_numbers_and_skips_blanks() {
        let step: IntentStep = serde_json::from_value(json!({
            "id": "s1",
            "description": "Switch",
            "type": "switch_network",
            "sourceStepIndices": [3, 4],
            "context": {"chainId": 8453, "networkName": "  ", "url": "https://x.io"}
        }))
        .unwrap();
        assert_eq!(step.context_str("chainId").as_deref(), Some("8453"));
        assert_eq!(step.context_str("networkName"), None);
        assert_eq!(step.context_str("url").as_deref(), Some("https://x.io"));
        assert_eq!(step.source_step_indices, vec![3, 4]);
    }

    #[test]
    fn control_signal_is_tagged() {
        let signal = ControlSignal::StepFailed {
            step_id: "s2".into(),
            error: "no button".into(),
        };
        assert_eq!(
            serde_json::to_value(&signal).unwrap(),
            json!({"type": "step_failed", "stepId": "s2", "error": "no button"})
        );
    }
}
