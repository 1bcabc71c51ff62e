//! Tool surface exposed to the model: control tools plus a pluggable set of
//! domain action tools.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::context::AgentContext;
use crate::error::ToolInputError;
use crate::types::ControlSignal;

pub const STEP_COMPLETE: &str = "step_complete";
pub const STEP_FAILED: &str = "step_failed";
pub const TEST_COMPLETE: &str = "test_complete";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

/// The single tool call the model selected on a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ToolCallResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub control_signal: Option<ControlSignal>,
}

impl ToolCallResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            output: format!("Error: {message}"),
            error: Some(message),
            control_signal: None,
        }
    }
}

/// Domain action tools (browser and wallet operations). Open-ended: the set
/// is whatever `definitions()` returns.
#[async_trait]
pub trait ActionToolkit: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Run one action. Failures are reported in the result, never raised.
    async fn execute(&self, name: &str, input: &Value, ctx: &mut AgentContext) -> ToolCallResult;
}

#[derive(Debug, Deserialize)]
struct StepCompleteInput {
    summary: String,
}

#[derive(Debug, Deserialize)]
struct StepFailedInput {
    error: String,
}

#[derive(Debug, Deserialize)]
struct TestCompleteInput {
    passed: bool,
    summary: String,
}

/// The fixed set of terminal tools. Matching on this is exhaustive, so adding
/// a control tool forces every consumer to handle it.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlTool {
    StepComplete { summary: String },
    StepFailed { error: String },
    TestComplete { passed: bool, summary: String },
}

impl ControlTool {
    pub fn is_control_name(name: &str) -> bool {
        matches!(name, STEP_COMPLETE | STEP_FAILED | TEST_COMPLETE)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlTool::StepComplete { .. } => STEP_COMPLETE,
            ControlTool::StepFailed { .. } => STEP_FAILED,
            ControlTool::TestComplete { .. } => TEST_COMPLETE,
        }
    }

    pub fn parse(name: &str, input: &Value) -> Result<Self, ToolInputError> {
        let malformed = |e: serde_json::Error| ToolInputError::Malformed {
            tool: name.to_string(),
            reason: e.to_string(),
        };
        match name {
            STEP_COMPLETE => {
                let args: StepCompleteInput =
                    serde_json::from_value(input.clone()).map_err(malformed)?;
                Ok(ControlTool::StepComplete {
                    summary: args.summary,
                })
            }
            STEP_FAILED => {
                let args: StepFailedInput =
                    serde_json::from_value(input.clone()).map_err(malformed)?;
                Ok(ControlTool::StepFailed { error: args.error })
            }
            TEST_COMPLETE => {
                let args: TestCompleteInput =
                    serde_json::from_value(input.clone()).map_err(malformed)?;
                Ok(ControlTool::TestComplete {
                    passed: args.passed,
                    summary: args.summary,
                })
            }
            other => Err(ToolInputError::UnknownTool(other.to_string())),
        }
    }

    /// `success` mirrors the semantic outcome: `step_failed` and
    /// `test_complete{passed:false}` are unsuccessful calls.
    pub fn execute(self, step_id: &str) -> ToolCallResult {
        let (success, output, signal) = match self {
            ControlTool::StepComplete { summary } => (
                true,
                format!("Step {step_id} marked complete"),
                ControlSignal::StepComplete {
                    step_id: step_id.to_string(),
                    summary,
                },
            ),
            ControlTool::StepFailed { error } => (
                false,
                format!("Step {step_id} marked failed: {error}"),
                ControlSignal::StepFailed {
                    step_id: step_id.to_string(),
                    error,
                },
            ),
            ControlTool::TestComplete { passed, summary } => (
                passed,
                format!(
                    "Test finished ({})",
                    if passed { "passed" } else { "failed" }
                ),
                ControlSignal::TestComplete { passed, summary },
            ),
        };
        ToolCallResult {
            success,
            error: (!success).then(|| output.clone()),
            output,
            control_signal: Some(signal),
        }
    }

    pub fn definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                STEP_COMPLETE,
                "Declare the current test step done. Call only once the step's goal is visibly achieved.",
                json!({
                    "type": "object",
                    "properties": {
                        "summary": {"type": "string", "description": "What was done and what you observed"}
                    },
                    "required": ["summary"]
                }),
            ),
            ToolDefinition::new(
                STEP_FAILED,
                "Declare the current test step failed when it cannot be completed.",
                json!({
                    "type": "object",
                    "properties": {
                        "error": {"type": "string", "description": "Why the step cannot be completed"}
                    },
                    "required": ["error"]
                }),
            ),
            ToolDefinition::new(
                TEST_COMPLETE,
                "End the whole test immediately with a final verdict. Remaining steps are skipped.",
                json!({
                    "type": "object",
                    "properties": {
                        "passed": {"type": "boolean"},
                        "summary": {"type": "string"}
                    },
                    "required": ["passed", "summary"]
                }),
            ),
        ]
    }
}

/// What a model tool call resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    Control(ControlTool),
    Action { name: String, input: Value },
}

/// Control tools plus the action toolkit, keyed for the model.
pub struct ToolRegistry<'a> {
    toolkit: &'a dyn ActionToolkit,
    action_definitions: Vec<ToolDefinition>,
}

impl<'a> ToolRegistry<'a> {
    pub fn new(toolkit: &'a dyn ActionToolkit) -> Self {
        Self {
            action_definitions: toolkit.definitions(),
            toolkit,
        }
    }

    pub fn toolkit(&self) -> &'a dyn ActionToolkit {
        self.toolkit
    }

    /// Action tools first, control tools last.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut all = self.action_definitions.clone();
        all.extend(ControlTool::definitions());
        all
    }

    pub fn resolve(&self, call: &ToolCall) -> Result<ToolInvocation, ToolInputError> {
        if ControlTool::is_control_name(&call.name) {
            return ControlTool::parse(&call.name, &call.input).map(ToolInvocation::Control);
        }
        if self.action_definitions.iter().any(|d| d.name == call.name) {
            return Ok(ToolInvocation::Action {
                name: call.name.clone(),
                input: call.input.clone(),
            });
        }
        Err(ToolInputError::UnknownTool(call.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OneTool;

    #[async_trait]
    impl ActionToolkit for OneTool {
        fn definitions(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition::new("browser_click", "click", json!({"type": "object"}))]
        }

        async fn execute(&self, _: &str, _: &Value, _: &mut AgentContext) -> ToolCallResult {
            ToolCallResult::success("clicked")
        }
    }

    fn call(name: &str, input: Value) -> ToolCall {
        ToolCall {
            name: name.into(),
            input,
        }
    }

    #[test]
    fn resolves_control_and_action_tools() {
        let registry = ToolRegistry::new(&OneTool);
        assert_eq!(registry.definitions().len(), 4);

        assert_eq!(
            registry
                .resolve(&call(STEP_COMPLETE, json!({"summary": "ok"})))
                .unwrap(),
            ToolInvocation::Control(ControlTool::StepComplete {
                summary: "ok".into()
            })
        );
        assert!(matches!(
            registry.resolve(&call("browser_click", json!({"ref": "s1-e0"}))),
            Ok(ToolInvocation::Action { .. })
        ));
        assert_eq!(
            registry.resolve(&call("browser_hover", json!({}))),
            Err(ToolInputError::UnknownTool("browser_hover".into()))
        );
    }

    #[test]
    fn malformed_control_input_is_an_error() {
        let err = ControlTool::parse(TEST_COMPLETE, &json!({"summary": "done"})).unwrap_err();
        assert!(matches!(err, ToolInputError::Malformed { ref tool, .. } if tool == TEST_COMPLETE));

        assert!(ControlTool::parse(STEP_FAILED, &json!("not an object")).is_err());
    }

    #[test]
    fn control_results_mirror_semantic_success() {
        let done = ControlTool::StepComplete {
            summary: "connected".into(),
        }
        .execute("s1");
        assert!(done.success);
        assert_eq!(
            done.control_signal,
            Some(ControlSignal::StepComplete {
                step_id: "s1".into(),
                summary: "connected".into()
            })
        );

        let failed = ControlTool::StepFailed {
            error: "no popup".into(),
        }
        .execute("s2");
        assert!(!failed.success);
        assert!(failed.error.is_some());

        let verdict = ControlTool::TestComplete {
            passed: false,
            summary: "balance wrong".into(),
        }
        .execute("s3");
        assert!(!verdict.success);
        assert_eq!(
            verdict.control_signal,
            Some(ControlSignal::TestComplete {
                passed: false,
                summary: "balance wrong".into()
            })
        );
    }
}
