//! Model-driven execution of a single intent step.
//!
//! Each step runs a small state machine:
//!
//! ```text
//! AWAITING_MODEL -> EXECUTING_TOOL -> AWAITING_MODEL | STEP_TERMINAL
//! ```
//!
//! Cancellation, the step timeout and both call budgets are checked before
//! every model call. The loop never retries a failed tool on its own; the
//! model sees the failure in its history and decides.

use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::brain::{ModelRequest, ToolCallingModel};
use crate::config::AgentConfig;
use crate::context::AgentContext;
use crate::cost::{BudgetCheck, CostTracker};
use crate::dom::{capture_snapshot, truncate_chars};
use crate::tools::{ActionToolkit, ToolCall, ToolInvocation, ToolRegistry};
use crate::types::{
    AgentAction, ControlSignal, ExecutionMode, IntentStep, StepResult, TokenUsage,
};

const HISTORY_OUTPUT_MAX_CHARS: usize = 300;

pub const SYSTEM_PROMPT: &str = r#"You are an end-to-end test agent for decentralized web apps. You control a real Chrome browser with a crypto wallet extension, one tool call at a time.

Rules:
1. Call exactly ONE tool per turn. Plain text replies are ignored.
2. Target elements by the [sN-eM] refs from the CURRENT snapshot. Refs from earlier snapshots are invalid.
3. Wallet popups (connect, sign, transaction, network) are handled with the wallet_* tools, not by clicking.
4. When the step's goal is visibly achieved, call step_complete with a short summary of the evidence.
5. If the step cannot be achieved, call step_failed with the reason. Do not loop on the same failing action.
6. Call test_complete only when the outcome of the whole test is already decided; remaining steps will be skipped.
7. Keep actions minimal. Do not navigate away unless the step asks for it."#;

/// What the orchestrator should do after a step.
#[derive(Debug, Clone, PartialEq)]
pub enum RunDirective {
    Continue,
    /// `test_complete` was called: stop and use this verdict.
    EndRun { passed: bool, summary: String },
    /// Run-wide call budget exhausted.
    AbortRun { reason: String },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct AgentStepOutcome {
    pub result: StepResult,
    pub directive: RunDirective,
}

pub struct AgentLoop<'a> {
    config: &'a AgentConfig,
    model: &'a dyn ToolCallingModel,
    registry: ToolRegistry<'a>,
}

impl<'a> AgentLoop<'a> {
    pub fn new(
        config: &'a AgentConfig,
        model: &'a dyn ToolCallingModel,
        toolkit: &'a dyn ActionToolkit,
    ) -> Self {
        Self {
            config,
            model,
            registry: ToolRegistry::new(toolkit),
        }
    }

    pub async fn run_step(
        &self,
        step: &IntentStep,
        index: usize,
        total: usize,
        ctx: &mut AgentContext,
        tracker: &mut CostTracker,
    ) -> AgentStepOutcome {
        info!(step = %step.id, kind = %step.step_type, "Step {}/{} (agent): {}", index + 1, total, step.description);

        let mut run = StepRun {
            step,
            index,
            started: Instant::now(),
            calls: 0,
            actions: Vec::new(),
            history: Vec::new(),
        };
        let step_timeout = Duration::from_millis(self.config.step_timeout_ms);
        let definitions = self.registry.definitions();

        loop {
            // AWAITING_MODEL
            if ctx.is_cancelled() {
                return run.fail("Run cancelled", RunDirective::Cancelled);
            }
            if run.started.elapsed() >= step_timeout {
                return run.fail(
                    format!("Step timed out after {}ms", self.config.step_timeout_ms),
                    RunDirective::Continue,
                );
            }
            match tracker.check_budget(run.calls) {
                BudgetCheck::Available => {}
                BudgetCheck::StepExhausted { used, limit } => {
                    return run.fail(
                        format!("Per-step API call budget exceeded ({used}/{limit} calls) without a control signal"),
                        RunDirective::Continue,
                    );
                }
                BudgetCheck::RunExhausted { used, limit } => {
                    warn!(used, limit, "Run-wide API call budget exhausted");
                    return run.fail(
                        format!("Run-wide API call budget exhausted ({used}/{limit} calls)"),
                        RunDirective::AbortRun {
                            reason: format!("Run aborted: API call budget exceeded ({used}/{limit} calls)"),
                        },
                    );
                }
            }

            let snapshot = match capture_snapshot(ctx).await {
                Ok(snapshot) => snapshot.render(),
                Err(e) => {
                    warn!(step = %step.id, error = %format!("{e:#}"), "Snapshot capture failed");
                    format!("(snapshot unavailable: {e:#})")
                }
            };
            let request = ModelRequest {
                system: SYSTEM_PROMPT,
                prompt: build_prompt(step, index, total, &run.history, &snapshot),
                tools: &definitions,
            };

            let remaining = step_timeout.saturating_sub(run.started.elapsed());
            let reply = tokio::time::timeout(remaining, self.model.next_tool_call(&request)).await;
            run.calls += 1;

            let turn = match reply {
                Ok(Ok(turn)) => {
                    tracker.record_call(&turn.usage);
                    turn
                }
                Ok(Err(e)) => {
                    tracker.record_call(&TokenUsage::default());
                    return run.fail(format!("Model call failed: {e:#}"), RunDirective::Continue);
                }
                Err(_) => {
                    tracker.record_call(&TokenUsage::default());
                    return run.fail(
                        format!(
                            "Step timed out after {}ms waiting for the model",
                            self.config.step_timeout_ms
                        ),
                        RunDirective::Continue,
                    );
                }
            };

            let Some(call) = turn.tool_call else {
                warn!(step = %step.id, calls = run.calls, "Model returned no tool call");
                let said = turn
                    .text
                    .map(|t| format!(" You replied: \"{}\".", truncate_chars(&t, HISTORY_OUTPUT_MAX_CHARS)))
                    .unwrap_or_default();
                run.history.push(format!(
                    "(no tool call){said} You must call exactly one tool."
                ));
                continue;
            };

            // EXECUTING_TOOL
            match self.registry.resolve(&call) {
                Err(e) => {
                    warn!(step = %step.id, tool = %call.name, error = %e, "Rejected tool call");
                    run.record(&call, false, format!("Error: {e}"), None, None, Duration::ZERO);
                }
                Ok(ToolInvocation::Control(control)) => {
                    info!(step = %step.id, tool = control.name(), calls = run.calls, "Control tool called");
                    let result = control.execute(&step.id);
                    run.record(&call, result.success, result.output.clone(), None, None, Duration::ZERO);
                    if let Some(signal) = result.control_signal {
                        // STEP_TERMINAL
                        return run.terminal(signal);
                    }
                }
                Ok(ToolInvocation::Action { name, input }) => {
                    let before = self.screenshot(ctx, &run, &format!("before-{name}")).await;
                    let tool_started = Instant::now();
                    let result = self.registry.toolkit().execute(&name, &input, ctx).await;
                    let elapsed = tool_started.elapsed();
                    let after = self.screenshot(ctx, &run, &format!("after-{name}")).await;

                    info!(step = %step.id, tool = %name, success = result.success, "Tool executed");
                    run.record(&call, result.success, result.output, before, after, elapsed);
                }
            }
        }
    }

    async fn screenshot(&self, ctx: &mut AgentContext, run: &StepRun<'_>, label: &str) -> Option<String> {
        if !self.config.capture_step_screenshots {
            return None;
        }
        ctx.capture_screenshot(run.index, &run.step.step_type, label).await
    }
}

/// Mutable bookkeeping for one step's loop.
struct StepRun<'s> {
    step: &'s IntentStep,
    index: usize,
    started: Instant,
    calls: u32,
    actions: Vec<AgentAction>,
    history: Vec<String>,
}

impl StepRun<'_> {
    fn record(
        &mut self,
        call: &ToolCall,
        success: bool,
        output: String,
        screenshot_before: Option<String>,
        screenshot_after: Option<String>,
        elapsed: Duration,
    ) {
        self.history.push(format!(
            "{} {} -> {}: {}",
            call.name,
            compact(&call.input),
            if success { "ok" } else { "failed" },
            truncate_chars(&output, HISTORY_OUTPUT_MAX_CHARS)
        ));
        self.actions.push(AgentAction {
            tool: call.name.clone(),
            input: call.input.clone(),
            output,
            success,
            screenshot_before,
            screenshot_after,
            duration_ms: elapsed.as_millis() as u64,
        });
    }

    fn finish(self, result: StepResult, directive: RunDirective) -> AgentStepOutcome {
        let mut result = result
            .with_actions(self.actions)
            .with_duration(self.started.elapsed().as_millis() as u64);
        result.api_calls = self.calls;
        AgentStepOutcome { result, directive }
    }

    fn fail(self, error: impl Into<String>, directive: RunDirective) -> AgentStepOutcome {
        let error = error.into();
        warn!(step = %self.step.id, calls = self.calls, %error, "Agent step failed");
        let result = StepResult::failed(self.step, self.index, ExecutionMode::Agent, error);
        self.finish(result, directive)
    }

    fn terminal(self, signal: ControlSignal) -> AgentStepOutcome {
        let (step, index) = (self.step, self.index);
        match signal {
            ControlSignal::StepComplete { summary, .. } => {
                info!(step = %step.id, calls = self.calls, "Step complete");
                let result = StepResult::passed(step, index, ExecutionMode::Agent, summary);
                self.finish(result, RunDirective::Continue)
            }
            ControlSignal::StepFailed { error, .. } => {
                warn!(step = %step.id, calls = self.calls, %error, "Step declared failed");
                let result = StepResult::failed(step, index, ExecutionMode::Agent, error);
                self.finish(result, RunDirective::Continue)
            }
            ControlSignal::TestComplete { passed, summary } => {
                info!(step = %step.id, passed, "Test declared complete");
                let mut result = if passed {
                    StepResult::passed(step, index, ExecutionMode::Agent, summary.clone())
                } else {
                    StepResult::failed(step, index, ExecutionMode::Agent, summary.clone())
                };
                result.summary = Some(summary.clone());
                self.finish(result, RunDirective::EndRun { passed, summary })
            }
        }
    }
}

fn compact(input: &Value) -> String {
    truncate_chars(&input.to_string(), 200)
}

pub fn build_prompt(
    step: &IntentStep,
    index: usize,
    total: usize,
    history: &[String],
    snapshot: &str,
) -> String {
    let mut prompt = format!(
        "Test step {} of {}: {}\nStep id: {}\nStep type: {}\n",
        index + 1,
        total,
        step.description,
        step.id,
        step.step_type
    );
    if let Some(context) = step.context.as_ref().filter(|c| !c.is_empty()) {
        prompt.push_str(&format!("Step context: {}\n", Value::Object(context.clone())));
    }

    prompt.push_str("\nActions so far in this step:\n");
    if history.is_empty() {
        prompt.push_str("(none)\n");
    }
    for (n, entry) in history.iter().enumerate() {
        prompt.push_str(&format!("{}. {entry}\n", n + 1));
    }

    prompt.push_str("\nCurrent page snapshot:\n");
    prompt.push_str(snapshot);
    prompt.push_str("\n\nCall exactly one tool. Use step_complete when this step is done, step_failed if it cannot be done.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepType;
    use serde_json::json;

    #[test]
    fn prompt_carries_step_history_and_snapshot() {
        let step = IntentStep {
            id: "connect".into(),
            description: "Connect the wallet".into(),
            step_type: StepType::ConnectWallet,
            source_step_indices: vec![1, 2],
            context: json!({"wallet": "metamask"}).as_object().cloned(),
        };
        let history = vec!["browser_click {\"ref\":\"s1-e0\"} -> ok: Clicked button \"Connect\"".to_string()];
        let prompt = build_prompt(&step, 1, 4, &history, "[s2-e0] button \"MetaMask\"");

        assert!(prompt.starts_with("Test step 2 of 4: Connect the wallet"));
        assert!(prompt.contains("Step type: connect_wallet"));
        assert!(prompt.contains("\"wallet\":\"metamask\""));
        assert!(prompt.contains("1. browser_click"));
        assert!(prompt.contains("[s2-e0] button \"MetaMask\""));
    }

    #[test]
    fn empty_history_is_explicit() {
        let step = IntentStep {
            id: "s".into(),
            description: "Sign in".into(),
            step_type: StepType::SignMessage,
            source_step_indices: vec![],
            context: None,
        };
        let prompt = build_prompt(&step, 0, 1, &[], "");
        assert!(prompt.contains("Actions so far in this step:\n(none)"));
        assert!(!prompt.contains("Step context"));
    }
}
