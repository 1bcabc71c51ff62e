use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::agent_loop::{AgentLoop, RunDirective};
use crate::brain::ToolCallingModel;
use crate::classifier::execution_mode;
use crate::config::AgentConfig;
use crate::context::AgentContext;
use crate::cost::CostTracker;
use crate::deterministic::DeterministicExecutor;
use crate::tools::ActionToolkit;
use crate::types::{
    AgentRunResult, ExecutionMode, IntentStep, RunStatus, StepResult, StepStatus,
};

/// Progress notifications for whoever is watching a run.
#[derive(Clone, Debug)]
pub enum RunEvent {
    RunStarted {
        total: usize,
    },
    StepStarted {
        index: usize,
        total: usize,
        step_id: String,
        mode: ExecutionMode,
    },
    StepFinished {
        index: usize,
        step_id: String,
        status: StepStatus,
    },
    RunFinished {
        status: RunStatus,
        passed: bool,
    },
}

/// Walks the intent steps in order and routes each one to the deterministic
/// executor or the agent loop. The only writer of `AgentRunResult`.
pub struct RunOrchestrator<'a> {
    config: &'a AgentConfig,
    model: &'a dyn ToolCallingModel,
    toolkit: &'a dyn ActionToolkit,
    executor: DeterministicExecutor,
    events: Option<broadcast::Sender<RunEvent>>,
}

impl<'a> RunOrchestrator<'a> {
    pub fn new(
        config: &'a AgentConfig,
        model: &'a dyn ToolCallingModel,
        toolkit: &'a dyn ActionToolkit,
    ) -> Self {
        Self {
            config,
            model,
            toolkit,
            executor: DeterministicExecutor::default(),
            events: None,
        }
    }

    pub fn with_executor(mut self, executor: DeterministicExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    pub async fn run(&self, steps: &[IntentStep], ctx: &mut AgentContext) -> AgentRunResult {
        let started = Instant::now();
        let total = steps.len();
        let mut status = RunStatus::Pending;
        let mut tracker = CostTracker::new(self.config);
        let agent = AgentLoop::new(self.config, self.model, self.toolkit);

        let mut results: Vec<StepResult> = Vec::with_capacity(total);
        let mut verdict: Option<(bool, String)> = None;
        let mut abort_reason: Option<String> = None;
        let mut cancelled = false;

        info!(steps = total, model = %self.config.model, "Starting run");
        status = transition(status, RunStatus::Running);
        self.emit(RunEvent::RunStarted { total });

        for (index, step) in steps.iter().enumerate() {
            let stop_reason = if cancelled || ctx.is_cancelled() {
                cancelled = true;
                Some("Skipped: run cancelled")
            } else if verdict.is_some() {
                Some("Skipped: test already completed")
            } else if abort_reason.is_some() {
                Some("Skipped: run aborted")
            } else {
                None
            };
            let mode = execution_mode(step);
            if let Some(reason) = stop_reason {
                results.push(StepResult::skipped(step, index, mode, reason));
                continue;
            }

            self.emit(RunEvent::StepStarted {
                index,
                total,
                step_id: step.id.clone(),
                mode,
            });

            let (result, directive) = match mode {
                ExecutionMode::Deterministic => (
                    self.executor.execute(step, index, total, ctx).await,
                    RunDirective::Continue,
                ),
                ExecutionMode::Agent => {
                    let outcome = agent.run_step(step, index, total, ctx, &mut tracker).await;
                    (outcome.result, outcome.directive)
                }
            };

            match &result.status {
                StepStatus::Failed => warn!(step = %step.id, error = ?result.error, "Step failed"),
                _ => info!(step = %step.id, status = ?result.status, duration_ms = result.duration_ms, "Step finished"),
            }
            self.emit(RunEvent::StepFinished {
                index,
                step_id: step.id.clone(),
                status: result.status,
            });
            results.push(result);

            match directive {
                RunDirective::Continue => {}
                RunDirective::EndRun { passed, summary } => verdict = Some((passed, summary)),
                RunDirective::AbortRun { reason } => abort_reason = Some(reason),
                RunDirective::Cancelled => cancelled = true,
            }
        }

        let failed = results.iter().filter(|r| r.status == StepStatus::Failed).count();
        let passed_steps = results.iter().filter(|r| r.status == StepStatus::Passed).count();

        let (passed, summary, error) = if cancelled {
            let ran = results.iter().filter(|r| r.status != StepStatus::Skipped).count();
            (
                false,
                format!("Run cancelled after {ran} of {total} steps"),
                Some("cancelled".to_string()),
            )
        } else if let Some(reason) = abort_reason {
            (false, reason.clone(), Some(reason))
        } else if let Some((verdict_passed, summary)) = verdict {
            (verdict_passed && failed == 0, summary, None)
        } else {
            let passed = failed == 0;
            let summary = if passed {
                format!("All {total} steps passed")
            } else {
                format!("{failed} of {total} steps failed ({passed_steps} passed)")
            };
            (passed, summary, None)
        };

        status = transition(
            status,
            if cancelled {
                RunStatus::Cancelled
            } else if passed {
                RunStatus::Passed
            } else {
                RunStatus::Failed
            },
        );

        let usage = tracker.usage();
        info!(
            ?status,
            passed,
            api_calls = usage.api_calls,
            cost_usd = usage.estimated_cost_usd,
            "Run finished: {summary}"
        );
        self.emit(RunEvent::RunFinished { status, passed });

        AgentRunResult {
            passed,
            status,
            summary,
            steps: results,
            duration_ms: started.elapsed().as_millis() as u64,
            usage,
            artifacts: ctx.take_artifacts(),
            error,
        }
    }
}

/// PENDING -> RUNNING -> {PASSED, FAILED, CANCELLED}.
fn transition(from: RunStatus, to: RunStatus) -> RunStatus {
    debug_assert!(
        matches!(
            (from, to),
            (RunStatus::Pending, RunStatus::Running)
                | (
                    RunStatus::Running,
                    RunStatus::Passed | RunStatus::Failed | RunStatus::Cancelled
                )
        ),
        "invalid run transition {from:?} -> {to:?}"
    );
    to
}
