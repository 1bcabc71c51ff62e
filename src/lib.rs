//! Hybrid end-to-end runner for dApp tests: fixed-shape steps (navigate,
//! switch network, verify state) run deterministically, everything else goes
//! through a tool-calling model loop driving a browser and a wallet.

pub mod actions;
pub mod agent_loop;
pub mod brain;
pub mod classifier;
pub mod config;
pub mod context;
pub mod cost;
pub mod deterministic;
pub mod dom;
pub mod error;
pub mod hands;
pub mod orchestrator;
pub mod surface;
pub mod tools;
pub mod types;
pub mod wallet;

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::{BufReader, BufWriter};
use std::path::Path;

pub use actions::BrowserWalletToolkit;
pub use agent_loop::{AgentLoop, RunDirective};
pub use brain::{Brain, ModelRequest, ModelTurn, ToolCallingModel};
pub use config::AgentConfig;
pub use context::AgentContext;
pub use cost::CostTracker;
pub use deterministic::DeterministicExecutor;
pub use orchestrator::{RunEvent, RunOrchestrator};
pub use surface::{BrowserPage, WalletSurface};
pub use tools::{ActionToolkit, ToolCall, ToolCallResult, ToolDefinition};
pub use types::{AgentRunResult, IntentStep, StepResult, StepStatus, StepType};

/// Read a JSON array of intent steps.
pub fn load_steps(path: &Path) -> Result<Vec<IntentStep>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("could not open steps file {}", path.display()))?;
    let reader = BufReader::new(file);
    let steps: Vec<IntentStep> = serde_json::from_reader(reader)
        .with_context(|| format!("{} is not a valid intent step list", path.display()))?;
    Ok(steps)
}

/// Write the run result as pretty JSON, creating parent directories.
pub fn save_run_result(path: &Path, result: &AgentRunResult) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("could not write {}", path.display()))?;

    serde_json::to_writer_pretty(BufWriter::new(file), result)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentUsage, RunStatus};

    #[test]
    fn loads_steps_and_saves_results() {
        let dir = tempfile::tempdir().unwrap();
        let steps_path = dir.path().join("steps.json");
        std::fs::write(
            &steps_path,
            r#"[
                {"id": "s1", "description": "Open the app", "type": "navigate",
                 "context": {"url": "https://example.com/app"}},
                {"id": "s2", "description": "Connect the wallet", "type": "connect-wallet",
                 "sourceStepIndices": [3, 4]}
            ]"#,
        )
        .unwrap();

        let steps = load_steps(&steps_path).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_type, StepType::Navigate);
        assert_eq!(steps[1].step_type, StepType::ConnectWallet);
        assert_eq!(steps[1].source_step_indices, vec![3, 4]);

        let result = AgentRunResult {
            passed: true,
            status: RunStatus::Passed,
            summary: "All 2 steps passed".into(),
            steps: Vec::new(),
            duration_ms: 12,
            usage: AgentUsage::default(),
            artifacts: Vec::new(),
            error: None,
        };
        let out = dir.path().join("nested").join("result.json");
        save_run_result(&out, &result).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(written["passed"], true);
        assert_eq!(written["durationMs"], 12);
    }

    #[test]
    fn missing_steps_file_names_the_path() {
        let err = load_steps(Path::new("/nonexistent/steps.json")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/steps.json"));
    }
}
