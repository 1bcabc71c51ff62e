use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dom::{SnapshotNode, parse_ref_generation};
use crate::error::SnapshotError;
use crate::surface::{BrowserPage, WalletSurface};
use crate::types::StepType;

/// Everything one run needs to touch the browser and wallet.
///
/// Owned by exactly one run. Concurrent runs each build their own.
pub struct AgentContext {
    pub page: Arc<dyn BrowserPage>,
    pub wallet: Arc<dyn WalletSurface>,
    /// Refs from the latest snapshot only. Replaced wholesale on each capture.
    pub snapshot_refs: HashMap<String, SnapshotNode>,
    pub snapshot_generation: u64,
    pub artifacts_dir: PathBuf,
    pub screenshot_counter: u32,
    pub artifacts: Vec<PathBuf>,
    pub cancel: CancellationToken,
}

impl AgentContext {
    pub fn new(
        page: Arc<dyn BrowserPage>,
        wallet: Arc<dyn WalletSurface>,
        artifacts_dir: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            page,
            wallet,
            snapshot_refs: HashMap::new(),
            snapshot_generation: 0,
            artifacts_dir: artifacts_dir.into(),
            screenshot_counter: 0,
            artifacts: Vec::new(),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn resolve_ref(&self, reference: &str) -> Result<&SnapshotNode, SnapshotError> {
        if let Some(node) = self.snapshot_refs.get(reference) {
            return Ok(node);
        }
        match parse_ref_generation(reference) {
            Some(stale) if stale < self.snapshot_generation => Err(SnapshotError::StaleRef {
                reference: reference.to_string(),
                stale,
                current: self.snapshot_generation,
            }),
            _ => Err(SnapshotError::UnknownRef(reference.to_string())),
        }
    }

    /// Take a screenshot for the given step. Failures are logged and swallowed;
    /// a screenshot never decides a step's outcome.
    pub async fn capture_screenshot(
        &mut self,
        step_index: usize,
        step_type: &StepType,
        label: &str,
    ) -> Option<String> {
        self.screenshot_counter += 1;
        let file_name = artifact_file_name(self.screenshot_counter, step_index, step_type, label);
        let path = self.artifacts_dir.join(file_name);

        if let Err(e) = tokio::fs::create_dir_all(&self.artifacts_dir).await {
            warn!(dir = %self.artifacts_dir.display(), error = %e, "Could not create artifacts dir");
            return None;
        }

        match self.page.screenshot(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Captured screenshot");
                let display = path_string(&path);
                self.artifacts.push(path);
                Some(display)
            }
            Err(e) => {
                warn!(step = step_index, label, error = %format!("{e:#}"), "Screenshot failed");
                None
            }
        }
    }

    pub fn take_artifacts(&mut self) -> Vec<String> {
        self.artifacts.drain(..).map(|p| path_string(&p)).collect()
    }
}

/// `{counter}-step{index}-{type}-{label}.png`, zero-padded so a plain
/// lexical sort matches capture order.
pub fn artifact_file_name(
    counter: u32,
    step_index: usize,
    step_type: &StepType,
    label: &str,
) -> String {
    format!(
        "{counter:03}-step{step_index:02}-{}-{}.png",
        sanitize(step_type.as_str()),
        sanitize(label)
    )
}

fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() { "shot".to_string() } else { trimmed.to_string() }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_names_embed_index_and_type() {
        assert_eq!(
            artifact_file_name(7, 2, &StepType::SwitchNetwork, "after"),
            "007-step02-switch_network-after.png"
        );
        assert_eq!(
            artifact_file_name(12, 10, &StepType::Other("Hover Menu".into()), "before browser_click"),
            "012-step10-hover-menu-before-browser_click.png"
        );
        assert_eq!(artifact_file_name(1, 0, &StepType::Navigate, "///"), "001-step00-navigate-shot.png");
    }
}
