//! Boundary traits for the browser and wallet automation the runner drives.
//!
//! `hands` implements both on top of headless_chrome; tests use in-memory fakes.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

#[async_trait]
pub trait BrowserPage: Send + Sync {
    /// Navigate and wait until the load settles or `timeout` elapses.
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()>;

    async fn title(&self) -> Result<String>;

    async fn url(&self) -> Result<String>;

    /// Evaluate a JS expression in the page. With `await_promise` the
    /// returned promise is awaited first. Non-serializable results come back
    /// as `Value::Null`.
    async fn evaluate(&self, expression: &str, await_promise: bool) -> Result<Value>;

    /// Write a PNG of the viewport to `path`.
    async fn screenshot(&self, path: &Path) -> Result<()>;

    async fn click(&self, selector: &str) -> Result<()>;

    /// Focus the element, clear it, then type `text`.
    async fn type_text(&self, selector: &str, text: &str) -> Result<()>;

    async fn press_key(&self, key: &str) -> Result<()>;
}

/// Wallet-level primitives. Each one handles its own confirmation popup.
#[async_trait]
pub trait WalletSurface: Send + Sync {
    /// Approve a pending connection request.
    async fn approve(&self) -> Result<()>;

    async fn sign(&self) -> Result<()>;

    async fn confirm_transaction(&self) -> Result<()>;

    /// Reject whatever request the wallet is currently showing.
    async fn reject(&self) -> Result<()>;

    async fn switch_network(&self, network_name: &str) -> Result<()>;
}
