//! Wallet automation over a browser-extension wallet (MetaMask-style UI).
//!
//! Every primitive waits for the extension's notification popup with
//! [`poll_until`], then clicks the first confirm/cancel button that exists.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use headless_chrome::{Browser, Tab};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::PollError;
use crate::surface::WalletSurface;

pub const POPUP_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const POPUP_TIMEOUT: Duration = Duration::from_secs(15);
const BUTTON_TIMEOUT: Duration = Duration::from_secs(3);

const APPROVE_BUTTONS: &[&str] = &[
    r#"[data-testid="confirm-btn"]"#,
    r#"[data-testid="page-container-footer-next"]"#,
];
const SIGN_BUTTONS: &[&str] = &[
    r#"[data-testid="confirm-footer-button"]"#,
    r#"[data-testid="signature-sign-button"]"#,
    r#"[data-testid="page-container-footer-next"]"#,
];
const CONFIRM_TX_BUTTONS: &[&str] = &[
    r#"[data-testid="confirm-footer-button"]"#,
    r#"[data-testid="page-container-footer-next"]"#,
];
const REJECT_BUTTONS: &[&str] = &[
    r#"[data-testid="confirm-footer-cancel-button"]"#,
    r#"[data-testid="cancel-btn"]"#,
    r#"[data-testid="page-container-footer-cancel"]"#,
];
const NETWORK_MENU: &str = r#"[data-testid="network-display"]"#;

/// Poll `probe` every `interval` until it yields a value, `timeout` elapses,
/// or `cancel` fires. One suspension point per iteration; cancellation wins
/// over the deadline, which wins over the next tick.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(PollError::TimedOut(timeout)),
            _ = ticker.tick() => {}
        }
        if let Some(found) = probe().await {
            return Ok(found);
        }
    }
}

/// Drives an unpacked wallet extension loaded into the same Chrome as the page.
pub struct ExtensionWallet {
    browser: Browser,
    extension_id: String,
    cancel: CancellationToken,
    popup_timeout: Duration,
}

impl ExtensionWallet {
    pub fn new(browser: Browser, extension_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            browser,
            extension_id: extension_id.into(),
            cancel,
            popup_timeout: POPUP_TIMEOUT,
        }
    }

    fn popup_prefix(&self) -> String {
        format!("chrome-extension://{}/notification.html", self.extension_id)
    }

    async fn wait_for_popup(&self) -> Result<Arc<Tab>> {
        let prefix = self.popup_prefix();
        debug!(%prefix, "Waiting for wallet popup");
        poll_until(POPUP_POLL_INTERVAL, self.popup_timeout, &self.cancel, || {
            let browser = self.browser.clone();
            let prefix = prefix.clone();
            async move {
                tokio::task::spawn_blocking(move || find_tab(&browser, &prefix))
                    .await
                    .ok()
                    .flatten()
            }
        })
        .await
        .map_err(|e| anyhow!("wallet popup did not appear: {e}"))
    }

    async fn click_in_popup(&self, action: &str, selectors: &'static [&'static str]) -> Result<()> {
        let popup = self.wait_for_popup().await?;
        let clicked = tokio::task::spawn_blocking(move || click_first(&popup, selectors))
            .await
            .map_err(|e| anyhow!("wallet task panicked: {e}"))??;
        info!(action, button = clicked, "Wallet popup handled");
        Ok(())
    }
}

#[async_trait]
impl WalletSurface for ExtensionWallet {
    async fn approve(&self) -> Result<()> {
        self.click_in_popup("approve", APPROVE_BUTTONS).await?;
        // Older wallet versions split the connect flow over two screens.
        let prefix = self.popup_prefix();
        let browser = self.browser.clone();
        let second = tokio::task::spawn_blocking(move || {
            find_tab(&browser, &prefix).map(|popup| click_first(&popup, APPROVE_BUTTONS))
        })
        .await;
        match second {
            Ok(Some(Ok(button))) => debug!(button, "Clicked second approval screen"),
            Ok(Some(Err(e))) => debug!(error = %format!("{e:#}"), "Second approval screen had no button"),
            Ok(None) => debug!("No second approval screen"),
            Err(e) => debug!(error = %e, "Second approval check panicked"),
        }
        Ok(())
    }

    async fn sign(&self) -> Result<()> {
        self.click_in_popup("sign", SIGN_BUTTONS).await
    }

    async fn confirm_transaction(&self) -> Result<()> {
        self.click_in_popup("confirm_transaction", CONFIRM_TX_BUTTONS).await
    }

    async fn reject(&self) -> Result<()> {
        self.click_in_popup("reject", REJECT_BUTTONS).await
    }

    async fn switch_network(&self, network_name: &str) -> Result<()> {
        let home = format!("chrome-extension://{}/home.html", self.extension_id);
        let xpath = format!(
            "//*[normalize-space(text())={}]",
            xpath_literal(network_name)
        );
        let browser = self.browser.clone();
        let name = network_name.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let tab = browser.new_tab()?;
            let outcome = (|| -> Result<()> {
                tab.navigate_to(&home)?.wait_until_navigated()?;
                tab.wait_for_element_with_custom_timeout(NETWORK_MENU, POPUP_TIMEOUT)?
                    .click()?;
                tab.wait_for_xpath_with_custom_timeout(&xpath, BUTTON_TIMEOUT)
                    .map_err(|_| anyhow!("network '{name}' not listed in wallet"))?
                    .click()?;
                std::thread::sleep(Duration::from_millis(500));
                Ok(())
            })();
            let _ = tab.close(false);
            outcome
        })
        .await
        .map_err(|e| anyhow!("wallet task panicked: {e}"))?
    }
}

/// Stand-in used when the run has no wallet extension. Every primitive fails,
/// so wallet steps fail cleanly instead of hanging on a popup.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredWallet;

impl UnconfiguredWallet {
    fn unavailable(action: &str) -> anyhow::Error {
        anyhow!("cannot {action}: no wallet extension configured (pass --extension-id)")
    }
}

#[async_trait]
impl WalletSurface for UnconfiguredWallet {
    async fn approve(&self) -> Result<()> {
        Err(Self::unavailable("approve"))
    }

    async fn sign(&self) -> Result<()> {
        Err(Self::unavailable("sign"))
    }

    async fn confirm_transaction(&self) -> Result<()> {
        Err(Self::unavailable("confirm transaction"))
    }

    async fn reject(&self) -> Result<()> {
        Err(Self::unavailable("reject"))
    }

    async fn switch_network(&self, network_name: &str) -> Result<()> {
        Err(Self::unavailable(&format!("switch to {network_name}")))
    }
}

fn find_tab(browser: &Browser, prefix: &str) -> Option<Arc<Tab>> {
    // Extension popups open as new targets that are not auto-attached.
    browser.register_missing_tabs();
    let tabs = browser.get_tabs().lock().ok()?;
    tabs.iter().find(|tab| tab.get_url().starts_with(prefix)).cloned()
}

fn click_first(tab: &Tab, selectors: &'static [&'static str]) -> Result<&'static str> {
    for selector in selectors {
        if let Ok(element) = tab.wait_for_element_with_custom_timeout(selector, BUTTON_TIMEOUT) {
            element.click()?;
            return Ok(*selector);
        }
    }
    Err(anyhow!("none of {selectors:?} found in wallet popup"))
}

/// Quote a string for XPath, handling embedded quotes.
fn xpath_literal(text: &str) -> String {
    if !text.contains('"') {
        format!("\"{text}\"")
    } else if !text.contains('\'') {
        format!("'{text}'")
    } else {
        let parts: Vec<String> = text.split('"').map(|p| format!("\"{p}\"")).collect();
        format!("concat({})", parts.join(", '\"', "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn poll_returns_once_probe_succeeds() {
        let cancel = CancellationToken::new();
        let attempts = AtomicUsize::new(0);
        let found = poll_until(Duration::from_millis(5), Duration::from_secs(2), &cancel, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move { (n >= 3).then_some(n) }
        })
        .await;
        assert_eq!(found, Ok(3));
    }

    #[tokio::test]
    async fn poll_times_out() {
        let cancel = CancellationToken::new();
        let outcome: Result<(), PollError> =
            poll_until(Duration::from_millis(5), Duration::from_millis(40), &cancel, || async {
                None
            })
            .await;
        assert_eq!(outcome, Err(PollError::TimedOut(Duration::from_millis(40))));
    }

    #[tokio::test]
    async fn cancellation_beats_a_ready_probe() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = poll_until(Duration::from_millis(5), Duration::from_secs(1), &cancel, || async {
            Some(())
        })
        .await;
        assert_eq!(outcome, Err(PollError::Cancelled));
    }

    #[tokio::test]
    async fn unconfigured_wallet_fails_every_primitive() {
        let wallet = UnconfiguredWallet;
        let err = wallet.switch_network("Base").await.unwrap_err();
        assert!(err.to_string().contains("no wallet extension configured"));
        assert!(wallet.approve().await.is_err());
    }

    #[test]
    fn xpath_literal_quotes() {
        assert_eq!(xpath_literal("Base"), "\"Base\"");
        assert_eq!(xpath_literal("My \"Net\""), "'My \"Net\"'");
        assert_eq!(
            xpath_literal("a\"b'c"),
            "concat(\"a\", '\"', \"b'c\")"
        );
    }
}
