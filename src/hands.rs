//! headless_chrome-backed browser page.
//!
//! headless_chrome is a blocking client, so every tab call hops onto the
//! blocking pool and the async side only ever awaits the join handle.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::surface::BrowserPage;

/// headless_chrome's per-tab wait default, restored after each navigation.
const TAB_DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// How to start Chrome for a run.
#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    pub chrome_path: Option<PathBuf>,
    pub headless: bool,
    pub profile_dir: Option<PathBuf>,
    /// Unpacked wallet extension to load alongside the dApp.
    pub extension_path: Option<PathBuf>,
}

pub struct ChromePage {
    browser: Browser,
    tab: Arc<Tab>,
}

impl ChromePage {
    /// Start a fresh Chrome. Blocking; call from `spawn_blocking`.
    pub fn launch(config: &LaunchConfig) -> Result<Self> {
        let chrome_path = match &config.chrome_path {
            Some(path) => path.clone(),
            None => find_chrome()?,
        };
        if let Some(profile) = &config.profile_dir {
            std::fs::create_dir_all(profile)?;
        }

        let load_extension = config
            .extension_path
            .as_ref()
            .map(|path| format!("--load-extension={}", path.display()));
        let disable_others = config
            .extension_path
            .as_ref()
            .map(|path| format!("--disable-extensions-except={}", path.display()));

        let mut args: Vec<&OsStr> = vec![
            OsStr::new("--no-first-run"),
            OsStr::new("--no-default-browser-check"),
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--disable-infobars"),
            OsStr::new("--password-store=basic"),
        ];
        if let (Some(load), Some(only)) = (&load_extension, &disable_others) {
            args.push(OsStr::new(load));
            args.push(OsStr::new(only));
        }
        if config.extension_path.is_some() && config.headless {
            warn!("Extensions need a headed window; wallet popups may not open in headless mode");
        }

        let options = LaunchOptions {
            headless: config.headless,
            path: Some(chrome_path.clone()),
            user_data_dir: config.profile_dir.clone(),
            args,
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        info!(chrome = %chrome_path.display(), headless = config.headless, "Starting Chrome");
        let browser = Browser::new(options).map_err(|e| anyhow!("Browser launch failed: {e}"))?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        debug!("Chrome ready");

        Ok(Self { browser, tab })
    }

    /// Attach to an already-running Chrome by its DevTools websocket URL.
    /// Blocking; call from `spawn_blocking`.
    pub fn connect(ws_url: &str) -> Result<Self> {
        info!(%ws_url, "Attaching to existing Chrome");
        let browser = Browser::connect(ws_url.to_string())
            .map_err(|e| anyhow!("Could not attach to Chrome at {ws_url}: {e}"))?;

        let existing = browser
            .get_tabs()
            .lock()
            .map_err(|_| anyhow!("tab list lock poisoned"))?
            .first()
            .cloned();
        let tab = match existing {
            Some(tab) => tab,
            None => browser.new_tab()?,
        };

        Ok(Self { browser, tab })
    }

    /// Handle to the underlying browser, for the wallet to find its popups.
    pub fn browser(&self) -> Browser {
        self.browser.clone()
    }

    async fn with_tab<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || op(&tab))
            .await
            .map_err(|e| anyhow!("browser task panicked: {e}"))?
    }
}

#[async_trait]
impl BrowserPage for ChromePage {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        let url = url.to_string();
        self.with_tab(move |tab| {
            tab.set_default_timeout(timeout);
            let outcome = tab
                .navigate_to(&url)
                .and_then(|tab| tab.wait_until_navigated())
                .map(|_| ());
            tab.set_default_timeout(TAB_DEFAULT_TIMEOUT);
            outcome
        })
        .await
    }

    async fn title(&self) -> Result<String> {
        self.with_tab(|tab| Ok(tab.get_title()?)).await
    }

    async fn url(&self) -> Result<String> {
        self.with_tab(|tab| Ok(tab.get_url())).await
    }

    async fn evaluate(&self, expression: &str, await_promise: bool) -> Result<Value> {
        let expression = expression.to_string();
        self.with_tab(move |tab| {
            let result = tab.evaluate(&expression, await_promise)?;
            Ok(result.value.unwrap_or(Value::Null))
        })
        .await
    }

    async fn screenshot(&self, path: &Path) -> Result<()> {
        let png = self
            .with_tab(|tab| {
                Ok(tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)?)
            })
            .await?;
        tokio::fs::write(path, png).await?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let selector = selector.to_string();
        self.with_tab(move |tab| {
            tab.find_element(&selector)?.click()?;
            Ok(())
        })
        .await
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        let selector = selector.to_string();
        let text = text.to_string();
        self.with_tab(move |tab| {
            tab.find_element(&selector)?.click()?;
            let quoted = serde_json::to_string(&selector)?;
            tab.evaluate(
                &format!("(document.querySelector({quoted}) || {{}}).value = ''"),
                false,
            )?;
            tab.type_str(&text)?;
            Ok(())
        })
        .await
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_tab(move |tab| {
            tab.press_key(&key)?;
            Ok(())
        })
        .await
    }
}

fn chrome_candidates() -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(
            local
                .join("Google")
                .join("Chrome")
                .join("Application")
                .join("chrome.exe"),
        );
    }
    candidates
}

fn find_chrome() -> Result<PathBuf> {
    if let Some(path) = chrome_candidates().into_iter().find(|p| p.exists()) {
        return Ok(path);
    }
    bail!("Chrome executable not found. Pass --chrome-path or install Google Chrome.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_cover_every_desktop_platform() {
        let candidates = chrome_candidates();
        assert!(candidates.iter().any(|p| p.to_string_lossy().contains("google-chrome")));
        assert!(candidates.iter().any(|p| p.to_string_lossy().ends_with("chrome.exe")));
    }
}
