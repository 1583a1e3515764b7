//! Browser session glue: attach to or launch Chrome, manage tabs.

use anyhow::Result;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::types::BrowserState;

/// Persistent browser session. Created once, reused for all tasks. `tab` is
/// the currently focused tab; the executor switches it as tab actions run.
pub struct BrowserSession {
    browser: Browser,
    pub tab: Arc<Tab>,
}

impl BrowserSession {
    pub fn launch(headless: bool) -> Result<Self> {
        // Prefer attaching to an already-running Chrome with an open
        // debugging port; fall back to launching our own.
        if let Ok(browser) = Browser::connect("http://127.0.0.1:9222".to_string()) {
            info!("attached to existing Chrome on port 9222");
            let tab = {
                let tabs_lock = browser.get_tabs();
                let tabs = tabs_lock.lock().unwrap();
                match tabs.first() {
                    Some(tab) => tab.clone(),
                    None => browser.new_tab()?,
                }
            };
            return Ok(Self { browser, tab });
        }

        info!(headless, "launching Chrome");
        let options = LaunchOptions {
            headless,
            args: vec![
                std::ffi::OsStr::new("--no-first-run"),
                std::ffi::OsStr::new("--no-default-browser-check"),
                std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
                std::ffi::OsStr::new("--disable-infobars"),
                std::ffi::OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: std::time::Duration::from_secs(600),
            ..Default::default()
        };
        let browser = Browser::new(options)
            .map_err(|e| anyhow::anyhow!("browser launch failed: {e}"))?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        Ok(Self { browser, tab })
    }

    /// Open a new tab and make it current.
    pub fn open_tab(&mut self) -> Result<Arc<Tab>> {
        let tab = self.browser.new_tab()?;
        self.tab = tab.clone();
        Ok(tab)
    }

    /// All tabs, in the driver's order.
    pub fn tabs(&self) -> Vec<Arc<Tab>> {
        let tabs_lock = self.browser.get_tabs();
        let tabs = tabs_lock.lock().unwrap();
        tabs.clone()
    }

    /// Bring a tab to the front and make it current.
    pub fn switch_to(&mut self, tab: Arc<Tab>) -> Result<()> {
        if let Err(e) = tab.activate() {
            warn!(error = %e, "could not activate tab");
        }
        self.tab = tab;
        Ok(())
    }

    /// Snapshot of the current browser state, read fresh from the driver.
    pub fn state(&self) -> BrowserState {
        let url = self.tab.get_url();
        let title = page_title(&self.tab).unwrap_or_else(|| "untitled".to_string());
        let domain = Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        let tabs = self.tabs();
        let tab_index = tabs
            .iter()
            .position(|t| Arc::ptr_eq(t, &self.tab))
            .unwrap_or(0);
        BrowserState {
            url,
            title,
            domain,
            tab_index,
            tab_count: tabs.len(),
        }
    }
}

/// Raw markup of the current page, for the digest builder.
pub fn page_markup(tab: &Tab) -> Result<String> {
    Ok(tab.get_content()?)
}

fn page_title(tab: &Tab) -> Option<String> {
    let result = tab.evaluate("document.title", false).ok()?;
    result.value.and_then(|v| v.as_str().map(String::from))
}
