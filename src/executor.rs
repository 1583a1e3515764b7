//! Perform one planned action against the browser.
//!
//! The executor is deliberately hard to kill: a failed resolution skips the
//! action, a failed click falls back to a scripted click, and any error is
//! reported to the orchestrator as a per-action failure rather than aborting
//! the task. Diagnostic screenshots are captured on the way out and their
//! write failures are ignored.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Element, Tab};
use rand::RngExt;
use tracing::{debug, info, warn};

use crate::hands::BrowserSession;
use crate::resolve::{is_displayed, poll_until, resolve};
use crate::types::{
    Action, ElementDescriptor, KEYSTROKE_DELAY_MS, READY_STATE_TIMEOUT_MS, RESOLVE_TIMEOUT_MS,
    SETTLE_DELAY_MS, ScrollDirection, SessionContext,
};

/// What a single action did to the task as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Keep executing the plan.
    Continue,
    /// The model signalled task completion.
    Complete,
}

const CONSENT_BUTTON_TEXTS: [&str; 8] = [
    "Accept",
    "Accept All",
    "I Agree",
    "Accept Cookies",
    "OK",
    "Got it",
    "Agree",
    "Close",
];

const CONSENT_CLOSE_XPATHS: [&str; 5] = [
    "//button[@aria-label='Close']",
    "//button[contains(@class, 'close')]",
    "//div[contains(@class, 'popup')]//button",
    "//div[contains(@class, 'cookie')]//button",
    "//div[contains(@class, 'consent')]//button",
];

/// Clicks the first plausible search button on the page; last resort when a
/// search-like target would not resolve.
const CLICK_SEARCH_BUTTON_JS: &str = r#"
(() => {
  const candidates = [
    document.querySelector('button[aria-label*="search" i]'),
    document.querySelector('button.search'),
    document.querySelector('button[type="submit"]'),
    document.querySelector('a.search-icon'),
    document.querySelector('*[id*="search-button"]'),
    document.querySelector('*[class*="search-button"]')
  ].filter(el => el !== null);
  if (candidates.length > 0) {
    candidates[0].click();
    return true;
  }
  return false;
})()
"#;

pub struct Executor<'s> {
    session: &'s mut BrowserSession,
    ctx: &'s mut SessionContext,
}

impl<'s> Executor<'s> {
    pub fn new(session: &'s mut BrowserSession, ctx: &'s mut SessionContext) -> Self {
        Self { session, ctx }
    }

    /// Execute one action. Errors are returned to the orchestrator, which
    /// logs and moves on; a screenshot named after the action kind is
    /// captured first so there is something to look at afterwards.
    pub fn execute(&mut self, action: &Action) -> Result<StepOutcome> {
        let kind = action.kind();
        debug!(kind, "executing action");
        let result = self.perform(action);
        if result.is_err() {
            self.screenshot(&format!("error_{kind}.png"));
        }
        random_delay(SETTLE_DELAY_MS.0, SETTLE_DELAY_MS.1);
        result
    }

    fn perform(&mut self, action: &Action) -> Result<StepOutcome> {
        match action {
            Action::Navigate { url } => self.navigate(url),
            Action::FindAndClick { element_properties } => self.find_and_click(element_properties),
            Action::Type {
                text,
                use_previous_element,
                element_properties,
            } => self.type_text(text, *use_previous_element, element_properties.as_ref()),
            Action::PressEnter {
                use_previous_element,
                element_properties,
            } => self.press_enter(*use_previous_element, element_properties.as_ref()),
            Action::Scroll { direction, amount } => self.scroll(*direction, *amount),
            Action::ScrollToElement {
                element_properties,
                alignment,
            } => self.scroll_to_element(element_properties, alignment.as_deref()),
            Action::NewTab { url } => self.new_tab(url.as_deref()),
            Action::CloseTab => self.close_tab(),
            Action::SwitchTab { index, url } => self.switch_tab(*index, url.as_deref()),
            Action::RefreshPage => {
                let tab = self.session.tab.clone();
                tab.reload(false, None)?;
                wait_for_ready(&tab);
                Ok(StepOutcome::Continue)
            }
            Action::GoBack => self.history_step("history.back()"),
            Action::GoForward => self.history_step("history.forward()"),
            Action::Wait { seconds } => {
                let seconds = seconds.unwrap_or(0.5);
                std::thread::sleep(Duration::from_secs_f64(seconds.clamp(0.0, 30.0)));
                Ok(StepOutcome::Continue)
            }
            Action::Complete => {
                info!("task marked as complete");
                Ok(StepOutcome::Complete)
            }
        }
    }

    fn navigate(&mut self, url: &str) -> Result<StepOutcome> {
        let tab = self.session.tab.clone();
        tab.navigate_to(url).context("navigation failed")?;
        wait_for_ready(&tab);
        std::thread::sleep(Duration::from_millis(500));
        info!(url, "navigated");
        dismiss_popups(&tab);
        Ok(StepOutcome::Continue)
    }

    fn find_and_click(&mut self, props: &ElementDescriptor) -> Result<StepOutcome> {
        let tab = self.session.tab.clone();
        match resolve(&tab, props, Duration::from_millis(RESOLVE_TIMEOUT_MS)) {
            Some(element) => {
                let _ = element.scroll_into_view();
                random_delay(100, 200);
                if let Err(e) = element.click() {
                    debug!(error = %e, "native click failed, trying scripted click");
                    element
                        .call_js_fn("function() { this.click(); }", vec![], false)
                        .context("scripted click failed")?;
                }
                info!(target = ?props, "clicked element");
                self.ctx.last_target = Some(props.clone());
            }
            None => {
                if props.is_search_like() && scripted_search_click(&tab) {
                    info!("clicked a search button via page script");
                    return Ok(StepOutcome::Continue);
                }
                warn!(target = ?props, "could not find element to click");
                self.screenshot("element_not_found.png");
            }
        }
        Ok(StepOutcome::Continue)
    }

    fn type_text(
        &mut self,
        text: &str,
        use_previous: bool,
        props: Option<&ElementDescriptor>,
    ) -> Result<StepOutcome> {
        let tab = self.session.tab.clone();
        let Some(target) = self.pick_target(use_previous, props) else {
            warn!("no element specified for typing");
            return Ok(StepOutcome::Continue);
        };
        match resolve(&tab, &target, Duration::from_millis(RESOLVE_TIMEOUT_MS)) {
            Some(element) => {
                wait_until_displayed(&element, Duration::from_millis(READY_STATE_TIMEOUT_MS));
                let _ = element.scroll_into_view();
                random_delay(100, 200);
                clear_field(&element)?;
                element
                    .focus()
                    .context("could not focus element for typing")?;
                for ch in text.chars() {
                    tab.type_str(&ch.to_string())?;
                    random_delay(KEYSTROKE_DELAY_MS.0, KEYSTROKE_DELAY_MS.1);
                }
                info!(text, "typed into element");
            }
            None => warn!(target = ?target, "element for typing not found"),
        }
        Ok(StepOutcome::Continue)
    }

    fn press_enter(
        &mut self,
        use_previous: bool,
        props: Option<&ElementDescriptor>,
    ) -> Result<StepOutcome> {
        let tab = self.session.tab.clone();
        let Some(target) = self.pick_target(use_previous, props) else {
            warn!("no element specified for pressing Enter");
            return Ok(StepOutcome::Continue);
        };
        match resolve(&tab, &target, Duration::from_millis(RESOLVE_TIMEOUT_MS)) {
            Some(element) => {
                let _ = element.focus();
                tab.press_key("Enter")?;
                info!("pressed Enter");
            }
            None => warn!(target = ?target, "element for pressing Enter not found"),
        }
        Ok(StepOutcome::Continue)
    }

    /// Element selection shared by type/press_enter: reuse the last resolved
    /// target when asked, otherwise take the fresh descriptor and remember it.
    fn pick_target(
        &mut self,
        use_previous: bool,
        props: Option<&ElementDescriptor>,
    ) -> Option<ElementDescriptor> {
        if use_previous && self.ctx.last_target.is_some() {
            return self.ctx.last_target.clone();
        }
        let props = props?.clone();
        self.ctx.last_target = Some(props.clone());
        Some(props)
    }

    fn scroll(
        &mut self,
        direction: Option<ScrollDirection>,
        amount: Option<i64>,
    ) -> Result<StepOutcome> {
        let tab = self.session.tab.clone();
        let amount = amount.unwrap_or(500).abs();
        let script = match direction.unwrap_or(ScrollDirection::Down) {
            ScrollDirection::Down => format!("window.scrollBy(0, {amount});"),
            ScrollDirection::Up => format!("window.scrollBy(0, -{amount});"),
            ScrollDirection::ToTop => "window.scrollTo(0, 0);".to_string(),
            ScrollDirection::ToBottom => {
                "window.scrollTo(0, document.body.scrollHeight);".to_string()
            }
        };
        tab.evaluate(&script, false)?;
        Ok(StepOutcome::Continue)
    }

    fn scroll_to_element(
        &mut self,
        props: &ElementDescriptor,
        alignment: Option<&str>,
    ) -> Result<StepOutcome> {
        let tab = self.session.tab.clone();
        match resolve(&tab, props, Duration::from_millis(RESOLVE_TIMEOUT_MS)) {
            Some(element) => {
                let block = match alignment {
                    Some(a @ ("start" | "center" | "end" | "nearest")) => a,
                    _ => "center",
                };
                element.call_js_fn(
                    &format!("function() {{ this.scrollIntoView({{block: '{block}'}}); }}"),
                    vec![],
                    false,
                )?;
                self.ctx.last_target = Some(props.clone());
            }
            None => warn!(target = ?props, "element to scroll to not found"),
        }
        Ok(StepOutcome::Continue)
    }

    fn new_tab(&mut self, url: Option<&str>) -> Result<StepOutcome> {
        let tab = self.session.open_tab()?;
        if let Some(url) = url.filter(|u| !u.is_empty() && *u != "about:blank") {
            tab.navigate_to(url)?;
            wait_for_ready(&tab);
            dismiss_popups(&tab);
        }
        info!(url = url.unwrap_or("about:blank"), "opened new tab");
        Ok(StepOutcome::Continue)
    }

    fn close_tab(&mut self) -> Result<StepOutcome> {
        let tabs = self.session.tabs();
        if tabs.len() <= 1 {
            info!("only one tab open, not closing it");
            return Ok(StepOutcome::Continue);
        }
        let current = self.session.tab.clone();
        let first_other = tabs
            .iter()
            .find(|t| !Arc::ptr_eq(t, &current))
            .cloned()
            .ok_or_else(|| anyhow!("no other tab to switch to"))?;
        let _ = current.close(true);
        self.session.switch_to(first_other)?;
        info!("closed tab and switched to the first remaining one");
        Ok(StepOutcome::Continue)
    }

    fn switch_tab(&mut self, index: Option<usize>, url: Option<&str>) -> Result<StepOutcome> {
        let tabs = self.session.tabs();
        let target = match (index, url) {
            (Some(i), _) => tabs.get(i).cloned(),
            (None, Some(needle)) => tabs.iter().find(|t| t.get_url().contains(needle)).cloned(),
            (None, None) => None,
        };
        match target {
            Some(tab) => {
                self.session.switch_to(tab)?;
                info!("switched tab");
            }
            None => warn!(?index, ?url, "no tab matched the switch request"),
        }
        Ok(StepOutcome::Continue)
    }

    fn history_step(&mut self, script: &str) -> Result<StepOutcome> {
        let tab = self.session.tab.clone();
        tab.evaluate(script, false)?;
        wait_for_ready(&tab);
        Ok(StepOutcome::Continue)
    }

    /// Best-effort diagnostic screenshot; failures to capture or write are
    /// ignored.
    fn screenshot(&self, filename: &str) {
        let result = self
            .session
            .tab
            .capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true);
        if let Ok(png) = result {
            if std::fs::write(filename, png).is_ok() {
                debug!(filename, "wrote diagnostic screenshot");
            }
        }
    }
}

/// Poll `document.readyState` until complete, bounded.
fn wait_for_ready(tab: &Arc<Tab>) {
    let deadline = Instant::now() + Duration::from_millis(READY_STATE_TIMEOUT_MS);
    while Instant::now() < deadline {
        let ready = tab
            .evaluate("document.readyState", false)
            .ok()
            .and_then(|r| r.value)
            .and_then(|v| v.as_str().map(String::from));
        if ready.as_deref() == Some("complete") {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    debug!("page did not reach readyState complete before the deadline");
}

fn wait_until_displayed(element: &Element, timeout: Duration) {
    poll_until(timeout, || is_displayed(element));
}

/// Clear an input before typing. Scripted value reset with an `input` event
/// so frameworks notice; falls back to a plain reset via the tab.
fn clear_field(element: &Element) -> Result<()> {
    let _ = element.click();
    if element
        .call_js_fn(
            r#"function() {
                this.value = '';
                this.dispatchEvent(new Event('input', {bubbles: true}));
            }"#,
            vec![],
            false,
        )
        .is_err()
    {
        element.call_js_fn("function() { this.value = ''; }", vec![], false)?;
    }
    Ok(())
}

fn scripted_search_click(tab: &Arc<Tab>) -> bool {
    tab.evaluate(CLICK_SEARCH_BUTTON_JS, false)
        .ok()
        .and_then(|r| r.value)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Best-effort consent/popup dismissal after navigation. Every failure is
/// swallowed; pages without popups pay only a few cheap lookups.
fn dismiss_popups(tab: &Arc<Tab>) {
    for text in CONSENT_BUTTON_TEXTS {
        let xpath = format!("//*[contains(text(), '{text}')]");
        if click_first_displayed(tab, &xpath) {
            debug!(text, "dismissed popup by button text");
            return;
        }
    }
    for xpath in CONSENT_CLOSE_XPATHS {
        if click_first_displayed(tab, xpath) {
            debug!(xpath, "dismissed popup by close selector");
            return;
        }
    }
}

fn click_first_displayed(tab: &Arc<Tab>, xpath: &str) -> bool {
    let Ok(elements) = tab.find_elements_by_xpath(xpath) else {
        return false;
    };
    for element in elements {
        if is_displayed(&element) && element.click().is_ok() {
            return true;
        }
    }
    false
}

fn random_delay(min_ms: u64, max_ms: u64) {
    let ms = rand::rng().random_range(min_ms..=max_ms);
    std::thread::sleep(Duration::from_millis(ms));
}
