//! Map an element descriptor to a single live DOM node.
//!
//! The cascade runs cheap, high-probability lookups before expensive generic
//! waits, and spends extra heuristics on search targets because finding the
//! search box is the most common thing the model asks for. Absence of a
//! match is a normal outcome, not an error: every strategy returns `None`
//! and the caller decides what to do.

use std::time::Duration;

use headless_chrome::{Element, Tab};
use tracing::{debug, trace};

use crate::types::{BOOKKEEPING_KEYS, ElementDescriptor};

/// High-probability search selectors, tried with no wait.
const FAST_SEARCH_XPATHS: [&str; 4] = [
    "//textarea[@aria-label='Search']",
    "//input[@aria-label='Search']",
    "//input[@name='q']",
    "//input[@type='search']",
];

/// Broader contains-based search selectors, tried after the generic query.
const BROAD_SEARCH_XPATHS: [&str; 8] = [
    "//input[@type='search']",
    "//input[@name='q']",
    "//input[@aria-label='Search']",
    "//input[contains(@placeholder, 'search')]",
    "//input[contains(@placeholder, 'Search')]",
    "//input[contains(@class, 'search')]",
    "//textarea[contains(@placeholder, 'Search')]",
    "//textarea[@aria-label='Search']",
];

/// In-page scan for a search-like input with a non-zero rendered box. It
/// marks the winner with a data attribute so it can be fetched back as an
/// element handle (a returned JS object cannot be turned into one).
const SEARCH_SCAN_JS: &str = r#"
(() => {
  document.querySelectorAll('[data-webpilot-target]')
    .forEach(el => el.removeAttribute('data-webpilot-target'));
  const inputs = document.querySelectorAll('input, textarea');
  for (const el of inputs) {
    const attr = name => (el.getAttribute(name) || '').toLowerCase();
    if (
      attr('type') === 'search' ||
      attr('name') === 'q' ||
      attr('placeholder').includes('search') ||
      attr('aria-label').includes('search') ||
      attr('id').includes('search')
    ) {
      const rect = el.getBoundingClientRect();
      const style = window.getComputedStyle(el);
      if (rect.width > 0 && rect.height > 0 &&
          style.display !== 'none' && style.visibility !== 'hidden') {
        el.setAttribute('data-webpilot-target', '');
        return true;
      }
    }
  }
  return false;
})()
"#;

type Strategy = for<'a> fn(&'a Tab, &ElementDescriptor, Duration) -> Option<Element<'a>>;

const STRATEGIES: [Strategy; 5] = [
    fast_search_selectors,
    by_id,
    by_structural_query,
    broad_search_selectors,
    page_scan,
];

/// Resolve a descriptor to exactly one live element, or `None`.
pub fn resolve<'a>(
    tab: &'a Tab,
    descriptor: &ElementDescriptor,
    timeout: Duration,
) -> Option<Element<'a>> {
    for strategy in STRATEGIES {
        if let Some(element) = strategy(tab, descriptor, timeout) {
            return Some(element);
        }
    }
    debug!(?descriptor, "no strategy resolved the descriptor");
    None
}

fn fast_search_selectors<'a>(
    tab: &'a Tab,
    descriptor: &ElementDescriptor,
    _timeout: Duration,
) -> Option<Element<'a>> {
    if !descriptor.is_search_like() {
        return None;
    }
    for xpath in FAST_SEARCH_XPATHS {
        if let Ok(element) = tab.find_element_by_xpath(xpath) {
            if is_displayed(&element) {
                trace!(xpath, "fast search selector hit");
                return Some(element);
            }
        }
    }
    None
}

/// Ids are the most reliable locator, so they get a real wait, first for
/// presence and then for a rendered box within the same deadline.
fn by_id<'a>(
    tab: &'a Tab,
    descriptor: &ElementDescriptor,
    timeout: Duration,
) -> Option<Element<'a>> {
    let id = descriptor.get_str("id").filter(|id| !id.contains('\''))?;
    let xpath = format!("//*[@id='{id}']");
    let deadline = std::time::Instant::now() + timeout;
    let element = tab.wait_for_xpath_with_custom_timeout(&xpath, timeout).ok()?;
    let remaining = deadline.saturating_duration_since(std::time::Instant::now());
    if poll_until(remaining, || is_displayed(&element)) {
        Some(element)
    } else {
        None
    }
}

/// Generic structural query from every remaining descriptor key, ANDed.
/// Waits for presence rather than visibility so elements that only need
/// scrolling still resolve.
fn by_structural_query<'a>(
    tab: &'a Tab,
    descriptor: &ElementDescriptor,
    timeout: Duration,
) -> Option<Element<'a>> {
    let xpath = build_structural_xpath(descriptor)?;
    trace!(%xpath, "structural query");
    tab.wait_for_xpath_with_custom_timeout(&xpath, timeout).ok()
}

fn broad_search_selectors<'a>(
    tab: &'a Tab,
    descriptor: &ElementDescriptor,
    _timeout: Duration,
) -> Option<Element<'a>> {
    if !descriptor.is_search_like() {
        return None;
    }
    for xpath in BROAD_SEARCH_XPATHS {
        if let Ok(element) = tab.find_element_by_xpath(xpath) {
            if is_displayed(&element) {
                return Some(element);
            }
        }
    }
    None
}

fn page_scan<'a>(
    tab: &'a Tab,
    descriptor: &ElementDescriptor,
    _timeout: Duration,
) -> Option<Element<'a>> {
    if !descriptor.is_search_like() {
        return None;
    }
    let marked = tab
        .evaluate(SEARCH_SCAN_JS, false)
        .ok()
        .and_then(|r| r.value)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !marked {
        return None;
    }
    tab.find_element("[data-webpilot-target]").ok()
}

/// Build `//tag[cond and cond ...]` from the descriptor. `text` becomes a
/// substring match on content, `class` one contains-condition per token, and
/// every other string-valued key an exact attribute match. Bookkeeping keys
/// and values that would break XPath quoting are skipped.
fn build_structural_xpath(descriptor: &ElementDescriptor) -> Option<String> {
    let tag = descriptor.get_str("tag").unwrap_or("*");
    let mut conditions: Vec<String> = Vec::new();
    for (key, value) in &descriptor.0 {
        if key == "tag" || BOOKKEEPING_KEYS.contains(&key.as_str()) {
            continue;
        }
        if key == "class" {
            for token in descriptor.class_tokens() {
                if !token.contains('\'') {
                    conditions.push(format!("contains(@class, '{token}')"));
                }
            }
            continue;
        }
        let Some(text) = value.as_str() else { continue };
        if text.contains('\'') {
            continue;
        }
        if key == "text" {
            conditions.push(format!("contains(text(), '{text}')"));
        } else {
            conditions.push(format!("@{key}='{text}'"));
        }
    }
    if conditions.is_empty() {
        return None;
    }
    Some(format!("//{tag}[{}]", conditions.join(" and ")))
}

/// Run `check` until it returns true or `timeout` elapses, sleeping 100ms
/// between attempts. The first check happens immediately, so a zero timeout
/// still gets one look.
pub fn poll_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Whether the element currently has a rendered box and visible style.
pub fn is_displayed(element: &Element) -> bool {
    element
        .call_js_fn(
            r#"function() {
                const rect = this.getBoundingClientRect();
                const style = window.getComputedStyle(this);
                return rect.width > 0 && rect.height > 0 &&
                    style.display !== 'none' && style.visibility !== 'hidden';
            }"#,
            vec![],
            false,
        )
        .ok()
        .and_then(|r| r.value)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}
