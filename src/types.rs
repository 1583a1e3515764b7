use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A property bag identifying one DOM element by its attributes rather than
/// a fixed selector. Produced by the digest builder, echoed back by the LLM
/// as `element_properties`, and consumed by the resolver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementDescriptor(pub BTreeMap<String, Value>);

/// Serialization order for digest lines. Any key not listed here is appended
/// after these, in map order.
const DESCRIPTOR_KEY_ORDER: [&str; 14] = [
    "tag",
    "id",
    "class",
    "name",
    "type",
    "placeholder",
    "aria-label",
    "role",
    "text",
    "href",
    "onclick",
    "is_search",
    "is_visible",
    "location",
];

/// Keys that describe bookkeeping about an element rather than one of its
/// HTML attributes. The structural query builder skips these.
pub const BOOKKEEPING_KEYS: [&str; 4] = ["is_search", "is_visible", "location", "description"];

impl ElementDescriptor {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Insert a value, dropping nulls so the bag only carries present keys.
    pub fn put(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        if !value.is_null() {
            self.0.insert(key.to_string(), value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Class tokens, accepting both a space-separated string and a list.
    pub fn class_tokens(&self) -> Vec<String> {
        match self.0.get("class") {
            Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether this descriptor points at a search input. Mirrors the digest
    /// builder's search-candidate predicate; values are type-checked before
    /// any string method is called, since the LLM may send anything here.
    pub fn is_search_like(&self) -> bool {
        if self.0.get("is_search").and_then(Value::as_bool) == Some(true) {
            return true;
        }
        let contains = |key: &str, needles: &[&str]| {
            self.get_str(key)
                .map(str::to_ascii_lowercase)
                .is_some_and(|v| needles.iter().any(|n| v.contains(n)))
        };
        self.get_str("type") == Some("search")
            || self.get_str("name") == Some("q")
            || contains("placeholder", &["search"])
            || contains("aria-label", &["search"])
            || contains("class", &["search", "query"])
            || contains("id", &["search", "query"])
    }

    /// One compact JSON object per digest line, keys in a fixed order so the
    /// model always sees `tag` first and the breadcrumb last.
    pub fn to_digest_line(&self) -> String {
        let mut out = String::from("{");
        let mut first = true;
        let mut write = |key: &str, value: &Value, out: &mut String| {
            if !first {
                out.push_str(", ");
            }
            first = false;
            out.push('"');
            out.push_str(key);
            out.push_str("\": ");
            out.push_str(&value.to_string());
        };
        for key in DESCRIPTOR_KEY_ORDER {
            if let Some(value) = self.0.get(key) {
                write(key, value, &mut out);
            }
        }
        for (key, value) in &self.0 {
            if !DESCRIPTOR_KEY_ORDER.contains(&key.as_str()) {
                write(key, value, &mut out);
            }
        }
        out.push('}');
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Down,
    Up,
    ToTop,
    ToBottom,
}

/// A single planned browser action, as returned by the LLM. The tag field is
/// `action`; unknown extra fields on a variant are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Navigate {
        url: String,
    },
    FindAndClick {
        #[serde(default)]
        element_properties: ElementDescriptor,
    },
    Type {
        text: String,
        #[serde(default)]
        use_previous_element: bool,
        #[serde(default)]
        element_properties: Option<ElementDescriptor>,
    },
    PressEnter {
        #[serde(default)]
        use_previous_element: bool,
        #[serde(default)]
        element_properties: Option<ElementDescriptor>,
    },
    Scroll {
        #[serde(default)]
        direction: Option<ScrollDirection>,
        #[serde(default)]
        amount: Option<i64>,
    },
    ScrollToElement {
        element_properties: ElementDescriptor,
        #[serde(default)]
        alignment: Option<String>,
    },
    NewTab {
        #[serde(default)]
        url: Option<String>,
    },
    CloseTab,
    SwitchTab {
        #[serde(default)]
        index: Option<usize>,
        #[serde(default)]
        url: Option<String>,
    },
    RefreshPage,
    GoBack,
    GoForward,
    Wait {
        #[serde(default)]
        seconds: Option<f64>,
    },
    Complete,
}

impl Action {
    /// Snake-case kind name, used for logging and screenshot filenames.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "navigate",
            Action::FindAndClick { .. } => "find_and_click",
            Action::Type { .. } => "type",
            Action::PressEnter { .. } => "press_enter",
            Action::Scroll { .. } => "scroll",
            Action::ScrollToElement { .. } => "scroll_to_element",
            Action::NewTab { .. } => "new_tab",
            Action::CloseTab => "close_tab",
            Action::SwitchTab { .. } => "switch_tab",
            Action::RefreshPage => "refresh_page",
            Action::GoBack => "go_back",
            Action::GoForward => "go_forward",
            Action::Wait { .. } => "wait",
            Action::Complete => "complete",
        }
    }
}

/// A message in the conversation history sent to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// Snapshot of the browser, read on demand and never cached across steps.
#[derive(Debug, Clone)]
pub struct BrowserState {
    pub url: String,
    pub title: String,
    pub domain: Option<String>,
    pub tab_index: usize,
    pub tab_count: usize,
}

/// Cross-task state owned by the orchestrator and threaded into the executor.
/// `last_target` is the descriptor of the most recently resolved element;
/// `use_previous_element` re-resolves through it.
#[derive(Debug, Default)]
pub struct SessionContext {
    pub last_target: Option<ElementDescriptor>,
}

pub const DIGEST_MAX_CHARS: usize = 5000;
pub const MAX_ITERATIONS_PER_TASK: usize = 10;
pub const LLM_MAX_RETRIES: usize = 3;
pub const HISTORY_COMPACT_THRESHOLD: usize = 20;
pub const HISTORY_HEAD_KEEP: usize = 2;
pub const HISTORY_TAIL_KEEP: usize = 18;
pub const RESOLVE_TIMEOUT_MS: u64 = 1500;
pub const READY_STATE_TIMEOUT_MS: u64 = 5000;
pub const SETTLE_DELAY_MS: (u64, u64) = (200, 500);
pub const KEYSTROKE_DELAY_MS: (u64, u64) = (10, 50);
