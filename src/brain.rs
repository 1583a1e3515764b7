//! LLM planning: conversation state, the chat round-trip with its retry
//! policy, and normalization of whatever shape the model sends back into a
//! concrete action list.

use anyhow::{Result, anyhow};
use reqwest::Client;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::recover::extract_json;
use crate::types::{
    Action, ChatMessage, HISTORY_COMPACT_THRESHOLD, HISTORY_HEAD_KEEP, HISTORY_TAIL_KEEP,
    LLM_MAX_RETRIES,
};

const SYSTEM_PROMPT: &str = r#"You are a web automation agent. You understand user commands and perform actions like navigating websites, finding elements dynamically, clicking, and typing.

Instead of fixed CSS selectors you identify elements by their attributes: text content, aria-labels, placeholders, ids, classes and so on.

IMPORTANT: Always respond with valid JSON only. No explanations, no markdown formatting, no narrative text outside the JSON.

Available actions:
- "navigate": go to a URL ("url")
- "find_and_click": find an element by "element_properties" and click it
- "type": type "text" into the previously found element ("use_previous_element": true) or into "element_properties"
- "press_enter": press Enter on the previously found element or on "element_properties"
- "scroll": scroll the page ("direction": "down"|"up"|"to_top"|"to_bottom", "amount" in pixels)
- "scroll_to_element": scroll an element into view ("element_properties", optional "alignment")
- "new_tab": open a new tab (optional "url")
- "close_tab": close the current tab
- "switch_tab": switch tabs by "index" or by "url" substring
- "refresh_page", "go_back", "go_forward": navigation controls
- "wait": pause for "seconds"
- "complete": signal that the task is finished

For "element_properties", provide attributes that uniquely identify the element, e.g.
{"tag": "input", "aria-label": "Search", "placeholder": "Search"}

Respond with {"actions": [...]} or a bare JSON array of actions.
"#;

const FEW_SHOT_EXAMPLES: &str = r#"
Example 1:
Command: "Search for cat videos on YouTube"
Actions: [
    {"action": "navigate", "url": "https://www.youtube.com"},
    {"action": "find_and_click", "element_properties": {"tag": "input", "aria-label": "Search", "placeholder": "Search"}},
    {"action": "type", "text": "cat videos", "use_previous_element": true},
    {"action": "press_enter", "use_previous_element": true}
]

Example 2:
Command: "Search for books on Amazon"
Actions: [
    {"action": "navigate", "url": "https://www.amazon.com"},
    {"action": "find_and_click", "element_properties": {"tag": "input", "aria-label": "Search", "type": "text"}},
    {"action": "type", "text": "books", "use_previous_element": true},
    {"action": "find_and_click", "element_properties": {"tag": "input", "type": "submit"}}
]

Example 3:
Command: "Check the weather on Google"
Actions: [
    {"action": "navigate", "url": "https://www.google.com"},
    {"action": "find_and_click", "element_properties": {"tag": "textarea", "aria-label": "Search"}},
    {"action": "type", "text": "weather forecast", "use_previous_element": true},
    {"action": "press_enter", "use_previous_element": true}
]
"#;

const CORRECTIVE_MESSAGE: &str = "Your response was not valid JSON. Please provide only a valid JSON response with no additional text or formatting. Format your response like: {\"actions\": [{\"action\": \"navigate\", ...}]}";

/// Failure modes of one planning round. Transport exhaustion is handled
/// inside `request_plan`; a malformed plan shape is fatal for the round and
/// surfaces to the orchestrator.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("LLM request failed: {0}")]
    Transport(String),
    #[error("model response had an unexpected shape: {0}")]
    MalformedPlan(String),
}

pub struct Brain {
    client: Client,
    api_key: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    conversation: Vec<ChatMessage>,
}

impl Brain {
    pub fn new(model: String) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY not set in environment"))?;
        Ok(Self {
            client: Client::new(),
            api_key,
            model,
            temperature: 0.1,
            max_tokens: 512,
            conversation: vec![ChatMessage::new(
                "system",
                format!("{SYSTEM_PROMPT}{FEW_SHOT_EXAMPLES}"),
            )],
        })
    }

    /// Ask for the next plan. Retries transport errors and unrecoverable
    /// response text up to the bound, injecting a corrective follow-up
    /// between attempts; on exhaustion the round degrades to an empty plan.
    pub async fn request_plan(&mut self, user_content: &str) -> Result<Vec<Action>, PlanError> {
        self.push_user(user_content);

        for attempt in 1..=LLM_MAX_RETRIES {
            let text = match self.chat().await {
                Ok(text) => text,
                Err(e) => {
                    warn!(attempt, error = %e, "LLM call failed");
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    continue;
                }
            };
            debug!(response = %text, "model replied");
            self.conversation.push(ChatMessage::new("assistant", text.as_str()));

            match extract_json(&text) {
                Some(value) => return normalize_plan(value),
                None => {
                    warn!(attempt, "no JSON found in model response");
                    if attempt < LLM_MAX_RETRIES {
                        self.conversation
                            .push(ChatMessage::new("user", CORRECTIVE_MESSAGE));
                    }
                }
            }
        }

        warn!("planning retries exhausted, substituting an empty action list");
        Ok(Vec::new())
    }

    /// Append a user message, unless an identical instruction is already the
    /// most recent user entry (retries would otherwise duplicate it).
    fn push_user(&mut self, content: &str) {
        let last_user = self
            .conversation
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str());
        if last_user == Some(content) {
            return;
        }
        self.conversation.push(ChatMessage::new("user", content));
    }

    /// Record a synthetic end-of-task summary and compact the window.
    pub fn finish_task(&mut self, summary: &str) {
        self.conversation.push(ChatMessage::new("assistant", summary));
        self.compact();
    }

    /// Cap the rolling window: keep the head (system context) and the most
    /// recent tail, drop the middle.
    fn compact(&mut self) {
        if self.conversation.len() <= HISTORY_COMPACT_THRESHOLD {
            return;
        }
        let tail = self
            .conversation
            .split_off(self.conversation.len() - HISTORY_TAIL_KEEP);
        self.conversation.truncate(HISTORY_HEAD_KEEP);
        self.conversation.extend(tail);
    }

    async fn chat(&self) -> Result<String, PlanError> {
        let messages: Vec<Value> = self
            .conversation
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "temperature": self.temperature,
                "max_tokens": self.max_tokens,
            }))
            .send()
            .await
            .map_err(|e| PlanError::Transport(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| PlanError::Transport(e.to_string()))?;

        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error");
            return Err(PlanError::Transport(format!("API error ({status}): {message}")));
        }

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PlanError::Transport(format!("no content in response: {body}")))
    }

    #[cfg(test)]
    fn for_tests() -> Self {
        Self {
            client: Client::new(),
            api_key: String::new(),
            model: "test".to_string(),
            temperature: 0.0,
            max_tokens: 16,
            conversation: vec![ChatMessage::new("system", "system prompt")],
        }
    }

    #[cfg(test)]
    fn history(&self) -> &[ChatMessage] {
        &self.conversation
    }
}

/// Normalize the recovered JSON into an action list. Accepted shapes: a bare
/// list, an object with an `actions` key, or a single action object. Other
/// shapes fail the round. Individual entries that do not parse as a known
/// action are skipped with a warning rather than poisoning the whole plan.
pub fn normalize_plan(value: Value) -> Result<Vec<Action>, PlanError> {
    let items: Vec<Value> = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("actions") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(PlanError::MalformedPlan(format!(
                    "\"actions\" is not a list: {other}"
                )));
            }
            None => vec![Value::Object(map)],
        },
        other => {
            return Err(PlanError::MalformedPlan(format!(
                "expected a list or object, got: {other}"
            )));
        }
    };

    let mut actions = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<Action>(item.clone()) {
            Ok(action) => actions.push(action),
            Err(e) => warn!(error = %e, action = %item, "skipping unparsable action"),
        }
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_accepts_bare_list() {
        let plan = normalize_plan(json!([
            {"action": "navigate", "url": "https://example.org"},
            {"action": "complete"}
        ]))
        .unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1].kind(), "complete");
    }

    #[test]
    fn normalize_accepts_actions_object() {
        let plan = normalize_plan(json!({"actions": [{"action": "press_enter"}]})).unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn normalize_wraps_single_action_object() {
        let plan = normalize_plan(json!({"action": "wait", "seconds": 2})).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].kind(), "wait");
    }

    #[test]
    fn normalize_rejects_scalars() {
        assert!(matches!(
            normalize_plan(json!("do something")),
            Err(PlanError::MalformedPlan(_))
        ));
        assert!(matches!(
            normalize_plan(json!({"actions": "navigate"})),
            Err(PlanError::MalformedPlan(_))
        ));
    }

    #[test]
    fn normalize_skips_unknown_action_kinds() {
        let plan = normalize_plan(json!([
            {"action": "levitate"},
            {"action": "complete"}
        ]))
        .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].kind(), "complete");
    }

    #[test]
    fn worked_example_plan_parses_end_to_end() {
        // The YouTube few-shot example from the system prompt must survive
        // recovery and normalization exactly.
        let raw = r#"```json
        {"actions": [
            {"action": "navigate", "url": "https://www.youtube.com"},
            {"action": "find_and_click",
             "element_properties": {"tag": "input", "aria-label": "Search", "placeholder": "Search"}},
            {"action": "type", "text": "cat videos", "use_previous_element": true},
            {"action": "press_enter", "use_previous_element": true}
        ]}
        ```"#;
        let value = crate::recover::extract_json(raw).unwrap();
        let plan = normalize_plan(value).unwrap();
        let kinds: Vec<_> = plan.iter().map(Action::kind).collect();
        assert_eq!(kinds, ["navigate", "find_and_click", "type", "press_enter"]);
        match &plan[2] {
            Action::Type {
                text,
                use_previous_element,
                ..
            } => {
                assert_eq!(text, "cat videos");
                assert_eq!(text.chars().count(), 10);
                assert!(*use_previous_element);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn duplicate_instruction_is_not_appended_twice() {
        let mut brain = Brain::for_tests();
        brain.push_user("search for rust");
        brain.push_user("search for rust");
        let users = brain
            .history()
            .iter()
            .filter(|m| m.role == "user")
            .count();
        assert_eq!(users, 1);
    }

    #[test]
    fn compaction_keeps_system_head_and_recent_tail() {
        let mut brain = Brain::for_tests();
        for i in 0..40 {
            brain.conversation.push(ChatMessage::new("user", format!("msg {i}")));
        }
        brain.finish_task("task done");
        assert_eq!(
            brain.history().len(),
            HISTORY_HEAD_KEEP + HISTORY_TAIL_KEEP
        );
        assert_eq!(brain.history()[0].role, "system");
        assert_eq!(brain.history().last().unwrap().content, "task done");
    }

    #[test]
    fn compaction_never_exceeds_threshold_across_tasks() {
        let mut brain = Brain::for_tests();
        for task in 0..25 {
            for i in 0..5 {
                brain
                    .conversation
                    .push(ChatMessage::new("user", format!("t{task} m{i}")));
            }
            brain.finish_task(&format!("summary {task}"));
            assert!(brain.history().len() <= HISTORY_COMPACT_THRESHOLD);
            assert_eq!(brain.history()[0].role, "system");
        }
    }
}
