//! Declarative flow definitions.
//!
//! A flow is a graph of named states. Each state runs an ordered list of
//! `onEnter` actions and owns an ordered list of transitions triggered by
//! classified intents or tool results. Flows are authored as JSON, validated
//! before a session binds to them, and immutable for the session's lifetime.

pub mod demo;
pub mod validate;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// A complete flow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<FlowMeta>,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub intents: BTreeMap<String, IntentDef>,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolDef>,
    #[serde(default)]
    pub states: BTreeMap<String, StateDef>,
}

impl FlowConfig {
    pub fn name(&self) -> &str {
        self.meta.as_ref().map_or("unnamed", |m| m.name.as_str())
    }

    /// Timeout for a declared tool, falling back to the engine default.
    pub fn tool_timeout(&self, tool: &str) -> Duration {
        self.tools
            .get(tool)
            .and_then(|def| def.timeout_ms.as_ref())
            .and_then(Value::as_u64)
            .map_or(DEFAULT_TOOL_TIMEOUT, Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowMeta {
    pub name: String,
    #[serde(default = "default_locale")]
    pub locale: String,
}

fn default_locale() -> String {
    "en-US".to_string()
}

/// An intent the classifier may recognize: example utterances plus the typed
/// slots to extract from matching input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentDef {
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub slots: BTreeMap<String, SlotType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotType {
    Number,
    Date,
    Time,
    Name,
    Phone,
    String,
}

/// A tool declaration. Schemas are carried opaquely for editors and
/// validation tooling; the engine only consults `timeout_ms`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDef {
    #[serde(default, rename = "onEnter")]
    pub on_enter: Vec<ActionSpec>,
    #[serde(default)]
    pub transitions: Vec<TransitionSpec>,
}

impl StateDef {
    /// Terminal states have no transitions; they may still run `onEnter`.
    pub fn is_terminal(&self) -> bool {
        self.transitions.is_empty()
    }

    /// The state's `ask` action, if it has one (used by the soft re-prompt).
    pub fn ask_text(&self) -> Option<&str> {
        self.on_enter.iter().find_map(|a| a.ask.as_deref())
    }
}

/// An action as authored: a bag of optional fields of which exactly one of
/// `say`/`ask`/`transfer`/`hangup`/`tool` must be present. [`ActionSpec::kind`]
/// normalizes into the discriminated [`Action`] the engine executes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub say: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hangup: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
}

/// A normalized action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action<'a> {
    Say(&'a str),
    Ask(&'a str),
    Transfer(&'a str),
    Hangup,
    Tool { name: &'a str, args: &'a Value },
}

impl ActionSpec {
    /// Normalize to a single [`Action`]. Returns `None` when zero or more
    /// than one action field is set (the validator rejects such flows).
    pub fn kind(&self) -> Option<Action<'_>> {
        let mut found = None;
        let mut count = 0;

        if let Some(text) = self.say.as_deref() {
            found = Some(Action::Say(text));
            count += 1;
        }
        if let Some(text) = self.ask.as_deref() {
            found = Some(Action::Ask(text));
            count += 1;
        }
        if let Some(target) = self.transfer.as_deref() {
            found = Some(Action::Transfer(target));
            count += 1;
        }
        if self.hangup == Some(true) {
            found = Some(Action::Hangup);
            count += 1;
        }
        if let Some(name) = self.tool.as_deref() {
            found = Some(Action::Tool {
                name,
                args: &self.args,
            });
            count += 1;
        }

        if count == 1 {
            found
        } else {
            None
        }
    }
}

/// A transition as authored. `onIntent` and `onToolResult` are triggers;
/// `when` guards, `assign` patches the context, and exactly one of `to` or
/// `branch` names the target (`branch` wins when both appear).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionSpec {
    #[serde(default, rename = "onIntent", skip_serializing_if = "Option::is_none")]
    pub on_intent: Option<OneOrMany>,
    #[serde(
        default,
        rename = "onToolResult",
        skip_serializing_if = "Option::is_none"
    )]
    pub on_tool_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<Vec<BranchArm>>,
}

impl TransitionSpec {
    pub fn matches_intent(&self, intent: &str) -> bool {
        self.on_intent.as_ref().is_some_and(|i| i.contains(intent))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchArm {
    pub when: String,
    pub to: String,
}

/// One intent name or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn contains(&self, name: &str) -> bool {
        match self {
            OneOrMany::One(one) => one == name,
            OneOrMany::Many(many) => many.iter().any(|n| n == name),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            OneOrMany::One(one) => std::slice::from_ref(one).iter(),
            OneOrMany::Many(many) => many.iter(),
        }
        .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_authored_json() {
        let flow: FlowConfig = serde_json::from_value(json!({
            "meta": {"name": "greeter"},
            "start": "Hello",
            "intents": {
                "BOOK": {"examples": ["book a table"], "slots": {"count": "number"}}
            },
            "tools": {
                "Lookup": {"timeout_ms": 5000}
            },
            "states": {
                "Hello": {
                    "onEnter": [{"ask": "Hi?"}],
                    "transitions": [
                        {"onIntent": "BOOK", "assign": {"n": "{{slot.count}}"}, "to": "Done"}
                    ]
                },
                "Done": {"onEnter": [{"hangup": true}]}
            }
        }))
        .unwrap();

        assert_eq!(flow.start, "Hello");
        assert_eq!(flow.tool_timeout("Lookup"), Duration::from_millis(5000));
        assert_eq!(flow.tool_timeout("Other"), DEFAULT_TOOL_TIMEOUT);
        assert!(flow.states["Done"].is_terminal());
        assert!(!flow.states["Hello"].is_terminal());
        assert_eq!(flow.states["Hello"].ask_text(), Some("Hi?"));

        let t = &flow.states["Hello"].transitions[0];
        assert!(t.matches_intent("BOOK"));
        assert!(!t.matches_intent("OTHER"));
    }

    #[test]
    fn on_intent_accepts_a_list() {
        let t: TransitionSpec = serde_json::from_value(json!({
            "onIntent": ["BOOK", "ASK_QUESTION"],
            "to": "Next"
        }))
        .unwrap();
        assert!(t.matches_intent("ASK_QUESTION"));
        assert_eq!(t.on_intent.unwrap().iter().count(), 2);
    }

    #[test]
    fn action_normalization() {
        let say: ActionSpec = serde_json::from_value(json!({"say": "hi"})).unwrap();
        assert_eq!(say.kind(), Some(Action::Say("hi")));

        let tool: ActionSpec =
            serde_json::from_value(json!({"tool": "Lookup", "args": {"q": "x"}})).unwrap();
        assert!(matches!(tool.kind(), Some(Action::Tool { name: "Lookup", .. })));

        let both: ActionSpec =
            serde_json::from_value(json!({"say": "hi", "ask": "there"})).unwrap();
        assert_eq!(both.kind(), None);

        let empty = ActionSpec::default();
        assert_eq!(empty.kind(), None);
    }
}
