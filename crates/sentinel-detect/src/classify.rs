//! Maps raw telemetry objects onto completion events.
//!
//! The upstream telemetry schema is not ours, so this is shape matching, not
//! schema validation. Anything not recognized comes back as
//! [`TelemetryEvent::Other`].

use sentinel_core::events::{CompletionEvent, SpeakerResult};
use serde::Serialize;
use serde_json::{Map, Value};

type Attributes = Map<String, Value>;
type AttributeStrategy = fn(&Value) -> Option<&Attributes>;

/// Tried in order; the first shape present wins.
const ATTRIBUTE_STRATEGIES: [AttributeStrategy; 3] =
    [resource_attributes, body_attributes, plain_attributes];

const EVENT_NAMESPACE: &str = "gemini_cli.";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Completion(CompletionEvent),
    Other(Value),
}

impl TelemetryEvent {
    pub fn completion(&self) -> Option<&CompletionEvent> {
        match self {
            TelemetryEvent::Completion(event) => Some(event),
            TelemetryEvent::Other(_) => None,
        }
    }

    pub fn is_user_turn(&self) -> bool {
        self.completion().is_some_and(CompletionEvent::is_user_turn)
    }

    pub fn is_agent_finish(&self) -> bool {
        matches!(
            self,
            TelemetryEvent::Completion(CompletionEvent::AgentFinish { .. })
        )
    }
}

fn resource_attributes(value: &Value) -> Option<&Attributes> {
    value.get("resource")?.get("attributes")?.as_object()
}

fn body_attributes(value: &Value) -> Option<&Attributes> {
    value.get("body")?.get("attributes")?.as_object()
}

fn plain_attributes(value: &Value) -> Option<&Attributes> {
    value.get("attributes")?.as_object()
}

pub fn extract_attributes(value: &Value) -> Option<&Attributes> {
    ATTRIBUTE_STRATEGIES
        .iter()
        .find_map(|strategy| strategy(value))
}

fn raw_event_name(map: &Attributes) -> Option<&str> {
    map.get("event.name")
        .or_else(|| map.get("event_name"))
        .and_then(Value::as_str)
}

/// Strips the CLI namespace and folds dotted names into snake case, so
/// `gemini_cli.agent.finish` and `agent_finish` compare equal.
pub fn normalize_event_name(name: &str) -> String {
    let trimmed = name.trim();
    let bare = trimmed.strip_prefix(EVENT_NAMESPACE).unwrap_or(trimmed);
    bare.replace('.', "_")
}

fn read_u64(map: &Attributes, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    })
}

fn read_string(map: &Attributes, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| map.get(*key)?.as_str().map(str::to_string))
}

pub fn classify(value: &Value) -> TelemetryEvent {
    match recognize(value) {
        Some(event) => TelemetryEvent::Completion(event),
        None => TelemetryEvent::Other(value.clone()),
    }
}

fn recognize(value: &Value) -> Option<CompletionEvent> {
    let attrs = extract_attributes(value);
    let name = attrs
        .and_then(raw_event_name)
        .or_else(|| value.as_object().and_then(raw_event_name))?;
    let fields = attrs.or_else(|| value.as_object())?;

    let turn_count = || read_u64(fields, &["turn_count", "turnCount"]);
    let duration_ms = || read_u64(fields, &["duration_ms", "durationMs"]);

    match normalize_event_name(name).as_str() {
        "next_speaker_check" => {
            let result = fields.get("result").and_then(Value::as_str)?;
            Some(CompletionEvent::NextSpeakerCheck {
                result: SpeakerResult::parse(result)?,
            })
        }
        "agent_complete_task" => Some(CompletionEvent::AgentCompleteTask {
            turn_count: turn_count(),
            duration_ms: duration_ms(),
        }),
        "agent_finish" => Some(CompletionEvent::AgentFinish {
            terminate_reason: read_string(fields, &["terminate_reason", "terminateReason"]),
            turn_count: turn_count(),
            duration_ms: duration_ms(),
        }),
        "conversation_finished" => Some(CompletionEvent::ConversationFinished {
            turn_count: turn_count(),
            duration_ms: duration_ms(),
        }),
        _ => None,
    }
}
