//! Completion signals emitted by provider CLI telemetry.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerResult {
    User,
    Model,
}

impl SpeakerResult {
    pub fn as_str(self) -> &'static str {
        match self {
            SpeakerResult::User => "user",
            SpeakerResult::Model => "model",
        }
    }

    /// Only the two values the agent emits are recognized.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(SpeakerResult::User),
            "model" => Some(SpeakerResult::Model),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionEvent {
    NextSpeakerCheck {
        result: SpeakerResult,
    },
    AgentCompleteTask {
        turn_count: Option<u64>,
        duration_ms: Option<u64>,
    },
    AgentFinish {
        terminate_reason: Option<String>,
        turn_count: Option<u64>,
        duration_ms: Option<u64>,
    },
    ConversationFinished {
        turn_count: Option<u64>,
        duration_ms: Option<u64>,
    },
}

impl CompletionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            CompletionEvent::NextSpeakerCheck { .. } => "next_speaker_check",
            CompletionEvent::AgentCompleteTask { .. } => "agent_complete_task",
            CompletionEvent::AgentFinish { .. } => "agent_finish",
            CompletionEvent::ConversationFinished { .. } => "conversation_finished",
        }
    }

    pub fn is_user_turn(&self) -> bool {
        matches!(
            self,
            CompletionEvent::NextSpeakerCheck {
                result: SpeakerResult::User
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{CompletionEvent, SpeakerResult};

    #[test]
    fn speaker_result_only_accepts_known_values() {
        assert_eq!(SpeakerResult::parse("user"), Some(SpeakerResult::User));
        assert_eq!(SpeakerResult::parse("model"), Some(SpeakerResult::Model));
        assert_eq!(SpeakerResult::parse("USER"), None);
        assert_eq!(SpeakerResult::parse(""), None);
    }

    #[test]
    fn completion_event_serializes_with_type_tag() {
        let event = CompletionEvent::AgentFinish {
            terminate_reason: Some("GOAL".to_string()),
            turn_count: Some(4),
            duration_ms: None,
        };
        let value = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(value["type"], "agent_finish");
        assert_eq!(value["terminate_reason"], "GOAL");
        assert_eq!(value["turn_count"], 4);
        assert_eq!(event.kind(), "agent_finish");
    }

    #[test]
    fn is_user_turn_matches_only_user_speaker_checks() {
        assert!(CompletionEvent::NextSpeakerCheck {
            result: SpeakerResult::User
        }
        .is_user_turn());
        assert!(!CompletionEvent::NextSpeakerCheck {
            result: SpeakerResult::Model
        }
        .is_user_turn());
        assert!(!CompletionEvent::ConversationFinished {
            turn_count: None,
            duration_ms: None
        }
        .is_user_turn());
    }
}
