//! Conversation turn assembly
//!
//! Folds streaming transcription and content deltas into an append-only log of
//! conversation turns. Only the tail turn is ever patched, and only while it is
//! not final. Coalescing looks at the tail alone: a delta joins the last turn
//! when that turn has the same role and is still open, otherwise it starts a
//! new turn.

use crate::protocol::GroundingChunk;
use crate::tools::{ToolInvocation, ToolResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use tokio::sync::watch;
use tracing::debug;

/// Who a turn belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
    System,
}

impl Role {
    fn label(&self) -> &'static str {
        match self {
            Role::User => "You",
            Role::Agent => "Agent",
            Role::System => "System",
        }
    }
}

/// One entry of the transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationTurn {
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub text: String,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub grounding_chunks: Vec<GroundingChunk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_request: Option<ToolInvocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_response: Option<Vec<ToolResult>>,
}

impl ConversationTurn {
    fn delta(role: Role, text: String, is_final: bool, grounding_chunks: Vec<GroundingChunk>, at: DateTime<Utc>) -> Self {
        Self {
            timestamp: at,
            role,
            text,
            is_final,
            grounding_chunks,
            tool_use_request: None,
            tool_use_response: None,
        }
    }

    fn system(text: String, at: DateTime<Utc>) -> Self {
        Self::delta(Role::System, text, true, Vec::new(), at)
    }
}

/// Everything the assembler reacts to, in session event order.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnInput {
    /// Speech-to-text of either side. Input transcription is `Role::User`,
    /// output transcription is `Role::Agent`.
    Transcript {
        role: Role,
        text: String,
        is_final: bool,
    },
    /// Non-audio model output, always an open agent delta.
    Content {
        text: String,
        grounding_chunks: Vec<GroundingChunk>,
    },
    TurnComplete,
    ToolRequest(Vec<ToolInvocation>),
    ToolResponse(Vec<ToolResult>),
}

/// Ordered, append-only list of turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TranscriptLog {
    turns: Vec<ConversationTurn>,
}

impl TranscriptLog {
    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    /// Apply one input. Returns whether the log changed.
    pub(crate) fn apply(&mut self, input: TurnInput, at: DateTime<Utc>) -> bool {
        match input {
            TurnInput::Transcript { role, text, is_final } => {
                self.apply_delta(role, text, is_final, Vec::new(), at)
            }
            TurnInput::Content { text, grounding_chunks } => {
                self.apply_delta(Role::Agent, text, false, grounding_chunks, at)
            }
            TurnInput::TurnComplete => match self.turns.last_mut() {
                Some(last) if !last.is_final => {
                    last.is_final = true;
                    true
                }
                _ => false,
            },
            TurnInput::ToolRequest(invocations) => {
                let changed = !invocations.is_empty();
                for invocation in invocations {
                    let text = format!(
                        "Triggering function call: **{}**\n```json\n{}\n```",
                        invocation.name,
                        pretty(&invocation.args)
                    );
                    let mut turn = ConversationTurn::system(text, at);
                    turn.tool_use_request = Some(invocation);
                    self.turns.push(turn);
                }
                changed
            }
            TurnInput::ToolResponse(results) => {
                if results.is_empty() {
                    return false;
                }
                let text = format!(
                    "Function call response:\n```json\n{}\n```",
                    serde_json::to_string_pretty(&results).unwrap_or_default()
                );
                let mut turn = ConversationTurn::system(text, at);
                turn.tool_use_response = Some(results);
                self.turns.push(turn);
                true
            }
        }
    }

    fn apply_delta(
        &mut self,
        role: Role,
        text: String,
        is_final: bool,
        grounding_chunks: Vec<GroundingChunk>,
        at: DateTime<Utc>,
    ) -> bool {
        let empty = text.is_empty() && grounding_chunks.is_empty();
        match self.turns.last_mut() {
            Some(last) if last.role == role && !last.is_final => {
                if empty && !is_final {
                    return false;
                }
                last.text.push_str(&text);
                last.grounding_chunks.extend(grounding_chunks);
                last.is_final = is_final;
                true
            }
            _ if empty => {
                debug!(target: "callerpro::turns", ?role, "Dropping empty delta");
                false
            }
            _ => {
                self.turns
                    .push(ConversationTurn::delta(role, text, is_final, grounding_chunks, at));
                true
            }
        }
    }

    /// Render the transcript for export.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        for turn in &self.turns {
            let _ = write!(
                out,
                "**{}** ({}): {}",
                turn.role.label(),
                format_timestamp(&turn.timestamp),
                turn.text
            );
            if !turn.is_final {
                out.push_str(" …");
            }
            out.push('\n');
            for chunk in &turn.grounding_chunks {
                if let Some(web) = &chunk.web {
                    let uri = web.uri.as_deref().unwrap_or_default();
                    let title = web.title.as_deref().unwrap_or(uri);
                    let _ = writeln!(out, "  - [{}]({})", title, uri);
                }
            }
            out.push('\n');
        }
        out
    }
}

/// `HH:MM:SS.mmm`
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%H:%M:%S%.3f").to_string()
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Pure reducer: `(log, input) -> log`.
pub fn reduce(mut log: TranscriptLog, input: TurnInput, at: DateTime<Utc>) -> TranscriptLog {
    log.apply(input, at);
    log
}

/// Owns the transcript and publishes a snapshot after every change.
pub struct TurnAssembler {
    tx: watch::Sender<TranscriptLog>,
}

impl TurnAssembler {
    pub fn new() -> (Self, watch::Receiver<TranscriptLog>) {
        let (tx, rx) = watch::channel(TranscriptLog::default());
        (Self { tx }, rx)
    }

    pub fn apply(&self, input: TurnInput) {
        let now = Utc::now();
        self.tx.send_if_modified(|log| log.apply(input, now));
    }

    pub fn subscribe(&self) -> watch::Receiver<TranscriptLog> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> TranscriptLog {
        self.tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WebSource;
    use serde_json::json;

    fn agent(text: &str, is_final: bool) -> TurnInput {
        TurnInput::Transcript {
            role: Role::Agent,
            text: text.to_string(),
            is_final,
        }
    }

    fn user(text: &str, is_final: bool) -> TurnInput {
        TurnInput::Transcript {
            role: Role::User,
            text: text.to_string(),
            is_final,
        }
    }

    fn run(inputs: Vec<TurnInput>) -> TranscriptLog {
        let at = Utc::now();
        inputs
            .into_iter()
            .fold(TranscriptLog::default(), |log, input| reduce(log, input, at))
    }

    fn summary(log: &TranscriptLog) -> Vec<(Role, &str, bool)> {
        log.iter().map(|t| (t.role, t.text.as_str(), t.is_final)).collect()
    }

    #[test]
    fn test_deltas_coalesce_into_hello() {
        let log = run(vec![agent("He", false), agent("llo", false), agent("", true)]);
        assert_eq!(summary(&log), vec![(Role::Agent, "Hello", true)]);

        let log = run(vec![agent("He", false), agent("l", false), agent("lo", true)]);
        assert_eq!(summary(&log), vec![(Role::Agent, "Hello", true)]);
    }

    #[test]
    fn test_one_turn_per_same_role_run() {
        let log = run(vec![
            user("Where ", false),
            user("is it?", false),
            agent("It is ", false),
            agent("here.", false),
            user("Thanks", false),
        ]);
        assert_eq!(
            summary(&log),
            vec![
                (Role::User, "Where is it?", false),
                (Role::Agent, "It is here.", false),
                (Role::User, "Thanks", false),
            ]
        );
    }

    #[test]
    fn test_final_turn_is_not_reopened() {
        let log = run(vec![agent("Done.", true), agent("Next", false)]);
        assert_eq!(
            summary(&log),
            vec![(Role::Agent, "Done.", true), (Role::Agent, "Next", false)]
        );
    }

    #[test]
    fn test_turn_complete_is_idempotent() {
        let log = run(vec![agent("Hi", false), TurnInput::TurnComplete]);
        assert_eq!(summary(&log), vec![(Role::Agent, "Hi", true)]);

        let again = reduce(log.clone(), TurnInput::TurnComplete, Utc::now());
        assert_eq!(again, log);

        let empty = reduce(TranscriptLog::default(), TurnInput::TurnComplete, Utc::now());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_empty_delta_dropped() {
        let log = run(vec![agent("", false)]);
        assert!(log.is_empty());

        let log = run(vec![agent("", true)]);
        assert!(log.is_empty());

        let log = run(vec![agent("Hi", false), agent("", false)]);
        assert_eq!(summary(&log), vec![(Role::Agent, "Hi", false)]);

        // An empty delta never opens a turn for another role.
        let log = run(vec![agent("Hi", false), user("", true)]);
        assert_eq!(summary(&log), vec![(Role::Agent, "Hi", false)]);

        let log = run(vec![TurnInput::Content {
            text: String::new(),
            grounding_chunks: Vec::new(),
        }]);
        assert!(log.is_empty());
    }

    #[test]
    fn test_content_appends_grounding() {
        let chunk = GroundingChunk {
            web: Some(WebSource {
                uri: Some("https://example.com".to_string()),
                title: Some("Example".to_string()),
            }),
        };
        let log = run(vec![
            agent("See ", false),
            TurnInput::Content {
                text: "this".to_string(),
                grounding_chunks: vec![chunk.clone()],
            },
            TurnInput::Content {
                text: String::new(),
                grounding_chunks: vec![chunk.clone()],
            },
        ]);
        assert_eq!(log.len(), 1);
        let turn = log.last().unwrap();
        assert_eq!(turn.text, "See this");
        assert!(!turn.is_final);
        assert_eq!(turn.grounding_chunks, vec![chunk.clone(), chunk]);
    }

    #[test]
    fn test_tool_entries_never_coalesce() {
        let invocations = vec![
            ToolInvocation {
                id: "1".to_string(),
                name: "lookup".to_string(),
                args: json!({ "q": "x" }),
            },
            ToolInvocation {
                id: "2".to_string(),
                name: "noop".to_string(),
                args: json!({}),
            },
        ];
        let results = vec![ToolResult {
            id: "1".to_string(),
            name: "lookup".to_string(),
            response: json!({ "result": "ok" }),
        }];
        let log = run(vec![
            agent("One moment", false),
            TurnInput::ToolRequest(invocations),
            TurnInput::ToolResponse(results.clone()),
            agent("Found it", false),
        ]);

        let roles: Vec<_> = log.iter().map(|t| (t.role, t.is_final)).collect();
        assert_eq!(
            roles,
            vec![
                (Role::Agent, false),
                (Role::System, true),
                (Role::System, true),
                (Role::System, true),
                (Role::Agent, false),
            ]
        );
        assert_eq!(
            log.turns()[1].text,
            "Triggering function call: **lookup**\n```json\n{\n  \"q\": \"x\"\n}\n```"
        );
        assert_eq!(log.turns()[1].tool_use_request.as_ref().unwrap().id, "1");
        assert!(log.turns()[3].text.starts_with("Function call response:\n```json\n"));
        assert_eq!(log.turns()[3].tool_use_response.as_ref(), Some(&results));
    }

    #[test]
    fn test_markdown_export() {
        let log = run(vec![user("Hi", true), agent("Hello", false)]);
        let md = log.to_markdown();
        assert!(md.contains("**You** ("));
        assert!(md.contains("): Hi\n"));
        assert!(md.contains("): Hello …\n"));
    }

    #[test]
    fn test_timestamp_format() {
        let at = DateTime::parse_from_rfc3339("2025-03-01T09:05:07.042Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(&at), "09:05:07.042");
    }

    #[test]
    fn test_assembler_publishes_only_changes() {
        let (assembler, mut rx) = TurnAssembler::new();

        assembler.apply(agent("", false));
        assert!(!rx.has_changed().unwrap());

        assembler.apply(agent("Hi", false));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);
        assert_eq!(assembler.snapshot().last().unwrap().text, "Hi");
    }
}
