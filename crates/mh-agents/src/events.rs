use serde::{Deserialize, Serialize};

use mh_core::types::{FileOp, QuestionOption, TokenUsage};

// ---------------------------------------------------------------------------
// AgentEvent — the subprocess wire protocol
// ---------------------------------------------------------------------------

/// One structured event emitted by an agent subprocess.
///
/// Agents print one JSON object per stdout line with a `type`/`payload`
/// envelope. Lines that do not parse as events are folded into `text`
/// events, so plain-output tools still stream through the same pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum AgentEvent {
    /// A chunk of agent output.
    Text { content: String },
    /// The agent invoked a tool. `write_file`/`delete_file` tool calls are
    /// applied to disk by the runner (unless dry-run).
    ToolCall {
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    /// The agent reports having changed a working-tree file itself.
    FileChanged { path: String, op: FileOp },
    /// Progress message with a 0-100 percentage.
    Progress { message: String, percent: u8 },
    /// The agent needs input before it can continue.
    Question {
        text: String,
        #[serde(default)]
        options: Vec<QuestionOption>,
    },
    /// Token usage delta since the last report, with an optional running
    /// USD cost for the delta.
    TokenUsage {
        usage: TokenUsage,
        #[serde(default)]
        cost_usd: f64,
    },
    /// The agent is finished. `completed_specs` lists the specification
    /// numbers the step fully implemented.
    Done {
        #[serde(default)]
        status: i32,
        #[serde(default)]
        completed_specs: Vec<u32>,
    },
}

/// Parse one stdout line into an event, falling back to `text`.
pub fn parse_line(line: &str) -> AgentEvent {
    let trimmed = line.trim_end();
    if trimmed.starts_with('{') {
        if let Ok(event) = serde_json::from_str::<AgentEvent>(trimmed) {
            return event;
        }
    }
    AgentEvent::Text {
        content: trimmed.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_changed() {
        let line = r#"{"type":"file_changed","payload":{"path":"greeting.txt","op":"create"}}"#;
        assert_eq!(
            parse_line(line),
            AgentEvent::FileChanged {
                path: "greeting.txt".into(),
                op: FileOp::Create,
            }
        );
    }

    #[test]
    fn parses_question_with_options() {
        let line = r#"{"type":"question","payload":{"text":"Use SQL or NoSQL?","options":[{"label":"SQL","recommended":true},{"label":"NoSQL"}]}}"#;
        match parse_line(line) {
            AgentEvent::Question { text, options } => {
                assert_eq!(text, "Use SQL or NoSQL?");
                assert_eq!(options.len(), 2);
                assert!(options[0].recommended);
                assert!(!options[1].recommended);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_token_usage() {
        let line = r#"{"type":"token_usage","payload":{"usage":{"input_tokens":120,"output_tokens":40,"cached_tokens":12},"cost_usd":0.42}}"#;
        match parse_line(line) {
            AgentEvent::TokenUsage { usage, cost_usd } => {
                assert_eq!(usage.input_tokens, 120);
                assert_eq!(usage.output_tokens, 40);
                assert_eq!(usage.cached_tokens, 12);
                assert!((cost_usd - 0.42).abs() < 1e-9);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn token_usage_cost_defaults_to_zero() {
        let line = r#"{"type":"token_usage","payload":{"usage":{"input_tokens":5,"output_tokens":1,"cached_tokens":0}}}"#;
        match parse_line(line) {
            AgentEvent::TokenUsage { cost_usd, .. } => assert_eq!(cost_usd, 0.0),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_done_with_specs() {
        let line = r#"{"type":"done","payload":{"status":0,"completed_specs":[1,2]}}"#;
        assert_eq!(
            parse_line(line),
            AgentEvent::Done {
                status: 0,
                completed_specs: vec![1, 2],
            }
        );
    }

    #[test]
    fn plain_text_falls_back() {
        assert_eq!(
            parse_line("Thinking about the plan..."),
            AgentEvent::Text {
                content: "Thinking about the plan...".into()
            }
        );
        // Malformed JSON is text too.
        assert_eq!(
            parse_line(r#"{"type":"unknown_kind","payload":{}}"#),
            AgentEvent::Text {
                content: r#"{"type":"unknown_kind","payload":{}}"#.into()
            }
        );
    }
}
