//! Stream-JSON output of agent processes.
//!
//! Agent commands print one JSON event per line. `StreamAccumulator` folds
//! those lines into the text, cost and duration of one invocation.

use serde::Deserialize;
use serde_json::Value;

/// Events of the stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: f64,
        #[serde(default)]
        duration_ms: u64,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
    },

    /// `user` tool results and anything newer than this parser
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// Final result event of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamResult {
    pub text: Option<String>,
    pub is_error: bool,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

/// Folds stream-json lines into one invocation outcome.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    result: Option<StreamResult>,
    tool_uses: usize,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one output line. Non-JSON lines are kept as plain text.
    pub fn push_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match serde_json::from_str::<StreamEvent>(line) {
            Ok(StreamEvent::Assistant { message, .. }) => {
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            self.text.push_str(&text);
                            self.text.push('\n');
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            self.tool_uses += 1;
                            tracing::debug!(tool = %tool_summary(&name, &input), "agent tool use");
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            Ok(StreamEvent::Result {
                result,
                is_error,
                total_cost_usd,
                duration_ms,
                ..
            }) => {
                self.result = Some(StreamResult {
                    text: result,
                    is_error,
                    cost_usd: total_cost_usd,
                    duration_ms,
                });
            }
            Ok(StreamEvent::System { .. } | StreamEvent::Other) => {}
            Err(_) => {
                self.text.push_str(line);
                self.text.push('\n');
            }
        }
    }

    pub fn result(&self) -> Option<&StreamResult> {
        self.result.as_ref()
    }

    pub fn tool_uses(&self) -> usize {
        self.tool_uses
    }

    /// The final result text if there was one, otherwise everything seen.
    pub fn output(&self) -> String {
        self.result
            .as_ref()
            .and_then(|r| r.text.clone())
            .unwrap_or_else(|| self.text.clone())
    }

    /// Everything the agent said, including the final result text.
    pub fn transcript(&self) -> String {
        match self.result.as_ref().and_then(|r| r.text.as_deref()) {
            Some(final_text) if !self.text.contains(final_text) => {
                format!("{}{}", self.text, final_text)
            }
            _ => self.text.clone(),
        }
    }
}

/// Short label for a tool call, e.g. `edit src/main.rs` or `bash cargo test`.
pub fn tool_summary(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(Value::as_str);
    let target = match name {
        "Read" | "Write" | "Edit" => field("file_path").map(last_components),
        "Bash" => field("command").map(|c| clip(c, 40)),
        "Grep" | "Glob" => field("pattern").map(str::to_string),
        _ => None,
    };
    match target {
        Some(target) => format!("{} {}", name.to_lowercase(), target),
        None => name.to_lowercase(),
    }
}

fn last_components(path: &str) -> String {
    let parts: Vec<&str> = path.rsplitn(3, '/').collect();
    match parts.as_slice() {
        [file, dir, _] => format!("{}/{}", dir, file),
        _ => path.to_string(),
    }
}

fn clip(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &s[..cut]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_with_cost() {
        let json = r#"{"type":"result","subtype":"success","result":"done","is_error":false,"total_cost_usd":0.42,"duration_ms":1500}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        match event {
            StreamEvent::Result {
                total_cost_usd,
                duration_ms,
                ..
            } => {
                assert!((total_cost_usd - 0.42).abs() < 1e-9);
                assert_eq!(duration_ms, 1500);
            }
            _ => panic!("Expected Result event"),
        }
    }

    #[test]
    fn test_unknown_event_type_is_other() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"user","tool_use_result":{}}"#).unwrap();
        assert!(matches!(event, StreamEvent::Other));
    }

    #[test]
    fn test_accumulator_prefers_result_text() {
        let mut acc = StreamAccumulator::new();
        acc.push_line(r#"{"type":"system","subtype":"init"}"#);
        acc.push_line(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"thinking"},{"type":"tool_use","name":"Read","input":{"file_path":"/a/b/c.rs"},"id":"1"}]}}"#);
        acc.push_line("");
        acc.push_line(r#"{"type":"result","subtype":"success","result":"<verdict>approve</verdict>","total_cost_usd":0.1,"duration_ms":20}"#);

        assert_eq!(acc.tool_uses(), 1);
        assert_eq!(acc.output(), "<verdict>approve</verdict>");
        assert!(acc.transcript().contains("thinking"));
        assert!(acc.transcript().contains("<verdict>"));
        assert_eq!(acc.result().unwrap().duration_ms, 20);
    }

    #[test]
    fn test_accumulator_keeps_plain_lines() {
        let mut acc = StreamAccumulator::new();
        acc.push_line("not json");
        assert!(acc.result().is_none());
        assert_eq!(acc.output(), "not json\n");
    }

    #[test]
    fn test_tool_summary() {
        let edit = serde_json::json!({"file_path": "/srv/app/src/billing/invoice.rs"});
        assert_eq!(tool_summary("Edit", &edit), "edit billing/invoice.rs");

        let bash = serde_json::json!({"command": "make check"});
        assert_eq!(tool_summary("Bash", &bash), "bash make check");

        assert_eq!(tool_summary("WebSearch", &serde_json::json!({})), "websearch");
        assert_eq!(last_components("main.rs"), "main.rs");
    }

    #[test]
    fn test_clip_counts_chars() {
        assert_eq!(clip("ééééé", 3), "ééé…");
        assert_eq!(clip("abc", 3), "abc");
    }
}
