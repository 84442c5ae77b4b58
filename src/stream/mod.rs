use serde::Deserialize;
use serde_json::{Value, json};

/// One record of Claude CLI's `--output-format stream-json --verbose` output.
///
/// Only the fields the pipeline consumes are modelled; everything else on the
/// line is ignored by serde.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RawRecord {
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        message: Option<RawMessage>,
    },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        message: Option<RawMessage>,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        total_cost_usd: f64,
        #[serde(default)]
        result: Option<String>,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        id: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: Option<Value>,
        #[serde(default)]
        exit_code: Option<i64>,
    },

    #[serde(other)]
    Unknown,
}

/// A typed event extracted from one line of tool output.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    /// Assistant prose.
    Text { subtype: String, content: String },
    /// The assistant invoked a tool. `label` is the file path or command it
    /// acted on, empty when the input carries neither.
    ToolUse {
        id: String,
        tool: String,
        input: Value,
        label: String,
    },
    /// Echo of a tool's output back to the assistant.
    ToolResult {
        id: String,
        output: String,
        exit_code: Option<i64>,
    },
    /// Final record of a run.
    Result { cost_usd: f64, summary: String },
}

impl ToolEvent {
    /// Payload published as the `output` event for this line.
    pub fn to_payload(&self) -> Value {
        match self {
            ToolEvent::Text { subtype, content } => json!({
                "type": subtype,
                "content": content,
            }),
            ToolEvent::ToolUse { id, tool, input, .. } => json!({
                "type": "tool_use",
                "tool": tool,
                "id": id,
                "input": input,
            }),
            ToolEvent::ToolResult {
                id,
                output,
                exit_code,
            } => {
                let mut payload = json!({
                    "type": "tool_result",
                    "id": id,
                    "output": output,
                });
                if let Some(code) = exit_code {
                    payload["exit_code"] = json!(code);
                }
                payload
            }
            ToolEvent::Result { cost_usd, .. } => json!({
                "type": "result",
                "cost_usd": cost_usd,
            }),
        }
    }
}

/// Parse one line of stream-json output.
///
/// Returns `None` for blank lines, malformed JSON, record kinds the pipeline
/// does not use (`system`, ...) and records missing the content they need.
/// Only the first content block of a message is considered.
pub fn parse_line(line: &str) -> Option<ToolEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let record: RawRecord = serde_json::from_str(line).ok()?;

    match record {
        RawRecord::Assistant { subtype, message } => {
            match message?.content.into_iter().next()? {
                ContentBlock::Text { text } => Some(ToolEvent::Text {
                    subtype: subtype
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| "text".to_string()),
                    content: text,
                }),
                ContentBlock::ToolUse { name, id, input } => {
                    let label = action_label(&input);
                    Some(ToolEvent::ToolUse {
                        id,
                        tool: name,
                        input,
                        label,
                    })
                }
                _ => None,
            }
        }
        RawRecord::User { message } => match message?.content.into_iter().next()? {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                exit_code,
            } => Some(ToolEvent::ToolResult {
                id: tool_use_id,
                output: match content {
                    Some(Value::String(s)) => s,
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                },
                exit_code,
            }),
            _ => None,
        },
        RawRecord::Result {
            total_cost_usd,
            result,
        } => Some(ToolEvent::Result {
            cost_usd: total_cost_usd,
            summary: result.unwrap_or_default(),
        }),
        RawRecord::Other => None,
    }
}

/// Human-readable target of a tool invocation: `file_path`, else `command`.
pub fn action_label(input: &Value) -> String {
    input
        .get("file_path")
        .and_then(|v| v.as_str())
        .or_else(|| input.get("command").and_then(|v| v.as_str()))
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assistant_text() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello world"}]},"session_id":"abc"}"#;
        assert_eq!(
            parse_line(line),
            Some(ToolEvent::Text {
                subtype: "text".into(),
                content: "Hello world".into()
            })
        );
    }

    #[test]
    fn test_parse_assistant_tool_use_extracts_file_path() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_1","name":"Write","input":{"file_path":"src/a.go","content":"package a"}}]}}"#;
        let event = parse_line(line).unwrap();
        match &event {
            ToolEvent::ToolUse {
                id, tool, label, ..
            } => {
                assert_eq!(id, "toolu_1");
                assert_eq!(tool, "Write");
                assert_eq!(label, "src/a.go");
            }
            other => panic!("Expected ToolUse, got {:?}", other),
        }
        let payload = event.to_payload();
        assert_eq!(payload["type"], "tool_use");
        assert_eq!(payload["tool"], "Write");
        assert_eq!(payload["input"]["file_path"], "src/a.go");
    }

    #[test]
    fn test_parse_tool_use_falls_back_to_command() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t","name":"Bash","input":{"command":"go test ./..."}}]}}"#;
        match parse_line(line) {
            Some(ToolEvent::ToolUse { label, .. }) => assert_eq!(label, "go test ./..."),
            other => panic!("Expected ToolUse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_tool_result_string_and_structured_content() {
        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#;
        assert_eq!(
            parse_line(line),
            Some(ToolEvent::ToolResult {
                id: "t1".into(),
                output: "ok".into(),
                exit_code: None
            })
        );

        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t2","content":[{"type":"text","text":"x"}]}]}}"#;
        match parse_line(line) {
            Some(ToolEvent::ToolResult { output, .. }) => {
                let reparsed: Value = serde_json::from_str(&output).unwrap();
                assert_eq!(reparsed[0]["text"], "x");
            }
            other => panic!("Expected ToolResult, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_result_carries_cost() {
        let line = r#"{"type":"result","subtype":"success","total_cost_usd":0.15,"result":"done","num_turns":2}"#;
        let event = parse_line(line).unwrap();
        assert_eq!(
            event,
            ToolEvent::Result {
                cost_usd: 0.15,
                summary: "done".into()
            }
        );
        assert_eq!(event.to_payload()["cost_usd"], 0.15);
    }

    #[test]
    fn test_parse_skips_unneeded_and_broken_lines() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("not json"), None);
        assert_eq!(parse_line(r#"{"type":"assistant","message":{"con"#), None);
        assert_eq!(
            parse_line(r#"{"type":"system","subtype":"init","cwd":"/tmp","tools":[]}"#),
            None
        );
        assert_eq!(parse_line(r#"{"type":"assistant","message":{"content":[]}}"#), None);
        assert_eq!(parse_line(r#"{"type":"assistant"}"#), None);
        assert_eq!(
            parse_line(r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hm"}]}}"#),
            None
        );
        assert_eq!(
            parse_line(r#"{"type":"user","message":{"content":[{"type":"text","text":"hi"}]}}"#),
            None
        );
    }

    #[test]
    fn test_tool_result_payload_includes_exit_code_only_when_present() {
        let with = ToolEvent::ToolResult {
            id: "a".into(),
            output: "".into(),
            exit_code: Some(2),
        };
        assert_eq!(with.to_payload()["exit_code"], 2);
        let without = ToolEvent::ToolResult {
            id: "a".into(),
            output: "".into(),
            exit_code: None,
        };
        assert!(without.to_payload().get("exit_code").is_none());
    }
}
