//! Stream Wire Protocol
//!
//! The orchestrator's output is a stream of [`StreamFrame`]s: plain answer
//! text, tool status transitions and reasoning segments. That tagged union is
//! the internal contract; the bracket markers
//! (`[[TOOL:name:state:args:result]]`, `[[THINKING:...]]`) are only the
//! boundary serialization for clients that consume one text stream.
//!
//! Decoding is tolerant: malformed or truncated markers degrade to dropped
//! markers, never an error. Tool args/results are JSON, so the decoder walks
//! them with a real JSON parser instead of splitting on delimiters.

use serde::{Deserialize, Serialize};

/// Tool execution state carried in a marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolState {
    Running,
    Done,
}

impl ToolState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
        }
    }
}

/// One frame of the orchestrator's output stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// User-visible answer text
    Text(String),

    /// A tool transitioned to `running` (result is JSON null) or `done`
    ToolStatus {
        name: String,
        state: ToolState,
        args: serde_json::Value,
        result: serde_json::Value,
    },

    ThinkingStart,
    ThinkingChunk(String),
    ThinkingEnd,
}

/// Flattened tool outcome persisted with the assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub name: String,
    pub args: serde_json::Value,
    pub result: serde_json::Value,
}

/// Serialize one frame to its wire form
#[must_use]
pub fn encode(frame: &StreamFrame) -> String {
    match frame {
        StreamFrame::Text(text) => text.clone(),
        StreamFrame::ToolStatus { name, state, args, result } => {
            format!("[[TOOL:{name}:{}:{args}:{result}]]", state.as_str())
        }
        StreamFrame::ThinkingStart => "[[THINKING:start]]".to_string(),
        StreamFrame::ThinkingChunk(text) => format!("[[THINKING:chunk:{text}]]"),
        StreamFrame::ThinkingEnd => "[[THINKING:end]]".to_string(),
    }
}

/// Decode a marker-bearing text into frames.
///
/// Plain text between markers becomes `Text` frames. A `[[` that does not
/// open a well-formed marker is kept as literal text when it clearly is not
/// marker-shaped, dropped (with everything after it) when it looks like a
/// marker cut off by stream truncation, and skipped past its `]]` terminator
/// when marker-shaped but malformed.
#[must_use]
pub fn decode(text: &str) -> Vec<StreamFrame> {
    let mut frames = Vec::new();
    let mut plain = String::new();
    let mut rest = text;

    while let Some(start) = rest.find("[[") {
        plain.push_str(&rest[..start]);
        let candidate = &rest[start..];

        if let Some((frame, consumed)) = parse_marker(candidate) {
            flush_text(&mut frames, &mut plain);
            frames.push(frame);
            rest = &candidate[consumed..];
        } else if is_marker_shaped(candidate) {
            if let Some(end) = candidate.find("]]") {
                // Malformed but terminated: drop the marker, keep the tail
                rest = &candidate[end + 2..];
            } else {
                // Truncated mid-marker at end of stream
                rest = "";
            }
        } else {
            // Ordinary text that happens to contain "[["
            plain.push_str("[[");
            rest = &candidate[2..];
        }
    }

    plain.push_str(rest);
    flush_text(&mut frames, &mut plain);
    frames
}

/// Plain text with every marker removed
#[must_use]
pub fn strip_markers(text: &str) -> String {
    decode(text)
        .into_iter()
        .filter_map(|frame| match frame {
            StreamFrame::Text(t) => Some(t),
            _ => None,
        })
        .collect()
}

/// Completed tool invocations, in stream order, for persistence
#[must_use]
pub fn extract_tool_records(text: &str) -> Vec<ToolRecord> {
    decode(text)
        .into_iter()
        .filter_map(|frame| match frame {
            StreamFrame::ToolStatus { name, state: ToolState::Done, args, result } => {
                Some(ToolRecord { name, args, result })
            }
            _ => None,
        })
        .collect()
}

fn flush_text(frames: &mut Vec<StreamFrame>, plain: &mut String) {
    if !plain.is_empty() {
        frames.push(StreamFrame::Text(std::mem::take(plain)));
    }
}

/// Whether `candidate` begins with a marker prefix (or with a prefix of one,
/// which can only happen at a truncation point)
fn is_marker_shaped(candidate: &str) -> bool {
    let shaped = |prefix: &str| {
        let n = prefix.len().min(candidate.len());
        candidate.as_bytes()[..n] == prefix.as_bytes()[..n]
    };
    shaped("[[TOOL:") || shaped("[[THINKING:")
}

/// Try to parse one complete marker at the start of `s`, returning the frame
/// and the bytes consumed
fn parse_marker(s: &str) -> Option<(StreamFrame, usize)> {
    if let Some(rest) = s.strip_prefix("[[THINKING:") {
        if let Some(tail) = rest.strip_prefix("start]]") {
            return Some((StreamFrame::ThinkingStart, s.len() - tail.len()));
        }
        if let Some(tail) = rest.strip_prefix("end]]") {
            return Some((StreamFrame::ThinkingEnd, s.len() - tail.len()));
        }
        if let Some(chunk) = rest.strip_prefix("chunk:") {
            let end = chunk.find("]]")?;
            let frame = StreamFrame::ThinkingChunk(chunk[..end].to_string());
            let consumed = s.len() - chunk.len() + end + 2;
            return Some((frame, consumed));
        }
        return None;
    }

    let rest = s.strip_prefix("[[TOOL:")?;

    let name_end = rest.find(':')?;
    let name = &rest[..name_end];
    if name.is_empty() || name.contains(']') || name.contains('[') {
        return None;
    }

    let after_name = &rest[name_end + 1..];
    let (state, after_state) = if let Some(tail) = after_name.strip_prefix("running:") {
        (ToolState::Running, tail)
    } else if let Some(tail) = after_name.strip_prefix("done:") {
        (ToolState::Done, tail)
    } else {
        return None;
    };

    let (args, args_len) = parse_json_prefix(after_state)?;
    let after_args = after_state[args_len..].strip_prefix(':')?;
    let (result, result_len) = parse_json_prefix(after_args)?;
    let tail = after_args[result_len..].strip_prefix("]]")?;

    let frame = StreamFrame::ToolStatus { name: name.to_string(), state, args, result };
    Some((frame, s.len() - tail.len()))
}

/// Parse one JSON value at the start of `s`, returning it and its byte length
fn parse_json_prefix(s: &str) -> Option<(serde_json::Value, usize)> {
    let mut iter = serde_json::Deserializer::from_str(s).into_iter::<serde_json::Value>();
    match iter.next()? {
        Ok(value) => Some((value, iter.byte_offset())),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tool_frame(state: ToolState, result: serde_json::Value) -> StreamFrame {
        StreamFrame::ToolStatus {
            name: "execute_query".to_string(),
            state,
            args: serde_json::json!({"query": "SELECT 1", "max_rows": 10}),
            result,
        }
    }

    #[test]
    fn test_encode_tool_markers() {
        let running = encode(&tool_frame(ToolState::Running, serde_json::Value::Null));
        assert!(running.starts_with("[[TOOL:execute_query:running:"));
        assert!(running.ends_with(":null]]"));

        let done = encode(&tool_frame(ToolState::Done, serde_json::json!({"rows": 1})));
        assert!(done.contains(":done:"));
    }

    #[test]
    fn test_round_trip_interleaved_stream() {
        let frames = vec![
            StreamFrame::ThinkingStart,
            StreamFrame::ThinkingChunk("inspecting the schema".to_string()),
            StreamFrame::ThinkingEnd,
            StreamFrame::Text("Let me check.".to_string()),
            tool_frame(ToolState::Running, serde_json::Value::Null),
            tool_frame(ToolState::Done, serde_json::json!({"rows": 1})),
            StreamFrame::Text("There is one row.".to_string()),
        ];
        let wire: String = frames.iter().map(encode).collect();

        assert_eq!(decode(&wire), frames);
    }

    #[test]
    fn test_decode_args_containing_delimiters() {
        // JSON args may contain colons and bracket pairs
        let frame = StreamFrame::ToolStatus {
            name: "execute_query".to_string(),
            state: ToolState::Done,
            args: serde_json::json!({"query": "SELECT ']]' AS x, 'a:b' AS y"}),
            result: serde_json::json!({"columns": ["x", "y"]}),
        };
        let wire = encode(&frame);
        assert_eq!(decode(&wire), vec![frame]);
    }

    #[test]
    fn test_truncated_marker_is_dropped() {
        let text = "The answer is 42. [[TOOL:execute_query:done:{\"que";
        assert_eq!(decode(text), vec![StreamFrame::Text("The answer is 42. ".to_string())]);
    }

    #[test]
    fn test_malformed_marker_is_skipped() {
        let text = "before [[TOOL:bad-state:maybe:null:null]] after";
        assert_eq!(
            decode(text),
            vec![StreamFrame::Text("before ".to_string()), StreamFrame::Text(" after".to_string())]
        );
    }

    #[test]
    fn test_literal_brackets_survive() {
        let text = "array[[0]] indexing";
        assert_eq!(decode(text), vec![StreamFrame::Text("array[[0]] indexing".to_string())]);
    }

    #[test]
    fn test_strip_markers() {
        let wire: String = [
            StreamFrame::ThinkingStart,
            StreamFrame::ThinkingChunk("hmm".to_string()),
            StreamFrame::ThinkingEnd,
            StreamFrame::Text("Hello".to_string()),
            tool_frame(ToolState::Done, serde_json::json!({"rows": 0})),
            StreamFrame::Text(" world".to_string()),
        ]
        .iter()
        .map(encode)
        .collect();

        assert_eq!(strip_markers(&wire), "Hello world");
    }

    #[test]
    fn test_extract_tool_records_takes_done_only() {
        let wire: String = [
            tool_frame(ToolState::Running, serde_json::Value::Null),
            tool_frame(ToolState::Done, serde_json::json!({"rows": 3})),
        ]
        .iter()
        .map(encode)
        .collect();

        let records = extract_tool_records(&wire);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "execute_query");
        assert_eq!(records[0].result, serde_json::json!({"rows": 3}));
    }

    #[test]
    fn test_empty_input() {
        assert!(decode("").is_empty());
        assert_eq!(strip_markers(""), "");
    }
}
