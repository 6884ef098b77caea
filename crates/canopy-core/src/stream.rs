//! Conversation-stream frames as seen by a client.
//!
//! A relayed stream that dies mid-way carries no error object; it just ends.
//! [`StreamMonitor`] tracks whether a completion marker arrived so callers
//! can tell a finished stream from a truncated one.

use serde::Deserialize;

/// Marker some backends send as the final `data:` payload.
pub const DONE_MARKER: &str = "[DONE]";

/// One decoded event-stream `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Token(String),
    Done,
    Error(String),
    /// Valid payload with no meaning for token display.
    Other(serde_json::Value),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TypedFrame {
    #[serde(alias = "content", alias = "delta")]
    Token {
        #[serde(alias = "text", alias = "delta")]
        content: String,
    },
    #[serde(alias = "complete", alias = "finish")]
    Done,
    Error {
        message: String,
    },
}

impl StreamFrame {
    /// Decode a `data:` payload. JSON frames are matched on their `type`
    /// field; anything else that is not the done marker is a raw token.
    pub fn parse(data: &str) -> Self {
        let trimmed = data.trim();
        if trimmed == DONE_MARKER {
            return StreamFrame::Done;
        }
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) => match TypedFrame::deserialize(&value) {
                Ok(TypedFrame::Token { content }) => StreamFrame::Token(content),
                Ok(TypedFrame::Done) => StreamFrame::Done,
                Ok(TypedFrame::Error { message }) => StreamFrame::Error(message),
                Err(_) => StreamFrame::Other(value),
            },
            Err(_) => StreamFrame::Token(data.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    /// Upstream reported an error frame before ending.
    Failed,
    /// Stream ended with neither a completion marker nor an error frame.
    Truncated,
}

#[derive(Debug, Default)]
pub struct StreamMonitor {
    frames: usize,
    done: bool,
    failed: bool,
}

impl StreamMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one `data:` payload and get it back decoded.
    pub fn observe(&mut self, data: &str) -> StreamFrame {
        let frame = StreamFrame::parse(data);
        self.frames += 1;
        match frame {
            StreamFrame::Done => self.done = true,
            StreamFrame::Error(_) => self.failed = true,
            _ => {}
        }
        frame
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Verdict once the underlying byte stream has ended.
    pub fn finish(&self) -> StreamOutcome {
        if self.done {
            StreamOutcome::Completed
        } else if self.failed {
            StreamOutcome::Failed
        } else {
            StreamOutcome::Truncated
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frames() {
        assert_eq!(StreamFrame::parse("[DONE]"), StreamFrame::Done);
        assert_eq!(
            StreamFrame::parse(r#"{"type":"token","content":"Hel"}"#),
            StreamFrame::Token("Hel".to_string())
        );
        assert_eq!(
            StreamFrame::parse(r#"{"type":"content","text":"lo"}"#),
            StreamFrame::Token("lo".to_string())
        );
        assert_eq!(StreamFrame::parse(r#"{"type":"complete"}"#), StreamFrame::Done);
        assert_eq!(
            StreamFrame::parse(r#"{"type":"error","message":"boom"}"#),
            StreamFrame::Error("boom".to_string())
        );
        assert!(matches!(
            StreamFrame::parse(r#"{"type":"usage","tokens":3}"#),
            StreamFrame::Other(_)
        ));
        assert_eq!(
            StreamFrame::parse("plain text"),
            StreamFrame::Token("plain text".to_string())
        );
    }

    #[test]
    fn test_monitor_detects_truncation() {
        let mut monitor = StreamMonitor::new();
        monitor.observe(r#"{"type":"token","content":"a"}"#);
        monitor.observe(r#"{"type":"token","content":"b"}"#);
        assert_eq!(monitor.frames(), 2);
        assert_eq!(monitor.finish(), StreamOutcome::Truncated);

        monitor.observe("[DONE]");
        assert_eq!(monitor.finish(), StreamOutcome::Completed);
    }

    #[test]
    fn test_monitor_reports_error_frames() {
        let mut monitor = StreamMonitor::new();
        monitor.observe(r#"{"type":"error","message":"rate limited"}"#);
        assert_eq!(monitor.finish(), StreamOutcome::Failed);
    }
}
