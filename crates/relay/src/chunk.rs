//! Units of streamed output exchanged between generation backends, the flow
//! interpreter and the wire protocol.
//!
//! A chunk is immutable once constructed. Each chunk carries a cost in
//! characters which feeds the usage accounting of the response; text chunks
//! default to their own length and everything else to zero unless a cost is
//! set explicitly.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

/// Normal completion of a request or a chained call.
pub const EXIT_OK: i32 = 0;
/// The request failed; the client only ever sees this together with a
/// generic error log chunk.
pub const EXIT_FAILURE: i32 = 1;
/// A tool call finished but the task needs another round through the flow.
pub const EXIT_INCOMPLETE: i32 = 2;
/// A tool call finished and the flow may fall through.
pub const EXIT_COMPLETE: i32 = EXIT_OK;

/// Syslog severity ladder used by log chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Emergency => "emergency",
            LogLevel::Alert => "alert",
            LogLevel::Critical => "critical",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Notice => "notice",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text {
        value: String,
        annotations: Vec<Value>,
    },
    ImageUrl {
        url: String,
    },
    AudioUrl {
        url: String,
    },
    Log {
        text: String,
        level: LogLevel,
        timestamp: DateTime<Utc>,
    },
    Progress {
        position: u64,
        total: u64,
        desc: Option<String>,
        postfix: Option<String>,
    },
    Refusal {
        text: String,
    },
    ExitCode {
        code: i32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub payload: Payload,
    cost: Option<usize>,
}

impl Chunk {
    pub fn text<S: Into<String>>(value: S) -> Self {
        Chunk {
            payload: Payload::Text {
                value: value.into(),
                annotations: Vec::new(),
            },
            cost: None,
        }
    }

    pub fn image_url<S: Into<String>>(url: S) -> Self {
        Chunk {
            payload: Payload::ImageUrl { url: url.into() },
            cost: None,
        }
    }

    pub fn audio_url<S: Into<String>>(url: S) -> Self {
        Chunk {
            payload: Payload::AudioUrl { url: url.into() },
            cost: None,
        }
    }

    pub fn log<S: Into<String>>(text: S, level: LogLevel) -> Self {
        Chunk {
            payload: Payload::Log {
                text: text.into(),
                level,
                timestamp: Utc::now(),
            },
            cost: None,
        }
    }

    pub fn progress(position: u64, total: u64) -> Self {
        Chunk {
            payload: Payload::Progress {
                position,
                total,
                desc: None,
                postfix: None,
            },
            cost: None,
        }
    }

    pub fn refusal<S: Into<String>>(text: S) -> Self {
        Chunk {
            payload: Payload::Refusal { text: text.into() },
            cost: None,
        }
    }

    pub fn exit_code(code: i32) -> Self {
        Chunk {
            payload: Payload::ExitCode { code },
            cost: None,
        }
    }

    /// Override the accounted cost of this chunk.
    pub fn with_cost(mut self, cost: usize) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Characters this chunk contributes to the usage accounting.
    pub fn cost(&self) -> usize {
        if let Some(cost) = self.cost {
            return cost;
        }
        match &self.payload {
            Payload::Text { value, .. } => value.chars().count(),
            _ => 0,
        }
    }

    /// Get the text content if this is a text chunk.
    pub fn as_text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn as_exit_code(&self) -> Option<i32> {
        match &self.payload {
            Payload::ExitCode { code } => Some(*code),
            _ => None,
        }
    }

    /// Encode the chunk into its tagged wire object.
    pub fn to_wire(&self) -> Value {
        match &self.payload {
            Payload::Text { value, annotations } => json!({
                "type": "text",
                "text": {"value": value, "annotations": annotations},
            }),
            Payload::ImageUrl { url } => json!({"type": "image_url", "image_url": url}),
            Payload::AudioUrl { url } => json!({"type": "audio_url", "audio_url": url}),
            Payload::Log {
                text,
                level,
                timestamp,
            } => json!({
                "type": "log",
                "log": {
                    "text": text,
                    "level": level.as_str(),
                    "timestamp": timestamp.to_rfc3339(),
                },
            }),
            Payload::Progress {
                position,
                total,
                desc,
                postfix,
            } => json!({
                "type": "progress",
                "progress": {
                    "position": position,
                    "total": total,
                    "desc": desc,
                    "postfix": postfix,
                },
            }),
            Payload::Refusal { text } => json!({"type": "refusal", "refusal": text}),
            Payload::ExitCode { code } => json!({"type": "exit_code", "exit_code": code}),
        }
    }

    /// Decode a tagged wire object back into a chunk. Unknown or malformed
    /// objects yield `None`; the caller decides whether that is an error.
    pub fn from_wire(value: &Value) -> Option<Chunk> {
        let kind = value.get("type")?.as_str()?;
        let chunk = match kind {
            "text" => {
                let body = value.get("text")?;
                Chunk {
                    payload: Payload::Text {
                        value: body.get("value")?.as_str()?.to_string(),
                        annotations: body
                            .get("annotations")
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default(),
                    },
                    cost: None,
                }
            }
            "image_url" => Chunk::image_url(value.get("image_url")?.as_str()?),
            "audio_url" => Chunk::audio_url(value.get("audio_url")?.as_str()?),
            "log" => {
                let body = value.get("log")?;
                let level = body
                    .get("level")
                    .and_then(|l| serde_json::from_value(l.clone()).ok())
                    .unwrap_or(LogLevel::Info);
                let timestamp = body
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now);
                Chunk {
                    payload: Payload::Log {
                        text: body.get("text")?.as_str()?.to_string(),
                        level,
                        timestamp,
                    },
                    cost: None,
                }
            }
            "progress" => {
                let body = value.get("progress")?;
                Chunk {
                    payload: Payload::Progress {
                        position: body.get("position")?.as_u64()?,
                        total: body.get("total")?.as_u64()?,
                        desc: body
                            .get("desc")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        postfix: body
                            .get("postfix")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    },
                    cost: None,
                }
            }
            "refusal" => Chunk::refusal(value.get("refusal")?.as_str()?),
            "exit_code" => Chunk::exit_code(value.get("exit_code")?.as_i64()? as i32),
            _ => return None,
        };
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_cost_defaults_to_length() {
        assert_eq!(Chunk::text("hello").cost(), 5);
        assert_eq!(Chunk::text("測試").cost(), 2);
        assert_eq!(Chunk::text("").cost(), 0);
    }

    #[test]
    fn test_non_text_cost_defaults_to_zero() {
        assert_eq!(Chunk::exit_code(EXIT_OK).cost(), 0);
        assert_eq!(Chunk::log("boom", LogLevel::Error).cost(), 0);
        assert_eq!(Chunk::progress(1, 10).cost(), 0);
    }

    #[test]
    fn test_cost_override() {
        assert_eq!(Chunk::text("hello").with_cost(42).cost(), 42);
        assert_eq!(Chunk::image_url("http://x/a.png").with_cost(7).cost(), 7);
    }

    #[test]
    fn test_text_wire_shape() {
        let wire = Chunk::text("hi").to_wire();
        assert_eq!(
            wire,
            json!({"type": "text", "text": {"value": "hi", "annotations": []}})
        );
    }

    #[test]
    fn test_exit_code_wire_shape() {
        let wire = Chunk::exit_code(EXIT_FAILURE).to_wire();
        assert_eq!(wire, json!({"type": "exit_code", "exit_code": 1}));
    }

    #[test]
    fn test_log_wire_shape() {
        let wire = Chunk::log("oops", LogLevel::Warning).to_wire();
        assert_eq!(wire["type"], "log");
        assert_eq!(wire["log"]["text"], "oops");
        assert_eq!(wire["log"]["level"], "warning");
        assert!(wire["log"]["timestamp"].is_string());
    }

    #[test]
    fn test_wire_round_trip() {
        let chunks = vec![
            Chunk::text("hello"),
            Chunk::image_url("http://x/a.png"),
            Chunk::audio_url("http://x/a.ogg"),
            Chunk::refusal("no"),
            Chunk::exit_code(EXIT_INCOMPLETE),
            Chunk::progress(3, 10),
        ];
        for chunk in chunks {
            let decoded = Chunk::from_wire(&chunk.to_wire()).unwrap();
            assert_eq!(decoded, chunk);
        }
    }

    #[test]
    fn test_from_wire_rejects_unknown_tag() {
        assert!(Chunk::from_wire(&json!({"type": "video_url", "video_url": "x"})).is_none());
        assert!(Chunk::from_wire(&json!({"no": "type"})).is_none());
    }
}
