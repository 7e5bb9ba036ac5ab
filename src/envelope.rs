//! Transcript envelopes - the unit of work flowing from recognizer to worker
//!
//! Upstream lines look like
//! `{"status": 0, "result": {"hypotheses": [{"transcript": "..."}], "final": true}}`.
//! A line with a non-zero status or without a `result` is out-of-band (usually a
//! log record relayed from somewhere else) and is passed through untouched.
//!
//! The manager forwards accepted envelopes to a worker with two extra fields:
//! `state` (the manager's mode state) and `correlation_id`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors raised while decoding or encoding an envelope
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object, got: {0}")]
    NotAnObject(String),

    #[error("recognizer result has no transcript hypothesis")]
    MissingTranscript,
}

/// Admission mode flags carried alongside every forwarded envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modes {
    pub strict: bool,
}

impl Default for Modes {
    fn default() -> Self {
        Self { strict: true }
    }
}

/// `{"modes": {...}}` as embedded in the manager -> worker message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerState {
    pub modes: Modes,
}

#[derive(Debug, Deserialize)]
struct RecognitionResult {
    #[serde(default)]
    hypotheses: Vec<Hypothesis>,
    #[serde(default, rename = "final")]
    is_final: bool,
}

#[derive(Debug, Deserialize)]
struct Hypothesis {
    transcript: String,
}

/// A decoded upstream line
#[derive(Debug, Clone)]
pub enum Incoming {
    /// A recognizer result carrying a transcript
    Transcript(Envelope),
    /// Anything else; relayed verbatim
    OutOfBand,
}

/// One recognized utterance
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub transcript: String,
    pub is_final: bool,
    pub correlation_id: Option<String>,
    pub state: Option<WorkerState>,
    raw: Map<String, Value>,
}

impl Envelope {
    /// Decode one frame.
    pub fn decode(frame: &[u8]) -> Result<Incoming, EnvelopeError> {
        let value: Value = serde_json::from_slice(frame)?;
        let raw = match value {
            Value::Object(map) => map,
            other => return Err(EnvelopeError::NotAnObject(other.to_string())),
        };

        let status = raw.get("status").and_then(Value::as_i64).unwrap_or(0);
        let result = match raw.get("result") {
            Some(result) if status == 0 => result.clone(),
            _ => return Ok(Incoming::OutOfBand),
        };

        let result: RecognitionResult = serde_json::from_value(result)?;
        let transcript = result
            .hypotheses
            .into_iter()
            .next()
            .map(|h| h.transcript)
            .ok_or(EnvelopeError::MissingTranscript)?;

        let correlation_id = raw
            .get("correlation_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let state = raw
            .get("state")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());

        Ok(Incoming::Transcript(Envelope {
            transcript,
            is_final: result.is_final,
            correlation_id,
            state,
            raw,
        }))
    }

    /// Build a recognizer-shaped envelope, as the upstream client would.
    pub fn recognized(transcript: &str, is_final: bool) -> Self {
        let value = serde_json::json!({
            "status": 0,
            "result": {"hypotheses": [{"transcript": transcript}], "final": is_final},
        });
        let raw = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            transcript: transcript.to_string(),
            is_final,
            correlation_id: None,
            state: None,
            raw,
        }
    }

    /// First whitespace-separated word of the transcript
    pub fn leading_word(&self) -> &str {
        self.transcript.split_whitespace().next().unwrap_or("")
    }

    /// Attach a fresh correlation id and the current mode state.
    pub fn tagged(mut self, modes: Modes) -> Self {
        self.correlation_id = Some(uuid::Uuid::new_v4().to_string());
        self.state = Some(WorkerState { modes });
        self
    }

    /// Encode as one newline-terminated line, original fields preserved.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut map = self.raw.clone();
        if let Some(state) = &self.state {
            map.insert("state".to_string(), serde_json::to_value(state)?);
        }
        if let Some(id) = &self.correlation_id {
            map.insert("correlation_id".to_string(), Value::String(id.clone()));
        }
        let mut line = serde_json::to_vec(&Value::Object(map))?;
        line.push(b'\n');
        Ok(line)
    }
}
