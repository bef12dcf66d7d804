//! Wire types shared between the gateway and its clients, and the
//! event-log payloads the gateway republishes downstream.

use serde::{Deserialize, Serialize};

pub const SAMPLE_RATE: u32 = 16_000;

/// First message on a newly accepted stream. All five of `uid`,
/// `platform`, `meeting_url`, `token`, `meeting_id` are mandatory; a
/// handshake missing or blanking any of them is rejected before a
/// session is created.
#[derive(Debug, Clone, Deserialize)]
pub struct Handshake {
    pub uid: Option<String>,
    pub platform: Option<String>,
    pub meeting_url: Option<String>,
    pub token: Option<String>,
    pub meeting_id: Option<String>,
    pub language: Option<String>,
    pub task: Option<Task>,
    pub model: Option<String>,
    pub initial_prompt: Option<String>,
    pub vad_parameters: Option<serde_json::Value>,
    pub use_vad: Option<bool>,
    pub max_clients: Option<usize>,
    pub max_connection_time: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Transcribe,
    Translate,
}

/// A single transcription segment as shown to the client and stored
/// in a session's transcript. `start`/`end` serialize as fixed
/// 3-decimal strings, matching the reference implementation's
/// `"{:.3f}".format(...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub completed: bool,
}

impl Segment {
    pub fn new(start: f64, end: f64, text: impl Into<String>, completed: bool) -> Self {
        Self { start, end, text: text.into(), completed }
    }
}

impl Serialize for Segment {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("Segment", 4)?;
        s.serialize_field("start", &format!("{:.3}", self.start))?;
        s.serialize_field("end", &format!("{:.3}", self.end))?;
        s.serialize_field("text", &self.text)?;
        s.serialize_field("completed", &self.completed)?;
        s.end()
    }
}

/// Messages the gateway sends back over the client stream (§6).
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Ready {
        uid: String,
        message: &'static str,
        backend: &'static str,
    },
    Language {
        uid: String,
        language: String,
        language_prob: f32,
    },
    Transcript {
        uid: String,
        segments: Vec<Segment>,
    },
    Wait {
        uid: String,
        status: &'static str,
        message: f64,
    },
    Error {
        uid: String,
        status: &'static str,
        message: String,
    },
    Disconnect {
        uid: String,
        message: &'static str,
    },
}

impl ServerMessage {
    pub fn ready(uid: impl Into<String>, backend: &'static str) -> Self {
        Self::Ready { uid: uid.into(), message: "SERVER_READY", backend }
    }

    pub fn wait(uid: impl Into<String>, wait_minutes: f64) -> Self {
        Self::Wait { uid: uid.into(), status: "WAIT", message: wait_minutes }
    }

    pub fn error(uid: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error { uid: uid.into(), status: "ERROR", message: message.into() }
    }

    pub fn disconnect(uid: impl Into<String>) -> Self {
        Self::Disconnect { uid: uid.into(), message: "DISCONNECT" }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerMessage always serializes")
    }
}

/// Event-log record payloads (§4.4 / §6). These are embedded as a
/// JSON string inside the stream entry's single `payload` field, not
/// sent directly as the entry itself.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventLogRecord {
    SessionStart {
        token: String,
        platform: String,
        meeting_id: String,
        uid: String,
        start_timestamp: String,
    },
    Transcription {
        token: String,
        platform: String,
        meeting_id: String,
        uid: String,
        segments: Vec<Segment>,
    },
}

impl EventLogRecord {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("EventLogRecord always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_serializes_fixed_three_decimals() {
        let seg = Segment::new(0.0, 1.0, "hello", false);
        let json = serde_json::to_string(&seg).unwrap();
        assert_eq!(json, r#"{"start":"0.000","end":"1.000","text":"hello","completed":false}"#);
    }

    #[test]
    fn transcript_message_shape() {
        let msg = ServerMessage::Transcript {
            uid: "u1".into(),
            segments: vec![Segment::new(0.0, 1.0, "hello", false)],
        };
        let json = msg.to_json();
        assert_eq!(
            json,
            r#"{"uid":"u1","segments":[{"start":"0.000","end":"1.000","text":"hello","completed":false}]}"#
        );
    }

    #[test]
    fn wait_message_shape() {
        let msg = ServerMessage::wait("u2", 1.5);
        assert_eq!(msg.to_json(), r#"{"uid":"u2","status":"WAIT","message":1.5}"#);
    }

    #[test]
    fn session_start_record_shape() {
        let rec = EventLogRecord::SessionStart {
            token: "tok".into(),
            platform: "zoom".into(),
            meeting_id: "m1".into(),
            uid: "u1".into(),
            start_timestamp: "2026-07-28T00:00:00Z".into(),
        };
        let json = rec.to_json();
        assert!(json.contains(r#""type":"session_start""#));
        assert!(json.contains(r#""uid":"u1""#));
    }
}
