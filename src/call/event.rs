//! # Call Stream Events
//!
//! Wire types for the upstream call stream and for the monitoring client.
//!
//! ## Upstream (call stream → engine):
//! JSON text frames tagged by `type`. Audio payloads are base64 strings.
//! Unknown types are not an error: `parse_stream_event` reports them so the
//! dispatcher can log and drop them.
//!
//! ## Downstream (engine → monitoring client):
//! `ClientEvent` JSON frames plus binary audio frames built by `encode_audio_frame`.

use crate::audio::chunk::{AudioChunk, Party};
use byteorder::{LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

/// Call progress reported by the telephony side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Answered,
    Ended,
    Failed,
}

/// One event from the upstream call stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// μ-law audio from the phone line
    CallerAudio {
        audio: String,
        #[serde(default)]
        seq: Option<u64>,
    },
    /// TTS audio from the agent
    AgentAudio {
        audio: String,
        #[serde(default)]
        seq: Option<u64>,
    },
    CallerTranscript { text: String },
    CallerTranscriptFinal { text: String },
    AgentTranscript { text: String },
    AgentTranscriptFinal { text: String },
    AgentTranscriptDone {
        #[serde(default)]
        text: Option<String>,
    },
    CallerSpeechStarted,
    CallerSpeechStopped,
    AgentStreamEnded,
    Status { status: CallStatus },
    Heartbeat,
    ToolResult {
        name: String,
        #[serde(default)]
        result: serde_json::Value,
    },
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::CallerAudio { .. } => "caller_audio",
            StreamEvent::AgentAudio { .. } => "agent_audio",
            StreamEvent::CallerTranscript { .. } => "caller_transcript",
            StreamEvent::CallerTranscriptFinal { .. } => "caller_transcript_final",
            StreamEvent::AgentTranscript { .. } => "agent_transcript",
            StreamEvent::AgentTranscriptFinal { .. } => "agent_transcript_final",
            StreamEvent::AgentTranscriptDone { .. } => "agent_transcript_done",
            StreamEvent::CallerSpeechStarted => "caller_speech_started",
            StreamEvent::CallerSpeechStopped => "caller_speech_stopped",
            StreamEvent::AgentStreamEnded => "agent_stream_ended",
            StreamEvent::Status { .. } => "status",
            StreamEvent::Heartbeat => "heartbeat",
            StreamEvent::ToolResult { .. } => "tool_result",
        }
    }
}

/// Result of parsing one upstream text frame.
#[derive(Debug, PartialEq)]
pub enum ParsedFrame {
    Event(StreamEvent),
    /// Well-formed JSON with a `type` we do not handle
    Unknown(String),
    /// Not JSON, no `type`, or a known type with bad fields
    Malformed(String),
}

const KNOWN_TYPES: &[&str] = &[
    "caller_audio",
    "agent_audio",
    "caller_transcript",
    "caller_transcript_final",
    "agent_transcript",
    "agent_transcript_final",
    "agent_transcript_done",
    "caller_speech_started",
    "caller_speech_stopped",
    "agent_stream_ended",
    "status",
    "heartbeat",
    "tool_result",
];

/// Classify an upstream text frame.
pub fn parse_stream_event(text: &str) -> ParsedFrame {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return ParsedFrame::Malformed(format!("invalid JSON: {}", e)),
    };

    let kind = match value.get("type").and_then(|t| t.as_str()) {
        Some(kind) => kind.to_string(),
        None => return ParsedFrame::Malformed("missing \"type\" field".to_string()),
    };

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return ParsedFrame::Unknown(kind);
    }

    match serde_json::from_value::<StreamEvent>(value) {
        Ok(event) => ParsedFrame::Event(event),
        Err(e) => ParsedFrame::Malformed(format!("bad {} event: {}", kind, e)),
    }
}

/// Messages the monitoring client sends to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// The user interacted with the page and audio output may start
    AudioUnlocked,
    Mute { party: Party, muted: bool },
    EndCall,
    Pong { timestamp: u64 },
}

/// JSON messages the engine sends to the monitoring client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    CallStatus {
        call_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    TurnStarted {
        turn_id: u64,
        party: Party,
        /// When the turn's first audio (or speech-start) arrived, RFC 3339
        opened_at: String,
    },
    TurnFinished {
        turn_id: u64,
        party: Party,
        skipped: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        transcript: Option<String>,
    },
    TranscriptPartial { party: Party, speaker: String, text: String },
    TranscriptFinal {
        party: Party,
        speaker: String,
        text: String,
        timestamp: String,
    },
    ToolResult { name: String, result: serde_json::Value },
    Error { code: String, message: String },
    Ping { timestamp: u64 },
}

/// Binary audio frame for the monitoring client.
///
/// ## Layout (little-endian):
/// `[party: u8][turn_id: u64][sample_rate: u32][samples: i16...]`
pub fn encode_audio_frame(turn_id: u64, chunk: &AudioChunk) -> Vec<u8> {
    let mut frame = Vec::with_capacity(13 + chunk.len() * 2);
    frame.push(chunk.party.wire_tag());
    // Writes into a Vec cannot fail.
    let _ = frame.write_u64::<LittleEndian>(turn_id);
    let _ = frame.write_u32::<LittleEndian>(chunk.sample_rate);
    for &sample in chunk.samples() {
        let _ = frame.write_i16::<LittleEndian>(sample);
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_audio_event() {
        let frame = parse_stream_event(r#"{"type":"caller_audio","audio":"/w==","seq":4}"#);
        assert_eq!(
            frame,
            ParsedFrame::Event(StreamEvent::CallerAudio {
                audio: "/w==".to_string(),
                seq: Some(4)
            })
        );
    }

    #[test]
    fn test_parse_marker_events() {
        assert_eq!(
            parse_stream_event(r#"{"type":"caller_speech_stopped"}"#),
            ParsedFrame::Event(StreamEvent::CallerSpeechStopped)
        );
        assert_eq!(
            parse_stream_event(r#"{"type":"status","status":"answered"}"#),
            ParsedFrame::Event(StreamEvent::Status { status: CallStatus::Answered })
        );
        assert_eq!(
            parse_stream_event(r#"{"type":"agent_transcript_done"}"#),
            ParsedFrame::Event(StreamEvent::AgentTranscriptDone { text: None })
        );
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert_eq!(
            parse_stream_event(r#"{"type":"sentiment","score":0.4}"#),
            ParsedFrame::Unknown("sentiment".to_string())
        );
        assert!(matches!(parse_stream_event("{nope"), ParsedFrame::Malformed(_)));
        assert!(matches!(parse_stream_event(r#"{"audio":"AA=="}"#), ParsedFrame::Malformed(_)));
        assert!(matches!(
            parse_stream_event(r#"{"type":"status","status":"exploded"}"#),
            ParsedFrame::Malformed(_)
        ));
    }

    #[test]
    fn test_kind_matches_wire_tag() {
        let event = StreamEvent::ToolResult { name: "lookup".to_string(), result: serde_json::json!({"ok": true}) };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.kind());
    }

    #[test]
    fn test_client_command_parsing() {
        let cmd: ClientCommand = serde_json::from_str(r#"{"type":"mute","party":"agent","muted":true}"#).unwrap();
        assert_eq!(cmd, ClientCommand::Mute { party: Party::Agent, muted: true });
        let cmd: ClientCommand = serde_json::from_str(r#"{"type":"audio_unlocked"}"#).unwrap();
        assert_eq!(cmd, ClientCommand::AudioUnlocked);
    }

    #[test]
    fn test_audio_frame_layout() {
        let chunk = AudioChunk::new(Party::Agent, 8000, vec![1, -1]);
        let frame = encode_audio_frame(7, &chunk);
        assert_eq!(frame.len(), 13 + 4);
        assert_eq!(frame[0], 1);
        assert_eq!(&frame[1..9], &7u64.to_le_bytes());
        assert_eq!(&frame[9..13], &8000u32.to_le_bytes());
        assert_eq!(&frame[13..15], &1i16.to_le_bytes());
        assert_eq!(&frame[15..17], &(-1i16).to_le_bytes());
    }
}
