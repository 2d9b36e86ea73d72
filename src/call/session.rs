//! # Call Session
//!
//! The per-call reducer. It classifies upstream events, routes them to the
//! codec, turn and transcript managers, and returns the resulting side
//! effects for the socket actor to execute.
//!
//! ## Inputs:
//! - Upstream text frames (`handle_text`)
//! - Decode results, in any order (`decode_finished`)
//! - Scheduler reports and device readiness
//! - Monitor commands (mute, end call) and timer expiries
//!
//! ## Outputs:
//! A `Vec<Effect>` per input. The session never performs I/O, never sleeps and
//! never spawns work itself, which keeps every path testable without a runtime.
//!
//! ## Phases:
//! `Connecting → Ringing → Active → Ended`, or `Failed` from any live phase.
//! Once terminal, every further input is ignored.

use crate::audio::chunk::{AudioChunk, Party};
use crate::audio::codec::{self, CodecError};
use crate::audio::enhance::VoiceEnhancer;
use crate::call::event::{parse_stream_event, CallStatus, ClientEvent, ParsedFrame, StreamEvent};
use crate::call::playback::{PlaybackCommand, PlaybackReport};
use crate::call::transcript::{TranscriptManager, TranscriptOutput};
use crate::call::turns::{ChunkTicket, TurnManager, TurnOutput};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallPhase {
    Connecting,
    Ringing,
    Active,
    Ended,
    Failed(String),
}

impl CallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPhase::Connecting => "connecting",
            CallPhase::Ringing => "ringing",
            CallPhase::Active => "active",
            CallPhase::Ended => "ended",
            CallPhase::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallPhase::Ended | CallPhase::Failed(_))
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode work for one audio event, run off the actor thread.
#[derive(Debug, Clone)]
pub struct DecodeJob {
    pub ticket: ChunkTicket,
    pub payload: String,
}

#[derive(Debug)]
pub struct DecodeOutcome {
    pub ticket: ChunkTicket,
    pub result: Result<AudioChunk, CodecError>,
}

impl DecodeJob {
    /// Decode the payload; caller audio also passes through the enhancement chain.
    pub fn run(self, enhancer: &VoiceEnhancer) -> DecodeOutcome {
        let result = codec::decode_for_party(self.ticket.party, &self.payload).map(|chunk| match chunk.party {
            Party::Caller => enhancer.enhance(&chunk),
            Party::Agent => chunk,
        });
        DecodeOutcome { ticket: self.ticket, result }
    }
}

/// Side effects requested by the session.
#[derive(Debug, Clone)]
pub enum Effect {
    Decode(DecodeJob),
    Playback(PlaybackCommand),
    Client(ClientEvent),
    ArmStatusWatchdog(Duration),
    DisarmStatusWatchdog,
    ScheduleTranscriptDeadline { token: u64, after: Duration },
    /// Close the upstream link and stop playback
    Teardown,
}

/// Per-call settings, snapshotted from the service config at connect time.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub caller_name: String,
    pub agent_name: String,
    pub status_timeout: Duration,
    pub pending_final_attempts: u32,
    pub pending_final_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            caller_name: "Caller".to_string(),
            agent_name: "Agent".to_string(),
            status_timeout: Duration::from_secs(60),
            pending_final_attempts: 10,
            pending_final_interval: Duration::from_millis(250),
        }
    }
}

/// Counters for one call, folded into service metrics when the call closes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub decoded_chunks: u64,
    pub dropped_chunks: u64,
    pub turns_played: u64,
    pub turns_skipped: u64,
    pub transcript_lines: u64,
    pub deferred_agent_finals: u64,
    pub ignored_events: u64,
}

pub struct CallSession {
    call_id: String,
    settings: SessionSettings,
    phase: CallPhase,
    status_seen: bool,
    turns: TurnManager,
    transcript: TranscriptManager,
    stats: SessionStats,
}

impl CallSession {
    pub fn new(call_id: impl Into<String>, settings: SessionSettings) -> Self {
        let transcript = TranscriptManager::new(
            settings.caller_name.clone(),
            settings.agent_name.clone(),
            settings.pending_final_attempts,
            settings.pending_final_interval,
        );
        Self {
            call_id: call_id.into(),
            settings,
            phase: CallPhase::Connecting,
            status_seen: false,
            turns: TurnManager::new(),
            transcript,
            stats: SessionStats::default(),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn phase(&self) -> &CallPhase {
        &self.phase
    }

    #[cfg(test)]
    pub fn turn_state(&self) -> crate::call::turns::TurnState {
        self.turns.state()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Begin the session: announce the phase and arm the status watchdog.
    pub fn start(&mut self) -> Vec<Effect> {
        info!(call_id = %self.call_id, "Call session started");
        vec![
            self.status_event(None),
            Effect::ArmStatusWatchdog(self.settings.status_timeout),
        ]
    }

    /// Handle one raw upstream text frame.
    pub fn handle_text(&mut self, raw: &str) -> Vec<Effect> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        match parse_stream_event(raw) {
            ParsedFrame::Event(event) => self.handle_event(event),
            ParsedFrame::Unknown(kind) => {
                self.stats.ignored_events += 1;
                debug!(call_id = %self.call_id, kind = %kind, "Ignoring unknown stream event");
                Vec::new()
            }
            ParsedFrame::Malformed(reason) => {
                self.stats.ignored_events += 1;
                warn!(call_id = %self.call_id, %reason, "Dropping malformed stream event");
                Vec::new()
            }
        }
    }

    pub fn handle_event(&mut self, event: StreamEvent) -> Vec<Effect> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        trace!(call_id = %self.call_id, kind = event.kind(), "Stream event");

        let mut effects = Vec::new();
        let mut turn_out = Vec::new();
        let mut text_out = Vec::new();
        let caller_open = self.turns.caller_turn_open();

        match event {
            StreamEvent::CallerAudio { audio, seq } => {
                self.dispatch_audio(Party::Caller, audio, seq, &mut turn_out, &mut effects)
            }
            StreamEvent::AgentAudio { audio, seq } => {
                self.dispatch_audio(Party::Agent, audio, seq, &mut turn_out, &mut effects)
            }
            StreamEvent::CallerTranscript { text } => self.transcript.caller_partial(&text, &mut text_out),
            StreamEvent::CallerTranscriptFinal { text } => {
                self.turns.caller_utterance_final(&mut turn_out);
                self.transcript.caller_final(&text, &mut text_out);
            }
            StreamEvent::AgentTranscript { text } => {
                self.transcript.agent_partial(&text, caller_open, &mut text_out)
            }
            StreamEvent::AgentTranscriptFinal { text } => {
                self.transcript.agent_final(&text, caller_open, &mut text_out)
            }
            StreamEvent::AgentTranscriptDone { text } => {
                self.transcript.agent_done(text.as_deref(), caller_open, &mut text_out)
            }
            StreamEvent::CallerSpeechStarted => self.turns.caller_speech_started(),
            StreamEvent::CallerSpeechStopped => self.turns.caller_speech_stopped(&mut turn_out),
            StreamEvent::AgentStreamEnded => self.turns.agent_stream_ended(&mut turn_out),
            StreamEvent::Status { status } => return self.handle_status(status),
            StreamEvent::Heartbeat => trace!(call_id = %self.call_id, "Upstream heartbeat"),
            StreamEvent::ToolResult { name, result } => {
                effects.push(Effect::Client(ClientEvent::ToolResult { name, result }))
            }
        }

        self.collect(turn_out, text_out, &mut effects);
        effects
    }

    fn dispatch_audio(
        &mut self,
        party: Party,
        payload: String,
        seq: Option<u64>,
        turn_out: &mut Vec<TurnOutput>,
        effects: &mut Vec<Effect>,
    ) {
        match self.turns.reserve_chunk(party, turn_out) {
            Some(ticket) => {
                trace!(call_id = %self.call_id, turn_id = ticket.turn_id, slot = ticket.seq, upstream_seq = ?seq, %party, "Chunk reserved");
                effects.push(Effect::Decode(DecodeJob { ticket, payload }));
            }
            None => self.stats.dropped_chunks += 1,
        }
    }

    fn handle_status(&mut self, status: CallStatus) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.status_seen {
            self.status_seen = true;
            effects.push(Effect::DisarmStatusWatchdog);
        }
        info!(call_id = %self.call_id, ?status, "Call status");

        match status {
            CallStatus::Ringing => {
                self.phase = CallPhase::Ringing;
                effects.push(self.status_event(None));
            }
            CallStatus::Answered => {
                self.phase = CallPhase::Active;
                effects.push(self.status_event(None));
            }
            CallStatus::Ended => effects.extend(self.close(CallPhase::Ended)),
            CallStatus::Failed => {
                effects.extend(self.close(CallPhase::Failed("call failed upstream".to_string())))
            }
        }
        effects
    }

    /// A decode job completed, successfully or not.
    pub fn decode_finished(&mut self, outcome: DecodeOutcome) -> Vec<Effect> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        let chunk = match outcome.result {
            Ok(chunk) => {
                self.stats.decoded_chunks += 1;
                Some(chunk)
            }
            Err(e) => {
                self.stats.dropped_chunks += 1;
                warn!(
                    call_id = %self.call_id,
                    turn_id = outcome.ticket.turn_id,
                    party = %outcome.ticket.party,
                    error = %e,
                    "Dropping undecodable chunk"
                );
                None
            }
        };

        let mut turn_out = Vec::new();
        self.turns.complete_chunk(outcome.ticket, chunk, &mut turn_out);
        let mut effects = Vec::new();
        self.collect(turn_out, Vec::new(), &mut effects);
        effects
    }

    pub fn playback_report(&mut self, report: PlaybackReport) -> Vec<Effect> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        let mut turn_out = Vec::new();
        match report {
            PlaybackReport::Finished { turn_id } => self.turns.playback_finished(turn_id, &mut turn_out),
            PlaybackReport::Deferred { turn_id } => self.turns.playback_deferred(turn_id, &mut turn_out),
        }
        let mut effects = Vec::new();
        self.collect(turn_out, Vec::new(), &mut effects);
        effects
    }

    /// The monitoring client unlocked audio output.
    pub fn device_ready(&mut self) -> Vec<Effect> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        let mut turn_out = Vec::new();
        self.turns.device_ready(&mut turn_out);
        let mut effects = Vec::new();
        self.collect(turn_out, Vec::new(), &mut effects);
        effects
    }

    pub fn set_muted(&mut self, party: Party, muted: bool) -> Vec<Effect> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        let mut turn_out = Vec::new();
        self.turns.set_muted(party, muted, &mut turn_out);
        let mut effects = Vec::new();
        self.collect(turn_out, Vec::new(), &mut effects);
        effects
    }

    pub fn transcript_deadline(&mut self, token: u64) -> Vec<Effect> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        let mut text_out = Vec::new();
        self.transcript.deadline_expired(token, &mut text_out);
        let mut effects = Vec::new();
        self.collect(Vec::new(), text_out, &mut effects);
        effects
    }

    /// The monitor asked to end the call.
    pub fn end_call(&mut self) -> Vec<Effect> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        info!(call_id = %self.call_id, "Call ended by monitor");
        self.close(CallPhase::Ended)
    }

    /// The upstream stream closed or errored.
    pub fn transport_closed(&mut self, reason: &str) -> Vec<Effect> {
        if self.phase.is_terminal() {
            return Vec::new();
        }
        warn!(call_id = %self.call_id, %reason, "Upstream transport lost");
        self.close(CallPhase::Failed(format!("transport lost: {}", reason)))
    }

    /// The status watchdog fired.
    pub fn status_timeout(&mut self) -> Vec<Effect> {
        if self.phase.is_terminal() || self.status_seen {
            return Vec::new();
        }
        warn!(
            call_id = %self.call_id,
            timeout_secs = self.settings.status_timeout.as_secs(),
            "No call status received"
        );
        self.close(CallPhase::Failed("no status update from call stream".to_string()))
    }

    fn close(&mut self, phase: CallPhase) -> Vec<Effect> {
        let mut turn_out = Vec::new();
        self.turns.teardown(&mut turn_out);
        self.transcript.reset();

        let mut effects = Vec::new();
        self.collect(turn_out, Vec::new(), &mut effects);

        let reason = match &phase {
            CallPhase::Failed(reason) => Some(reason.clone()),
            _ => None,
        };
        self.phase = phase;
        info!(call_id = %self.call_id, phase = %self.phase, "Call session closed");
        effects.push(self.status_event(reason));
        effects.push(Effect::Teardown);
        effects
    }

    fn status_event(&self, reason: Option<String>) -> Effect {
        Effect::Client(ClientEvent::CallStatus {
            call_id: self.call_id.clone(),
            status: self.phase.as_str().to_string(),
            reason,
        })
    }

    /// Translate manager outputs into effects, updating stats and turn annotations.
    fn collect(&mut self, turn_out: Vec<TurnOutput>, text_out: Vec<TranscriptOutput>, effects: &mut Vec<Effect>) {
        for output in turn_out {
            match output {
                TurnOutput::Playback(command) => effects.push(Effect::Playback(command)),
                TurnOutput::TurnStarted { turn_id, party, opened_at } => {
                    effects.push(Effect::Client(ClientEvent::TurnStarted {
                        turn_id,
                        party,
                        opened_at: opened_at.to_rfc3339(),
                    }))
                }
                TurnOutput::TurnFinished {
                    turn_id,
                    party,
                    skipped,
                    transcript,
                } => {
                    if skipped {
                        self.stats.turns_skipped += 1;
                    } else {
                        self.stats.turns_played += 1;
                    }
                    effects.push(Effect::Client(ClientEvent::TurnFinished {
                        turn_id,
                        party,
                        skipped,
                        transcript,
                    }));
                }
            }
        }

        for output in text_out {
            match output {
                TranscriptOutput::Partial { party, speaker, text } => {
                    effects.push(Effect::Client(ClientEvent::TranscriptPartial { party, speaker, text }))
                }
                TranscriptOutput::Final(line) => {
                    self.stats.transcript_lines += 1;
                    self.turns.annotate_latest(line.party, &line.text);
                    effects.push(Effect::Client(ClientEvent::TranscriptFinal {
                        party: line.party,
                        speaker: line.speaker,
                        text: line.text,
                        timestamp: line.timestamp.to_rfc3339(),
                    }));
                }
                TranscriptOutput::ArmDeadline { token, after } => {
                    self.stats.deferred_agent_finals += 1;
                    effects.push(Effect::ScheduleTranscriptDeadline { token, after });
                }
            }
        }
    }
}
