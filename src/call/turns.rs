//! # Turn Manager
//!
//! Groups decoded chunks into per-party turns, queues turns FIFO and drives
//! the playback scheduler one turn at a time.
//!
//! ## States:
//! - **Idle**: nothing playing, no caller utterance open
//! - **CallerSpeaking**: a caller turn is collecting chunks, nothing playing
//! - **CallerTurnPlaying**: the head of the queue is a caller turn being played
//! - **AgentTurnPlaying**: the head of the queue is an agent turn being played
//!
//! ## Turn lifecycle:
//! - A **caller** turn opens on the first caller chunk (or speech-start) and
//!   is held outside the queue until speech-stop/utterance-final closes it.
//!   Only then is it enqueued. An utterance-final that trails a speech-stop
//!   belongs to the turn that stop closed, not to whatever caller turn is open.
//! - An **agent** turn is enqueued as soon as it opens, so it can start playing
//!   while TTS audio is still streaming. The agent stream-ended marker closes it.
//! - The head turn is fed to the scheduler chunk by chunk as chunks become
//!   playable. Once it is closed and fully fed, `Finish` is sent and the
//!   scheduler's completion report dequeues it and starts the next one.
//!
//! ## Output:
//! Every operation appends `TurnOutput`s to a caller-provided vector. The
//! manager never talks to the scheduler directly.

use crate::audio::buffer::TurnBuffer;
use crate::audio::chunk::{AudioChunk, Party};
use crate::call::playback::PlaybackCommand;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info, warn};

pub type TurnId = u64;

/// Where a dispatched audio event will land once decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTicket {
    pub turn_id: TurnId,
    pub party: Party,
    pub seq: u64,
}

/// Playback state of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    CallerSpeaking,
    CallerTurnPlaying,
    AgentTurnPlaying,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnState::Idle => "idle",
            TurnState::CallerSpeaking => "caller_speaking",
            TurnState::CallerTurnPlaying => "caller_turn_playing",
            TurnState::AgentTurnPlaying => "agent_turn_playing",
        };
        f.write_str(name)
    }
}

/// Side effects produced by the turn manager.
#[derive(Debug, Clone)]
pub enum TurnOutput {
    Playback(PlaybackCommand),
    TurnStarted {
        turn_id: TurnId,
        party: Party,
        opened_at: DateTime<Utc>,
    },
    TurnFinished {
        turn_id: TurnId,
        party: Party,
        skipped: bool,
        transcript: Option<String>,
    },
}

/// A contiguous span of audio from one party.
#[derive(Debug)]
struct Turn {
    id: TurnId,
    party: Party,
    created_at: DateTime<Utc>,
    /// Still receiving chunks
    streaming: bool,
    transcript: Option<String>,
    buffer: TurnBuffer,
    /// Caller turn opened by an explicit speech-start marker
    opened_by_marker: bool,
}

impl Turn {
    fn new(id: TurnId, party: Party) -> Self {
        Self {
            id,
            party,
            created_at: Utc::now(),
            streaming: true,
            transcript: None,
            buffer: TurnBuffer::new(),
            opened_by_marker: false,
        }
    }
}

/// Progress of the head turn through the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadPhase {
    /// Start sent, buffers being forwarded
    Playing,
    /// Scheduler reported the output device is locked
    AwaitingDevice,
}

#[derive(Debug, Clone, Copy)]
struct Playhead {
    turn_id: TurnId,
    party: Party,
    phase: HeadPhase,
    finish_sent: bool,
}

/// Owns every turn of one call.
#[derive(Debug)]
pub struct TurnManager {
    state: TurnState,
    queue: VecDeque<Turn>,
    open_caller: Option<Turn>,
    /// Agent turn currently accepting chunks (lives in `queue`)
    open_agent: Option<TurnId>,
    /// Caller turn closed by speech-stop whose utterance-final has not arrived
    awaiting_final: Option<TurnId>,
    /// Caller turn the latest utterance-final belongs to
    finalized_caller: Option<TurnId>,
    playhead: Option<Playhead>,
    next_id: TurnId,
    caller_muted: bool,
    agent_muted: bool,
    device_ready: bool,
}

impl Default for TurnManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnManager {
    pub fn new() -> Self {
        Self {
            state: TurnState::Idle,
            queue: VecDeque::new(),
            open_caller: None,
            open_agent: None,
            awaiting_final: None,
            finalized_caller: None,
            playhead: None,
            next_id: 1,
            caller_muted: false,
            agent_muted: false,
            device_ready: false,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> TurnState {
        self.state
    }

    /// True while a caller utterance is open and has not been closed.
    pub fn caller_turn_open(&self) -> bool {
        self.open_caller.is_some()
    }

    pub fn is_muted(&self, party: Party) -> bool {
        match party {
            Party::Caller => self.caller_muted,
            Party::Agent => self.agent_muted,
        }
    }

    fn allocate_id(&mut self) -> TurnId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn open_caller_turn(&mut self, by_marker: bool) -> TurnId {
        if let Some(leaked) = self.open_caller.take() {
            warn!(
                turn_id = leaked.id,
                reserved = leaked.buffer.reserved(),
                "Discarding unfinished caller turn"
            );
        }
        let id = self.allocate_id();
        let mut turn = Turn::new(id, Party::Caller);
        turn.opened_by_marker = by_marker;
        self.open_caller = Some(turn);
        debug!(turn_id = id, "Caller turn opened");
        id
    }

    fn open_agent_turn(&mut self, out: &mut Vec<TurnOutput>) -> TurnId {
        let id = self.allocate_id();
        self.queue.push_back(Turn::new(id, Party::Agent));
        self.open_agent = Some(id);
        debug!(turn_id = id, queued = self.queue.len(), "Agent turn opened");
        self.pump(out);
        id
    }

    /// Explicit caller speech-start marker.
    pub fn caller_speech_started(&mut self) {
        match &mut self.open_caller {
            Some(turn) if !turn.opened_by_marker => {
                // Audio arrived ahead of the marker; the marker adopts that turn.
                turn.opened_by_marker = true;
            }
            _ => {
                self.open_caller_turn(true);
            }
        }
        self.refresh_state();
    }

    /// Caller speech-stop: close and enqueue the caller turn.
    pub fn caller_speech_stopped(&mut self, out: &mut Vec<TurnOutput>) {
        match self.close_caller_turn(out) {
            Some(turn_id) => self.awaiting_final = Some(turn_id),
            None => debug!("Caller stop with no open caller turn"),
        }
    }

    /// Caller utterance-final. Closes the open caller turn unless a
    /// speech-stop already closed the utterance this final belongs to.
    ///
    /// Returns the turn the utterance belongs to.
    pub fn caller_utterance_final(&mut self, out: &mut Vec<TurnOutput>) -> Option<TurnId> {
        let turn_id = match self.awaiting_final.take() {
            Some(turn_id) => {
                debug!(turn_id, "Utterance final for a caller turn already closed");
                Some(turn_id)
            }
            None => self.close_caller_turn(out),
        };
        self.finalized_caller = turn_id;
        turn_id
    }

    fn close_caller_turn(&mut self, out: &mut Vec<TurnOutput>) -> Option<TurnId> {
        let Some(mut turn) = self.open_caller.take() else {
            self.refresh_state();
            return None;
        };
        let turn_id = turn.id;

        if turn.buffer.reserved() == 0 {
            debug!(turn_id, "Dropping empty caller turn");
            self.refresh_state();
            return Some(turn_id);
        }

        turn.streaming = false;
        debug!(
            turn_id,
            chunks = turn.buffer.reserved(),
            decoding = turn.buffer.pending_count(),
            "Caller turn closed"
        );
        self.queue.push_back(turn);
        self.pump(out);
        Some(turn_id)
    }

    /// Agent completion marker: close the open agent turn.
    pub fn agent_stream_ended(&mut self, out: &mut Vec<TurnOutput>) {
        let Some(id) = self.open_agent.take() else {
            debug!("Agent stream ended with no open agent turn");
            return;
        };
        if let Some(turn) = self.queue.iter_mut().find(|t| t.id == id) {
            turn.streaming = false;
            debug!(turn_id = id, chunks = turn.buffer.reserved(), "Agent turn closed");
        }
        self.pump(out);
    }

    /// Reserve a position for an incoming audio event, opening a turn if needed.
    ///
    /// ## Returns:
    /// - **Some(ticket)** to pass back to `complete_chunk` once decoded
    /// - **None** if the chunk belongs to an agent turn that was already
    ///   skipped by mute, and must be discarded
    pub fn reserve_chunk(&mut self, party: Party, out: &mut Vec<TurnOutput>) -> Option<ChunkTicket> {
        match party {
            Party::Caller => {
                if self.open_caller.is_none() {
                    self.open_caller_turn(false);
                    self.refresh_state();
                }
                let turn = self.open_caller.as_mut()?;
                let seq = turn.buffer.reserve();
                Some(ChunkTicket { turn_id: turn.id, party, seq })
            }
            Party::Agent => {
                let id = match self.open_agent {
                    Some(id) => id,
                    None => self.open_agent_turn(out),
                };
                match self.queue.iter_mut().find(|t| t.id == id) {
                    Some(turn) => {
                        let seq = turn.buffer.reserve();
                        Some(ChunkTicket { turn_id: id, party, seq })
                    }
                    None => {
                        debug!(turn_id = id, "Agent turn already skipped, discarding chunk");
                        None
                    }
                }
            }
        }
    }

    /// Deliver a decode result to its reserved position.
    ///
    /// `None` marks the position as dropped (decode failed). Returns false when
    /// the turn no longer exists.
    pub fn complete_chunk(
        &mut self,
        ticket: ChunkTicket,
        chunk: Option<AudioChunk>,
        out: &mut Vec<TurnOutput>,
    ) -> bool {
        let turn = match self.open_caller.as_mut().filter(|t| t.id == ticket.turn_id) {
            Some(turn) => Some(turn),
            None => self.queue.iter_mut().find(|t| t.id == ticket.turn_id),
        };
        let Some(turn) = turn else {
            debug!(turn_id = ticket.turn_id, seq = ticket.seq, "Decode finished for a discarded turn");
            return false;
        };

        let resolved = match chunk {
            Some(chunk) => turn.buffer.fill(ticket.seq, chunk),
            None => turn.buffer.drop_slot(ticket.seq),
        };
        if !resolved {
            warn!(turn_id = ticket.turn_id, seq = ticket.seq, "Decode result for unknown slot");
            return false;
        }

        if self.playhead.map(|p| p.turn_id) == Some(ticket.turn_id) {
            self.pump(out);
        }
        true
    }

    /// Completion report from the scheduler.
    pub fn playback_finished(&mut self, turn_id: TurnId, out: &mut Vec<TurnOutput>) {
        match self.playhead {
            Some(head) if head.turn_id == turn_id && head.finish_sent => {
                self.finish_head(false, out);
                self.pump(out);
            }
            _ => debug!(turn_id, "Ignoring stale playback completion"),
        }
    }

    /// The scheduler could not start because output is locked.
    pub fn playback_deferred(&mut self, turn_id: TurnId, out: &mut Vec<TurnOutput>) {
        let Some(head) = self.playhead.as_mut().filter(|p| p.turn_id == turn_id) else {
            debug!(turn_id, "Ignoring stale deferral");
            return;
        };
        info!(turn_id, "Playback deferred until audio output is unlocked");
        head.phase = HeadPhase::AwaitingDevice;
        head.finish_sent = false;
        if let Some(turn) = self.queue.front_mut() {
            turn.buffer.rewind();
        }
        if self.device_ready {
            self.restart_head(out);
        }
    }

    /// The output device became ready (user gesture received).
    pub fn device_ready(&mut self, out: &mut Vec<TurnOutput>) {
        self.device_ready = true;
        if matches!(self.playhead, Some(p) if p.phase == HeadPhase::AwaitingDevice) {
            self.restart_head(out);
        }
    }

    fn restart_head(&mut self, out: &mut Vec<TurnOutput>) {
        if let Some(head) = self.playhead.as_mut() {
            debug!(turn_id = head.turn_id, "Restarting deferred playback");
            head.phase = HeadPhase::Playing;
            out.push(TurnOutput::Playback(PlaybackCommand::Start {
                turn_id: head.turn_id,
                party: head.party,
            }));
        }
        self.pump(out);
    }

    /// Mute or unmute one party's audio.
    ///
    /// Muting the party that is currently playing cancels playback at once and
    /// completes the turn without playing its remaining chunks.
    pub fn set_muted(&mut self, party: Party, muted: bool, out: &mut Vec<TurnOutput>) {
        match party {
            Party::Caller => self.caller_muted = muted,
            Party::Agent => self.agent_muted = muted,
        }
        info!(%party, muted, "Playback mute changed");

        if muted && matches!(self.playhead, Some(p) if p.party == party) {
            self.finish_head(true, out);
            self.pump(out);
        }
    }

    /// Attach committed transcript text to the party's latest utterance.
    ///
    /// Caller text goes to the turn of the latest utterance-final; agent text
    /// to the newest agent turn still held. Turns already played are skipped.
    pub fn annotate_latest(&mut self, party: Party, text: &str) {
        let target = match party {
            Party::Caller => self.finalized_caller,
            Party::Agent => self.queue.iter().rev().find(|t| t.party == Party::Agent).map(|t| t.id),
        };
        let Some(turn_id) = target else {
            return;
        };
        let turn = match self.open_caller.as_mut().filter(|t| t.id == turn_id) {
            Some(turn) => Some(turn),
            None => self.queue.iter_mut().find(|t| t.id == turn_id),
        };
        if let Some(turn) = turn {
            turn.transcript = Some(text.to_string());
        }
    }

    /// Stop playback and drop every turn. Used when the call ends or fails.
    pub fn teardown(&mut self, out: &mut Vec<TurnOutput>) {
        if self.playhead.is_some() {
            self.finish_head(true, out);
        }
        let dropped = self.queue.len() + usize::from(self.open_caller.is_some());
        self.queue.clear();
        self.open_caller = None;
        self.open_agent = None;
        self.awaiting_final = None;
        self.finalized_caller = None;
        if dropped > 0 {
            info!(dropped, "Discarded pending turns");
        }
        self.refresh_state();
    }

    /// Remove the head turn. When `cancelled`, the scheduler is told to stop.
    fn finish_head(&mut self, cancelled: bool, out: &mut Vec<TurnOutput>) {
        let Some(head) = self.playhead.take() else {
            return;
        };
        if cancelled {
            out.push(TurnOutput::Playback(PlaybackCommand::Cancel { turn_id: head.turn_id }));
        }
        let transcript = match self.queue.front() {
            Some(turn) if turn.id == head.turn_id => self.queue.pop_front().and_then(|t| t.transcript),
            _ => None,
        };
        out.push(TurnOutput::TurnFinished {
            turn_id: head.turn_id,
            party: head.party,
            skipped: cancelled,
            transcript,
        });
        debug!(turn_id = head.turn_id, party = %head.party, cancelled, "Turn finished");
    }

    /// Drive playback: start the head turn if nothing is playing and forward
    /// any newly playable chunks of the head turn.
    fn pump(&mut self, out: &mut Vec<TurnOutput>) {
        loop {
            if self.playhead.is_none() {
                let Some(head) = self.queue.front() else {
                    break;
                };
                let (turn_id, party, opened_at) = (head.id, head.party, head.created_at);

                if self.is_muted(party) {
                    // Zero-duration completion: advance without playing.
                    let transcript = self.queue.pop_front().and_then(|t| t.transcript);
                    out.push(TurnOutput::TurnStarted { turn_id, party, opened_at });
                    out.push(TurnOutput::TurnFinished {
                        turn_id,
                        party,
                        skipped: true,
                        transcript,
                    });
                    debug!(turn_id, %party, "Skipping muted turn");
                    continue;
                }

                self.playhead = Some(Playhead {
                    turn_id,
                    party,
                    phase: HeadPhase::Playing,
                    finish_sent: false,
                });
                out.push(TurnOutput::TurnStarted { turn_id, party, opened_at });
                out.push(TurnOutput::Playback(PlaybackCommand::Start { turn_id, party }));
            }

            let Some(head) = self.playhead.as_mut() else {
                break;
            };
            if head.phase != HeadPhase::Playing || head.finish_sent {
                break;
            }
            let Some(turn) = self.queue.front_mut() else {
                break;
            };
            for chunk in turn.buffer.take_ready() {
                out.push(TurnOutput::Playback(PlaybackCommand::Buffer {
                    turn_id: turn.id,
                    chunk,
                }));
            }
            if !turn.streaming && turn.buffer.is_drained() {
                head.finish_sent = true;
                out.push(TurnOutput::Playback(PlaybackCommand::Finish { turn_id: turn.id }));
            }
            break;
        }
        self.refresh_state();
    }

    fn refresh_state(&mut self) {
        let next = match self.playhead.map(|p| p.party) {
            Some(Party::Caller) => TurnState::CallerTurnPlaying,
            Some(Party::Agent) => TurnState::AgentTurnPlaying,
            None if self.open_caller.is_some() => TurnState::CallerSpeaking,
            None => TurnState::Idle,
        };
        if next != self.state {
            debug!(from = %self.state, to = %next, "Turn state changed");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(party: Party, marker: i16) -> AudioChunk {
        AudioChunk::new(party, 8000, vec![marker; 8])
    }

    /// Reserve and immediately fill one chunk.
    fn push(tm: &mut TurnManager, party: Party, marker: i16, out: &mut Vec<TurnOutput>) -> ChunkTicket {
        let ticket = tm.reserve_chunk(party, out).expect("ticket");
        tm.complete_chunk(ticket, Some(chunk(party, marker)), out);
        ticket
    }

    fn commands(out: &[TurnOutput]) -> Vec<String> {
        out.iter()
            .filter_map(|o| match o {
                TurnOutput::Playback(PlaybackCommand::Start { turn_id, .. }) => Some(format!("start:{}", turn_id)),
                TurnOutput::Playback(PlaybackCommand::Buffer { turn_id, chunk }) => {
                    Some(format!("buf:{}:{}", turn_id, chunk.samples()[0]))
                }
                TurnOutput::Playback(PlaybackCommand::Finish { turn_id }) => Some(format!("finish:{}", turn_id)),
                TurnOutput::Playback(PlaybackCommand::Cancel { turn_id }) => Some(format!("cancel:{}", turn_id)),
                TurnOutput::Playback(PlaybackCommand::Shutdown) => None,
                TurnOutput::TurnStarted { turn_id, .. } => Some(format!("started:{}", turn_id)),
                TurnOutput::TurnFinished { turn_id, skipped, .. } => {
                    Some(format!("finished:{}:{}", turn_id, if *skipped { "skip" } else { "ok" }))
                }
            })
            .collect()
    }

    #[test]
    fn test_caller_then_agent_scenario() {
        let mut tm = TurnManager::new();
        let mut out = Vec::new();

        push(&mut tm, Party::Caller, 1, &mut out);
        push(&mut tm, Party::Caller, 2, &mut out);
        assert_eq!(tm.state(), TurnState::CallerSpeaking);
        assert!(out.is_empty());

        tm.caller_speech_stopped(&mut out);
        assert_eq!(tm.state(), TurnState::CallerTurnPlaying);
        assert_eq!(commands(&out), vec!["started:1", "start:1", "buf:1:1", "buf:1:2", "finish:1"]);
        out.clear();

        push(&mut tm, Party::Agent, 10, &mut out);
        tm.agent_stream_ended(&mut out);
        // Agent turn waits behind the playing caller turn.
        assert!(out.is_empty());
        assert_eq!(tm.queue.len(), 2);

        tm.playback_finished(1, &mut out);
        assert_eq!(tm.state(), TurnState::AgentTurnPlaying);
        assert_eq!(
            commands(&out),
            vec!["finished:1:ok", "started:2", "start:2", "buf:2:10", "finish:2"]
        );
        out.clear();

        tm.playback_finished(2, &mut out);
        assert_eq!(commands(&out), vec!["finished:2:ok"]);
        assert_eq!(tm.state(), TurnState::Idle);
        assert_eq!(tm.queue.len(), 0);
    }

    #[test]
    fn test_out_of_order_decode_keeps_chunk_order() {
        let mut tm = TurnManager::new();
        let mut out = Vec::new();
        let t1 = tm.reserve_chunk(Party::Caller, &mut out).unwrap();
        let t2 = tm.reserve_chunk(Party::Caller, &mut out).unwrap();
        let t3 = tm.reserve_chunk(Party::Caller, &mut out).unwrap();
        tm.caller_speech_stopped(&mut out);
        assert_eq!(commands(&out), vec!["started:1", "start:1"]);
        out.clear();

        tm.complete_chunk(t3, Some(chunk(Party::Caller, 3)), &mut out);
        tm.complete_chunk(t2, Some(chunk(Party::Caller, 2)), &mut out);
        assert!(out.is_empty());
        tm.complete_chunk(t1, Some(chunk(Party::Caller, 1)), &mut out);
        assert_eq!(commands(&out), vec!["buf:1:1", "buf:1:2", "buf:1:3", "finish:1"]);
    }

    #[test]
    fn test_failed_decode_does_not_stall_turn() {
        let mut tm = TurnManager::new();
        let mut out = Vec::new();
        let t1 = tm.reserve_chunk(Party::Agent, &mut out).unwrap();
        let t2 = tm.reserve_chunk(Party::Agent, &mut out).unwrap();
        tm.agent_stream_ended(&mut out);
        out.clear();

        tm.complete_chunk(t2, Some(chunk(Party::Agent, 5)), &mut out);
        tm.complete_chunk(t1, None, &mut out);
        assert_eq!(commands(&out), vec!["buf:1:5", "finish:1"]);
    }

    #[test]
    fn test_agent_plays_while_streaming() {
        let mut tm = TurnManager::new();
        let mut out = Vec::new();
        push(&mut tm, Party::Agent, 1, &mut out);
        assert_eq!(tm.state(), TurnState::AgentTurnPlaying);
        assert_eq!(commands(&out), vec!["started:1", "start:1", "buf:1:1"]);
        out.clear();

        push(&mut tm, Party::Agent, 2, &mut out);
        assert_eq!(commands(&out), vec!["buf:1:2"]);
        out.clear();

        // Completion marker closes the playing turn; no new turn appears.
        tm.agent_stream_ended(&mut out);
        assert_eq!(commands(&out), vec!["finish:1"]);
        assert_eq!(tm.queue.len(), 1);
    }

    #[test]
    fn test_turns_group_contiguous_party_spans() {
        let mut tm = TurnManager::new();
        let mut out = Vec::new();
        // Agent greeting streams first and starts playing.
        push(&mut tm, Party::Agent, 1, &mut out);
        push(&mut tm, Party::Agent, 2, &mut out);
        tm.agent_stream_ended(&mut out);
        // Caller answers while the greeting is still playing.
        push(&mut tm, Party::Caller, 3, &mut out);
        push(&mut tm, Party::Caller, 4, &mut out);
        tm.caller_speech_stopped(&mut out);
        push(&mut tm, Party::Agent, 5, &mut out);

        let parties: Vec<Party> = tm.queue.iter().map(|t| t.party).collect();
        assert_eq!(parties, vec![Party::Agent, Party::Caller, Party::Agent]);
        assert_eq!(tm.queue[0].buffer.reserved(), 2);
        assert_eq!(tm.queue[1].buffer.reserved(), 2);
        assert!(tm.queue[2].streaming);
    }

    #[test]
    fn test_mute_agent_mid_playback_advances_queue() {
        let mut tm = TurnManager::new();
        let mut out = Vec::new();
        push(&mut tm, Party::Agent, 1, &mut out);
        push(&mut tm, Party::Caller, 7, &mut out);
        tm.caller_speech_stopped(&mut out);
        out.clear();

        tm.set_muted(Party::Agent, true, &mut out);
        assert_eq!(
            commands(&out),
            vec!["cancel:1", "finished:1:skip", "started:2", "start:2", "buf:2:7", "finish:2"]
        );
        assert_eq!(tm.state(), TurnState::CallerTurnPlaying);
        out.clear();

        // Late agent chunks for the skipped turn are discarded.
        assert!(tm.reserve_chunk(Party::Agent, &mut out).is_none());
        // Once the stream ends, new agent audio opens a fresh (muted) turn.
        tm.agent_stream_ended(&mut out);
        assert!(tm.reserve_chunk(Party::Agent, &mut out).is_some());
    }

    #[test]
    fn test_muted_turn_completes_with_zero_duration() {
        let mut tm = TurnManager::new();
        let mut out = Vec::new();
        tm.set_muted(Party::Caller, true, &mut out);
        push(&mut tm, Party::Caller, 1, &mut out);
        tm.caller_speech_stopped(&mut out);
        assert_eq!(commands(&out), vec!["started:1", "finished:1:skip"]);
        assert_eq!(tm.state(), TurnState::Idle);
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let mut tm = TurnManager::new();
        let mut out = Vec::new();
        push(&mut tm, Party::Agent, 1, &mut out);
        out.clear();
        // Finish not sent yet: a completion now must not dequeue the turn.
        tm.playback_finished(1, &mut out);
        tm.playback_finished(99, &mut out);
        assert!(out.is_empty());
        assert_eq!(tm.queue.len(), 1);
    }

    #[test]
    fn test_deferred_start_retries_when_device_ready() {
        let mut tm = TurnManager::new();
        let mut out = Vec::new();
        push(&mut tm, Party::Caller, 1, &mut out);
        push(&mut tm, Party::Caller, 2, &mut out);
        tm.caller_speech_stopped(&mut out);
        out.clear();

        tm.playback_deferred(1, &mut out);
        assert!(out.is_empty());
        assert_eq!(tm.queue.len(), 1);

        tm.device_ready(&mut out);
        assert_eq!(commands(&out), vec!["start:1", "buf:1:1", "buf:1:2", "finish:1"]);
    }

    #[test]
    fn test_speech_start_marker_discards_leaked_turn() {
        let mut tm = TurnManager::new();
        let mut out = Vec::new();
        tm.caller_speech_started();
        push(&mut tm, Party::Caller, 1, &mut out);
        // Stop never arrived; a new start discards the leaked chunks.
        tm.caller_speech_started();
        push(&mut tm, Party::Caller, 2, &mut out);
        tm.caller_speech_stopped(&mut out);
        assert_eq!(commands(&out), vec!["started:2", "start:2", "buf:2:2", "finish:2"]);
    }

    #[test]
    fn test_speech_start_adopts_turn_opened_by_audio() {
        let mut tm = TurnManager::new();
        let mut out = Vec::new();
        push(&mut tm, Party::Caller, 1, &mut out);
        tm.caller_speech_started();
        push(&mut tm, Party::Caller, 2, &mut out);
        tm.caller_speech_stopped(&mut out);
        assert_eq!(commands(&out), vec!["started:1", "start:1", "buf:1:1", "buf:1:2", "finish:1"]);
    }

    #[test]
    fn test_teardown_cancels_and_clears() {
        let mut tm = TurnManager::new();
        let mut out = Vec::new();
        push(&mut tm, Party::Agent, 1, &mut out);
        push(&mut tm, Party::Caller, 2, &mut out);
        out.clear();

        tm.teardown(&mut out);
        assert_eq!(commands(&out), vec!["cancel:1", "finished:1:skip"]);
        assert_eq!(tm.queue.len(), 0);
        assert!(!tm.caller_turn_open());
        assert_eq!(tm.state(), TurnState::Idle);
    }

    #[test]
    fn test_annotate_latest() {
        let mut tm = TurnManager::new();
        let mut out = Vec::new();
        push(&mut tm, Party::Agent, 1, &mut out);
        tm.annotate_latest(Party::Agent, "hello there");
        assert_eq!(tm.queue.front().unwrap().transcript.as_deref(), Some("hello there"));
    }

    #[test]
    fn test_late_utterance_final_does_not_close_next_turn() {
        let mut tm = TurnManager::new();
        let mut out = Vec::new();
        push(&mut tm, Party::Agent, 9, &mut out);
        push(&mut tm, Party::Caller, 1, &mut out);
        tm.caller_speech_stopped(&mut out);
        // Next utterance starts before the first one's transcript final lands.
        push(&mut tm, Party::Caller, 2, &mut out);

        assert_eq!(tm.caller_utterance_final(&mut out), Some(2));
        assert!(tm.caller_turn_open());
        tm.annotate_latest(Party::Caller, "first words");
        assert_eq!(tm.queue[1].id, 2);
        assert_eq!(tm.queue[1].transcript.as_deref(), Some("first words"));
        assert!(tm.open_caller.as_ref().unwrap().transcript.is_none());

        push(&mut tm, Party::Caller, 3, &mut out);
        tm.caller_speech_stopped(&mut out);
        assert_eq!(tm.queue[2].buffer.reserved(), 2);
    }

    #[test]
    fn test_utterance_final_without_stop_closes_turn() {
        let mut tm = TurnManager::new();
        let mut out = Vec::new();
        push(&mut tm, Party::Caller, 1, &mut out);
        assert_eq!(tm.caller_utterance_final(&mut out), Some(1));
        assert!(!tm.caller_turn_open());
        assert_eq!(commands(&out), vec!["started:1", "start:1", "buf:1:1", "finish:1"]);
    }

    #[test]
    fn test_finished_turn_carries_transcript() {
        let mut tm = TurnManager::new();
        let mut out = Vec::new();
        push(&mut tm, Party::Agent, 1, &mut out);
        tm.agent_stream_ended(&mut out);
        tm.annotate_latest(Party::Agent, "How can I help?");
        out.clear();
        tm.playback_finished(1, &mut out);
        assert!(matches!(
            out.as_slice(),
            [TurnOutput::TurnFinished { turn_id: 1, transcript: Some(text), .. }] if text == "How can I help?"
        ));
    }
}
