//! # Playback Scheduler
//!
//! Renders the buffers of one turn back-to-back in real time and reports when
//! the turn has finished.
//!
//! ## Protocol:
//! 1. `Start` opens a turn. If the output device is not ready yet the
//!    scheduler answers with `Deferred` and ignores that turn's buffers.
//! 2. `Buffer` commands queue decoded chunks. Each chunk is emitted as a
//!    `RenderedFrame` and then held for its playback duration.
//! 3. `Finish` marks the turn complete; once the last buffer has elapsed the
//!    scheduler reports `Finished`.
//! 4. `Cancel` stops the turn at once. Queued buffers are discarded and an
//!    in-flight duration wait is abandoned. No report is sent.
//!
//! Device readiness is read from a `watch` channel owned by the socket actor.

use crate::audio::chunk::{AudioChunk, Party};
use crate::call::turns::TurnId;
use std::collections::VecDeque;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Instructions from the turn manager.
#[derive(Debug, Clone)]
pub enum PlaybackCommand {
    Start { turn_id: TurnId, party: Party },
    Buffer { turn_id: TurnId, chunk: AudioChunk },
    Finish { turn_id: TurnId },
    Cancel { turn_id: TurnId },
    /// Stop the scheduler task
    Shutdown,
}

/// Completion signals back to the turn manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackReport {
    Finished { turn_id: TurnId },
    Deferred { turn_id: TurnId },
}

/// A chunk handed to the output at the moment it starts playing.
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub turn_id: TurnId,
    pub chunk: AudioChunk,
}

/// Sending side of the scheduler's command channel.
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    commands: mpsc::UnboundedSender<PlaybackCommand>,
}

impl PlaybackHandle {
    /// Queue a command. Returns false once the scheduler task has stopped.
    pub fn send(&self, command: PlaybackCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(PlaybackCommand::Shutdown);
    }
}

#[derive(Debug)]
struct ActiveTurn {
    turn_id: TurnId,
    queued: VecDeque<AudioChunk>,
    finishing: bool,
}

/// Outcome of applying one command.
enum Flow {
    Continue,
    Stop,
}

pub struct PlaybackScheduler {
    commands: mpsc::UnboundedReceiver<PlaybackCommand>,
    device_ready: watch::Receiver<bool>,
    frames: mpsc::UnboundedSender<RenderedFrame>,
    reports: mpsc::UnboundedSender<PlaybackReport>,
    active: Option<ActiveTurn>,
}

impl PlaybackScheduler {
    /// Spawn the scheduler on the current tokio runtime.
    pub fn spawn(
        device_ready: watch::Receiver<bool>,
        frames: mpsc::UnboundedSender<RenderedFrame>,
        reports: mpsc::UnboundedSender<PlaybackReport>,
    ) -> (PlaybackHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = PlaybackScheduler {
            commands: rx,
            device_ready,
            frames,
            reports,
            active: None,
        };
        let task = tokio::spawn(scheduler.run());
        (PlaybackHandle { commands: tx }, task)
    }

    async fn run(mut self) {
        loop {
            let next = self.active.as_mut().and_then(|turn| {
                turn.queued.pop_front().map(|chunk| (turn.turn_id, chunk))
            });

            match next {
                Some((turn_id, chunk)) => {
                    if let Flow::Stop = self.render(turn_id, chunk).await {
                        break;
                    }
                }
                None => {
                    if let Some(turn) = self.active.as_ref().filter(|t| t.finishing) {
                        let turn_id = turn.turn_id;
                        self.active = None;
                        trace!(turn_id, "Turn playback finished");
                        let _ = self.reports.send(PlaybackReport::Finished { turn_id });
                        continue;
                    }
                    match self.commands.recv().await {
                        Some(command) => {
                            if let Flow::Stop = self.apply(command) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        debug!("Playback scheduler stopped");
    }

    /// Emit one chunk and hold for its duration while still taking commands.
    async fn render(&mut self, turn_id: TurnId, chunk: AudioChunk) -> Flow {
        let duration = chunk.duration();
        if self.frames.send(RenderedFrame { turn_id, chunk }).is_err() {
            return Flow::Stop;
        }

        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Flow::Continue,
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Flow::Stop;
                    };
                    if let Flow::Stop = self.apply(command) {
                        return Flow::Stop;
                    }
                    if self.active.as_ref().map(|t| t.turn_id) != Some(turn_id) {
                        // Cancelled mid-buffer
                        return Flow::Continue;
                    }
                }
            }
        }
    }

    fn apply(&mut self, command: PlaybackCommand) -> Flow {
        match command {
            PlaybackCommand::Start { turn_id, party } => {
                if let Some(previous) = self.active.take() {
                    warn!(previous = previous.turn_id, turn_id, "Start while another turn is active");
                }
                if !*self.device_ready.borrow() {
                    debug!(turn_id, %party, "Output device not ready, deferring");
                    let _ = self.reports.send(PlaybackReport::Deferred { turn_id });
                    return Flow::Continue;
                }
                trace!(turn_id, %party, "Turn playback started");
                self.active = Some(ActiveTurn {
                    turn_id,
                    queued: VecDeque::new(),
                    finishing: false,
                });
            }
            PlaybackCommand::Buffer { turn_id, chunk } => match self.active.as_mut() {
                Some(turn) if turn.turn_id == turn_id => turn.queued.push_back(chunk),
                _ => trace!(turn_id, "Dropping buffer for inactive turn"),
            },
            PlaybackCommand::Finish { turn_id } => match self.active.as_mut() {
                Some(turn) if turn.turn_id == turn_id => turn.finishing = true,
                _ => trace!(turn_id, "Finish for inactive turn"),
            },
            PlaybackCommand::Cancel { turn_id } => {
                if self.active.as_ref().map(|t| t.turn_id) == Some(turn_id) {
                    debug!(turn_id, "Turn playback cancelled");
                    self.active = None;
                }
            }
            PlaybackCommand::Shutdown => return Flow::Stop,
        }
        Flow::Continue
    }
}
