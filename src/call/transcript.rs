//! # Transcript Manager
//!
//! Buffers partial text per party and decides when committed lines may be
//! shown, so the agent's reply never appears before the caller's own words.
//!
//! ## Ordering rule:
//! An agent final is held only while a caller utterance is still open: caller
//! partial text is buffered, or the turn manager reports an open caller turn
//! (passed in as `caller_open`). Otherwise it renders at once. A held final is
//! released by whichever comes first:
//! - the next caller final (event-driven release)
//! - the hold deadline (`attempts × interval`), rendered with a warning

use crate::audio::chunk::Party;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};

/// A committed transcript line.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptLine {
    pub party: Party,
    pub speaker: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Side effects produced by the transcript manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptOutput {
    /// Updated in-progress text for one party
    Partial { party: Party, speaker: String, text: String },
    Final(TranscriptLine),
    /// Call `deadline_expired(token)` after `after` has elapsed
    ArmDeadline { token: u64, after: Duration },
}

#[derive(Debug)]
struct PendingFinal {
    text: String,
    token: u64,
}

#[derive(Debug)]
pub struct TranscriptManager {
    caller_name: String,
    agent_name: String,
    caller_buffer: String,
    agent_buffer: String,
    pending: Option<PendingFinal>,
    next_token: u64,
    hold_for: Duration,
}

fn append_partial(buffer: &mut String, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(text);
}

impl TranscriptManager {
    pub fn new(caller_name: impl Into<String>, agent_name: impl Into<String>, attempts: u32, interval: Duration) -> Self {
        Self {
            caller_name: caller_name.into(),
            agent_name: agent_name.into(),
            caller_buffer: String::new(),
            agent_buffer: String::new(),
            pending: None,
            next_token: 1,
            hold_for: interval * attempts,
        }
    }

    pub fn speaker(&self, party: Party) -> &str {
        match party {
            Party::Caller => &self.caller_name,
            Party::Agent => &self.agent_name,
        }
    }

    #[cfg(test)]
    fn has_pending_final(&self) -> bool {
        self.pending.is_some()
    }

    fn caller_utterance_open(&self, caller_open: bool) -> bool {
        caller_open || !self.caller_buffer.is_empty()
    }

    fn line(&self, party: Party, text: String) -> TranscriptLine {
        TranscriptLine {
            party,
            speaker: self.speaker(party).to_string(),
            text,
            timestamp: Utc::now(),
        }
    }

    fn render_agent(&mut self, text: String, out: &mut Vec<TranscriptOutput>) {
        out.push(TranscriptOutput::Final(self.line(Party::Agent, text)));
    }

    pub fn caller_partial(&mut self, text: &str, out: &mut Vec<TranscriptOutput>) {
        append_partial(&mut self.caller_buffer, text);
        out.push(TranscriptOutput::Partial {
            party: Party::Caller,
            speaker: self.caller_name.clone(),
            text: self.caller_buffer.clone(),
        });
    }

    pub fn agent_partial(&mut self, text: &str, caller_open: bool, out: &mut Vec<TranscriptOutput>) {
        append_partial(&mut self.agent_buffer, text);
        if self.pending.is_none() && !self.caller_utterance_open(caller_open) {
            out.push(TranscriptOutput::Partial {
                party: Party::Agent,
                speaker: self.agent_name.clone(),
                text: self.agent_buffer.clone(),
            });
        }
    }

    /// Commit the caller's utterance and release any held agent final.
    pub fn caller_final(&mut self, text: &str, out: &mut Vec<TranscriptOutput>) {
        let text = match text.trim() {
            "" => std::mem::take(&mut self.caller_buffer),
            t => t.to_string(),
        };
        self.caller_buffer.clear();
        if !text.is_empty() {
            out.push(TranscriptOutput::Final(self.line(Party::Caller, text)));
        }

        if let Some(pending) = self.pending.take() {
            debug!(token = pending.token, "Releasing held agent final after caller commit");
            self.render_agent(pending.text, out);
        }
    }

    /// Commit an agent utterance, holding it while a caller utterance is open.
    pub fn agent_final(&mut self, text: &str, caller_open: bool, out: &mut Vec<TranscriptOutput>) {
        let text = match text.trim() {
            "" => std::mem::take(&mut self.agent_buffer),
            t => t.to_string(),
        };
        self.agent_buffer.clear();
        if text.is_empty() {
            return;
        }

        if let Some(pending) = self.pending.as_mut() {
            // Keep the existing deadline; a second reply joins the held one.
            append_partial(&mut pending.text, &text);
            return;
        }

        if !self.caller_utterance_open(caller_open) {
            self.render_agent(text, out);
            return;
        }

        let token = self.next_token;
        self.next_token += 1;
        debug!(token, hold_ms = self.hold_for.as_millis() as u64, "Holding agent final until caller commits");
        self.pending = Some(PendingFinal { text, token });
        out.push(TranscriptOutput::ArmDeadline { token, after: self.hold_for });
    }

    /// Agent utterance done without a final: finalize whatever was buffered.
    pub fn agent_done(&mut self, text: Option<&str>, caller_open: bool, out: &mut Vec<TranscriptOutput>) {
        match text.map(str::trim).filter(|t| !t.is_empty()) {
            Some(text) => self.agent_final(text, caller_open, out),
            None if !self.agent_buffer.is_empty() => self.agent_final("", caller_open, out),
            None => {}
        }
    }

    /// The hold deadline for `token` elapsed.
    pub fn deadline_expired(&mut self, token: u64, out: &mut Vec<TranscriptOutput>) {
        match self.pending.take() {
            Some(pending) if pending.token == token => {
                warn!(token, "Caller never committed, rendering held agent final");
                self.render_agent(pending.text, out);
            }
            other => {
                self.pending = other;
                debug!(token, "Ignoring stale transcript deadline");
            }
        }
    }

    /// Drop all buffered and held text.
    pub fn reset(&mut self) {
        self.caller_buffer.clear();
        self.agent_buffer.clear();
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TranscriptManager {
        TranscriptManager::new("Dana", "Agent", 10, Duration::from_millis(250))
    }

    fn finals(out: &[TranscriptOutput]) -> Vec<(Party, String)> {
        out.iter()
            .filter_map(|o| match o {
                TranscriptOutput::Final(line) => Some((line.party, line.text.clone())),
                _ => None,
            })
            .collect()
    }

    fn deadline_token(out: &[TranscriptOutput]) -> Option<u64> {
        out.iter().find_map(|o| match o {
            TranscriptOutput::ArmDeadline { token, .. } => Some(*token),
            _ => None,
        })
    }

    #[test]
    fn test_partials_concatenate_with_space() {
        let mut tm = manager();
        let mut out = Vec::new();
        tm.caller_partial("I need", &mut out);
        tm.caller_partial("a refund", &mut out);
        assert_eq!(
            out.last(),
            Some(&TranscriptOutput::Partial {
                party: Party::Caller,
                speaker: "Dana".to_string(),
                text: "I need a refund".to_string()
            })
        );
    }

    #[test]
    fn test_caller_final_after_agent_final_renders_caller_first() {
        let mut tm = manager();
        let mut out = Vec::new();
        tm.caller_partial("hello", &mut out);
        tm.agent_final("How can I help?", false, &mut out);
        assert!(finals(&out).is_empty());
        assert!(tm.has_pending_final());

        tm.caller_final("hello there", &mut out);
        assert_eq!(
            finals(&out),
            vec![
                (Party::Caller, "hello there".to_string()),
                (Party::Agent, "How can I help?".to_string())
            ]
        );
        assert!(!tm.has_pending_final());
    }

    #[test]
    fn test_agent_final_held_while_caller_turn_open() {
        let mut tm = manager();
        let mut out = Vec::new();
        // Caller audio is flowing but no transcript has arrived yet.
        tm.agent_final("One moment", true, &mut out);
        assert!(finals(&out).is_empty());
        assert!(out.contains(&TranscriptOutput::ArmDeadline {
            token: 1,
            after: Duration::from_millis(2500)
        }));

        let token = deadline_token(&out).unwrap();
        out.clear();
        tm.deadline_expired(token, &mut out);
        assert_eq!(finals(&out), vec![(Party::Agent, "One moment".to_string())]);
    }

    #[test]
    fn test_greeting_renders_without_caller_utterance() {
        let mut tm = manager();
        let mut out = Vec::new();
        tm.agent_final("Hello, thanks for calling", false, &mut out);
        assert_eq!(finals(&out), vec![(Party::Agent, "Hello, thanks for calling".to_string())]);
        assert!(deadline_token(&out).is_none());
    }

    #[test]
    fn test_consecutive_agent_finals_keep_conversation_order() {
        let mut tm = manager();
        let mut out = Vec::new();
        tm.caller_final("A", &mut out);
        tm.agent_final("B1", false, &mut out);
        tm.agent_final("B2", false, &mut out);
        tm.caller_final("C", &mut out);

        let rendered: Vec<String> = finals(&out)
            .into_iter()
            .map(|(party, text)| format!("{}:{}", party, text))
            .collect();
        assert_eq!(rendered, vec!["caller:A", "agent:B1", "agent:B2", "caller:C"]);
        assert!(deadline_token(&out).is_none());
    }

    #[test]
    fn test_stale_deadline_is_ignored() {
        let mut tm = manager();
        let mut out = Vec::new();
        tm.agent_final("one", true, &mut out);
        let token = deadline_token(&out).unwrap();
        tm.caller_final("ok", &mut out);
        out.clear();
        tm.deadline_expired(token, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_agent_done_flushes_buffered_partial() {
        let mut tm = manager();
        let mut out = Vec::new();
        tm.caller_final("hi", &mut out);
        tm.agent_partial("Good", false, &mut out);
        tm.agent_partial("morning", false, &mut out);
        out.clear();
        tm.agent_done(None, false, &mut out);
        assert_eq!(finals(&out), vec![(Party::Agent, "Good morning".to_string())]);

        out.clear();
        tm.agent_done(None, false, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_agent_partials_suppressed_while_caller_speaks() {
        let mut tm = manager();
        let mut out = Vec::new();
        tm.caller_partial("so I was", &mut out);
        out.clear();
        tm.agent_partial("Hello", false, &mut out);
        assert!(out.is_empty());
        tm.agent_partial("there", true, &mut out);
        assert!(out.is_empty());

        tm.caller_final("so I was wondering", &mut out);
        out.clear();
        tm.agent_partial("Sure", false, &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_second_agent_final_joins_held_text() {
        let mut tm = manager();
        let mut out = Vec::new();
        tm.agent_final("Hi.", true, &mut out);
        tm.agent_final("Are you there?", false, &mut out);
        assert_eq!(out.iter().filter(|o| matches!(o, TranscriptOutput::ArmDeadline { .. })).count(), 1);
        tm.caller_final("yes", &mut out);
        assert_eq!(finals(&out)[1], (Party::Agent, "Hi. Are you there?".to_string()));
    }

    #[test]
    fn test_lines_carry_speaker_names() {
        let mut tm = manager();
        let mut out = Vec::new();
        tm.caller_final("hello", &mut out);
        match &out[0] {
            TranscriptOutput::Final(line) => assert_eq!(line.speaker, "Dana"),
            other => panic!("unexpected output {:?}", other),
        }
    }
}
