//! # Call Engine
//!
//! Everything that happens inside one monitored call:
//! - **event**: upstream stream events and the monitoring client protocol
//! - **turns**: turn aggregation, FIFO queue and playback sequencing
//! - **transcript**: partial/final text and caller-before-agent ordering
//! - **playback**: real-time scheduler task that renders turn buffers
//! - **session**: the reducer tying the above together

pub mod event;
pub mod playback;
pub mod session;
pub mod transcript;
pub mod turns;
