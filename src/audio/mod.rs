//! # Audio Module
//!
//! Decoding and conditioning of the call's audio.
//!
//! ## Key Components:
//! - **chunk**: decoded mono PCM chunks tagged with their party
//! - **codec**: base64 transport, G.711 μ-law table, WAV container decode
//! - **enhance**: caller voice enhancement chain
//! - **buffer**: sequenced per-turn chunk storage
//!
//! ## Audio Format:
//! - **Sample Rate**: 8kHz for μ-law; WAV keeps its own rate
//! - **Bit Depth**: 16-bit signed PCM
//! - **Channels**: Mono

pub mod buffer;
pub mod chunk;
pub mod codec;
pub mod enhance;
