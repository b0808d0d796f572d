//! Audio extension for `stream-request`.
//!
//! Decodes raw PCM16 responses into [`AudioClip`]s while they download, so playback can start
//! as soon as enough audio is buffered (the request's stream-ready notification) instead of
//! after the transfer completes.
//!
//! This crate is composed of several modules:
//! - `pcm`: the [`ChunkDecoder`] contract and its PCM16 reference implementation.
//! - `clip`: [`ClipStreamBuffer`] readiness tracking and the shared [`AudioClip`] handle.
//! - `handler`: [`AudioClipHandler`] plugging both into a request, and [`AudioRequestExt`].

mod clip;
mod handler;
mod pcm;

pub use crate::clip::{AudioClip, ClipFormat, ClipSettings, ClipStreamBuffer};
pub use crate::handler::{AudioClipHandler, AudioRequestExt};
pub use crate::pcm::{ChunkDecoder, PCM16_SAMPLE_BYTES, Pcm16Decoder, decode_pcm16};
