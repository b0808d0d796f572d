//! Streaming download handler that decodes into an [`AudioClip`].

use std::io;
use std::path::Path;

use stream_request::{
    DownloadHandler, Engine, Request, RequestError, RequestResult, RequestSpec, StreamCapable,
};
use tracing::{debug, trace};

use crate::clip::{AudioClip, ClipSettings};
use crate::pcm::{ChunkDecoder, Pcm16Decoder};

/// Feeds response bytes through a [`ChunkDecoder`] into an [`AudioClip`].
///
/// - The response length (when the transport reports one) sets the clip's expected total.
/// - The request becomes stream-ready when the clip is ready for playback.
/// - The request finalizes once the transport finished and every received byte was decoded.
/// - On failure or cancellation the clip is unloaded.
#[derive(Debug)]
pub struct AudioClipHandler<D = Pcm16Decoder> {
    clip: AudioClip,
    decoder: D,
    scratch: Vec<f32>,
    drained: bool,
}

impl AudioClipHandler<Pcm16Decoder> {
    pub fn new(clip: AudioClip) -> Self {
        Self::with_decoder(clip, Pcm16Decoder::new())
    }
}

impl<D: ChunkDecoder> AudioClipHandler<D> {
    pub fn with_decoder(clip: AudioClip, mut decoder: D) -> Self {
        decoder.reset();
        Self {
            clip,
            decoder,
            scratch: Vec::new(),
            drained: false,
        }
    }

    pub fn clip(&self) -> &AudioClip {
        &self.clip
    }
}

impl<D: ChunkDecoder> StreamCapable for AudioClipHandler<D> {
    fn is_stream_ready(&self) -> bool {
        self.clip.is_ready()
    }

    fn is_stream_complete(&self) -> bool {
        self.drained
    }
}

impl<D: ChunkDecoder> DownloadHandler for AudioClipHandler<D> {
    type Payload = AudioClip;

    fn on_content_length(&mut self, len: u64) {
        let sample_bytes = self.decoder.sample_bytes().max(1) as u64;
        let total = len / sample_bytes;
        trace!(len, total, "audio: expected samples");
        self.clip.set_total_samples(total);
    }

    fn receive(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.scratch.clear();
        self.decoder.decode_into(chunk, &mut self.scratch);
        if !self.scratch.is_empty() && !self.clip.add_samples(&self.scratch) {
            trace!(clip = self.clip.name(), "audio: clip unloaded, samples dropped");
        }
        Ok(())
    }

    fn on_transport_done(&mut self) {
        if self.decoder.has_carry() {
            debug!(clip = self.clip.name(), "audio: dropping incomplete trailing sample");
        }
        if self.clip.total_samples().is_none() {
            self.clip.set_total_samples(self.clip.len() as u64);
        }
        self.drained = true;
    }

    fn stream(&self) -> Option<&dyn StreamCapable> {
        Some(self)
    }

    fn finish(&mut self) -> RequestResult<AudioClip> {
        Ok(self.clip.clone())
    }

    fn discard(&mut self, error: &RequestError) {
        debug!(clip = self.clip.name(), "audio: discarding clip: {}", error);
        self.clip.unload();
    }
}

/// Audio request constructors for [`Engine`].
pub trait AudioRequestExt {
    /// GET `target` as raw PCM16 into a new clip.
    ///
    /// The clip is returned alongside the request so playback can start on stream-ready,
    /// before the request completes. The request also completes with the same clip.
    fn get_audio_clip(
        &self,
        target: &str,
        settings: &ClipSettings,
    ) -> (Request<AudioClip>, AudioClip);

    /// Like [`get_audio_clip`](Self::get_audio_clip) with a custom decoder.
    fn get_audio_clip_with<D: ChunkDecoder>(
        &self,
        target: &str,
        settings: &ClipSettings,
        decoder: D,
    ) -> (Request<AudioClip>, AudioClip);
}

impl AudioRequestExt for Engine {
    fn get_audio_clip(
        &self,
        target: &str,
        settings: &ClipSettings,
    ) -> (Request<AudioClip>, AudioClip) {
        self.get_audio_clip_with(target, settings, Pcm16Decoder::new())
    }

    fn get_audio_clip_with<D: ChunkDecoder>(
        &self,
        target: &str,
        settings: &ClipSettings,
        decoder: D,
    ) -> (Request<AudioClip>, AudioClip) {
        let clip = AudioClip::new(clip_name(target), settings);
        let handler = AudioClipHandler::with_decoder(clip.clone(), decoder);
        let request = self.request(RequestSpec::get(target), handler, Ok::<_, RequestError>);
        (request, clip)
    }
}

fn clip_name(target: &str) -> String {
    let trimmed = target.split(['?', '#']).next().unwrap_or(target);
    Path::new(trimmed)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| target.to_owned())
}
