//! Streamed audio clips.
//!
//! A [`ClipStreamBuffer`] accumulates decoded samples and decides when playback may start;
//! [`AudioClip`] is the shared handle callers hold while the download keeps appending.
//!
//! Notes:
//! - Samples are interleaved (`L R L R ...` for stereo); counts and totals are in samples, not
//!   frames.
//! - Readiness needs a known, non-zero total. The threshold is capped at the clip's total
//!   duration, so clips shorter than the threshold become ready once fully buffered.
//! - Once ready, a buffer stays ready and its total is frozen. Once unloaded it is inert:
//!   [`ClipStreamBuffer::add_samples`] returns `false` and appends nothing.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, trace};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Upper bound on samples pre-allocated from an announced total (16 MiB of `f32`).
const MAX_RESERVED_SAMPLES: usize = 4 * 1024 * 1024;

/// Sample layout of a clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for ClipFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

impl ClipFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Interleaved samples per second of audio.
    pub fn samples_per_second(&self) -> u64 {
        u64::from(self.sample_rate) * u64::from(self.channels)
    }

    /// Duration covered by `samples` interleaved samples.
    pub fn duration_of(&self, samples: u64) -> Duration {
        let rate = self.samples_per_second();
        if rate == 0 {
            return Duration::ZERO;
        }
        let nanos = u128::from(samples) * NANOS_PER_SEC / u128::from(rate);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Samples needed to cover `duration`, rounded up.
    pub fn samples_for(&self, duration: Duration) -> u64 {
        let samples =
            (duration.as_nanos() * u128::from(self.samples_per_second())).div_ceil(NANOS_PER_SEC);
        u64::try_from(samples).unwrap_or(u64::MAX)
    }
}

/// Settings for streamed clips.
#[derive(Debug, Clone)]
pub struct ClipSettings {
    /// Layout of the decoded samples.
    /// Default: 48 kHz stereo.
    pub format: ClipFormat,

    /// Minimum buffered duration before playback may start.
    /// Default: 500 ms.
    pub ready_threshold: Duration,
}

impl Default for ClipSettings {
    fn default() -> Self {
        Self {
            format: ClipFormat::default(),
            ready_threshold: Duration::from_millis(500),
        }
    }
}

impl ClipSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(mut self, format: ClipFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.format.sample_rate = sample_rate;
        self
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.format.channels = channels;
        self
    }

    pub fn with_ready_threshold(mut self, threshold: Duration) -> Self {
        self.ready_threshold = threshold;
        self
    }
}

/// Samples of one clip being streamed, plus its playback readiness.
#[derive(Debug)]
pub struct ClipStreamBuffer {
    format: ClipFormat,
    ready_threshold: Duration,
    total_samples: u64,
    samples: Vec<f32>,
    ready: bool,
    unloaded: bool,
}

impl ClipStreamBuffer {
    pub fn new(settings: &ClipSettings) -> Self {
        Self {
            format: settings.format,
            ready_threshold: settings.ready_threshold,
            total_samples: 0,
            samples: Vec::new(),
            ready: false,
            unloaded: false,
        }
    }

    pub fn format(&self) -> ClipFormat {
        self.format
    }

    /// Record the expected total. Returns `false` (and changes nothing) once the buffer is ready
    /// or unloaded.
    pub fn set_total_samples(&mut self, total: u64) -> bool {
        if self.ready || self.unloaded {
            trace!(total, "clip: set_total_samples ignored");
            return false;
        }
        self.total_samples = total;
        let additional = total.saturating_sub(self.len() as u64);
        let reserve = usize::try_from(additional).map_or(MAX_RESERVED_SAMPLES, |n| {
            n.min(MAX_RESERVED_SAMPLES)
        });
        self.samples.reserve(reserve);
        self.update_ready();
        true
    }

    /// Expected total, once known.
    pub fn total_samples(&self) -> Option<u64> {
        (self.total_samples > 0).then_some(self.total_samples)
    }

    /// Append decoded samples. Returns `false` without appending after [`unload`](Self::unload).
    pub fn add_samples(&mut self, samples: &[f32]) -> bool {
        if self.unloaded {
            return false;
        }
        self.samples.extend_from_slice(samples);
        self.update_ready();
        true
    }

    /// Release the buffered audio. The buffer accepts nothing afterwards.
    pub fn unload(&mut self) {
        if self.unloaded {
            return;
        }
        self.unloaded = true;
        self.ready = false;
        self.samples = Vec::new();
        debug!("clip: unloaded");
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded
    }

    /// Samples appended so far.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Every expected sample has arrived.
    pub fn is_fully_buffered(&self) -> bool {
        self.total_samples()
            .is_some_and(|total| self.len() as u64 >= total)
    }

    pub fn buffered_duration(&self) -> Duration {
        self.format.duration_of(self.len() as u64)
    }

    /// Total duration, once the total is known.
    pub fn total_duration(&self) -> Option<Duration> {
        self.total_samples().map(|t| self.format.duration_of(t))
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    fn update_ready(&mut self) {
        if self.ready {
            return;
        }
        let Some(total) = self.total_samples() else {
            return;
        };
        let needed = self.format.samples_for(self.ready_threshold).min(total);
        if self.len() as u64 >= needed {
            self.ready = true;
            debug!(
                buffered = self.len(),
                total,
                "clip: ready (buffered {:?})",
                self.buffered_duration()
            );
        }
    }
}

/// Shared handle to a streamed clip.
///
/// Cloning shares the buffer: the download appends through one clone while the caller reads
/// through another.
#[derive(Debug, Clone)]
pub struct AudioClip {
    name: Arc<str>,
    inner: Arc<RwLock<ClipStreamBuffer>>,
}

impl AudioClip {
    pub fn new(name: impl Into<Arc<str>>, settings: &ClipSettings) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(RwLock::new(ClipStreamBuffer::new(settings))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> ClipFormat {
        self.inner.read().format()
    }

    pub fn set_total_samples(&self, total: u64) -> bool {
        self.inner.write().set_total_samples(total)
    }

    pub fn total_samples(&self) -> Option<u64> {
        self.inner.read().total_samples()
    }

    pub fn add_samples(&self, samples: &[f32]) -> bool {
        self.inner.write().add_samples(samples)
    }

    pub fn unload(&self) {
        self.inner.write().unload();
    }

    pub fn is_ready(&self) -> bool {
        self.inner.read().is_ready()
    }

    pub fn is_unloaded(&self) -> bool {
        self.inner.read().is_unloaded()
    }

    pub fn is_fully_buffered(&self) -> bool {
        self.inner.read().is_fully_buffered()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn buffered_duration(&self) -> Duration {
        self.inner.read().buffered_duration()
    }

    /// Copy of the samples from `offset` on, for consumers that play while the clip streams.
    pub fn samples_from(&self, offset: usize) -> Vec<f32> {
        let buffer = self.inner.read();
        buffer.samples().get(offset..).map(<[f32]>::to_vec).unwrap_or_default()
    }

    /// Read access to the whole buffer. Appends block while the guard is held.
    pub fn read(&self) -> RwLockReadGuard<'_, ClipStreamBuffer> {
        self.inner.read()
    }
}
