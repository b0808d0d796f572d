//! Streaming byte -> sample decoding.
//!
//! A [`ChunkDecoder`] is bound to one logical stream. Chunks may end in the middle of a sample;
//! the incomplete bytes are carried into the next call, so decoding a stream chunk by chunk
//! yields exactly the samples a one-shot decode of the concatenated bytes would.

/// Bytes per PCM16 sample.
pub const PCM16_SAMPLE_BYTES: usize = 2;

/// Largest positive PCM16 value; decoded samples are divided by it.
const PCM16_SCALE: f32 = i16::MAX as f32;

/// Stateful transcoder from raw bytes to normalized samples.
pub trait ChunkDecoder: Send + 'static {
    /// Bytes per encoded sample.
    fn sample_bytes(&self) -> usize;

    /// Forget any carried bytes. Call once per new logical stream.
    fn reset(&mut self);

    /// Decode `chunk`, appending samples to `out`.
    fn decode_into(&mut self, chunk: &[u8], out: &mut Vec<f32>);

    /// Decode `chunk` into a fresh vector.
    fn decode(&mut self, chunk: &[u8]) -> Vec<f32> {
        let mut out = Vec::new();
        self.decode_into(chunk, &mut out);
        out
    }

    /// Bytes of an incomplete sample are pending.
    fn has_carry(&self) -> bool;
}

/// Little-endian signed 16-bit PCM.
#[derive(Debug, Clone, Default)]
pub struct Pcm16Decoder {
    carry: Option<u8>,
}

impl Pcm16Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of samples the next `decode` of a `chunk_len`-byte chunk produces.
    pub fn output_len(&self, chunk_len: usize) -> usize {
        (chunk_len + usize::from(self.carry.is_some())) / PCM16_SAMPLE_BYTES
    }
}

impl ChunkDecoder for Pcm16Decoder {
    fn sample_bytes(&self) -> usize {
        PCM16_SAMPLE_BYTES
    }

    fn reset(&mut self) {
        self.carry = None;
    }

    fn decode_into(&mut self, chunk: &[u8], out: &mut Vec<f32>) {
        out.reserve(self.output_len(chunk.len()));

        let mut rest = chunk;
        if let Some(lo) = self.carry {
            let Some((&hi, tail)) = rest.split_first() else {
                return;
            };
            self.carry = None;
            out.push(pcm16_sample(lo, hi));
            rest = tail;
        }

        let mut pairs = rest.chunks_exact(PCM16_SAMPLE_BYTES);
        out.extend(pairs.by_ref().map(|pair| pcm16_sample(pair[0], pair[1])));
        if let [odd] = pairs.remainder() {
            self.carry = Some(*odd);
        }
    }

    fn has_carry(&self) -> bool {
        self.carry.is_some()
    }
}

/// One-shot decode of a whole PCM16 buffer. A trailing odd byte is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(PCM16_SAMPLE_BYTES)
        .map(|pair| pcm16_sample(pair[0], pair[1]))
        .collect()
}

#[inline]
fn pcm16_sample(lo: u8, hi: u8) -> f32 {
    f32::from(i16::from_le_bytes([lo, hi])) / PCM16_SCALE
}
