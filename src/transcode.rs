//! PCM16 transcoding between the SFU and the speech provider.
//!
//! All audio is 16-bit signed little-endian. The SFU side runs 48 kHz stereo;
//! the TTS provider emits 24 kHz mono; the STT provider consumes 16 kHz mono.
//! Rate conversion prefers a stateful FFT resampler (rubato) and falls back
//! permanently to scalar decimation/interpolation when the resampler cannot
//! be built or errors mid-stream.

use rubato::{FftFixedIn, Resampler};

/// Input frames fed to the FFT resampler per processing block.
const RESAMPLER_CHUNK: usize = 1024;

/// Drop a trailing odd byte so the buffer holds whole 16-bit samples.
pub fn trim_to_even(pcm: &[u8]) -> &[u8] {
    if pcm.len() % 2 != 0 {
        eprintln!(
            "[Transcode] Truncating trailing odd byte ({} byte buffer)",
            pcm.len()
        );
        &pcm[..pcm.len() - 1]
    } else {
        pcm
    }
}

fn bytes_to_samples(pcm: &[u8]) -> Vec<i16> {
    trim_to_even(pcm)
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Average interleaved stereo frames down to mono, rounding half up.
pub fn stereo_to_mono(pcm: &[u8]) -> Vec<u8> {
    let samples = bytes_to_samples(pcm);
    let mut out = Vec::with_capacity(samples.len() / 2);
    for frame in samples.chunks_exact(2) {
        out.push(((frame[0] as i32 + frame[1] as i32 + 1) >> 1) as i16);
    }
    samples_to_bytes(&out)
}

/// Duplicate each mono sample into a stereo frame.
pub fn mono_to_stereo(pcm: &[u8]) -> Vec<u8> {
    let samples = bytes_to_samples(pcm);
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.push(s);
        out.push(s);
    }
    samples_to_bytes(&out)
}

/// Scalar 3:1 decimation (48 kHz -> 16 kHz): keep every third sample.
fn decimate_3to1(samples: &[i16]) -> Vec<i16> {
    samples.iter().step_by(3).copied().collect()
}

/// Scalar 1:2 upsampling (24 kHz -> 48 kHz): linear interpolation midpoints,
/// terminal sample duplicated.
fn upsample_2x(samples: &[i16]) -> Vec<i16> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for (i, &s) in samples.iter().enumerate() {
        out.push(s);
        let next = samples.get(i + 1).copied().unwrap_or(s);
        out.push(((s as i32 + next as i32) / 2) as i16);
    }
    out
}

/// Stateful streaming resampler over mono PCM16. Input chunks of any size
/// are accepted; whole blocks are resampled and the remainder carries over
/// to the next call.
struct StreamResampler {
    inner: FftFixedIn<f32>,
    carry: Vec<f32>,
}

impl StreamResampler {
    fn new(from_hz: usize, to_hz: usize) -> Option<Self> {
        match FftFixedIn::<f32>::new(from_hz, to_hz, RESAMPLER_CHUNK, 2, 1) {
            Ok(inner) => Some(Self {
                inner,
                carry: Vec::new(),
            }),
            Err(e) => {
                eprintln!(
                    "[Transcode] Resampler init failed ({} -> {} Hz): {}, using scalar path",
                    from_hz, to_hz, e
                );
                None
            }
        }
    }

    fn process_interleaved_int(&mut self, input: &[i16]) -> Result<Vec<i16>, String> {
        self.carry
            .extend(input.iter().map(|&s| s as f32 / 32768.0));

        let mut out = Vec::new();
        while self.carry.len() >= RESAMPLER_CHUNK {
            let block: Vec<f32> = self.carry.drain(..RESAMPLER_CHUNK).collect();
            let waves = vec![block];
            let resampled = self
                .inner
                .process(&waves, None)
                .map_err(|e| e.to_string())?;
            out.extend(resampled[0].iter().map(|&s| (s * 32767.0) as i16));
        }
        Ok(out)
    }

    /// Push the carry remainder and internal filter tail out.
    fn flush(&mut self) -> Result<Vec<i16>, String> {
        let mut out = Vec::new();
        if !self.carry.is_empty() {
            let block: Vec<f32> = std::mem::take(&mut self.carry);
            let waves = vec![block];
            let resampled = self
                .inner
                .process_partial(Some(&waves), None)
                .map_err(|e| e.to_string())?;
            out.extend(resampled[0].iter().map(|&s| (s * 32767.0) as i16));
        }
        let tail = self
            .inner
            .process_partial::<Vec<f32>>(None, None)
            .map_err(|e| e.to_string())?;
        out.extend(tail[0].iter().map(|&s| (s * 32767.0) as i16));
        Ok(out)
    }
}

/// Mono PCM16 rate converter for one direction of one session.
///
/// Built once at session start for the relevant ratio. The preferred path is
/// the stateful FFT resampler; any failure drops the session to the scalar
/// path for good.
pub struct AudioTranscoder {
    from_hz: usize,
    to_hz: usize,
    resampler: Option<StreamResampler>,
}

impl AudioTranscoder {
    /// 48 kHz mono -> 16 kHz mono (STT ingestion).
    pub fn downsampler_48k_to_16k() -> Self {
        Self::new(48_000, 16_000)
    }

    /// 24 kHz mono -> 48 kHz mono (TTS streaming).
    pub fn upsampler_24k_to_48k() -> Self {
        Self::new(24_000, 48_000)
    }

    fn new(from_hz: usize, to_hz: usize) -> Self {
        Self {
            from_hz,
            to_hz,
            resampler: StreamResampler::new(from_hz, to_hz),
        }
    }

    /// Scalar-only variant (used by tests for exact output).
    pub fn scalar(from_hz: usize, to_hz: usize) -> Self {
        Self {
            from_hz,
            to_hz,
            resampler: None,
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.resampler.is_none()
    }

    /// Convert one mono PCM16 chunk. Chunk sizes are arbitrary; the
    /// preferred path is stateful across chunks.
    pub fn process(&mut self, mono_pcm: &[u8]) -> Vec<u8> {
        let samples = bytes_to_samples(mono_pcm);
        if let Some(r) = self.resampler.as_mut() {
            match r.process_interleaved_int(&samples) {
                Ok(out) => return samples_to_bytes(&out),
                Err(e) => {
                    eprintln!(
                        "[Transcode] Resampler error ({} -> {} Hz): {}, switching to scalar path",
                        self.from_hz, self.to_hz, e
                    );
                    self.resampler = None;
                }
            }
        }
        samples_to_bytes(&self.scalar_convert(&samples))
    }

    /// Drain any buffered resampler state at end of stream.
    pub fn flush(&mut self) -> Vec<u8> {
        if let Some(r) = self.resampler.as_mut() {
            match r.flush() {
                Ok(out) => return samples_to_bytes(&out),
                Err(e) => {
                    eprintln!("[Transcode] Resampler flush error: {}", e);
                    self.resampler = None;
                }
            }
        }
        Vec::new()
    }

    fn scalar_convert(&self, samples: &[i16]) -> Vec<i16> {
        match (self.from_hz, self.to_hz) {
            (48_000, 16_000) => decimate_3to1(samples),
            (24_000, 48_000) => upsample_2x(samples),
            _ => samples.to_vec(),
        }
    }
}
