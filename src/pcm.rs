//! Raw PCM sources: an ffmpeg decoding process and a volume transform.

use std::ffi::OsStr;
use std::process::Stdio;

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

use crate::model::{CHANNELS, FRAME_SIZE};
use crate::{Error, Result};

/// Interleaved stereo samples in one 20 ms frame.
pub const FRAME_SAMPLES: usize = FRAME_SIZE as usize * CHANNELS;
/// Bytes of little-endian i16 PCM in one 20 ms frame.
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// A source of interleaved 48 kHz stereo i16 samples, one frame at a time.
#[async_trait]
pub trait PcmSource: Send {
	/// Read the next block of samples, or `None` once the source is exhausted.
	async fn read_pcm(&mut self) -> Option<Vec<i16>>;
}

/// PCM decoded from a media file by an `ffmpeg` child process.
pub struct FfmpegStream {
	// killed when the stream is dropped
	_child: Child,
	stdout: ChildStdout,
	buffer: Vec<u8>,
}

/// Start `ffmpeg` decoding `path` to raw 48 kHz stereo s16le on its stdout.
pub fn open_ffmpeg_stream<P: AsRef<OsStr>>(path: P) -> Result<FfmpegStream> {
	let mut child = Command::new("ffmpeg")
		.arg("-i")
		.arg(path)
		.args(&["-f", "s16le", "-acodec", "pcm_s16le", "-ac", "2", "-ar", "48000", "-"])
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::null())
		.kill_on_drop(true)
		.spawn()?;
	let stdout = child.stdout.take().ok_or(Error::Other("ffmpeg stdout was not captured"))?;
	Ok(FfmpegStream {
		_child: child,
		stdout,
		buffer: vec![0; FRAME_BYTES],
	})
}

#[async_trait]
impl PcmSource for FfmpegStream {
	async fn read_pcm(&mut self) -> Option<Vec<i16>> {
		let mut filled = 0;
		while filled < FRAME_BYTES {
			match self.stdout.read(&mut self.buffer[filled..]).await {
				Ok(0) => break,
				Ok(n) => filled += n,
				Err(err) => {
					warn!("Error reading from ffmpeg: {}", err);
					break;
				}
			}
		}
		if filled == 0 {
			return None;
		}
		// the final partial frame is padded with silence
		for byte in &mut self.buffer[filled..] {
			*byte = 0;
		}
		let mut samples = vec![0; FRAME_SAMPLES];
		LittleEndian::read_i16_into(&self.buffer, &mut samples);
		Some(samples)
	}
}

/// Scales every sample of the wrapped source by a linear gain.
pub struct Volume<S> {
	source: S,
	gain: f32,
}

impl<S: PcmSource> Volume<S> {
	pub fn new(source: S, gain: f32) -> Volume<S> {
		Volume { source, gain }
	}

	pub fn gain(&self) -> f32 {
		self.gain
	}

	pub fn set_gain(&mut self, gain: f32) {
		self.gain = gain;
	}

	pub fn into_inner(self) -> S {
		self.source
	}
}

/// Apply `gain` to one sample, saturating at the bounds of i16.
pub fn scale(sample: i16, gain: f32) -> i16 {
	let scaled = (sample as f32 * gain).round();
	scaled.max(i16::MIN as f32).min(i16::MAX as f32) as i16
}

#[async_trait]
impl<S: PcmSource> PcmSource for Volume<S> {
	async fn read_pcm(&mut self) -> Option<Vec<i16>> {
		let mut samples = self.source.read_pcm().await?;
		if self.gain != 1.0 {
			for sample in &mut samples {
				*sample = scale(*sample, self.gain);
			}
		}
		Some(samples)
	}
}

#[async_trait]
impl PcmSource for tokio::sync::mpsc::Receiver<Vec<i16>> {
	async fn read_pcm(&mut self) -> Option<Vec<i16>> {
		self.recv().await
	}
}
