//! Opus encoding for outbound audio and decoding for received audio.

use async_trait::async_trait;
use opus::{Application, Bitrate, Channels};

use crate::model::{MAX_OPUS_FRAME, SAMPLE_RATE};
use crate::pcm::{PcmSource, FRAME_SAMPLES};
use crate::player::AudioSource;
use crate::Result;

const BITRATE: i32 = 96_000;
const EXPECTED_PACKET_LOSS: i32 = 2;
// 120 ms, the longest frame Opus produces
const MAX_DECODED_SAMPLES: usize = FRAME_SAMPLES * 6;

/// A stereo Opus encoder tuned for music over a lossy link.
pub struct Encoder {
	encoder: opus::Encoder,
	output: Vec<u8>,
}

// The encoder state is only reached through &mut self.
unsafe impl Send for Encoder {}

impl Encoder {
	pub fn new() -> Result<Encoder> {
		let mut encoder = opus::Encoder::new(SAMPLE_RATE, Channels::Stereo, Application::Audio)?;
		encoder.set_bitrate(Bitrate::Bits(BITRATE))?;
		encoder.set_inband_fec(true)?;
		encoder.set_packet_loss_perc(EXPECTED_PACKET_LOSS)?;
		Ok(Encoder {
			encoder,
			output: vec![0; MAX_OPUS_FRAME],
		})
	}

	/// Encode one 20 ms frame of interleaved stereo samples.
	pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
		let len = self.encoder.encode(pcm, &mut self.output)?;
		Ok(self.output[..len].to_vec())
	}
}

/// A stereo Opus decoder for one remote speaker.
pub struct Decoder {
	decoder: opus::Decoder,
	output: Vec<i16>,
}

unsafe impl Send for Decoder {}

impl Decoder {
	pub fn new() -> Result<Decoder> {
		Ok(Decoder {
			decoder: opus::Decoder::new(SAMPLE_RATE, Channels::Stereo)?,
			output: vec![0; MAX_DECODED_SAMPLES],
		})
	}

	/// Decode one packet to interleaved stereo samples.
	pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
		let per_channel = self.decoder.decode(packet, &mut self.output, false)?;
		Ok(self.output[..per_channel * 2].to_vec())
	}
}

/// Turns a [`PcmSource`] into an [`AudioSource`] by Opus-encoding each frame.
///
/// Blocks of any length are regrouped into 20 ms frames; only the final
/// partial frame is padded with silence.
pub struct Encoded<S> {
	source: S,
	encoder: Encoder,
	pending: Vec<i16>,
	exhausted: bool,
}

impl<S: PcmSource> Encoded<S> {
	pub fn new(source: S) -> Result<Encoded<S>> {
		Ok(Encoded {
			source,
			encoder: Encoder::new()?,
			pending: Vec::with_capacity(FRAME_SAMPLES * 2),
			exhausted: false,
		})
	}
}

#[async_trait]
impl<S: PcmSource> AudioSource for Encoded<S> {
	async fn next_frame(&mut self) -> Option<Vec<u8>> {
		while !self.exhausted && self.pending.len() < FRAME_SAMPLES {
			match self.source.read_pcm().await {
				Some(block) => self.pending.extend_from_slice(&block),
				None => self.exhausted = true,
			}
		}
		if self.pending.is_empty() {
			return None;
		}
		let take = self.pending.len().min(FRAME_SAMPLES);
		let mut pcm: Vec<i16> = self.pending.drain(..take).collect();
		pcm.resize(FRAME_SAMPLES, 0);
		match self.encoder.encode(&pcm) {
			Ok(frame) => Some(frame),
			Err(err) => {
				warn!("Error encoding audio: {}", err);
				None
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn silence_survives_a_round_trip() {
		let mut encoder = Encoder::new().unwrap();
		let mut decoder = Decoder::new().unwrap();
		let packet = encoder.encode(&[0; FRAME_SAMPLES]).unwrap();
		assert!(!packet.is_empty() && packet.len() <= MAX_OPUS_FRAME);
		let pcm = decoder.decode(&packet).unwrap();
		assert_eq!(pcm.len(), FRAME_SAMPLES);
	}

	#[tokio::test]
	async fn short_frames_are_padded() {
		let (tx, rx) = tokio::sync::mpsc::channel(2);
		tx.send(vec![0i16; 100]).await.unwrap();
		drop(tx);

		let mut encoded = Encoded::new(rx).unwrap();
		assert!(encoded.next_frame().await.is_some());
		assert!(encoded.next_frame().await.is_none());
	}

	#[tokio::test]
	async fn long_blocks_are_split_into_frames() {
		let (tx, rx) = tokio::sync::mpsc::channel(4);
		tx.send(vec![1i16; FRAME_SAMPLES * 2]).await.unwrap();
		drop(tx);

		let mut encoded = Encoded::new(rx).unwrap();
		assert!(encoded.next_frame().await.is_some());
		assert!(encoded.next_frame().await.is_some());
		assert!(encoded.next_frame().await.is_none());
	}

	#[tokio::test]
	async fn uneven_blocks_carry_over() {
		let (tx, rx) = tokio::sync::mpsc::channel(4);
		tx.send(vec![1i16; FRAME_SAMPLES / 2 * 3]).await.unwrap();
		tx.send(vec![1i16; FRAME_SAMPLES / 2]).await.unwrap();
		tx.send(vec![1i16; 10]).await.unwrap();
		drop(tx);

		// 1.5 + 0.5 frames make two full frames; the 10 leftover samples a padded third
		let mut encoded = Encoded::new(rx).unwrap();
		for _ in 0..3 {
			assert!(encoded.next_frame().await.is_some());
		}
		assert!(encoded.next_frame().await.is_none());
		assert!(encoded.pending.is_empty());
	}
}
