//! Real-time pacing of outbound audio.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::model::{Speaking, FRAME_DURATION};
use crate::{lock, Result};

/// A source of encoded audio, one 20 ms Opus frame at a time.
#[async_trait]
pub trait AudioSource: Send {
	/// The next frame, or `None` when the source is exhausted.
	async fn next_frame(&mut self) -> Option<Vec<u8>>;
}

/// Adapts an iterator of already-encoded frames.
pub struct Frames<I>(pub I);

#[async_trait]
impl<I: Iterator<Item = Vec<u8>> + Send> AudioSource for Frames<I> {
	async fn next_frame(&mut self) -> Option<Vec<u8>> {
		self.0.next()
	}
}

#[async_trait]
impl AudioSource for mpsc::Receiver<Vec<u8>> {
	async fn next_frame(&mut self) -> Option<Vec<u8>> {
		self.recv().await
	}
}

#[async_trait]
impl AudioSource for Box<dyn AudioSource> {
	async fn next_frame(&mut self) -> Option<Vec<u8>> {
		(**self).next_frame().await
	}
}

/// Where a player delivers its frames.
#[async_trait]
pub trait VoiceSink: Send + Sync {
	async fn send_frame(&self, frame: &[u8]) -> Result<()>;

	/// Announce the speaking state, returning whether it could be sent.
	fn set_speaking(&self, flags: Speaking) -> bool;
}

struct PlayerState {
	sink: Arc<dyn VoiceSink>,
	playing: AtomicBool,
	paused: AtomicBool,
	task: Mutex<Option<JoinHandle<()>>>,
}

/// Sends one frame every 20 ms against an absolute schedule.
///
/// Time spent paused extends the schedule instead of being made up with a
/// burst of frames on resume.
#[derive(Clone)]
pub struct Player(Arc<PlayerState>);

impl Player {
	pub fn new(sink: Arc<dyn VoiceSink>) -> Player {
		Player(Arc::new(PlayerState {
			sink,
			playing: AtomicBool::new(false),
			paused: AtomicBool::new(false),
			task: Mutex::new(None),
		}))
	}

	/// Begin playing `source`, replacing anything already playing.
	pub fn start<S: AudioSource + 'static>(&self, source: S) {
		self.abort();
		self.0.paused.store(false, Ordering::SeqCst);
		self.0.playing.store(true, Ordering::SeqCst);
		self.0.sink.set_speaking(Speaking::MICROPHONE);
		let task = tokio::spawn(pace(self.0.clone(), source));
		*lock(&self.0.task) = Some(task);
	}

	pub fn pause(&self) {
		self.0.paused.store(true, Ordering::SeqCst);
	}

	pub fn resume(&self) {
		self.0.paused.store(false, Ordering::SeqCst);
	}

	/// Stop the pacing task. Calling this again does nothing.
	pub fn stop(&self) {
		self.0.playing.store(false, Ordering::SeqCst);
		self.abort();
	}

	/// Mark this player inactive; its task ends on the next tick.
	pub fn deactivate(&self) {
		self.0.playing.store(false, Ordering::SeqCst);
	}

	pub fn is_playing(&self) -> bool {
		self.0.playing.load(Ordering::SeqCst)
	}

	pub fn is_paused(&self) -> bool {
		self.0.paused.load(Ordering::SeqCst)
	}

	fn abort(&self) {
		if let Some(task) = lock(&self.0.task).take() {
			task.abort();
		}
	}
}

async fn pace<S: AudioSource>(state: Arc<PlayerState>, mut source: S) {
	let epoch = Instant::now();
	let mut sent = Duration::ZERO;
	let mut paused = Duration::ZERO;
	loop {
		if !state.playing.load(Ordering::SeqCst) {
			return;
		}
		if state.paused.load(Ordering::SeqCst) {
			paused += FRAME_DURATION;
		} else {
			match source.next_frame().await {
				Some(frame) => {
					// deactivated while waiting on the source
					if !state.playing.load(Ordering::SeqCst) {
						return;
					}
					if let Err(err) = state.sink.send_frame(&frame).await {
						warn!("Error sending voice frame: {}", err);
					}
					sent += FRAME_DURATION;
				}
				None => {
					debug!("Audio source exhausted after {:?}", sent);
					state.playing.store(false, Ordering::SeqCst);
					state.sink.set_speaking(Speaking::empty());
					return;
				}
			}
		}
		time::sleep_until(epoch + sent + paused).await;
	}
}
