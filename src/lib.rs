//! Client for the Discord voice gateway and its encrypted UDP audio transport.
//!
//! A [`VoiceConnection`] is fed the voice state and voice server details the
//! main gateway hands out, then performs the voice handshake: identify,
//! heartbeat, IP discovery and encryption negotiation. Once established,
//! a [`Player`] paces Opus frames out at one every 20 ms and, if configured,
//! received audio is published per user as [`InboundAudio`].
//!
//! ```no_run
//! # async fn run() -> discord_voice::Result<()> {
//! use discord_voice::*;
//!
//! let conn = VoiceConnection::new(UserId(80351110224678912), VoiceConfig::default());
//! conn.voice_state_update(ServerId(81384788765712384), ChannelId(81384788765712385), "session id");
//! conn.voice_server_update("eu-west1.discord.media:80", "voice token");
//! conn.connect().await?;
//! conn.play_pcm(pcm::open_ffmpeg_stream("song.mp3")?)?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate serde_json;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

use std::sync::{Mutex, MutexGuard, PoisonError};

#[macro_use]
mod serial;
mod error;
pub mod model;
pub mod packet;
pub mod udp;
pub mod gateway;
pub mod player;
pub mod pcm;
#[cfg(feature = "codec")]
pub mod codec;
mod connection;

pub use connection::{VoiceConfig, VoiceConnection};
pub use error::{Error, Result};
pub use gateway::GatewayState;
pub use model::*;
pub use player::{AudioSource, Frames, Player, VoiceSink};
pub use udp::InboundAudio;

/// Lock a mutex, carrying on with the data if a panicking thread poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
