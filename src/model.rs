//! Wire types shared by the voice gateway and the UDP transport.

use std::fmt;
use std::time::Duration;

use serde_json::Value;

use crate::serial::{deserialize_id, deserialize_interval, deserialize_speaking};
use crate::{Error, Result};

/// Version of the voice gateway protocol spoken by this crate.
pub const VOICE_GATEWAY_VERSION: u64 = 4;

/// Number of interleaved audio channels.
pub const CHANNELS: usize = 2;
/// Samples per second, per channel.
pub const SAMPLE_RATE: u32 = 48_000;
/// Length of one audio frame in milliseconds.
pub const FRAME_DURATION_MS: u64 = 20;
/// Length of one audio frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(FRAME_DURATION_MS);
/// Samples per channel in one frame; also the RTP timestamp step.
pub const FRAME_SIZE: u32 = SAMPLE_RATE * FRAME_DURATION_MS as u32 / 1000;
/// Largest Opus payload a single frame can encode to.
pub const MAX_OPUS_FRAME: usize = 1276;
/// Upper bound on an outbound packet, header and nonce material included.
pub const MAX_PACKET_SIZE: usize = 28 + MAX_OPUS_FRAME * 3;

/// The RTP sequence number wraps at this value.
pub const SEQUENCE_MODULUS: u32 = 1 << 16;
/// The RTP timestamp and the lite nonce counter wrap at this value.
pub const TIMESTAMP_MODULUS: u64 = 1 << 32;

/// Fixed first two bytes of every voice packet (RTP version 2, payload type 0x78).
pub const RTP_MARKER: [u8; 2] = [0x80, 0x78];
/// Length of the fixed packet header.
pub const RTP_HEADER_LEN: usize = 12;
/// Length of an IP discovery request and reply.
pub const DISCOVERY_PACKET_LEN: usize = 70;

/// An identifier for a User
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug, Ord, PartialOrd)]
pub struct UserId(pub u64);

/// An identifier for a Server (guild)
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug, Ord, PartialOrd)]
pub struct ServerId(pub u64);

/// An identifier for a voice Channel
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug, Ord, PartialOrd)]
pub struct ChannelId(pub u64);

macro_rules! id_display {
	($($name:ident;)*) => {
		$(impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		})*
	}
}

id_display! {
	UserId;
	ServerId;
	ChannelId;
}

/// Voice gateway opcodes.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub enum OpCode {
	Identify,
	SelectProtocol,
	Ready,
	Heartbeat,
	SessionDescription,
	Speaking,
	HeartbeatAck,
	Resume,
	Hello,
	Resumed,
	ClientDisconnect,
}

serial_numbers! { OpCode;
	Identify, 0;
	SelectProtocol, 1;
	Ready, 2;
	Heartbeat, 3;
	SessionDescription, 4;
	Speaking, 5;
	HeartbeatAck, 6;
	Resume, 7;
	Hello, 8;
	Resumed, 9;
	ClientDisconnect, 13;
}
serial_use_mapping!(OpCode, numeric);

/// Packet encryption schemes the transport can speak.
///
/// All three use an XSalsa20-Poly1305 secretbox; they differ only in where
/// the 24-byte nonce comes from and how much of it travels on the wire.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub enum EncryptionMode {
	/// The nonce is the 12-byte RTP header, zero-extended.
	XSalsa20Poly1305,
	/// A random 24-byte nonce is appended to each packet.
	XSalsa20Poly1305Suffix,
	/// A 4-byte incrementing counter is appended to each packet.
	XSalsa20Poly1305Lite,
}

serial_names! { EncryptionMode;
	XSalsa20Poly1305, "xsalsa20_poly1305";
	XSalsa20Poly1305Suffix, "xsalsa20_poly1305_suffix";
	XSalsa20Poly1305Lite, "xsalsa20_poly1305_lite";
}
serial_use_mapping!(EncryptionMode, named);

impl EncryptionMode {
	/// Number of nonce bytes this mode appends after the ciphertext.
	pub fn nonce_suffix_len(&self) -> usize {
		match *self {
			EncryptionMode::XSalsa20Poly1305 => 0,
			EncryptionMode::XSalsa20Poly1305Suffix => 24,
			EncryptionMode::XSalsa20Poly1305Lite => 4,
		}
	}
}

impl Default for EncryptionMode {
	fn default() -> EncryptionMode {
		EncryptionMode::XSalsa20Poly1305
	}
}

impl fmt::Display for EncryptionMode {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.name())
	}
}

bitflags! {
	/// Speaking state announced to the other participants.
	pub struct Speaking: u8 {
		/// Normal transmission of voice audio
		const MICROPHONE = 1 << 0;
		/// Transmission of context audio for video, no speaking indicator
		const SOUNDSHARE = 1 << 1;
		/// Priority speaker, lowering the audio of other speakers
		const PRIORITY = 1 << 2;
	}
}

/// What to publish on a user's inbound queue.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub enum ReceiveMode {
	/// The decrypted Opus payload, as sent.
	Opus,
	/// Interleaved little-endian i16 stereo samples decoded from the payload.
	#[cfg(feature = "codec")]
	Pcm,
}

//=================
// Inbound events

/// A message received from the voice gateway.
#[derive(Clone, Debug)]
pub enum VoiceEvent {
	Hello {
		heartbeat_interval: Duration,
	},
	Ready {
		ssrc: u32,
		ip: String,
		port: u16,
		modes: Vec<String>,
	},
	SessionDescription {
		mode: String,
		secret_key: Vec<u8>,
	},
	Speaking {
		user_id: UserId,
		ssrc: u32,
		speaking: Speaking,
	},
	HeartbeatAck,
	Resumed,
	ClientDisconnect {
		user_id: UserId,
	},
	Unknown(u64, Value),
}

#[derive(Deserialize)]
struct Envelope {
	op: u64,
	#[serde(default)]
	d: Value,
}

#[derive(Deserialize)]
struct HelloData {
	#[serde(deserialize_with = "deserialize_interval")]
	heartbeat_interval: Duration,
}

#[derive(Deserialize)]
struct ReadyData {
	ssrc: u32,
	ip: String,
	port: u16,
	#[serde(default)]
	modes: Vec<String>,
}

#[derive(Deserialize)]
struct SessionDescriptionData {
	mode: String,
	secret_key: Vec<u8>,
}

#[derive(Deserialize)]
struct SpeakingData {
	#[serde(deserialize_with = "deserialize_id")]
	user_id: u64,
	ssrc: u32,
	#[serde(deserialize_with = "deserialize_speaking")]
	speaking: Speaking,
}

#[derive(Deserialize)]
struct ClientDisconnectData {
	#[serde(deserialize_with = "deserialize_id")]
	user_id: u64,
}

impl VoiceEvent {
	pub fn decode(value: Value) -> Result<VoiceEvent> {
		let Envelope { op, d } = serde_json::from_value(value)?;
		Ok(match OpCode::from_num(op) {
			Some(OpCode::Hello) => {
				let data: HelloData = serde_json::from_value(d)?;
				VoiceEvent::Hello { heartbeat_interval: data.heartbeat_interval }
			}
			Some(OpCode::Ready) => {
				let data: ReadyData = serde_json::from_value(d)?;
				VoiceEvent::Ready { ssrc: data.ssrc, ip: data.ip, port: data.port, modes: data.modes }
			}
			Some(OpCode::SessionDescription) => {
				let data: SessionDescriptionData = serde_json::from_value(d)?;
				VoiceEvent::SessionDescription { mode: data.mode, secret_key: data.secret_key }
			}
			Some(OpCode::Speaking) => {
				let data: SpeakingData = serde_json::from_value(d)?;
				VoiceEvent::Speaking { user_id: UserId(data.user_id), ssrc: data.ssrc, speaking: data.speaking }
			}
			Some(OpCode::HeartbeatAck) => VoiceEvent::HeartbeatAck,
			Some(OpCode::Resumed) => VoiceEvent::Resumed,
			Some(OpCode::ClientDisconnect) => {
				let data: ClientDisconnectData = serde_json::from_value(d)?;
				VoiceEvent::ClientDisconnect { user_id: UserId(data.user_id) }
			}
			_ => VoiceEvent::Unknown(op, d),
		})
	}

	/// Decode a text frame received from the gateway.
	pub fn from_text(text: &str) -> Result<VoiceEvent> {
		let value: Value = serde_json::from_str(text)?;
		if !value.is_object() {
			return Err(Error::Decode("expected an object", value));
		}
		VoiceEvent::decode(value)
	}
}

//=================
// Outbound messages

pub fn identify(server_id: ServerId, user_id: UserId, session_id: &str, token: &str) -> Value {
	json! {{
		"op": OpCode::Identify,
		"d": {
			"server_id": server_id.to_string(),
			"user_id": user_id.to_string(),
			"session_id": session_id,
			"token": token,
		}
	}}
}

pub fn select_protocol(address: &str, port: u16, mode: EncryptionMode) -> Value {
	json! {{
		"op": OpCode::SelectProtocol,
		"d": {
			"protocol": "udp",
			"data": {
				"address": address,
				"port": port,
				"mode": mode,
			}
		}
	}}
}

/// The heartbeat payload is an opaque nonce; a millisecond timestamp is used.
pub fn heartbeat(nonce: i64) -> Value {
	json! {{
		"op": OpCode::Heartbeat,
		"d": nonce,
	}}
}

pub fn speaking(flags: Speaking, ssrc: u32, delay: u32) -> Value {
	json! {{
		"op": OpCode::Speaking,
		"d": {
			"speaking": flags.bits(),
			"ssrc": ssrc,
			"delay": delay,
		}
	}}
}
