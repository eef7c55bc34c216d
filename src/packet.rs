//! RTP-style voice packet framing and encryption.
//!
//! The header is `0x80 0x78`, a big-endian u16 sequence number, a big-endian
//! u32 timestamp and a big-endian u32 SSRC. The body is an XSalsa20-Poly1305
//! secretbox of one Opus frame, followed by whatever nonce material the
//! negotiated [`EncryptionMode`] transmits.

use byteorder::{BigEndian, ByteOrder};
use rand::rngs::OsRng;
use rand::RngCore;
use sodiumoxide::crypto::secretbox;

use crate::model::*;
use crate::{Error, Result};

pub use sodiumoxide::crypto::secretbox::Key;

/// Copy a negotiated secret into a fixed-length key, rejecting any other length.
pub fn key_from_slice(secret: &[u8]) -> Option<Key> {
	Key::from_slice(secret)
}

/// Outbound packet state: the reusable frame buffer and the three counters.
pub struct Outbound {
	buffer: Vec<u8>,
	sequence: u16,
	timestamp: u32,
	lite_nonce: u32,
}

impl Default for Outbound {
	fn default() -> Outbound {
		Outbound::new()
	}
}

impl Outbound {
	pub fn new() -> Outbound {
		let mut buffer = vec![0; MAX_PACKET_SIZE];
		buffer[..2].copy_from_slice(&RTP_MARKER);
		Outbound {
			buffer,
			sequence: 0,
			timestamp: 0,
			lite_nonce: 0,
		}
	}

	/// Write the SSRC assigned by the server into the header.
	pub fn set_ssrc(&mut self, ssrc: u32) {
		BigEndian::write_u32(&mut self.buffer[8..12], ssrc);
	}

	pub fn sequence(&self) -> u16 {
		self.sequence
	}

	pub fn timestamp(&self) -> u32 {
		self.timestamp
	}

	pub fn header(&self) -> &[u8] {
		&self.buffer[..RTP_HEADER_LEN]
	}

	#[cfg(test)]
	fn set_counters(&mut self, sequence: u16, timestamp: u32, lite_nonce: u32) {
		self.sequence = sequence;
		self.timestamp = timestamp;
		self.lite_nonce = lite_nonce;
	}

	/// Step the sequence and timestamp and write them into the header.
	fn advance(&mut self) {
		self.sequence = self.sequence.wrapping_add(1);
		self.timestamp = self.timestamp.wrapping_add(FRAME_SIZE);
		BigEndian::write_u16(&mut self.buffer[2..4], self.sequence);
		BigEndian::write_u32(&mut self.buffer[4..8], self.timestamp);
	}

	/// Frame and encrypt one Opus packet, returning the bytes to transmit.
	pub fn seal(&mut self, mode: EncryptionMode, key: &Key, opus: &[u8]) -> Result<&[u8]> {
		let len = RTP_HEADER_LEN + secretbox::MACBYTES + opus.len() + mode.nonce_suffix_len();
		if len > MAX_PACKET_SIZE {
			return Err(Error::Other("Opus frame too large for a voice packet"));
		}
		self.advance();

		let mut nonce = [0; secretbox::NONCEBYTES];
		let suffix_len = match mode {
			EncryptionMode::XSalsa20Poly1305 => {
				nonce[..RTP_HEADER_LEN].copy_from_slice(&self.buffer[..RTP_HEADER_LEN]);
				0
			}
			EncryptionMode::XSalsa20Poly1305Suffix => {
				OsRng.fill_bytes(&mut nonce);
				secretbox::NONCEBYTES
			}
			EncryptionMode::XSalsa20Poly1305Lite => {
				BigEndian::write_u32(&mut nonce[..4], self.lite_nonce);
				self.lite_nonce = self.lite_nonce.wrapping_add(1);
				4
			}
		};

		let sealed = secretbox::seal(opus, &secretbox::Nonce(nonce), key);
		let body_end = RTP_HEADER_LEN + sealed.len();
		self.buffer[RTP_HEADER_LEN..body_end].copy_from_slice(&sealed);
		self.buffer[body_end..body_end + suffix_len].copy_from_slice(&nonce[..suffix_len]);
		Ok(&self.buffer[..body_end + suffix_len])
	}
}

/// Check the marker and minimum length, returning the packet's SSRC.
pub fn ssrc_of(packet: &[u8]) -> Option<u32> {
	if packet.len() < RTP_HEADER_LEN || packet[..2] != RTP_MARKER {
		return None;
	}
	Some(BigEndian::read_u32(&packet[8..12]))
}

/// Rebuild the nonce for `mode` from a received packet and open its body.
pub fn open(mode: EncryptionMode, key: &Key, packet: &[u8]) -> Result<Vec<u8>> {
	let suffix_len = mode.nonce_suffix_len();
	if packet.len() < RTP_HEADER_LEN + suffix_len + secretbox::MACBYTES {
		return Err(Error::Crypto);
	}
	let end = packet.len() - suffix_len;

	let mut nonce = [0; secretbox::NONCEBYTES];
	match mode {
		EncryptionMode::XSalsa20Poly1305 => nonce[..RTP_HEADER_LEN].copy_from_slice(&packet[..RTP_HEADER_LEN]),
		EncryptionMode::XSalsa20Poly1305Suffix | EncryptionMode::XSalsa20Poly1305Lite => {
			nonce[..suffix_len].copy_from_slice(&packet[end..])
		}
	}

	secretbox::open(&packet[RTP_HEADER_LEN..end], &secretbox::Nonce(nonce), key).map_err(|()| Error::Crypto)
}

/// Build the 70-byte IP discovery request for `ssrc`.
pub fn discovery_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_LEN] {
	let mut request = [0; DISCOVERY_PACKET_LEN];
	BigEndian::write_u16(&mut request[0..2], 1);
	BigEndian::write_u16(&mut request[2..4], DISCOVERY_PACKET_LEN as u16);
	BigEndian::write_u32(&mut request[4..8], ssrc);
	request
}

/// Parse an IP discovery reply into our external address and port.
///
/// The address is a NUL-terminated string starting at offset 4; the port is
/// the big-endian u16 in the final two bytes.
pub fn parse_discovery_reply(reply: &[u8]) -> Result<(String, u16)> {
	if reply.len() < 8 {
		return Err(Error::Protocol("IP discovery reply too short"));
	}
	let port_at = reply.len() - 2;
	let address = &reply[4..port_at];
	let address = match address.iter().position(|&b| b == 0) {
		Some(nul) => &address[..nul],
		None => return Err(Error::Protocol("IP discovery reply address is not terminated")),
	};
	let address = ::std::str::from_utf8(address).map_err(|_| Error::Protocol("IP discovery reply address is not UTF-8"))?;
	if address.is_empty() {
		return Err(Error::Protocol("IP discovery reply address is empty"));
	}
	Ok((address.to_owned(), BigEndian::read_u16(&reply[port_at..])))
}
