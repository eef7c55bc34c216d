//! The encrypted UDP voice transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use crate::gateway::SsrcMap;
use crate::model::*;
use crate::packet::{self, Key, Outbound};
use crate::{lock, Error, Result};

/// Received audio for one remote user.
///
/// The queue lives as long as the transport; clones share it.
#[derive(Clone)]
pub struct InboundAudio {
	user_id: UserId,
	queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl InboundAudio {
	pub fn user_id(&self) -> UserId {
		self.user_id
	}

	/// Wait for the next payload from this user.
	pub async fn recv(&self) -> Option<Vec<u8>> {
		self.queue.lock().await.recv().await
	}

	/// Take the next payload if one is already queued.
	pub fn try_recv(&self) -> Option<Vec<u8>> {
		self.queue.try_lock().ok()?.try_recv().ok()
	}
}

#[derive(Default)]
struct Crypt {
	outbound: Outbound,
	session: Option<(Key, EncryptionMode)>,
	remote: Option<SocketAddr>,
}

/// Owns the voice socket, the outbound packet state and the inbound queues.
pub struct VoiceUdp {
	socket: Mutex<Option<Arc<UdpSocket>>>,
	crypt: Mutex<Crypt>,
	receivers: Mutex<HashMap<UserId, (mpsc::UnboundedSender<Vec<u8>>, InboundAudio)>>,
	#[cfg(feature = "codec")]
	decoders: Mutex<HashMap<UserId, crate::codec::Decoder>>,
	recv_task: Mutex<Option<JoinHandle<()>>>,
	dropped: AtomicU64,
}

impl Default for VoiceUdp {
	fn default() -> VoiceUdp {
		VoiceUdp::new()
	}
}

impl VoiceUdp {
	pub fn new() -> VoiceUdp {
		if sodiumoxide::init().is_err() {
			warn!("libsodium failed to initialize");
		}
		VoiceUdp {
			socket: Mutex::new(None),
			crypt: Mutex::new(Crypt::default()),
			receivers: Mutex::new(HashMap::new()),
			#[cfg(feature = "codec")]
			decoders: Mutex::new(HashMap::new()),
			recv_task: Mutex::new(None),
			dropped: AtomicU64::new(0),
		}
	}

	fn socket(&self) -> Result<Arc<UdpSocket>> {
		lock(&self.socket).clone().ok_or(Error::Other("voice socket is not bound"))
	}

	pub fn stop_receiving(&self) {
		if let Some(task) = lock(&self.recv_task).take() {
			task.abort();
		}
	}

	/// Open a fresh ephemeral socket, closing any previous one first.
	pub async fn bind(&self) -> Result<SocketAddr> {
		self.stop_receiving();
		lock(&self.socket).take();
		let socket = UdpSocket::bind("0.0.0.0:0").await?;
		let local = socket.local_addr()?;
		debug!("Voice socket bound to {}", local);
		*lock(&self.socket) = Some(Arc::new(socket));
		Ok(local)
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		Ok(self.socket()?.local_addr()?)
	}

	pub fn set_ssrc(&self, ssrc: u32) {
		lock(&self.crypt).outbound.set_ssrc(ssrc);
	}

	pub fn set_remote(&self, remote: SocketAddr) {
		lock(&self.crypt).remote = Some(remote);
	}

	/// Install the negotiated key and mode; audio may be sent from now on.
	pub fn set_session(&self, key: Key, mode: EncryptionMode) {
		lock(&self.crypt).session = Some((key, mode));
	}

	pub fn mode(&self) -> Option<EncryptionMode> {
		lock(&self.crypt).session.as_ref().map(|&(_, mode)| mode)
	}

	/// Number of inbound packets discarded because they failed to open.
	pub fn dropped(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}

	/// Learn our external address by echoing a discovery request off `remote`.
	pub async fn discover_address(&self, ssrc: u32, remote: SocketAddr, timeout: Duration, attempts: u32) -> Result<(String, u16)> {
		let socket = self.socket()?;
		let request = packet::discovery_request(ssrc);
		let mut reply = vec![0; MAX_PACKET_SIZE];
		for attempt in 1..=attempts {
			socket.send_to(&request, remote).await?;
			match time::timeout(timeout, socket.recv_from(&mut reply)).await {
				Ok(Ok((len, _))) => {
					let (address, port) = packet::parse_discovery_reply(&reply[..len])?;
					debug!("Discovered external address {}:{}", address, port);
					return Ok((address, port));
				}
				Ok(Err(err)) => return Err(err.into()),
				Err(_) => warn!("IP discovery attempt {}/{} to {} timed out", attempt, attempts, remote),
			}
		}
		Err(Error::Timeout("IP discovery"))
	}

	/// Frame, encrypt and transmit one Opus frame.
	pub async fn send(&self, opus: &[u8]) -> Result<()> {
		let (socket, packet, remote) = {
			let mut crypt = lock(&self.crypt);
			let Crypt { ref mut outbound, ref session, remote } = *crypt;
			let (key, mode) = match *session {
				Some((ref key, mode)) => (key, mode),
				None => return Err(Error::UnsupportedMode("no session negotiated".into())),
			};
			let socket = self.socket()?;
			let remote = remote.ok_or(Error::Other("voice server address is unknown"))?;
			(socket, outbound.seal(mode, key, opus)?.to_vec(), remote)
		};
		socket.send_to(&packet, remote).await?;
		Ok(())
	}

	/// Spawn the receive loop, demultiplexing packets by SSRC into user queues.
	pub fn start_receiving(self: &Arc<Self>, ssrcs: SsrcMap, mode: ReceiveMode) -> Result<()> {
		let socket = self.socket()?;
		let udp = Arc::downgrade(self);
		let task = tokio::spawn(async move {
			let mut buffer = vec![0; MAX_PACKET_SIZE];
			loop {
				let len = match socket.recv_from(&mut buffer).await {
					Ok((len, _)) => len,
					Err(err) => {
						warn!("Voice socket receive failed: {}", err);
						break;
					}
				};
				match udp.upgrade() {
					Some(udp) => {
						udp.receive_datagram(&buffer[..len], &ssrcs, mode);
					}
					None => break,
				}
			}
		});
		if let Some(previous) = lock(&self.recv_task).replace(task) {
			previous.abort();
		}
		Ok(())
	}

	/// Handle one inbound datagram, returning whether it reached a user queue.
	pub fn receive_datagram(&self, datagram: &[u8], ssrcs: &SsrcMap, mode: ReceiveMode) -> bool {
		let user_id = match packet::ssrc_of(datagram).and_then(|ssrc| ssrcs.user(ssrc)) {
			Some(user_id) => user_id,
			None => return false,
		};
		let (key, encryption) = match lock(&self.crypt).session {
			Some((ref key, encryption)) => (key.clone(), encryption),
			None => return false,
		};
		let payload = match packet::open(encryption, &key, datagram) {
			Ok(payload) => payload,
			Err(err) => {
				let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
				debug!("Dropping packet from {}: {} ({} dropped)", user_id, err, dropped);
				return false;
			}
		};
		let payload = match mode {
			ReceiveMode::Opus => payload,
			#[cfg(feature = "codec")]
			ReceiveMode::Pcm => match self.decode(user_id, &payload) {
				Some(pcm) => pcm,
				None => return false,
			},
		};
		self.queue(user_id).0.send(payload).is_ok()
	}

	#[cfg(feature = "codec")]
	fn decode(&self, user_id: UserId, opus: &[u8]) -> Option<Vec<u8>> {
		use byteorder::{ByteOrder, LittleEndian};

		let mut decoders = lock(&self.decoders);
		let decoder = match decoders.entry(user_id) {
			::std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
			::std::collections::hash_map::Entry::Vacant(entry) => match crate::codec::Decoder::new() {
				Ok(decoder) => entry.insert(decoder),
				Err(err) => {
					warn!("Could not create a decoder for {}: {}", user_id, err);
					return None;
				}
			},
		};
		match decoder.decode(opus) {
			Ok(samples) => {
				let mut bytes = vec![0; samples.len() * 2];
				LittleEndian::write_i16_into(&samples, &mut bytes);
				Some(bytes)
			}
			Err(err) => {
				debug!("Could not decode audio from {}: {}", user_id, err);
				None
			}
		}
	}

	fn queue(&self, user_id: UserId) -> (mpsc::UnboundedSender<Vec<u8>>, InboundAudio) {
		lock(&self.receivers)
			.entry(user_id)
			.or_insert_with(|| {
				let (tx, rx) = mpsc::unbounded_channel();
				let inbound = InboundAudio {
					user_id,
					queue: Arc::new(tokio::sync::Mutex::new(rx)),
				};
				(tx, inbound)
			})
			.clone()
	}

	/// The inbound queue for `user_id`, created on first use.
	pub fn inbound(&self, user_id: UserId) -> InboundAudio {
		self.queue(user_id).1
	}

	/// Release what is held for a user who left: their decoder and queue.
	///
	/// Handles already given out still yield what was queued, then `None`.
	pub fn forget(&self, user_id: UserId) {
		lock(&self.receivers).remove(&user_id);
		#[cfg(feature = "codec")]
		lock(&self.decoders).remove(&user_id);
	}

	/// Stop receiving, drop the socket and forget the key. Queues are kept.
	pub fn close(&self) {
		self.stop_receiving();
		lock(&self.socket).take();
		let mut crypt = lock(&self.crypt);
		crypt.session = None;
		crypt.remote = None;
	}
}

/// Resolve the voice server's advertised address.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
	lookup_host((host, port)).await?.next().ok_or(Error::Other("voice server address did not resolve"))
}
