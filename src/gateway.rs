//! The voice signaling session: handshake, heartbeats and reconnection.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::connection::VoiceConfig;
use crate::model::*;
use crate::packet::{self, Key};
use crate::udp::{self, VoiceUdp};
use crate::{lock, Error, Result};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Our external address and port, as learned by IP discovery.
type Discovered = Result<(String, u16)>;

/// Everything needed to identify with a voice server.
#[derive(Clone, Debug)]
pub struct Identity {
	pub server_id: ServerId,
	pub user_id: UserId,
	pub session_id: String,
	pub token: String,
	pub endpoint: String,
}

/// Build the websocket URL for a voice endpoint as handed out by the main gateway.
pub fn gateway_url(endpoint: &str) -> Result<Url> {
	let endpoint = endpoint.strip_suffix(":80").unwrap_or(endpoint);
	let mut url = if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
		Url::parse(endpoint)?
	} else {
		Url::parse(&format!("wss://{}", endpoint))?
	};
	url.query_pairs_mut().append_pair("v", &VOICE_GATEWAY_VERSION.to_string());
	Ok(url)
}

//=================
// SSRC map

#[derive(Default)]
struct SsrcTable {
	users: HashMap<u32, UserId>,
	ssrcs: HashMap<UserId, u32>,
}

/// Which remote user is sending on which SSRC.
///
/// Each user has at most one active SSRC; the most recent announcement wins.
#[derive(Clone, Default)]
pub struct SsrcMap(Arc<Mutex<SsrcTable>>);

impl SsrcMap {
	pub fn upsert(&self, user_id: UserId, ssrc: u32) {
		let mut table = lock(&self.0);
		if let Some(old) = table.ssrcs.insert(user_id, ssrc) {
			table.users.remove(&old);
		}
		if let Some(previous_owner) = table.users.insert(ssrc, user_id) {
			if previous_owner != user_id {
				table.ssrcs.remove(&previous_owner);
			}
		}
	}

	pub fn remove(&self, user_id: UserId) {
		let mut table = lock(&self.0);
		if let Some(ssrc) = table.ssrcs.remove(&user_id) {
			table.users.remove(&ssrc);
		}
	}

	pub fn user(&self, ssrc: u32) -> Option<UserId> {
		lock(&self.0).users.get(&ssrc).cloned()
	}

	pub fn ssrc(&self, user_id: UserId) -> Option<u32> {
		lock(&self.0).ssrcs.get(&user_id).cloned()
	}

	pub fn len(&self) -> usize {
		lock(&self.0).ssrcs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn clear(&self) {
		let mut table = lock(&self.0);
		table.users.clear();
		table.ssrcs.clear();
	}
}

//=================
// Close codes

/// What to do after the voice websocket closes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CloseAction {
	/// Open a new session with the same identity.
	Reconnect,
	/// Stop quietly; the session was ended on purpose.
	Terminal,
	/// Stop and report an error.
	Fatal,
}

/// Classify a close code. A close frame without a code is treated as 1005.
pub fn classify(code: Option<u16>) -> CloseAction {
	match code.unwrap_or(1005) {
		1000 | 1005 | 4001 | 4002 | 4005 | 4009 | 4015 => CloseAction::Reconnect,
		0 | 4014 => CloseAction::Terminal,
		_ => CloseAction::Fatal,
	}
}

//=================
// Heartbeats

/// Heartbeat bookkeeping for one session.
#[derive(Default, Debug)]
pub struct Heartbeat {
	interval: Option<Duration>,
	last_sent: Option<Instant>,
	last_ack: Option<Instant>,
	ping: Option<Duration>,
}

impl Heartbeat {
	pub fn interval(&self) -> Option<Duration> {
		self.interval
	}

	pub fn ping(&self) -> Option<Duration> {
		self.ping
	}

	pub fn sent(&mut self, at: Instant) {
		self.last_sent = Some(at);
	}

	/// Record an acknowledgement, returning the measured round trip.
	pub fn acked(&mut self, at: Instant) -> Option<Duration> {
		self.last_ack = Some(at);
		if let Some(sent) = self.last_sent {
			self.ping = Some(at.saturating_duration_since(sent));
		}
		self.ping
	}

	/// A heartbeat went out and nothing has acknowledged it since.
	pub fn is_dead(&self) -> bool {
		match (self.last_sent, self.last_ack) {
			(Some(sent), Some(ack)) => ack < sent,
			(Some(_), None) => true,
			(None, _) => false,
		}
	}
}

fn heartbeat_task(state: Arc<Mutex<Heartbeat>>, outbox: mpsc::UnboundedSender<Outgoing>, interval: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = time::interval(interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			let dead = {
				let mut heartbeat = lock(&state);
				if heartbeat.is_dead() {
					true
				} else {
					heartbeat.sent(Instant::now());
					false
				}
			};
			if dead {
				warn!("Voice heartbeat was not acknowledged, closing");
				let _ = outbox.send(Outgoing::Close(1000, "Dead connection".into()));
				return;
			}
			let nonce = Utc::now().timestamp_millis();
			if outbox.send(Outgoing::Message(heartbeat(nonce))).is_err() {
				return;
			}
		}
	})
}

//=================
// Handshake

/// Where the signaling session is in its lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GatewayState {
	Disconnected,
	Connecting,
	Identified,
	AwaitingReady,
	Negotiating,
	Established,
	Reconnecting,
	Closed,
}

impl fmt::Display for GatewayState {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

/// The action a received event calls for.
pub enum Step {
	StartHeartbeat(Duration),
	Discover { ssrc: u32, ip: String, port: u16 },
	Establish { key: Key, mode: EncryptionMode },
	MapSpeaker { user_id: UserId, ssrc: u32 },
	UnmapSpeaker(UserId),
	Acknowledged,
	Ignore,
}

/// The pure handshake state machine of one websocket session.
pub struct Handshake {
	state: GatewayState,
	mode: EncryptionMode,
}

impl Handshake {
	pub fn new(mode: EncryptionMode) -> Handshake {
		Handshake {
			state: GatewayState::Connecting,
			mode,
		}
	}

	pub fn state(&self) -> GatewayState {
		self.state
	}

	/// The websocket is open and Identify has been sent.
	pub fn identified(&mut self) {
		self.state = GatewayState::Identified;
	}

	pub fn advance(&mut self, event: VoiceEvent) -> Result<Step> {
		use self::GatewayState::*;

		match (self.state, event) {
			(state, VoiceEvent::Hello { heartbeat_interval }) => {
				if state == Identified {
					self.state = AwaitingReady;
				}
				Ok(Step::StartHeartbeat(heartbeat_interval))
			}
			(Identified, VoiceEvent::Ready { ssrc, ip, port, modes }) | (AwaitingReady, VoiceEvent::Ready { ssrc, ip, port, modes }) => {
				if !modes.iter().any(|mode| mode == self.mode.name()) {
					return Err(Error::Protocol("voice server does not offer the configured encryption mode"));
				}
				self.state = Negotiating;
				Ok(Step::Discover { ssrc, ip, port })
			}
			(_, VoiceEvent::Ready { .. }) => Err(Error::Protocol("Ready received out of order")),
			(Negotiating, VoiceEvent::SessionDescription { mode, secret_key })
			| (Established, VoiceEvent::SessionDescription { mode, secret_key }) => {
				let mode = match EncryptionMode::from_name(&mode) {
					Some(mode) => mode,
					None => return Err(Error::UnsupportedMode(mode)),
				};
				let key = packet::key_from_slice(&secret_key).ok_or(Error::Protocol("secret key must be 32 bytes"))?;
				self.state = Established;
				Ok(Step::Establish { key, mode })
			}
			(_, VoiceEvent::SessionDescription { .. }) => Err(Error::Protocol("SessionDescription received before Ready")),
			(_, VoiceEvent::Speaking { user_id, ssrc, .. }) => Ok(Step::MapSpeaker { user_id, ssrc }),
			(_, VoiceEvent::ClientDisconnect { user_id }) => Ok(Step::UnmapSpeaker(user_id)),
			(_, VoiceEvent::HeartbeatAck) => Ok(Step::Acknowledged),
			(_, VoiceEvent::Resumed) => {
				debug!("Voice session resumed");
				Ok(Step::Ignore)
			}
			(_, VoiceEvent::Unknown(op, data)) => {
				debug!("Unknown voice op {}: {}", op, data);
				Ok(Step::Ignore)
			}
		}
	}
}

//=================
// Driver

/// A request to the task that owns the websocket.
#[derive(Debug)]
pub enum Outgoing {
	Message(Value),
	Close(u16, String),
}

/// How one websocket session ended.
struct Ending {
	code: Option<u16>,
	reason: String,
	established: bool,
}

/// The signaling side of a voice connection.
pub struct Gateway {
	config: VoiceConfig,
	udp: Arc<VoiceUdp>,
	ssrcs: SsrcMap,
	state: Mutex<GatewayState>,
	ssrc: Mutex<Option<u32>>,
	heartbeat: Arc<Mutex<Heartbeat>>,
	heartbeat_task: Mutex<Option<JoinHandle<()>>>,
	outbox: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
	discovery: Mutex<Option<JoinHandle<()>>>,
	driver: Mutex<Option<JoinHandle<()>>>,
	closing: AtomicBool,
}

impl Gateway {
	pub fn new(config: VoiceConfig, udp: Arc<VoiceUdp>) -> Gateway {
		Gateway {
			config,
			udp,
			ssrcs: SsrcMap::default(),
			state: Mutex::new(GatewayState::Disconnected),
			ssrc: Mutex::new(None),
			heartbeat: Arc::new(Mutex::new(Heartbeat::default())),
			heartbeat_task: Mutex::new(None),
			outbox: Mutex::new(None),
			discovery: Mutex::new(None),
			driver: Mutex::new(None),
			closing: AtomicBool::new(false),
		}
	}

	pub fn state(&self) -> GatewayState {
		*lock(&self.state)
	}

	fn set_state(&self, state: GatewayState) {
		let mut current = lock(&self.state);
		if *current != state {
			debug!("Voice gateway: {} -> {}", *current, state);
			*current = state;
		}
	}

	pub fn is_ready(&self) -> bool {
		self.state() == GatewayState::Established
	}

	pub fn ping(&self) -> Option<Duration> {
		lock(&self.heartbeat).ping()
	}

	pub fn ssrc(&self) -> Option<u32> {
		*lock(&self.ssrc)
	}

	pub fn ssrcs(&self) -> &SsrcMap {
		&self.ssrcs
	}

	/// Queue a message for the websocket. Returns `false` if no channel is open.
	pub fn send(&self, message: Value) -> bool {
		match *lock(&self.outbox) {
			Some(ref outbox) => outbox.send(Outgoing::Message(message)).is_ok(),
			None => false,
		}
	}

	pub fn set_speaking(&self, flags: Speaking) -> bool {
		match self.ssrc() {
			Some(ssrc) => self.send(speaking(flags, ssrc, 0)),
			None => false,
		}
	}

	fn start_heartbeat(&self, interval: Duration) {
		let outbox = match *lock(&self.outbox) {
			Some(ref outbox) => outbox.clone(),
			None => return,
		};
		lock(&self.heartbeat).interval = Some(interval);
		debug!("Voice heartbeat every {:?}", interval);
		let task = heartbeat_task(self.heartbeat.clone(), outbox, interval);
		if let Some(previous) = lock(&self.heartbeat_task).replace(task) {
			previous.abort();
		}
	}

	pub fn stop_heartbeat(&self) {
		if let Some(task) = lock(&self.heartbeat_task).take() {
			task.abort();
		}
	}

	fn stop_discovery(&self) {
		if let Some(task) = lock(&self.discovery).take() {
			task.abort();
		}
	}

	/// Run the handshake, resolving once the first session is established.
	///
	/// The session keeps running in the background afterwards, reconnecting
	/// when the server asks for it.
	pub async fn connect(self: &Arc<Self>, identity: Identity) -> Result<()> {
		if let Some(driver) = lock(&self.driver).take() {
			driver.abort();
		}
		self.stop_heartbeat();
		self.stop_discovery();
		self.closing.store(false, Ordering::SeqCst);

		let (tx, rx) = oneshot::channel();
		let driver = tokio::spawn(run(self.clone(), identity, tx));
		*lock(&self.driver) = Some(driver);
		rx.await.unwrap_or(Err(Error::Other("voice gateway stopped before the session was established")))
	}

	/// Close the websocket, ending the session for good.
	pub async fn close(&self) {
		self.closing.store(true, Ordering::SeqCst);
		self.stop_heartbeat();
		self.stop_discovery();
		let outbox = lock(&self.outbox).take();
		let driver = lock(&self.driver).take();
		if let Some(mut driver) = driver {
			let requested = outbox.map_or(false, |outbox| outbox.send(Outgoing::Close(1000, "Closing".into())).is_ok());
			if !requested || time::timeout(CLOSE_GRACE, &mut driver).await.is_err() {
				driver.abort();
			}
		}
		self.ssrcs.clear();
		*lock(&self.ssrc) = None;
		self.set_state(GatewayState::Closed);
	}

	/// One websocket session, from opening the socket to its close.
	async fn session(&self, identity: &Identity, ready: &mut Option<oneshot::Sender<Result<()>>>) -> Result<Ending> {
		self.ssrcs.clear();
		*lock(&self.heartbeat) = Heartbeat::default();
		self.set_state(GatewayState::Connecting);

		let url = gateway_url(&identity.endpoint)?;
		debug!("Voice gateway: {}", url);
		let (socket, _) = connect_async(url.as_str()).await?;
		let (mut sink, mut stream) = socket.split();

		let (tx, mut rx) = mpsc::unbounded_channel();
		*lock(&self.outbox) = Some(tx);
		let (found, mut discovered) = mpsc::unbounded_channel();

		let mut handshake = Handshake::new(self.config.mode);
		let hello = identify(identity.server_id, identity.user_id, &identity.session_id, &identity.token);
		sink.send(Message::Text(hello.to_string())).await?;
		handshake.identified();
		self.set_state(handshake.state());

		let mut established = false;
		loop {
			tokio::select! {
				outgoing = rx.recv() => match outgoing {
					Some(Outgoing::Message(message)) => sink.send(Message::Text(message.to_string())).await?,
					Some(Outgoing::Close(code, reason)) => {
						let frame = CloseFrame { code: CloseCode::from(code), reason: reason.clone().into() };
						if let Err(err) = sink.send(Message::Close(Some(frame))).await {
							debug!("Error sending voice close frame: {}", err);
						}
						return Ok(Ending { code: Some(code), reason, established });
					}
					None => return Ok(Ending { code: Some(1000), reason: "outbox dropped".into(), established }),
				},
				message = stream.next() => match message {
					Some(Ok(Message::Text(text))) => {
						self.handle(&mut handshake, &text, &found)?;
						if !established && handshake.state() == GatewayState::Established {
							established = true;
							if let Some(ready) = ready.take() {
								let _ = ready.send(Ok(()));
							}
						}
					}
					Some(Ok(Message::Close(frame))) => {
						return Ok(match frame {
							Some(frame) => Ending { code: Some(frame.code.into()), reason: frame.reason.into_owned(), established },
							None => Ending { code: None, reason: String::new(), established },
						});
					}
					Some(Ok(_)) => {}
					Some(Err(err)) => return Ok(Ending { code: Some(1006), reason: err.to_string(), established }),
					None => return Ok(Ending { code: Some(1006), reason: "connection dropped".into(), established }),
				},
				outcome = discovered.recv() => match outcome {
					Some(Ok((address, port))) => self.discovered(&address, port)?,
					Some(Err(err)) => return Err(err),
					None => {}
				},
			}
		}
	}

	fn handle(&self, handshake: &mut Handshake, text: &str, found: &mpsc::UnboundedSender<Discovered>) -> Result<()> {
		let event = match VoiceEvent::from_text(text) {
			Ok(event) => event,
			Err(err) => {
				warn!("Undecodable voice gateway message: {}", err);
				return Ok(());
			}
		};
		let step = handshake.advance(event)?;
		self.set_state(handshake.state());
		match step {
			Step::StartHeartbeat(interval) => self.start_heartbeat(interval),
			Step::Discover { ssrc, ip, port } => {
				*lock(&self.ssrc) = Some(ssrc);
				let udp = self.udp.clone();
				let (timeout, attempts) = (self.config.discovery_timeout, self.config.discovery_attempts);
				let found = found.clone();
				let task = tokio::spawn(async move {
					let _ = found.send(discover(&udp, ssrc, &ip, port, timeout, attempts).await);
				});
				if let Some(previous) = lock(&self.discovery).replace(task) {
					previous.abort();
				}
			}
			Step::Establish { key, mode } => {
				self.udp.set_session(key, mode);
				info!("Voice session established using {}", mode);
			}
			Step::MapSpeaker { user_id, ssrc } => self.ssrcs.upsert(user_id, ssrc),
			Step::UnmapSpeaker(user_id) => {
				self.ssrcs.remove(user_id);
				self.udp.forget(user_id);
			}
			Step::Acknowledged => {
				if let Some(ping) = lock(&self.heartbeat).acked(Instant::now()) {
					debug!("Voice ping: {:?}", ping);
				}
			}
			Step::Ignore => {}
		}
		Ok(())
	}

	/// IP discovery finished: start receiving and tell the server where to send.
	fn discovered(&self, address: &str, port: u16) -> Result<()> {
		if let Some(mode) = self.config.receive {
			self.udp.start_receiving(self.ssrcs.clone(), mode)?;
		}
		self.send(select_protocol(address, port, self.config.mode));
		Ok(())
	}
}

/// Bind a fresh socket and learn our external address through the voice server at `ip:port`.
async fn discover(transport: &VoiceUdp, ssrc: u32, ip: &str, port: u16, timeout: Duration, attempts: u32) -> Discovered {
	transport.bind().await?;
	transport.set_ssrc(ssrc);
	let remote = udp::resolve(ip, port).await?;
	transport.set_remote(remote);
	transport.discover_address(ssrc, remote, timeout, attempts).await
}

/// Drive sessions until one ends in a way that does not allow reconnecting.
async fn run(gateway: Arc<Gateway>, identity: Identity, ready: oneshot::Sender<Result<()>>) {
	let mut ready = Some(ready);
	loop {
		let outcome = gateway.session(&identity, &mut ready).await;
		gateway.stop_heartbeat();
		gateway.stop_discovery();
		lock(&gateway.outbox).take();

		let error = match outcome {
			Ok(Ending { code, reason, .. }) if gateway.closing.load(Ordering::SeqCst) => {
				debug!("Voice gateway closed by owner ({:?}: {})", code, reason);
				Error::Closed(code, reason)
			}
			Ok(Ending { code, reason, established }) => match classify(code) {
				CloseAction::Reconnect => {
					info!("Voice gateway closed ({:?}: {}), reconnecting", code, reason);
					gateway.set_state(GatewayState::Reconnecting);
					if !established {
						time::sleep(RECONNECT_DELAY).await;
					}
					continue;
				}
				CloseAction::Terminal => {
					info!("Voice gateway closed ({:?}: {})", code, reason);
					Error::Closed(code, reason)
				}
				CloseAction::Fatal => Error::Closed(code, reason),
			},
			Err(err) => err,
		};

		gateway.udp.close();
		gateway.set_state(GatewayState::Closed);
		match ready.take() {
			Some(ready) => {
				let _ = ready.send(Err(error));
			}
			None => match error {
				Error::Closed(code, _) if classify(code) != CloseAction::Fatal => {}
				_ if gateway.closing.load(Ordering::SeqCst) => {}
				error => error!("Voice gateway failed: {}", error),
			},
		}
		return;
	}
}
