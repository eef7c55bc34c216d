//! The voice connection handle tying signaling, transport and playback together.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::gateway::{Gateway, GatewayState, Identity};
use crate::model::*;
use crate::player::{Player, VoiceSink};
use crate::udp::{InboundAudio, VoiceUdp};
use crate::{lock, Error, Result};

/// Tunables for a voice connection.
#[derive(Clone, Debug)]
pub struct VoiceConfig {
	/// Encryption mode requested from the server.
	pub mode: EncryptionMode,
	/// Start the receive loop and publish audio in this form; `None` ignores inbound audio.
	pub receive: Option<ReceiveMode>,
	/// How long to wait for each IP discovery reply.
	pub discovery_timeout: Duration,
	/// How many IP discovery requests to send before giving up.
	pub discovery_attempts: u32,
}

impl Default for VoiceConfig {
	fn default() -> VoiceConfig {
		VoiceConfig {
			mode: EncryptionMode::default(),
			receive: None,
			discovery_timeout: Duration::from_secs(5),
			discovery_attempts: 3,
		}
	}
}

#[derive(Default)]
struct Settings {
	server_id: Option<ServerId>,
	channel_id: Option<ChannelId>,
	session_id: Option<String>,
	endpoint: Option<String>,
	token: Option<String>,
}

/// The path a player's frames take out of the connection.
struct Link {
	gateway: Arc<Gateway>,
	udp: Arc<VoiceUdp>,
}

#[async_trait]
impl VoiceSink for Link {
	async fn send_frame(&self, frame: &[u8]) -> Result<()> {
		self.udp.send(frame).await
	}

	fn set_speaking(&self, flags: Speaking) -> bool {
		self.gateway.set_speaking(flags)
	}
}

struct Inner {
	user_id: UserId,
	config: VoiceConfig,
	settings: Mutex<Settings>,
	gateway: Arc<Gateway>,
	udp: Arc<VoiceUdp>,
	player: Mutex<Option<Player>>,
}

/// A connection to one voice channel.
///
/// Feed it the voice state and voice server details from the main gateway,
/// then `connect`. Clones share the same connection.
#[derive(Clone)]
pub struct VoiceConnection(Arc<Inner>);

impl VoiceConnection {
	pub fn new(user_id: UserId, config: VoiceConfig) -> VoiceConnection {
		let udp = Arc::new(VoiceUdp::new());
		let gateway = Arc::new(Gateway::new(config.clone(), udp.clone()));
		VoiceConnection(Arc::new(Inner {
			user_id,
			config,
			settings: Mutex::new(Settings::default()),
			gateway,
			udp,
			player: Mutex::new(None),
		}))
	}

	pub fn user_id(&self) -> UserId {
		self.0.user_id
	}

	pub fn config(&self) -> &VoiceConfig {
		&self.0.config
	}

	/// Record the session this user has in the voice channel.
	pub fn voice_state_update(&self, server_id: ServerId, channel_id: ChannelId, session_id: &str) {
		let mut settings = lock(&self.0.settings);
		settings.server_id = Some(server_id);
		settings.channel_id = Some(channel_id);
		settings.session_id = Some(session_id.to_owned());
	}

	/// Record the voice server assigned to the channel.
	pub fn voice_server_update(&self, endpoint: &str, token: &str) {
		let mut settings = lock(&self.0.settings);
		settings.endpoint = Some(endpoint.to_owned());
		settings.token = Some(token.to_owned());
	}

	pub fn server_id(&self) -> Option<ServerId> {
		lock(&self.0.settings).server_id
	}

	pub fn channel_id(&self) -> Option<ChannelId> {
		lock(&self.0.settings).channel_id
	}

	fn identity(&self) -> Result<Identity> {
		let settings = lock(&self.0.settings);
		Ok(Identity {
			server_id: settings.server_id.ok_or(Error::Config("server id"))?,
			user_id: self.0.user_id,
			session_id: settings.session_id.clone().ok_or(Error::Config("session id"))?,
			token: settings.token.clone().ok_or(Error::Config("token"))?,
			endpoint: settings.endpoint.clone().ok_or(Error::Config("endpoint"))?,
		})
	}

	/// Open the voice session, returning once audio can be sent.
	pub async fn connect(&self) -> Result<()> {
		let identity = self.identity()?;
		info!("Connecting to voice server {} for server {}", identity.endpoint, identity.server_id);
		self.0.gateway.connect(identity).await
	}

	/// Announce the speaking flags. Returns `false` if no session is open.
	pub fn set_speaking(&self, flags: Speaking) -> bool {
		self.0.gateway.set_speaking(flags)
	}

	/// Create the connection's player, retiring any previous one.
	pub fn player(&self) -> Player {
		let player = Player::new(Arc::new(Link {
			gateway: self.0.gateway.clone(),
			udp: self.0.udp.clone(),
		}));
		if let Some(previous) = lock(&self.0.player).replace(player.clone()) {
			previous.deactivate();
		}
		player
	}

	/// Encode and play raw PCM on a fresh player.
	#[cfg(feature = "codec")]
	pub fn play_pcm<S: crate::pcm::PcmSource + 'static>(&self, source: S) -> Result<Player> {
		let source = crate::codec::Encoded::new(source)?;
		let player = self.player();
		player.start(source);
		Ok(player)
	}

	/// Audio received from `user_id`.
	pub fn inbound(&self, user_id: UserId) -> InboundAudio {
		self.0.udp.inbound(user_id)
	}

	/// Tear the connection down: playback, heartbeats, receiving, the
	/// websocket and finally the socket. Safe to call more than once.
	pub async fn close(&self) {
		let player = lock(&self.0.player).take();
		if let Some(player) = player {
			player.stop();
		}
		self.0.gateway.stop_heartbeat();
		self.0.udp.stop_receiving();
		self.0.gateway.close().await;
		self.0.udp.close();
	}

	pub fn is_ready(&self) -> bool {
		self.0.gateway.is_ready()
	}

	/// Round trip of the last acknowledged heartbeat.
	pub fn ping(&self) -> Option<Duration> {
		self.0.gateway.ping()
	}

	pub fn ssrc(&self) -> Option<u32> {
		self.0.gateway.ssrc()
	}

	pub fn mode(&self) -> Option<EncryptionMode> {
		self.0.udp.mode()
	}

	pub fn state(&self) -> GatewayState {
		self.0.gateway.state()
	}

	/// Which user is speaking on `ssrc`, as last announced.
	pub fn speaker(&self, ssrc: u32) -> Option<UserId> {
		self.0.gateway.ssrcs().user(ssrc)
	}
}
