//! End-to-end handshake against a local mock voice server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use discord_voice::packet::{self, Key, Outbound};
use discord_voice::*;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

const SSRC: u32 = 1234;
const SPEAKER: UserId = UserId(42);
const SPEAKER_SSRC: u32 = 777;
const KEY: [u8; 32] = [3; 32];
const WAIT: Duration = Duration::from_secs(5);

fn init_logging() {
	let _ = simplelog::TestLogger::init(simplelog::LevelFilter::Debug, simplelog::Config::default());
}

#[derive(Clone, Copy)]
enum Scenario {
	/// Complete the handshake on every connection.
	Full,
	/// Close every connection with this code right after Identify.
	CloseAfterIdentify(u16),
	/// Close the first connection with this code, then behave as `Full`.
	ReconnectOnce(u16),
	/// Heartbeat quickly and hold each IP discovery reply back this long.
	SlowDiscovery(Duration),
	/// Heartbeat quickly and leave the first connection's heartbeats unanswered.
	IgnoreHeartbeatsOnce,
}

impl Scenario {
	fn heartbeat_interval(self) -> f64 {
		match self {
			Scenario::SlowDiscovery(_) | Scenario::IgnoreHeartbeatsOnce => 100.0,
			_ => 41250.0,
		}
	}

	fn discovery_delay(self) -> Duration {
		match self {
			Scenario::SlowDiscovery(delay) => delay,
			_ => Duration::ZERO,
		}
	}
}

struct MockServer {
	endpoint: String,
	udp: Arc<UdpSocket>,
	events: mpsc::UnboundedReceiver<Value>,
	discoveries: mpsc::UnboundedReceiver<SocketAddr>,
	datagrams: mpsc::UnboundedReceiver<Vec<u8>>,
	accepted: Arc<AtomicUsize>,
}

impl MockServer {
	async fn start(scenario: Scenario) -> MockServer {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let endpoint = format!("ws://{}", listener.local_addr().unwrap());
		let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
		let udp_port = udp.local_addr().unwrap().port();

		let (events_tx, events) = mpsc::unbounded_channel();
		let (discoveries_tx, discoveries) = mpsc::unbounded_channel();
		let (datagrams_tx, datagrams) = mpsc::unbounded_channel();
		let accepted = Arc::new(AtomicUsize::new(0));
		tokio::spawn(serve(listener, scenario, udp_port, events_tx, accepted.clone()));
		tokio::spawn(respond(udp.clone(), scenario.discovery_delay(), discoveries_tx, datagrams_tx));

		MockServer {
			endpoint,
			udp,
			events,
			discoveries,
			datagrams,
			accepted,
		}
	}

	fn sessions(&self) -> usize {
		self.accepted.load(Ordering::SeqCst)
	}

	async fn next_event(&mut self) -> Value {
		timeout(WAIT, self.events.recv()).await.expect("timed out waiting for a gateway message").expect("server stopped")
	}

	async fn expect_op(&mut self, op: u64) -> Value {
		loop {
			let event = self.next_event().await;
			if event["op"].as_u64() == Some(op) {
				return event;
			}
		}
	}

	async fn expect_close(&mut self) -> Value {
		loop {
			let event = self.next_event().await;
			if event.get("close").is_some() {
				return event["close"].clone();
			}
		}
	}

	async fn next_datagram(&mut self) -> Vec<u8> {
		timeout(WAIT, self.datagrams.recv()).await.expect("timed out waiting for a datagram").expect("server stopped")
	}
}

async fn send(ws: &mut WebSocketStream<TcpStream>, value: Value) {
	let _ = ws.send(Message::Text(value.to_string())).await;
}

async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Option<Value> {
	loop {
		match ws.next().await {
			Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).ok(),
			Some(Ok(_)) => {}
			_ => return None,
		}
	}
}

async fn serve(listener: TcpListener, scenario: Scenario, udp_port: u16, events: mpsc::UnboundedSender<Value>, sessions: Arc<AtomicUsize>) {
	let mut accepted = 0;
	while let Ok((stream, _)) = listener.accept().await {
		let mut ws = match accept_async(stream).await {
			Ok(ws) => ws,
			Err(_) => continue,
		};
		match next_json(&mut ws).await {
			Some(identify) => {
				let _ = events.send(identify);
			}
			None => continue,
		}

		let close = match scenario {
			Scenario::CloseAfterIdentify(code) => Some(code),
			Scenario::ReconnectOnce(code) if accepted == 0 => Some(code),
			_ => None,
		};
		let first = accepted == 0;
		accepted += 1;
		sessions.store(accepted, Ordering::SeqCst);
		let ack = !(first && matches!(scenario, Scenario::IgnoreHeartbeatsOnce));
		match close {
			Some(code) => {
				let frame = CloseFrame {
					code: CloseCode::from(code),
					reason: "scripted".into(),
				};
				let _ = ws.close(Some(frame)).await;
				while let Some(Ok(_)) = ws.next().await {}
			}
			None => session(ws, udp_port, &events, scenario.heartbeat_interval(), ack).await,
		}
	}
}

async fn session(mut ws: WebSocketStream<TcpStream>, udp_port: u16, events: &mpsc::UnboundedSender<Value>, interval: f64, ack: bool) {
	send(&mut ws, json!({"op": 8, "d": {"heartbeat_interval": interval, "v": 4}})).await;
	send(&mut ws, json!({"op": 2, "d": {
		"ssrc": SSRC,
		"ip": "127.0.0.1",
		"port": udp_port,
		"modes": ["xsalsa20_poly1305", "xsalsa20_poly1305_suffix", "xsalsa20_poly1305_lite"],
		"heartbeat_interval": 1,
	}}))
	.await;

	while let Some(message) = ws.next().await {
		match message {
			Ok(Message::Text(text)) => {
				let value: Value = serde_json::from_str(&text).unwrap();
				match value["op"].as_u64() {
					Some(1) => {
						let mode = value["d"]["data"]["mode"].clone();
						send(&mut ws, json!({"op": 4, "d": {"mode": mode, "secret_key": KEY.to_vec()}})).await;
						send(&mut ws, json!({"op": 5, "d": {"user_id": SPEAKER.0.to_string(), "ssrc": SPEAKER_SSRC, "speaking": 1}})).await;
					}
					Some(3) if ack => send(&mut ws, json!({"op": 6, "d": value["d"].clone()})).await,
					_ => {}
				}
				let _ = events.send(value);
			}
			Ok(Message::Close(frame)) => {
				let _ = events.send(json!({"close": frame.map(|frame| u16::from(frame.code))}));
				break;
			}
			Ok(_) => {}
			Err(_) => break,
		}
	}
}

async fn respond(socket: Arc<UdpSocket>, delay: Duration, discoveries: mpsc::UnboundedSender<SocketAddr>, datagrams: mpsc::UnboundedSender<Vec<u8>>) {
	let mut buf = [0; 4096];
	while let Ok((len, from)) = socket.recv_from(&mut buf).await {
		if len == 70 && buf[..2] == [0, 1] {
			tokio::time::sleep(delay).await;
			let mut reply = [0; 70];
			reply[..4].copy_from_slice(&[0, 2, 0, 70]);
			reply[4..13].copy_from_slice(b"127.0.0.1");
			reply[68..].copy_from_slice(&from.port().to_be_bytes());
			let _ = socket.send_to(&reply, from).await;
			let _ = discoveries.send(from);
		} else {
			let _ = datagrams.send(buf[..len].to_vec());
		}
	}
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
	for _ in 0..500 {
		if check() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("timed out waiting for {}", what);
}

fn connection(server: &MockServer, mode: EncryptionMode) -> VoiceConnection {
	let config = VoiceConfig {
		mode,
		receive: Some(ReceiveMode::Opus),
		..VoiceConfig::default()
	};
	let conn = VoiceConnection::new(UserId(1), config);
	conn.voice_state_update(ServerId(10), ChannelId(11), "session");
	conn.voice_server_update(&server.endpoint, "token");
	conn
}

#[tokio::test]
async fn full_session() {
	init_logging();
	let mut server = MockServer::start(Scenario::Full).await;
	let conn = connection(&server, EncryptionMode::XSalsa20Poly1305Lite);

	timeout(WAIT, conn.connect()).await.expect("connect hung").expect("connect failed");
	assert!(conn.is_ready());
	assert_eq!(conn.state(), GatewayState::Established);
	assert_eq!(conn.ssrc(), Some(SSRC));
	assert_eq!(conn.mode(), Some(EncryptionMode::XSalsa20Poly1305Lite));

	let identify = server.expect_op(0).await;
	assert_eq!(identify["d"], json!({"server_id": "10", "user_id": "1", "session_id": "session", "token": "token"}));

	let client = timeout(WAIT, server.discoveries.recv()).await.unwrap().unwrap();
	let select = server.expect_op(1).await;
	assert_eq!(select["d"]["protocol"], "udp");
	assert_eq!(select["d"]["data"]["address"], "127.0.0.1");
	assert_eq!(select["d"]["data"]["port"], client.port());
	assert_eq!(select["d"]["data"]["mode"], "xsalsa20_poly1305_lite");
	eventually("a heartbeat acknowledgement", || conn.ping().is_some()).await;

	assert!(conn.set_speaking(Speaking::MICROPHONE | Speaking::PRIORITY));
	let speaking = server.expect_op(5).await;
	assert_eq!(speaking["d"], json!({"speaking": 5, "ssrc": SSRC, "delay": 0}));

	// audio from another participant lands in their queue
	eventually("the speaker mapping", || conn.speaker(SPEAKER_SSRC) == Some(SPEAKER)).await;
	let inbound = conn.inbound(SPEAKER);
	let mut outbound = Outbound::new();
	outbound.set_ssrc(SPEAKER_SSRC);
	let datagram = outbound.seal(EncryptionMode::XSalsa20Poly1305Lite, &Key(KEY), b"opus!").unwrap().to_vec();
	server.udp.send_to(&datagram, client).await.unwrap();
	assert_eq!(timeout(WAIT, inbound.recv()).await.unwrap(), Some(b"opus!".to_vec()));

	// our audio reaches the server
	let player = conn.player();
	player.start(Frames(vec![b"one".to_vec(), b"two".to_vec()].into_iter()));
	let first = server.next_datagram().await;
	assert_eq!(packet::ssrc_of(&first), Some(SSRC));
	assert_eq!(packet::open(EncryptionMode::XSalsa20Poly1305Lite, &Key(KEY), &first).unwrap(), b"one");
	let second = server.next_datagram().await;
	assert_eq!(packet::open(EncryptionMode::XSalsa20Poly1305Lite, &Key(KEY), &second).unwrap(), b"two");
	assert_eq!(server.expect_op(5).await["d"]["speaking"], 1);
	assert_eq!(server.expect_op(5).await["d"]["speaking"], 0);

	conn.close().await;
	assert_eq!(server.expect_close().await, 1000);
	assert_eq!(conn.state(), GatewayState::Closed);
	assert!(!conn.is_ready());
	assert_eq!(conn.mode(), None);
	assert!(!conn.set_speaking(Speaking::MICROPHONE));

	conn.close().await;
	assert_eq!(conn.state(), GatewayState::Closed);
}

#[tokio::test]
async fn disconnect_before_ready_fails_connect() {
	init_logging();
	for &code in &[4014, 4006] {
		let mut server = MockServer::start(Scenario::CloseAfterIdentify(code)).await;
		let conn = connection(&server, EncryptionMode::XSalsa20Poly1305);

		let result = timeout(WAIT, conn.connect()).await.expect("connect hung");
		match result {
			Err(Error::Closed(Some(closed), _)) => assert_eq!(closed, code),
			Err(other) => panic!("unexpected error for {}: {}", code, other),
			Ok(()) => panic!("connected despite close code {}", code),
		}
		assert_eq!(conn.state(), GatewayState::Closed);
		server.expect_op(0).await;
	}
}

#[tokio::test]
async fn reconnects_after_a_resumable_close() {
	init_logging();
	let mut server = MockServer::start(Scenario::ReconnectOnce(4015)).await;
	let conn = connection(&server, EncryptionMode::XSalsa20Poly1305Suffix);

	timeout(WAIT, conn.connect()).await.expect("connect hung").expect("connect failed");
	assert!(conn.is_ready());
	assert_eq!(conn.mode(), Some(EncryptionMode::XSalsa20Poly1305Suffix));
	server.expect_op(0).await;
	server.expect_op(0).await;

	conn.close().await;
}

#[tokio::test]
async fn unreachable_endpoint_fails_connect() {
	init_logging();
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let endpoint = format!("ws://{}", listener.local_addr().unwrap());
	drop(listener);

	let conn = VoiceConnection::new(UserId(1), VoiceConfig::default());
	conn.voice_state_update(ServerId(10), ChannelId(11), "session");
	conn.voice_server_update(&endpoint, "token");
	assert!(timeout(WAIT, conn.connect()).await.expect("connect hung").is_err());
	assert_eq!(conn.state(), GatewayState::Closed);
}

#[tokio::test]
async fn slow_discovery_keeps_the_session_alive() {
	init_logging();
	let mut server = MockServer::start(Scenario::SlowDiscovery(Duration::from_millis(400))).await;
	let conn = connection(&server, EncryptionMode::XSalsa20Poly1305);

	timeout(WAIT, conn.connect()).await.expect("connect hung").expect("connect failed");
	assert!(conn.is_ready());
	assert_eq!(server.sessions(), 1);

	// heartbeats kept flowing while discovery was outstanding
	server.expect_op(0).await;
	server.expect_op(3).await;
	server.expect_op(3).await;
	server.expect_op(1).await;
	assert!(conn.ping().is_some());
	assert_eq!(server.sessions(), 1);

	conn.close().await;
}

#[tokio::test]
async fn unanswered_heartbeats_force_a_reconnect() {
	init_logging();
	let mut server = MockServer::start(Scenario::IgnoreHeartbeatsOnce).await;
	let conn = connection(&server, EncryptionMode::XSalsa20Poly1305);

	timeout(WAIT, conn.connect()).await.expect("connect hung").expect("connect failed");
	server.expect_op(0).await;
	assert_eq!(server.expect_close().await, 1000);

	let identify = server.expect_op(0).await;
	assert_eq!(identify["d"]["session_id"], "session");
	eventually("the second session", || server.sessions() == 2 && conn.is_ready()).await;
	eventually("an acknowledged heartbeat", || conn.ping().is_some()).await;
	assert_eq!(conn.state(), GatewayState::Established);
	assert_eq!(server.sessions(), 2);

	conn.close().await;
	assert_eq!(conn.state(), GatewayState::Closed);
}
