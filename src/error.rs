use std::error::Error as StdError;
use std::fmt::Display;
use std::io::Error as IoError;

#[cfg(feature = "codec")]
use opus::Error as OpusError;
use serde_json::Error as JsonError;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Error as WsError;
use url::ParseError as UrlError;

/// Voice client `Result` alias type.
pub type Result<T> = ::std::result::Result<T, Error>;

/// Voice client error type.
#[derive(Debug)]
pub enum Error {
	/// A `serde_json` crate error
	Json(JsonError),
	/// A `tungstenite` crate error
	WebSocket(WsError),
	/// A `std::io` module error
	Io(IoError),
	/// The voice endpoint could not be turned into a URL
	Url(UrlError),
	/// An `opus` crate error
	#[cfg(feature = "codec")]
	Opus(OpusError),
	/// A json decoding error, with a description and the offending value
	Decode(&'static str, Value),
	/// Identity fields required to connect were missing
	Config(&'static str),
	/// The voice server violated the handshake protocol
	Protocol(&'static str),
	/// The negotiated or configured encryption mode is not usable
	UnsupportedMode(String),
	/// The voice gateway closed with a code that does not allow reconnecting
	Closed(Option<u16>, String),
	/// A packet failed to authenticate or was too short to open
	Crypto,
	/// A bounded wait ran out
	Timeout(&'static str),
	/// A miscellaneous error, with a description
	Other(&'static str),
}

impl From<IoError> for Error {
	fn from(err: IoError) -> Error {
		Error::Io(err)
	}
}

impl From<JsonError> for Error {
	fn from(err: JsonError) -> Error {
		Error::Json(err)
	}
}

impl From<WsError> for Error {
	fn from(err: WsError) -> Error {
		Error::WebSocket(err)
	}
}

impl From<UrlError> for Error {
	fn from(err: UrlError) -> Error {
		Error::Url(err)
	}
}

#[cfg(feature = "codec")]
impl From<OpusError> for Error {
	fn from(err: OpusError) -> Error {
		Error::Opus(err)
	}
}

impl Display for Error {
	fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
		match *self {
			Error::Json(ref inner) => inner.fmt(f),
			Error::WebSocket(ref inner) => inner.fmt(f),
			Error::Io(ref inner) => inner.fmt(f),
			Error::Url(ref inner) => inner.fmt(f),
			#[cfg(feature = "codec")]
			Error::Opus(ref inner) => inner.fmt(f),
			Error::Decode(msg, ref value) => write!(f, "json decode error: {} in {}", msg, value),
			Error::Config(msg) => write!(f, "missing connection settings: {}", msg),
			Error::Protocol(msg) => write!(f, "voice protocol error: {}", msg),
			Error::UnsupportedMode(ref mode) => write!(f, "unsupported encryption mode {:?}", mode),
			Error::Closed(Some(code), ref reason) => write!(f, "voice gateway closed with code {}: {}", code, reason),
			Error::Closed(None, ref reason) => write!(f, "voice gateway closed: {}", reason),
			Error::Crypto => f.write_str("packet decryption failed"),
			Error::Timeout(what) => write!(f, "timed out waiting for {}", what),
			Error::Other(msg) => f.write_str(msg),
		}
	}
}

impl StdError for Error {
	fn source(&self) -> Option<&(dyn StdError + 'static)> {
		match *self {
			Error::Json(ref inner) => Some(inner),
			Error::WebSocket(ref inner) => Some(inner),
			Error::Io(ref inner) => Some(inner),
			Error::Url(ref inner) => Some(inner),
			#[cfg(feature = "codec")]
			Error::Opus(ref inner) => Some(inner),
			_ => None,
		}
	}
}
