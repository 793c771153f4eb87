//! rfc 6455 websocket endpoint toolkit
//!
//! one crate for both ends of a websocket connection: dial out with
//! [Endpoint::connect], accept with [Endpoint::server] or
//! [Endpoint::secure_server], and receive events through a [WsHandler].
//! framing, masking, fragmentation, the close handshake and ping based
//! liveness all live in the connection machine; tls is delegated to an
//! opaque [SecureContext].

#![warn(missing_docs)]

use std::time::Duration;

pub use http;

/// frame encoder/decoder over a read buffer
pub mod codec;
/// per connection state machine & handler contract
pub mod connection;
/// registry of live connections and servers
pub mod endpoint;
/// websocket error definitions
pub mod errors;
/// websocket transport unit
pub mod frame;
/// close codes & http upgrade engine
pub mod protocol;
/// listening socket & accept loop
pub mod server;
/// stream definition
pub mod stream;
/// tls material provider
pub mod tls;

pub use codec::Role;
pub use connection::{CloseStatus, Phase, WsConn, WsHandler};
pub use endpoint::Endpoint;
pub use errors::{ProtocolError, WsError};
pub use frame::{Frame, Message, OpCode};
pub use protocol::close_code;
pub use server::WsServer;
pub use stream::WsStream;
pub use tls::{ClientAuth, SecureContext};

use protocol::Mode;

pub(crate) fn check_uri(uri: &http::Uri) -> Result<Mode, WsError> {
    if let Some(scheme) = uri.scheme_str() {
        match scheme.to_lowercase().as_str() {
            "ws" => Ok(Mode::Ws),
            "wss" => Ok(Mode::Wss),
            s => Err(WsError::InvalidUri(format!("unknown scheme {s}"))),
        }
    } else {
        Err(WsError::InvalidUri("missing scheme".into()))
    }
}

/// connection and server tunables
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// read deadline for the http upgrade, nothing else
    pub handshake_so_timeout: Duration,
    /// per frame read deadline, also paces the ping policy
    pub connection_so_timeout: Duration,
    /// probe a silent peer with a ping before giving up on it
    pub ping: bool,
    /// largest acceptable message, enforced per frame and on reassembly
    pub max_message_length: u64,
    /// outbound fragmentation threshold
    pub payload_buffer_length: usize,
    /// listen backlog for servers
    pub backlog: u32,
    /// connections one server keeps open concurrently
    pub max_connections: usize,
    /// subprotocols offered by a client or accepted by a server
    pub subprotocols: Vec<String>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            handshake_so_timeout: Duration::from_secs(30),
            connection_so_timeout: Duration::from_secs(60),
            ping: true,
            max_message_length: 1 << 20,
            payload_buffer_length: 16 * 1024,
            backlog: 128,
            max_connections: 8,
            subprotocols: vec![],
        }
    }
}

impl WsConfig {
    /// config with the defaults above
    pub fn new() -> Self {
        Default::default()
    }

    /// set handshake read deadline
    pub fn handshake_so_timeout(self, handshake_so_timeout: Duration) -> Self {
        Self {
            handshake_so_timeout,
            ..self
        }
    }

    /// set per frame read deadline
    pub fn connection_so_timeout(self, connection_so_timeout: Duration) -> Self {
        Self {
            connection_so_timeout,
            ..self
        }
    }

    /// enable or disable the ping policy
    pub fn ping(self, ping: bool) -> Self {
        Self { ping, ..self }
    }

    /// set largest acceptable message length
    pub fn max_message_length(self, max_message_length: u64) -> Self {
        Self {
            max_message_length,
            ..self
        }
    }

    /// set outbound fragment size
    pub fn payload_buffer_length(self, payload_buffer_length: usize) -> Self {
        Self {
            payload_buffer_length,
            ..self
        }
    }

    /// set listen backlog
    pub fn backlog(self, backlog: u32) -> Self {
        Self { backlog, ..self }
    }

    /// set how many connections a server keeps open concurrently
    pub fn max_connections(self, max_connections: usize) -> Self {
        Self {
            max_connections,
            ..self
        }
    }

    /// add one subprotocol to offer/accept
    pub fn subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocols.push(subprotocol.into());
        self
    }

    /// set the subprotocols to offer/accept
    ///
    /// **NOTE** it will clear protocols set by `subprotocol` method
    pub fn subprotocols(self, subprotocols: Vec<String>) -> Self {
        Self {
            subprotocols,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_scheme_decides_mode() {
        let uri: http::Uri = "ws://example.com/".parse().unwrap();
        assert_eq!(check_uri(&uri).unwrap(), Mode::Ws);
        let uri: http::Uri = "WSS://example.com:8443/feed".parse().unwrap();
        assert_eq!(check_uri(&uri).unwrap(), Mode::Wss);
        let uri: http::Uri = "http://example.com/".parse().unwrap();
        assert!(matches!(check_uri(&uri), Err(WsError::InvalidUri(_))));
        let uri: http::Uri = "/just/a/path".parse().unwrap();
        assert!(matches!(check_uri(&uri), Err(WsError::InvalidUri(_))));
    }

    #[test]
    fn config_builder_chains() {
        let config = WsConfig::new()
            .ping(false)
            .max_message_length(64)
            .payload_buffer_length(16)
            .max_connections(2)
            .subprotocol("chat")
            .subprotocol("superchat");
        assert!(!config.ping);
        assert_eq!(config.max_message_length, 64);
        assert_eq!(config.payload_buffer_length, 16);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.subprotocols, vec!["chat", "superchat"]);
    }
}
