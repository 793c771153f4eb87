use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::debug;

use crate::codec::Role;
use crate::connection::{handshake_failed, run, WsConn, WsHandler};
use crate::errors::WsError;
use crate::protocol::{close_code, req_handshake, Mode};
use crate::server::WsServer;
use crate::stream::WsStream;
use crate::tls::{ClientAuth, SecureContext};
use crate::{check_uri, WsConfig};

/// process wide registry of live connections and servers
///
/// owns the client initiated connections it dialed and every server it
/// bound; `list_*` return snapshots, [Endpoint::close_all] drains both
pub struct Endpoint {
    conns: Arc<Mutex<Vec<WsConn>>>,
    servers: Arc<Mutex<Vec<WsServer>>>,
    tls: Mutex<SecureContext>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpoint {
    /// empty registry with an unconfigured secure context
    pub fn new() -> Self {
        Self {
            conns: Arc::new(Mutex::new(Vec::new())),
            servers: Arc::new(Mutex::new(Vec::new())),
            tls: Mutex::new(SecureContext::new()),
        }
    }

    /// certificate chain + private key file for secure servers
    pub fn set_key_file(&self, path: impl AsRef<Path>, passphrase: Option<&str>) {
        self.tls.lock().unwrap().set_key_file(path, passphrase);
    }

    /// trust anchors used to verify peers; unset means the bundled
    /// web roots
    pub fn set_trust_store(&self, path: impl AsRef<Path>, passphrase: Option<&str>) {
        self.tls.lock().unwrap().set_trust_store(path, passphrase);
    }

    /// client certificate policy of secure servers
    pub fn set_client_auth(&self, client_auth: ClientAuth) {
        self.tls.lock().unwrap().set_client_auth(client_auth);
    }

    /// bind a plaintext server; the factory yields one handler per
    /// accepted connection
    pub async fn server<F, H>(
        &self,
        bind_addr: Option<IpAddr>,
        port: u16,
        factory: F,
        config: WsConfig,
    ) -> Result<WsServer, WsError>
    where
        F: Fn() -> H + Send + 'static,
        H: WsHandler,
    {
        let server =
            WsServer::bind(bind_addr, port, factory, config, None, self.servers.clone()).await?;
        self.servers.lock().unwrap().push(server.clone());
        Ok(server)
    }

    /// bind a tls server using the configured key file
    pub async fn secure_server<F, H>(
        &self,
        bind_addr: Option<IpAddr>,
        port: u16,
        factory: F,
        config: WsConfig,
    ) -> Result<WsServer, WsError>
    where
        F: Fn() -> H + Send + 'static,
        H: WsHandler,
    {
        let acceptor = self.tls.lock().unwrap().acceptor()?;
        let server = WsServer::bind(
            bind_addr,
            port,
            factory,
            config,
            Some(acceptor),
            self.servers.clone(),
        )
        .await?;
        self.servers.lock().unwrap().push(server.clone());
        Ok(server)
    }

    /// dial a `ws://` or `wss://` uri, run the client handshake and
    /// spawn the connection machine
    ///
    /// the handler gets `on_open` on the connection task; handshake
    /// failures surface as `on_error` followed by an abnormal
    /// `on_close`, transport failures before the handshake as a bare
    /// `on_error`
    pub async fn connect<H: WsHandler>(
        &self,
        uri: &str,
        mut handler: H,
        config: WsConfig,
    ) -> Result<WsConn, WsError> {
        let uri: http::Uri = uri
            .parse()
            .map_err(|_| WsError::InvalidUri(uri.to_string()))?;
        let mode = check_uri(&uri)?;
        let host = uri
            .host()
            .ok_or_else(|| WsError::InvalidUri("missing host".into()))?
            .to_string();
        let port = uri.port_u16().unwrap_or_else(|| mode.default_port());

        let stream = match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => stream,
            Err(err) => {
                let err = WsError::ConnectionFailed(err.to_string());
                handler.on_error(None, &err);
                return Err(err);
            }
        };
        let (mut ws_stream, tls_protocol) = match mode {
            Mode::Wss => {
                let connector = self.tls.lock().unwrap().connector()?;
                let server_name = ServerName::try_from(host.clone())
                    .map_err(|e| WsError::Tls(format!("invalid server name: {e}")))?;
                match timeout(
                    config.handshake_so_timeout,
                    connector.connect(server_name, stream),
                )
                .await
                {
                    Ok(Ok(tls_stream)) => {
                        let protocol = tls_stream
                            .get_ref()
                            .1
                            .protocol_version()
                            .map(|v| format!("{v:?}"));
                        (
                            WsStream::Tls(tokio_rustls::TlsStream::Client(tls_stream)),
                            protocol,
                        )
                    }
                    Ok(Err(err)) => {
                        let err = WsError::Tls(err.to_string());
                        handler.on_error(None, &err);
                        return Err(err);
                    }
                    Err(_) => {
                        let err = WsError::Timeout("tls handshake");
                        handler.on_error(None, &err);
                        return Err(err);
                    }
                }
            }
            Mode::Ws => (WsStream::Plain(stream), None),
        };

        let (conn, rx) = WsConn::new(
            Role::Client,
            host,
            Some(uri.clone()),
            tls_protocol,
            config.clone(),
        );
        match timeout(
            config.handshake_so_timeout,
            req_handshake(&mut ws_stream, &uri, mode, &config.subprotocols),
        )
        .await
        {
            Err(_) => {
                let err = WsError::Timeout("handshake");
                handshake_failed(&conn, &mut handler, &err);
                Err(err)
            }
            Ok(Err(err)) => {
                handshake_failed(&conn, &mut handler, &err);
                Err(err)
            }
            Ok(Ok(hs)) => {
                if let Some(proto) = hs.subprotocol {
                    conn.set_subprotocol(proto);
                }
                conn.set_open();
                self.conns.lock().unwrap().push(conn.clone());
                debug!("connected to {uri} as conn {}", conn.id());
                tokio::spawn(run(
                    conn.clone(),
                    handler,
                    ws_stream,
                    hs.remain,
                    rx,
                    self.conns.clone(),
                ));
                Ok(conn)
            }
        }
    }

    /// snapshot of the client initiated connections this registry owns
    pub fn list_connections(&self) -> Vec<WsConn> {
        self.conns.lock().unwrap().clone()
    }

    /// snapshot of the live servers
    pub fn list_servers(&self) -> Vec<WsServer> {
        self.servers.lock().unwrap().clone()
    }

    /// stop every server from accepting, close their children, then
    /// close the owned client connections, all with going away
    pub fn close_all(&self, reason: &str) {
        let servers: Vec<WsServer> = self.servers.lock().unwrap().clone();
        for server in servers {
            server.close(reason);
        }
        let conns: Vec<WsConn> = self.conns.lock().unwrap().clone();
        for conn in conns {
            conn.close(close_code::GOING_AWAY, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CloseStatus;
    use crate::frame::{Message, OpCode};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Open,
        Message(OpCode, Vec<u8>),
        Error(String),
        Close(u16),
    }

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<Event>>>,
        echo: bool,
    }

    impl Recorder {
        fn echoing() -> Self {
            Self {
                echo: true,
                ..Default::default()
            }
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn got_message(&self, payload: &[u8]) -> bool {
            self.events()
                .iter()
                .any(|e| matches!(e, Event::Message(_, data) if data == payload))
        }

        fn closed_with(&self) -> Option<u16> {
            self.events().iter().find_map(|e| match e {
                Event::Close(code) => Some(*code),
                _ => None,
            })
        }
    }

    impl WsHandler for Recorder {
        fn on_open(&mut self, _conn: &WsConn) {
            self.events.lock().unwrap().push(Event::Open);
        }

        fn on_message(&mut self, conn: &WsConn, msg: Message) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Message(msg.code, msg.data.to_vec()));
            if self.echo {
                if msg.is_text() {
                    conn.send_text(msg.as_text().unwrap()).unwrap();
                } else {
                    conn.send_binary(&msg.data).unwrap();
                }
            }
        }

        fn on_error(&mut self, _conn: Option<&WsConn>, err: &WsError) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Error(err.to_string()));
        }

        fn on_close(&mut self, _conn: &WsConn, status: CloseStatus) {
            self.events.lock().unwrap().push(Event::Close(status.code));
        }
    }

    /// factory that records each handler it hands out
    #[allow(clippy::type_complexity)]
    fn recording_factory(
        echo: bool,
    ) -> (Box<dyn Fn() -> Recorder + Send>, Arc<Mutex<Vec<Recorder>>>) {
        let handed_out: Arc<Mutex<Vec<Recorder>>> = Arc::new(Mutex::new(Vec::new()));
        let list = handed_out.clone();
        let factory = Box::new(move || {
            let rec = if echo {
                Recorder::echoing()
            } else {
                Recorder::default()
            };
            list.lock().unwrap().push(rec.clone());
            rec
        });
        (factory, handed_out)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 5s");
    }

    fn localhost() -> Option<IpAddr> {
        Some("127.0.0.1".parse().unwrap())
    }

    #[tokio::test]
    async fn echo_end_to_end_with_normal_closure() {
        let endpoint = Endpoint::new();
        let (factory, server_recs) = recording_factory(true);
        let server = endpoint
            .server(localhost(), 0, factory, WsConfig::default())
            .await
            .unwrap();

        let rec = Recorder::default();
        let conn = endpoint
            .connect(
                &format!("ws://127.0.0.1:{}/echo", server.port()),
                rec.clone(),
                WsConfig::default(),
            )
            .await
            .unwrap();
        assert!(conn.is_open());
        assert_eq!(conn.role(), Role::Client);
        assert_eq!(conn.request_uri().unwrap().path(), "/echo");
        assert_eq!(endpoint.list_connections().len(), 1);

        conn.send_text("hello").unwrap();
        wait_until(|| rec.got_message(b"hello")).await;
        let server_rec = server_recs.lock().unwrap()[0].clone();
        assert!(server_rec.got_message(b"hello"));

        conn.close(1000, "");
        wait_until(|| rec.closed_with() == Some(1000)).await;
        wait_until(|| server_rec.closed_with() == Some(1000)).await;
        wait_until(|| endpoint.list_connections().is_empty()).await;
        wait_until(|| server.list_connections().is_empty()).await;
        assert_eq!(conn.status(), Some(CloseStatus::new(1000, "")));
    }

    #[tokio::test]
    async fn server_side_sees_request_headers_and_peer() {
        let endpoint = Endpoint::new();
        let (factory, server_recs) = recording_factory(false);
        let server = endpoint
            .server(localhost(), 0, factory, WsConfig::default())
            .await
            .unwrap();
        let _conn = endpoint
            .connect(
                &format!("ws://127.0.0.1:{}/inspect", server.port()),
                Recorder::default(),
                WsConfig::default(),
            )
            .await
            .unwrap();
        wait_until(|| server.list_connections().len() == 1).await;
        let server_conn = server.list_connections().pop().unwrap();
        assert_eq!(server_conn.role(), Role::Server);
        assert_eq!(server_conn.peer_host(), "127.0.0.1");
        let headers = server_conn.request_headers().unwrap();
        assert_eq!(
            headers.get("upgrade").map(|v| v.to_str().unwrap()),
            Some("websocket")
        );
        drop(server_recs);
    }

    #[tokio::test]
    async fn subprotocol_negotiated_on_both_sides() {
        let endpoint = Endpoint::new();
        let (factory, server_recs) = recording_factory(false);
        let server = endpoint
            .server(
                localhost(),
                0,
                factory,
                WsConfig::default().subprotocol("chat"),
            )
            .await
            .unwrap();
        let conn = endpoint
            .connect(
                &format!("ws://127.0.0.1:{}/", server.port()),
                Recorder::default(),
                WsConfig::default().subprotocol("soap").subprotocol("chat"),
            )
            .await
            .unwrap();
        assert_eq!(conn.subprotocol(), Some("chat"));
        wait_until(|| server.list_connections().len() == 1).await;
        assert_eq!(
            server.list_connections()[0].subprotocol(),
            Some("chat")
        );
        drop(server_recs);
    }

    #[tokio::test]
    async fn third_connection_turned_away_with_1013() {
        let endpoint = Endpoint::new();
        let (factory, _server_recs) = recording_factory(false);
        let server = endpoint
            .server(
                localhost(),
                0,
                factory,
                WsConfig::default().max_connections(2),
            )
            .await
            .unwrap();
        let uri = format!("ws://127.0.0.1:{}/", server.port());

        let rec1 = Recorder::default();
        let conn1 = endpoint
            .connect(&uri, rec1.clone(), WsConfig::default())
            .await
            .unwrap();
        wait_until(|| server.list_connections().len() == 1).await;
        let rec2 = Recorder::default();
        let conn2 = endpoint
            .connect(&uri, rec2.clone(), WsConfig::default())
            .await
            .unwrap();
        wait_until(|| server.list_connections().len() == 2).await;

        // handshake completes, then the server turns the connection away
        let rec3 = Recorder::default();
        let _conn3 = endpoint
            .connect(&uri, rec3.clone(), WsConfig::default())
            .await
            .unwrap();
        wait_until(|| rec3.closed_with() == Some(1013)).await;

        assert!(conn1.is_open());
        assert!(conn2.is_open());
        assert_eq!(server.list_connections().len(), 2);
    }

    #[tokio::test]
    async fn close_all_drains_servers_then_clients() {
        let endpoint = Endpoint::new();
        let (factory, server_recs) = recording_factory(false);
        let server = endpoint
            .server(localhost(), 0, factory, WsConfig::default())
            .await
            .unwrap();
        let rec = Recorder::default();
        let conn = endpoint
            .connect(
                &format!("ws://127.0.0.1:{}/", server.port()),
                rec.clone(),
                WsConfig::default(),
            )
            .await
            .unwrap();
        wait_until(|| server.list_connections().len() == 1).await;

        endpoint.close_all("endpoint shutting down");

        assert!(!server.is_open());
        wait_until(|| rec.closed_with().is_some()).await;
        assert_eq!(rec.closed_with(), Some(1001));
        let server_rec = server_recs.lock().unwrap()[0].clone();
        wait_until(|| server_rec.closed_with().is_some()).await;
        assert_eq!(server_rec.closed_with(), Some(1001));
        wait_until(|| endpoint.list_servers().is_empty()).await;
        wait_until(|| endpoint.list_connections().is_empty()).await;
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn connect_rejects_bad_scheme() {
        let endpoint = Endpoint::new();
        let result = endpoint
            .connect(
                "http://127.0.0.1:1/",
                Recorder::default(),
                WsConfig::default(),
            )
            .await;
        assert!(matches!(result, Err(WsError::InvalidUri(_))));
    }

    #[tokio::test]
    async fn failed_dial_reports_error_without_close() {
        let endpoint = Endpoint::new();
        let rec = Recorder::default();
        // nothing listens on this port
        let result = endpoint
            .connect("ws://127.0.0.1:1/", rec.clone(), WsConfig::default())
            .await;
        assert!(matches!(result, Err(WsError::ConnectionFailed(_))));
        assert!(rec.events().iter().any(|e| matches!(e, Event::Error(_))));
        assert!(rec.closed_with().is_none());
        assert!(endpoint.list_connections().is_empty());
    }
}
