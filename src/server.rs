use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Encoder;
use tracing::{debug, info, warn};

use crate::codec::{FrameEncoder, Role};
use crate::connection::{handshake_failed, run, WsConn, WsHandler};
use crate::errors::WsError;
use crate::frame::Frame;
use crate::protocol::{accept_handshake, close_code};
use crate::stream::WsStream;
use crate::WsConfig;

static SERVER_ID: AtomicU64 = AtomicU64::new(1);

struct ServerInner {
    id: u64,
    local_addr: SocketAddr,
    secure: bool,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    conns: Arc<Mutex<Vec<WsConn>>>,
    config: WsConfig,
}

/// handle to one listening websocket server
///
/// the accept loop runs on its own task; dropping the handle does not
/// stop it, [WsServer::close] does
#[derive(Clone)]
pub struct WsServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for WsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServer")
            .field("id", &self.inner.id)
            .field("local_addr", &self.inner.local_addr)
            .field("secure", &self.inner.secure)
            .field("open", &self.is_open())
            .finish()
    }
}

impl WsServer {
    /// bind a listening socket and spawn the accept loop
    ///
    /// the factory produces one handler per accepted connection
    pub(crate) async fn bind<F, H>(
        bind_addr: Option<IpAddr>,
        port: u16,
        factory: F,
        config: WsConfig,
        tls: Option<TlsAcceptor>,
        servers: Arc<Mutex<Vec<WsServer>>>,
    ) -> Result<WsServer, WsError>
    where
        F: Fn() -> H + Send + 'static,
        H: WsHandler,
    {
        let addr = SocketAddr::new(
            bind_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port,
        );
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.backlog)?;
        let local_addr = listener.local_addr()?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = WsServer {
            inner: Arc::new(ServerInner {
                id: SERVER_ID.fetch_add(1, Ordering::Relaxed),
                local_addr,
                secure: tls.is_some(),
                running: AtomicBool::new(true),
                stop_tx,
                conns: Arc::new(Mutex::new(Vec::new())),
                config,
            }),
        };
        info!(
            "websocket server listening on {}{}",
            local_addr,
            if server.inner.secure { " (tls)" } else { "" }
        );
        tokio::spawn(accept_loop(
            listener,
            server.clone(),
            factory,
            tls,
            servers,
            stop_rx,
        ));
        Ok(server)
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// bound port, useful after binding port 0
    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    /// check server runs over tls
    pub fn is_secure(&self) -> bool {
        self.inner.secure
    }

    /// check server still accepts connections
    pub fn is_open(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// snapshot of the live child connections
    pub fn list_connections(&self) -> Vec<WsConn> {
        self.inner.conns.lock().unwrap().clone()
    }

    /// stop accepting and close every child with going away
    ///
    /// idempotent; children run their close protocol, they are not
    /// dropped on the floor
    pub fn close(&self, reason: &str) {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            info!("server on {} closing: {reason}", self.inner.local_addr);
            let _ = self.inner.stop_tx.send(true);
        }
        let children: Vec<WsConn> = self.inner.conns.lock().unwrap().clone();
        for child in children {
            child.close(close_code::GOING_AWAY, reason);
        }
    }
}

async fn accept_loop<F, H>(
    listener: TcpListener,
    server: WsServer,
    factory: F,
    tls: Option<TlsAcceptor>,
    servers: Arc<Mutex<Vec<WsServer>>>,
    mut stop_rx: watch::Receiver<bool>,
) where
    F: Fn() -> H + Send + 'static,
    H: WsHandler,
{
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("accepted transport from {peer}");
                    tokio::spawn(serve_socket(
                        stream,
                        peer,
                        server.clone(),
                        factory(),
                        tls.clone(),
                    ));
                }
                Err(err) => {
                    // accept failures stop the server; during shutdown
                    // they are part of the teardown and stay quiet
                    if server.inner.running.swap(false, Ordering::AcqRel) {
                        warn!("accept failed on {}: {err}", server.inner.local_addr);
                        factory().on_error(None, &WsError::from(err));
                    }
                    break;
                }
            }
        }
    }
    server.inner.running.store(false, Ordering::Release);
    servers.lock().unwrap().retain(|s| s.id() != server.id());
}

async fn serve_socket<H: WsHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    server: WsServer,
    mut handler: H,
    tls: Option<TlsAcceptor>,
) {
    let config = server.inner.config.clone();
    let deadline = config.handshake_so_timeout;
    let (mut ws_stream, tls_protocol) = match tls {
        Some(acceptor) => match timeout(deadline, acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => {
                let protocol = tls_stream
                    .get_ref()
                    .1
                    .protocol_version()
                    .map(|v| format!("{v:?}"));
                (
                    WsStream::Tls(tokio_rustls::TlsStream::Server(tls_stream)),
                    protocol,
                )
            }
            Ok(Err(err)) => {
                handler.on_error(None, &WsError::Tls(err.to_string()));
                return;
            }
            Err(_) => {
                handler.on_error(None, &WsError::Timeout("tls handshake"));
                return;
            }
        },
        None => (WsStream::Plain(stream), None),
    };
    let (conn, rx) = WsConn::new(
        Role::Server,
        peer.ip().to_string(),
        None,
        tls_protocol,
        config.clone(),
    );
    match timeout(
        deadline,
        accept_handshake(&mut ws_stream, &config.subprotocols),
    )
    .await
    {
        Err(_) => {
            // deadline fired: transport closes with no http body
            handshake_failed(&conn, &mut handler, &WsError::Timeout("handshake"));
        }
        Ok(Err(err)) => {
            handshake_failed(&conn, &mut handler, &err);
        }
        Ok(Ok(hs)) => {
            let admitted = {
                let mut conns = server.inner.conns.lock().unwrap();
                if conns.len() >= config.max_connections {
                    false
                } else {
                    conns.push(conn.clone());
                    true
                }
            };
            if !admitted {
                debug!("capacity reached, turning {peer} away");
                turn_away(&mut ws_stream).await;
                return;
            }
            conn.set_request(hs.request);
            if let Some(proto) = hs.subprotocol {
                conn.set_subprotocol(proto);
            }
            conn.set_open();
            run(
                conn,
                handler,
                ws_stream,
                hs.remain,
                rx,
                server.inner.conns.clone(),
            )
            .await;
        }
    }
}

/// handshake completed but the server is full: answer 1013 and drop
async fn turn_away<S: AsyncWrite + Unpin>(stream: &mut S) {
    let mut buf = BytesMut::new();
    let mut encoder = FrameEncoder { role: Role::Server };
    if encoder
        .encode(
            Frame::close(close_code::TRY_AGAIN_LATER, "try again later"),
            &mut buf,
        )
        .is_ok()
    {
        let _ = stream.write_all(&buf).await;
        let _ = stream.flush().await;
    }
    let _ = stream.shutdown().await;
}
