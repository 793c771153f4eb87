use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::codec::{FrameDecoder, FrameEncoder, Role};
use crate::errors::{ProtocolError, WsError};
use crate::frame::{Frame, Message, OpCode};
use crate::protocol::{close_code, is_valid_close_code};
use crate::WsConfig;

/// payload of the liveness probe this endpoint sends
const PING_PAYLOAD: &[u8] = b"keepalive";

/// connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// transport up, handshake not finished
    Connecting = 0,
    /// handshake done, data may flow
    Open = 1,
    /// a close frame was sent or received
    Closing = 2,
    /// transport torn down
    Closed = 3,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Connecting,
            1 => Phase::Open,
            2 => Phase::Closing,
            _ => Phase::Closed,
        }
    }
}

/// terminal close status of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    /// rfc 6455 section 7.4 status code, see [close_code]
    pub code: u16,
    /// optional human readable reason
    pub reason: String,
}

impl CloseStatus {
    /// construct status
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// true when the connection went down without a close handshake
    pub fn is_abnormal(&self) -> bool {
        self.code == close_code::ABNORMAL_CLOSURE
    }
}

/// capability set a connection delivers its events to
///
/// all callbacks for one connection are invoked from that connection's
/// task: `on_open`, every `on_message`/`on_error` and the final
/// `on_close` form a happens-before chain. callbacks across different
/// connections run concurrently.
pub trait WsHandler: Send + 'static {
    /// connection reached [Phase::Open]
    fn on_open(&mut self, _conn: &WsConn) {}

    /// a complete message arrived
    fn on_message(&mut self, _conn: &WsConn, _msg: Message) {}

    /// best-effort error notification; `None` for server accept errors,
    /// the connection may still transition to closed afterwards
    fn on_error(&mut self, _conn: Option<&WsConn>, _err: &WsError) {}

    /// fires exactly once, after the transport is released
    fn on_close(&mut self, _conn: &WsConn, _status: CloseStatus) {}
}

pub(crate) enum Outbound {
    Frame(Frame),
    Shutdown,
}

static CONN_ID: AtomicU64 = AtomicU64::new(1);

struct ConnInner {
    id: u64,
    role: Role,
    phase: AtomicU8,
    out_tx: mpsc::UnboundedSender<Outbound>,
    // fragments of one outgoing message must stay contiguous
    send_lock: Mutex<()>,
    status: Mutex<Option<CloseStatus>>,
    peer_host: String,
    uri: Option<http::Uri>,
    request: OnceLock<http::Request<()>>,
    subprotocol: OnceLock<String>,
    tls_protocol: Option<String>,
    config: WsConfig,
}

/// handle to one websocket connection
///
/// cheap to clone, safe to share; all send operations push whole frames
/// onto the connection's writer task, so concurrent senders interleave
/// frames but never bytes
#[derive(Clone)]
pub struct WsConn {
    inner: Arc<ConnInner>,
}

impl std::fmt::Debug for WsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConn")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("phase", &self.phase())
            .field("peer_host", &self.inner.peer_host)
            .finish()
    }
}

impl WsConn {
    pub(crate) fn new(
        role: Role,
        peer_host: String,
        uri: Option<http::Uri>,
        tls_protocol: Option<String>,
        config: WsConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let conn = Self {
            inner: Arc::new(ConnInner {
                id: CONN_ID.fetch_add(1, Ordering::Relaxed),
                role,
                phase: AtomicU8::new(Phase::Connecting as u8),
                out_tx,
                send_lock: Mutex::new(()),
                status: Mutex::new(None),
                peer_host,
                uri,
                request: OnceLock::new(),
                subprotocol: OnceLock::new(),
                tls_protocol,
                config,
            }),
        };
        (conn, out_rx)
    }

    /// process-unique connection id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// which end of the connection this endpoint plays
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// current lifecycle phase
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.inner.phase.load(Ordering::Acquire))
    }

    /// check connection accepts sends
    pub fn is_open(&self) -> bool {
        self.phase() == Phase::Open
    }

    /// terminal close status, set once the close protocol decided it
    pub fn status(&self) -> Option<CloseStatus> {
        self.inner.status.lock().unwrap().clone()
    }

    /// host the peer is known as; remote ip for accepted connections
    pub fn peer_host(&self) -> &str {
        &self.inner.peer_host
    }

    /// negotiated subprotocol, if any
    pub fn subprotocol(&self) -> Option<&str> {
        self.inner.subprotocol.get().map(|s| s.as_str())
    }

    /// tls protocol version of the transport, `None` on plaintext
    pub fn tls_protocol(&self) -> Option<&str> {
        self.inner.tls_protocol.as_deref()
    }

    /// uri this client connection was dialed with
    pub fn request_uri(&self) -> Option<&http::Uri> {
        self.inner.uri.as_ref()
    }

    /// headers of the upgrade request this server connection accepted
    pub fn request_headers(&self) -> Option<&http::HeaderMap> {
        self.inner.request.get().map(|r| r.headers())
    }

    /// configuration this connection runs with
    pub fn config(&self) -> &WsConfig {
        &self.inner.config
    }

    /// send one text message, fragmented at the payload buffer length
    pub fn send_text(&self, data: &str) -> Result<(), WsError> {
        self.send_data(OpCode::Text, data.as_bytes())
    }

    /// send one binary message, fragmented at the payload buffer length
    pub fn send_binary(&self, data: &[u8]) -> Result<(), WsError> {
        self.send_data(OpCode::Binary, data)
    }

    fn send_data(&self, code: OpCode, data: &[u8]) -> Result<(), WsError> {
        if !self.is_open() {
            return Err(WsError::NotOpen);
        }
        let chunk = self.inner.config.payload_buffer_length.max(1);
        let _guard = self.inner.send_lock.lock().unwrap();
        if data.len() <= chunk {
            self.push_frame(Frame::new(true, code, data));
            return Ok(());
        }
        let mut offset = 0;
        let mut opcode = code;
        while offset < data.len() {
            let end = (offset + chunk).min(data.len());
            self.push_frame(Frame::new(end == data.len(), opcode, &data[offset..end]));
            opcode = OpCode::Continue;
            offset = end;
        }
        Ok(())
    }

    /// send one message pulled from a reader; the final frame is flagged
    /// when the reader signals end of input
    pub fn send_stream<R: std::io::Read>(
        &self,
        is_text: bool,
        reader: &mut R,
    ) -> Result<(), WsError> {
        if !self.is_open() {
            return Err(WsError::NotOpen);
        }
        let chunk = self.inner.config.payload_buffer_length.max(1);
        let _guard = self.inner.send_lock.lock().unwrap();
        let mut opcode = if is_text { OpCode::Text } else { OpCode::Binary };
        let mut current = vec![0u8; chunk];
        let mut next = vec![0u8; chunk];
        let mut current_len = read_full(reader, &mut current)?;
        loop {
            if current_len < chunk {
                // reader drained, this is the final frame
                self.push_frame(Frame::new(true, opcode, &current[..current_len]));
                return Ok(());
            }
            let next_len = read_full(reader, &mut next)?;
            if next_len == 0 {
                self.push_frame(Frame::new(true, opcode, &current[..current_len]));
                return Ok(());
            }
            self.push_frame(Frame::new(false, opcode, &current[..current_len]));
            std::mem::swap(&mut current, &mut next);
            current_len = next_len;
            opcode = OpCode::Continue;
        }
    }

    /// initiate the close handshake; idempotent and thread-safe
    ///
    /// codes that may not travel in a close frame fall back to 1000
    pub fn close(&self, code: u16, reason: &str) {
        if self
            .inner
            .phase
            .compare_exchange(
                Phase::Open as u8,
                Phase::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let code = if is_valid_close_code(code) {
                code
            } else {
                close_code::NORMAL_CLOSURE
            };
            self.set_status_once(code, reason);
            self.push_frame(Frame::close(code, reason));
        }
    }

    fn push_frame(&self, frame: Frame) {
        let _ = self.inner.out_tx.send(Outbound::Frame(frame));
    }

    pub(crate) fn set_open(&self) {
        let _ = self.inner.phase.compare_exchange(
            Phase::Connecting as u8,
            Phase::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn set_phase(&self, phase: Phase) {
        self.inner.phase.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn set_request(&self, request: http::Request<()>) {
        let _ = self.inner.request.set(request);
    }

    pub(crate) fn set_subprotocol(&self, subprotocol: String) {
        let _ = self.inner.subprotocol.set(subprotocol);
    }

    fn set_status_once(&self, code: u16, reason: &str) {
        let mut status = self.inner.status.lock().unwrap();
        if status.is_none() {
            *status = Some(CloseStatus::new(code, reason));
        }
    }
}

fn read_full<R: std::io::Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// handshake never completed: no transport to tear down, but the
/// handler contract still gets its error and terminal close
pub(crate) fn handshake_failed<H: WsHandler>(conn: &WsConn, handler: &mut H, err: &WsError) {
    conn.set_phase(Phase::Closed);
    conn.set_status_once(close_code::ABNORMAL_CLOSURE, &err.to_string());
    handler.on_error(Some(conn), err);
    let status = conn
        .status()
        .unwrap_or_else(|| CloseStatus::new(close_code::ABNORMAL_CLOSURE, ""));
    handler.on_close(conn, status);
}

fn protocol_close<H: WsHandler>(conn: &WsConn, handler: &mut H, code: u16, error: ProtocolError) {
    let err = WsError::protocol(code, error);
    conn.set_phase(Phase::Closing);
    conn.push_frame(Frame::close(code, &err.to_string()));
    conn.set_status_once(code, &err.to_string());
    handler.on_error(Some(conn), &err);
}

/// drive one upgraded connection until it closes
///
/// owns the transport and the handler; every callback happens on this
/// task. `remain` is whatever arrived behind the http head.
pub(crate) async fn run<S, H>(
    conn: WsConn,
    mut handler: H,
    stream: S,
    remain: BytesMut,
    rx: mpsc::UnboundedReceiver<Outbound>,
    registry: Arc<Mutex<Vec<WsConn>>>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: WsHandler,
{
    let role = conn.role();
    let max_message = conn.inner.config.max_message_length;
    let read_timeout = conn.inner.config.connection_so_timeout;
    let ping_enabled = conn.inner.config.ping;

    let (read_half, write_half) = tokio::io::split(stream);
    let mut framed = FramedRead::new(
        read_half,
        FrameDecoder {
            role,
            max_payload_len: max_message,
        },
    );
    if !remain.is_empty() {
        framed.read_buffer_mut().extend_from_slice(&remain);
    }
    let writer = tokio::spawn(write_loop(rx, FramedWrite::new(write_half, FrameEncoder { role })));

    conn.set_open();
    handler.on_open(&conn);

    let mut assembler: Option<(OpCode, BytesMut)> = None;
    let mut awaiting_pong = false;

    loop {
        let frame = match timeout(read_timeout, framed.next()).await {
            Err(_) => {
                if conn.phase() == Phase::Closing {
                    conn.set_status_once(close_code::ABNORMAL_CLOSURE, "close handshake timed out");
                    break;
                }
                if ping_enabled && !awaiting_pong {
                    debug!("conn {}: read deadline fired, probing peer", conn.id());
                    awaiting_pong = true;
                    conn.push_frame(Frame::ping(PING_PAYLOAD));
                    continue;
                }
                let err = WsError::Timeout("read");
                handler.on_error(Some(&conn), &err);
                conn.push_frame(Frame::close(close_code::GOING_AWAY, "liveness timeout"));
                conn.set_status_once(close_code::ABNORMAL_CLOSURE, "liveness timeout");
                break;
            }
            Ok(None) => {
                conn.set_status_once(close_code::ABNORMAL_CLOSURE, "connection reset without close");
                break;
            }
            Ok(Some(Err(err))) => {
                if conn.phase() == Phase::Closing {
                    // transport noise after the close handshake started
                    break;
                }
                if let WsError::ProtocolError {
                    close_code: code, ..
                } = &err
                {
                    conn.set_phase(Phase::Closing);
                    conn.push_frame(Frame::close(*code, &err.to_string()));
                    conn.set_status_once(*code, &err.to_string());
                } else {
                    conn.set_status_once(close_code::ABNORMAL_CLOSURE, &err.to_string());
                }
                handler.on_error(Some(&conn), &err);
                break;
            }
            Ok(Some(Ok(frame))) => {
                // any inbound frame counts as liveness
                awaiting_pong = false;
                frame
            }
        };

        match frame.opcode {
            OpCode::Close => {
                if conn.phase() == Phase::Open {
                    conn.set_phase(Phase::Closing);
                    let peer_code = frame.close_code();
                    // 1005 never travels, echo 1000 for a code-less close
                    conn.push_frame(Frame::close(
                        peer_code.unwrap_or(close_code::NORMAL_CLOSURE),
                        "",
                    ));
                    conn.set_status_once(
                        peer_code.unwrap_or(close_code::NO_STATUS),
                        &frame.close_reason(),
                    );
                }
                break;
            }
            OpCode::Ping => {
                conn.push_frame(Frame::pong(&frame.payload));
            }
            OpCode::Pong => {}
            OpCode::Text | OpCode::Binary => {
                if conn.phase() != Phase::Open {
                    continue;
                }
                if assembler.is_some() {
                    protocol_close(
                        &conn,
                        &mut handler,
                        close_code::PROTOCOL_ERROR,
                        ProtocolError::NotContinueFrameAfterFragmented,
                    );
                    break;
                }
                if frame.fin {
                    if frame.opcode == OpCode::Text && std::str::from_utf8(&frame.payload).is_err()
                    {
                        protocol_close(
                            &conn,
                            &mut handler,
                            close_code::INVALID_PAYLOAD,
                            ProtocolError::InvalidUtf8,
                        );
                        break;
                    }
                    handler.on_message(
                        &conn,
                        Message {
                            code: frame.opcode,
                            data: frame.payload,
                        },
                    );
                } else {
                    assembler = Some((frame.opcode, frame.payload));
                }
            }
            OpCode::Continue => {
                if conn.phase() != Phase::Open {
                    continue;
                }
                let Some((code, mut buf)) = assembler.take() else {
                    protocol_close(
                        &conn,
                        &mut handler,
                        close_code::PROTOCOL_ERROR,
                        ProtocolError::MissInitialFragmentedFrame,
                    );
                    break;
                };
                let total = (buf.len() + frame.payload.len()) as u64;
                if total > max_message {
                    protocol_close(
                        &conn,
                        &mut handler,
                        close_code::MESSAGE_TOO_BIG,
                        ProtocolError::PayloadTooLarge(total, max_message),
                    );
                    break;
                }
                buf.extend_from_slice(&frame.payload);
                if frame.fin {
                    if code == OpCode::Text && std::str::from_utf8(&buf).is_err() {
                        protocol_close(
                            &conn,
                            &mut handler,
                            close_code::INVALID_PAYLOAD,
                            ProtocolError::InvalidUtf8,
                        );
                        break;
                    }
                    handler.on_message(&conn, Message { code, data: buf });
                } else {
                    assembler = Some((code, buf));
                }
            }
        }
    }

    conn.set_phase(Phase::Closed);
    let _ = conn.inner.out_tx.send(Outbound::Shutdown);
    registry.lock().unwrap().retain(|c| c.id() != conn.id());
    let _ = writer.await;
    let status = conn
        .status()
        .unwrap_or_else(|| CloseStatus::new(close_code::ABNORMAL_CLOSURE, ""));
    debug!("conn {} closed: {} {:?}", conn.id(), status.code, status.reason);
    handler.on_close(&conn, status);
}

async fn write_loop<W>(
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut framed: FramedWrite<W, FrameEncoder>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(frame) => {
                if let Err(err) = framed.send(frame).await {
                    debug!("write side failed: {err}");
                    break;
                }
            }
            Outbound::Shutdown => break,
        }
    }
    rx.close();
    let _ = framed.get_mut().shutdown().await;
}
