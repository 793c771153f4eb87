use base64::engine::general_purpose::STANDARD as BASE64;
use base64::engine::Engine as _;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::errors::WsError;

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// the only protocol version this endpoint speaks
pub const VERSION: u8 = 13;

/// upper bound on an http upgrade head, request or response
const MAX_HEAD_LEN: usize = 64 * 1024;

/// close status codes, rfc 6455 section 7.4
pub mod close_code {
    /// 1000 indicates a normal closure, meaning that the purpose for
    /// which the connection was established has been fulfilled.
    pub const NORMAL_CLOSURE: u16 = 1000;
    /// 1001 indicates that an endpoint is "going away", such as a server
    /// going down or a browser having navigated away from a page.
    pub const GOING_AWAY: u16 = 1001;
    /// 1002 indicates that an endpoint is terminating the connection due
    /// to a protocol error.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// 1003 indicates that an endpoint is terminating the connection
    /// because it has received a type of data it cannot accept.
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// 1005 is a reserved value, never present in a close frame; it marks
    /// a close that carried no status code.
    pub const NO_STATUS: u16 = 1005;
    /// 1006 is a reserved value, never present in a close frame; it marks
    /// a connection that went down without a close handshake.
    pub const ABNORMAL_CLOSURE: u16 = 1006;
    /// 1007 indicates that an endpoint is terminating the connection
    /// because message data was inconsistent with the message type,
    /// e.g. non utf-8 data within a text message.
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// 1008 indicates that an endpoint is terminating the connection
    /// because it has received a message that violates its policy.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// 1009 indicates that an endpoint is terminating the connection
    /// because it has received a message that is too big to process.
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// 1010 indicates that a client expected the server to negotiate one
    /// or more extensions the server did not return.
    pub const MANDATORY_EXT: u16 = 1010;
    /// 1011 indicates that a server is terminating the connection because
    /// it encountered an unexpected condition.
    pub const INTERNAL_ERROR: u16 = 1011;
    /// 1013 indicates that the service is overloaded and the client
    /// should connect to a different endpoint or retry later.
    pub const TRY_AGAIN_LATER: u16 = 1013;
}

/// check a status code may legally travel in a close frame
///
/// 1000-4999 with the reserved set {1004, 1005, 1006, 1015} carved out
pub fn is_valid_close_code(code: u16) -> bool {
    (1000..=4999).contains(&code) && !matches!(code, 1004 | 1005 | 1006 | 1015)
}

/// uri scheme of a websocket endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// plaintext transport
    Ws,
    /// tls transport
    Wss,
}

impl Mode {
    /// port used when the uri does not carry one
    pub fn default_port(&self) -> u16 {
        match self {
            Mode::Ws => 80,
            Mode::Wss => 443,
        }
    }
}

/// random 16 byte nonce for the Sec-WebSocket-Key header
pub(crate) fn gen_key() -> String {
    let r: [u8; 16] = rand::random();
    BASE64.encode(r)
}

/// Sec-WebSocket-Accept derivation binding a response to the request key
pub(crate) fn cal_accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID);
    BASE64.encode(sha1.finalize())
}

/// read an http head up to the CRLF CRLF boundary
///
/// returns the head and whatever arrived behind it; those bytes belong
/// to the frame layer and must reach the connection untouched
async fn read_head<S>(stream: &mut S) -> Result<(BytesMut, BytesMut), WsError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let num = stream.read_buf(&mut buf).await?;
        if let Some(idx) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let remain = buf.split_off(idx + 4);
            return Ok((buf, remain));
        }
        if num == 0 {
            return Err(WsError::HandShakeFailed(
                "connection closed before http head completed".into(),
            ));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(WsError::HandShakeFailed("http head too large".into()));
        }
    }
}

fn header_values<'h, 'b>(
    headers: &'h [httparse::Header<'b>],
    name: &str,
) -> impl Iterator<Item = &'b [u8]> + 'h
where
    'b: 'h,
{
    let name = name.to_lowercase();
    headers
        .iter()
        .filter(move |h| h.name.to_lowercase() == name)
        .map(|h| h.value)
}

fn header_value<'b>(headers: &[httparse::Header<'b>], name: &str) -> Option<&'b [u8]> {
    header_values(headers, name).next()
}

/// case insensitive token search over comma separated header values,
/// all occurrences of the header considered (rfc 7230 token lists)
fn header_contains_token(headers: &[httparse::Header<'_>], name: &str, token: &str) -> bool {
    header_values(headers, name).any(|value| {
        String::from_utf8_lossy(value)
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    })
}

fn header_eq_ignore_case(headers: &[httparse::Header<'_>], name: &str, expect: &str) -> bool {
    header_value(headers, name)
        .map(|v| String::from_utf8_lossy(v).trim().eq_ignore_ascii_case(expect))
        .unwrap_or(false)
}

/// outcome of a successful client side upgrade
#[derive(Debug)]
pub(crate) struct ClientHandshake {
    /// subprotocol the server selected, if any
    pub subprotocol: Option<String>,
    /// bytes that arrived behind the response head
    pub remain: BytesMut,
}

/// perform the client side http upgrade and validate the response
pub(crate) async fn req_handshake<S>(
    stream: &mut S,
    uri: &http::Uri,
    mode: Mode,
    protocols: &[String],
) -> Result<ClientHandshake, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = gen_key();
    let accept_key = cal_accept_key(&key);
    let host = uri
        .host()
        .ok_or_else(|| WsError::InvalidUri("missing host".into()))?;
    let host_header = match uri.port_u16() {
        Some(port) => format!("{host}:{port}"),
        None => format!("{}:{}", host, mode.default_port()),
    };
    let path = uri
        .path_and_query()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "/".to_string());
    let mut req = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host_header}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: {VERSION}\r\n"
    );
    if !protocols.is_empty() {
        req.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocols.join(", ")));
    }
    req.push_str("\r\n");
    stream.write_all(req.as_bytes()).await?;

    let (head, remain) = read_head(stream).await?;
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut headers);
    let parse_status = resp
        .parse(&head)
        .map_err(|_| WsError::HandShakeFailed("invalid http response".to_string()))?;
    if parse_status.is_partial() {
        return Err(WsError::HandShakeFailed("truncated http response".into()));
    }
    if resp.code != Some(101) {
        return Err(WsError::HandShakeFailed(format!(
            "expect 101 response, got {:?} {:?}",
            resp.code, resp.reason
        )));
    }
    if !header_eq_ignore_case(resp.headers, "upgrade", "websocket") {
        return Err(WsError::HandShakeFailed(
            "missing or invalid upgrade header".into(),
        ));
    }
    if !header_contains_token(resp.headers, "connection", "upgrade") {
        return Err(WsError::HandShakeFailed(
            "missing upgrade token in connection header".into(),
        ));
    }
    match header_value(resp.headers, "sec-websocket-accept") {
        Some(value) if value == accept_key.as_bytes() => {}
        Some(value) => {
            return Err(WsError::HandShakeFailed(format!(
                "mismatch accept key, expect {accept_key}, got {:?}",
                String::from_utf8_lossy(value)
            )));
        }
        None => {
            return Err(WsError::HandShakeFailed(
                "missing sec-websocket-accept header".into(),
            ));
        }
    }
    if header_value(resp.headers, "sec-websocket-extensions")
        .map(|v| !v.is_empty())
        .unwrap_or(false)
    {
        return Err(WsError::HandShakeFailed(
            "server negotiated an extension, none was offered".into(),
        ));
    }
    let subprotocol = match header_value(resp.headers, "sec-websocket-protocol") {
        Some(value) => {
            let selected = String::from_utf8_lossy(value).trim().to_string();
            if !protocols.iter().any(|p| p.eq_ignore_ascii_case(&selected)) {
                return Err(WsError::HandShakeFailed(format!(
                    "server selected unoffered subprotocol `{selected}`"
                )));
            }
            Some(selected)
        }
        None => None,
    };
    debug!("client handshake complete, subprotocol {subprotocol:?}");
    Ok(ClientHandshake {
        subprotocol,
        remain,
    })
}

/// outcome of a successful server side upgrade
#[derive(Debug)]
pub(crate) struct ServerHandshake {
    /// the upgrade request, for the application to inspect
    pub request: http::Request<()>,
    /// subprotocol echoed back to the client, if any
    pub subprotocol: Option<String>,
    /// bytes that arrived behind the request head
    pub remain: BytesMut,
}

/// write a 400 and surface the rejection as a handshake failure
async fn reject<S>(stream: &mut S, extra_header: &str, msg: &str) -> WsError
where
    S: AsyncWrite + Unpin,
{
    let resp = format!(
        "HTTP/1.1 400 Bad Request\r\n{extra_header}Content-Length: {}\r\nConnection: close\r\n\r\n{msg}",
        msg.len()
    );
    let _ = stream.write_all(resp.as_bytes()).await;
    let _ = stream.flush().await;
    WsError::HandShakeFailed(msg.to_string())
}

/// wait for a client upgrade, validate it and answer 101 or 400
pub(crate) async fn accept_handshake<S>(
    stream: &mut S,
    accept_protocols: &[String],
) -> Result<ServerHandshake, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (head, remain) = read_head(stream).await?;
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    let parse_status = match req.parse(&head) {
        Ok(status) => status,
        Err(_) => return Err(reject(stream, "", "invalid http request").await),
    };
    if parse_status.is_partial() {
        return Err(reject(stream, "", "truncated http request").await);
    }
    if req.method != Some("GET") {
        return Err(reject(stream, "", "websocket upgrade requires GET").await);
    }
    if req.version != Some(1) {
        return Err(reject(stream, "", "websocket upgrade requires http/1.1").await);
    }
    if !header_eq_ignore_case(req.headers, "upgrade", "websocket") {
        return Err(reject(stream, "", "missing upgrade header or invalid header value").await);
    }
    if !header_contains_token(req.headers, "connection", "upgrade") {
        return Err(reject(stream, "", "missing upgrade token in connection header").await);
    }
    if !header_eq_ignore_case(req.headers, "sec-websocket-version", "13") {
        return Err(reject(
            stream,
            "Sec-WebSocket-Version: 13\r\n",
            "unsupported websocket version",
        )
        .await);
    }
    let key = match header_value(req.headers, "sec-websocket-key") {
        Some(value) if !value.is_empty() => String::from_utf8_lossy(value).trim().to_string(),
        _ => return Err(reject(stream, "", "missing sec-websocket-key or key is empty").await),
    };
    match BASE64.decode(&key) {
        Ok(raw) if raw.len() == 16 => {}
        _ => return Err(reject(stream, "", "sec-websocket-key is not a 16 byte nonce").await),
    }
    if header_value(req.headers, "sec-websocket-extensions")
        .map(|v| !v.is_empty())
        .unwrap_or(false)
    {
        return Err(reject(stream, "", "extensions are not supported").await);
    }
    // first client offered token the acceptable set contains wins
    let subprotocol = header_values(req.headers, "sec-websocket-protocol")
        .flat_map(|value| {
            String::from_utf8_lossy(value)
                .split(',')
                .map(|t| t.trim().to_string())
                .collect::<Vec<_>>()
        })
        .find(|offered| {
            accept_protocols
                .iter()
                .any(|p| p.eq_ignore_ascii_case(offered))
        });

    let mut request = http::Request::builder()
        .method(http::Method::GET)
        .uri(req.path.unwrap_or("/"));
    for header in req.headers.iter() {
        request = request.header(header.name, header.value);
    }
    let request = request
        .body(())
        .map_err(|e| WsError::HandShakeFailed(format!("invalid request head: {e}")))?;

    let accept_key = cal_accept_key(&key);
    let mut resp = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n"
    );
    if let Some(proto) = &subprotocol {
        resp.push_str(&format!("Sec-WebSocket-Protocol: {proto}\r\n"));
    }
    resp.push_str("\r\n");
    stream.write_all(resp.as_bytes()).await?;
    debug!("server handshake complete, subprotocol {subprotocol:?}");
    Ok(ServerHandshake {
        request,
        subprotocol,
        remain,
    })
}
