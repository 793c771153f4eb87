use thiserror::Error;

/// errors during handshake, read/write frame or endpoint management
#[derive(Debug, Error)]
pub enum WsError {
    #[error("invalid uri `{0}`")]
    InvalidUri(String),
    #[error("connection failed `{0}`")]
    ConnectionFailed(String),
    #[error("tls failure `{0}`")]
    Tls(String),
    #[error("io error {0:?}")]
    IOError(#[from] std::io::Error),
    #[error("{0}")]
    HandShakeFailed(String),
    #[error("{error}")]
    ProtocolError {
        /// close code to put on the wire for this violation
        close_code: u16,
        /// the underlying frame level violation
        error: ProtocolError,
    },
    #[error("connection is not open")]
    NotOpen,
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("server at connection capacity")]
    TryAgainLater,
    #[error("internal error `{0}`")]
    Internal(String),
}

impl WsError {
    pub(crate) fn protocol(close_code: u16, error: ProtocolError) -> Self {
        WsError::ProtocolError { close_code, error }
    }
}

/// errors during decode frame from bytes
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid leading bits {0:b}")]
    InvalidLeadingBits(u8),
    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),
    #[error("invalid extended payload length")]
    InvalidExtendedLen,
    #[error("expected masked frame")]
    UnmaskedFrame,
    #[error("unexpected masked frame")]
    MaskedFrame,
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    #[error("control frame is too big {0}")]
    ControlFrameTooBig(usize),
    #[error("continuation frame without initial data frame")]
    MissInitialFragmentedFrame,
    #[error("new data frame while previous message incomplete")]
    NotContinueFrameAfterFragmented,
    #[error("invalid close frame payload len, expect 0, >= 2")]
    InvalidCloseFramePayload,
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    #[error("invalid utf-8 text")]
    InvalidUtf8,
    #[error("payload too large, {0} exceeds limit {1}")]
    PayloadTooLarge(u64, u64),
}
