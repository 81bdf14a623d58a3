use thiserror::Error;

/// Underlying I/O failure on the transport. Fatal to the [`Connection`](crate::Connection).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("transport closed")]
    Closed,
}

/// Failures during the CNXN/AUTH/STLS handshake. Fatal.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("device rejected every offered credential")]
    AuthRejected,
    #[error("unexpected command {command:?} in state {state}")]
    UnexpectedCommand { command: crate::codec::Command, state: &'static str },
    #[error("handshake did not complete within the configured deadline")]
    HandshakeTimeout,
}

/// Wire-format violations. Fatal.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet magic {magic:#010x} does not match command {command:?}")]
    BadMagic { command: crate::codec::Command, magic: u32 },
    #[error("unknown command {0:#010x}")]
    UnknownCommand(u32),
    #[error("payload length {len} exceeds negotiated max_payload {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("payload checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("unexpected frame id {0:?}")]
    UnexpectedFrame(String),
}

/// Failures scoped to a single [`Stream`](crate::Stream). Non-fatal to the Connection.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream is closed")]
    StreamClosed,
    #[error("peer refused to open {destination:?}")]
    ServiceUnavailable { destination: String },
    #[error("write did not obtain credit within the configured deadline")]
    BackpressureTimeout,
    #[error("connection is closed")]
    TransportClosed,
}

/// SYNC sub-protocol failures. Non-fatal.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("local file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sync failure: {0}")]
    SyncFail(String),
    #[error("unexpected sync frame id {0:?}")]
    UnexpectedFrame(String),
}

/// Shell v2 sub-protocol failures.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Key generation / signing failures. Surfaced at Connection construction, before any I/O.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("RSA key generation failed: {0}")]
    Generation(String),
    #[error("RSA key is not a supported size (must be 2048-bit)")]
    UnsupportedKeySize,
    #[error("token must be exactly 20 bytes, got {0}")]
    BadTokenLength(usize),
}

/// Aggregate error type for the crate's top-level entry points.
#[derive(Debug, Error)]
pub enum AdbError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error(transparent)]
    Key(#[from] KeyError),
}
