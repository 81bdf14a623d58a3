//! Client-side core of the Android Debug Bridge wire protocol.
//!
//! This crate implements the packet codec, the CNXN/AUTH/STLS handshake,
//! the per-stream flow-controlled multiplexer, and the SYNC and Shell v2
//! sub-protocols that run on top of it. It does not parse command-line
//! arguments, persist keys to disk, speak the adb-server smart-socket
//! protocol, or drive a USB transport — callers wire those up externally
//! and hand this crate a connected byte stream.

pub mod codec;
pub mod connection;
pub mod error;
pub mod key;
pub mod service;
pub mod shell;
pub mod stream;
pub mod sync;
pub mod transport;

pub use codec::{Command, Packet};
pub use connection::{Connection, ConnectConfig};
pub use error::{AdbError, HandshakeError, KeyError, ProtocolError, ShellError, StreamError, SyncError, TransportError};
pub use key::{KeySigner, ANDROID_PUBKEY_ENCODED_SIZE};
pub use service::{InstallRequest, Service, ServiceRequest};
pub use shell::{Shell, ShellResult, ShellSession};
pub use stream::Stream;
pub use sync::{Dirent, FileStat, Sync};
pub use transport::Transport;

#[cfg(test)]
pub(crate) fn init_test_logger() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .format_timestamp_millis()
        .is_test(true)
        .try_init();
}
