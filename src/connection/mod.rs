//! Connection establishment: the CNXN/AUTH/STLS handshake state machine,
//! and the `Connection` handle callers use to open streams afterwards.

mod handshake;

use crate::error::{HandshakeError, StreamError};
use crate::key::KeySigner;
use crate::stream::{self, MuxCommand};
use crate::transport::Transport;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Tunables for `Connection::connect` and the streams opened on it.
/// Defaults match the values the protocol's Design Notes recommend.
#[derive(Clone, Debug)]
pub struct ConnectConfig {
    pub protocol_version: u32,
    pub max_payload: usize,
    pub features: Vec<String>,
    pub propose_delayed_ack: bool,
    pub delayed_ack_budget: u32,
    pub connect_deadline: Option<Duration>,
    pub handshake_deadline: Option<Duration>,
    pub open_deadline: Option<Duration>,
    pub write_deadline: Option<Duration>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        ConnectConfig {
            protocol_version: 0x0100_0001,
            max_payload: 1024 * 1024,
            features: vec![
                "shell_v2".to_string(),
                "cmd".to_string(),
                "stat_v2".to_string(),
                "abb_exec".to_string(),
                "fixed_push_mkdir".to_string(),
                "apex".to_string(),
            ],
            propose_delayed_ack: false,
            delayed_ack_budget: 1024 * 1024,
            connect_deadline: Some(Duration::from_secs(10)),
            handshake_deadline: Some(Duration::from_secs(30)),
            open_deadline: Some(Duration::from_secs(10)),
            write_deadline: None,
        }
    }
}

struct Inner {
    features: HashSet<String>,
    peer_max_payload: usize,
    protocol_version: u32,
    cmd_tx: mpsc::UnboundedSender<MuxCommand>,
    config: ConnectConfig,
}

/// An authenticated, multiplexed connection to an adbd instance.
///
/// Cloning a `Connection` is cheap; all clones share the same underlying
/// reader/writer task and stream table.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Perform the handshake over an already-connected [`Transport`] and,
    /// on success, spawn the stream multiplexer.
    ///
    /// `device_name` is sent verbatim alongside the public key when the
    /// device has not yet authorized this key (e.g. `"host::adb_core"`).
    pub async fn connect(
        transport: Transport,
        signer: &KeySigner,
        config: ConnectConfig,
        device_name: &str,
    ) -> Result<Connection, HandshakeError> {
        let outcome = handshake::perform(transport, signer, &config, device_name).await?;
        log::info!(
            "handshake complete: protocol_version={:#010x} max_payload={} features={:?}",
            outcome.peer_version,
            outcome.max_payload,
            outcome.features
        );
        let cmd_tx = stream::spawn_mux(outcome.framed, outcome.max_payload);
        Ok(Connection {
            inner: Arc::new(Inner {
                features: outcome.features,
                peer_max_payload: outcome.max_payload,
                protocol_version: outcome.peer_version,
                cmd_tx,
                config,
            }),
        })
    }

    /// Whether the peer advertised `feature` in its `CNXN` banner.
    pub fn supports(&self, feature: &str) -> bool {
        self.inner.features.contains(feature)
    }

    pub fn protocol_version(&self) -> u32 {
        self.inner.protocol_version
    }

    pub fn peer_max_payload(&self) -> usize {
        self.inner.peer_max_payload
    }

    /// Open a new multiplexed stream to `destination` (e.g. `"shell:ls"`,
    /// `"sync:"`).
    pub async fn open(&self, destination: &str) -> Result<crate::stream::Stream, StreamError> {
        let delayed_ack_budget = self.inner.config.propose_delayed_ack.then_some(self.inner.config.delayed_ack_budget);
        stream::open(
            &self.inner.cmd_tx,
            destination,
            self.inner.peer_max_payload,
            self.inner.config.open_deadline,
            delayed_ack_budget,
            self.inner.config.write_deadline,
        )
        .await
    }

    /// Cancel every outstanding stream operation with `TransportClosed` and
    /// tear down the reader/writer task. The Connection is unusable after this.
    pub async fn close(&self) {
        let _ = self.inner.cmd_tx.send(MuxCommand::Shutdown);
    }
}
