use super::ConnectConfig;
use crate::codec::{Command, Packet, PacketCodec};
use crate::error::HandshakeError;
use crate::key::KeySigner;
use crate::transport::{upgrade_tls, Transport, TlsKeypair};
use base64::Engine;
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::codec::{Framed, FramedParts};

const AUTH_TOKEN: u32 = 1;
const AUTH_SIGNATURE: u32 = 2;
const AUTH_RSAPUBLICKEY: u32 = 3;

pub(crate) struct HandshakeOutcome {
    pub framed: Framed<Transport, PacketCodec>,
    pub peer_version: u32,
    pub max_payload: usize,
    pub features: HashSet<String>,
}

/// Drive the `CNXN`/`AUTH`/`STLS` handshake to completion, or fail with a
/// fatal [`HandshakeError`]. On success, returns the `Framed` transport
/// (with the negotiated protocol version and max_payload already applied
/// to its codec) ready to be handed to the stream multiplexer.
pub(crate) async fn perform(
    transport: Transport,
    signer: &KeySigner,
    config: &ConnectConfig,
    device_name: &str,
) -> Result<HandshakeOutcome, HandshakeError> {
    let codec = PacketCodec::new(config.max_payload);
    let mut framed = Framed::new(transport, codec);

    send_cnxn(&mut framed, config).await?;

    let mut auth_rounds: u32 = 0;
    loop {
        let packet = recv_with_deadline(&mut framed, config.handshake_deadline).await?;
        match packet.command {
            Command::Stls => {
                let keys = TlsKeypair::generate()?;
                send(&mut framed, Packet::empty(Command::Stls, config.protocol_version, 0)).await?;
                framed = swap_tls(framed, keys).await?;
                send_cnxn(&mut framed, config).await?;
            }
            Command::Auth if packet.arg0 == AUTH_TOKEN => {
                auth_rounds += 1;
                if auth_rounds > 2 {
                    return Err(HandshakeError::AuthRejected);
                }
                if auth_rounds == 1 {
                    log::debug!("signing auth challenge (round 1)");
                    let sig = signer.sign_token(&packet.payload)?;
                    send(&mut framed, Packet::new(Command::Auth, AUTH_SIGNATURE, 0, sig.to_vec())).await?;
                } else {
                    log::debug!("signature rejected, offering public key (round 2)");
                    let blob = signer.public_key_android_blob();
                    let mut payload = base64::engine::general_purpose::STANDARD.encode(blob).into_bytes();
                    payload.push(b' ');
                    payload.extend_from_slice(device_name.as_bytes());
                    payload.push(0);
                    send(&mut framed, Packet::new(Command::Auth, AUTH_RSAPUBLICKEY, 0, payload)).await?;
                }
            }
            Command::Cnxn => {
                let (peer_version, peer_max_payload, features) =
                    parse_cnxn_banner(packet.arg0, packet.arg1, &packet.payload)?;
                let negotiated_max_payload = (peer_max_payload as usize).min(config.max_payload);
                framed.codec_mut().protocol_version = peer_version;
                framed.codec_mut().max_payload = negotiated_max_payload;
                return Ok(HandshakeOutcome { framed, peer_version, max_payload: negotiated_max_payload, features });
            }
            Command::Clse | Command::Okay | Command::Wrte => {
                log::debug!("ignoring stray {:?} during handshake", packet.command);
            }
            other => {
                return Err(HandshakeError::UnexpectedCommand { command: other, state: "handshake" });
            }
        }
    }
}

async fn send(framed: &mut Framed<Transport, PacketCodec>, packet: Packet) -> Result<(), HandshakeError> {
    framed.send(packet).await?;
    Ok(())
}

async fn send_cnxn(framed: &mut Framed<Transport, PacketCodec>, config: &ConnectConfig) -> Result<(), HandshakeError> {
    let banner = format!("host::features={}\0", config.features.join(","));
    send(framed, Packet::new(Command::Cnxn, config.protocol_version, config.max_payload as u32, banner.into_bytes())).await
}

async fn recv_with_deadline(
    framed: &mut Framed<Transport, PacketCodec>,
    deadline: Option<Duration>,
) -> Result<Packet, HandshakeError> {
    let next = framed.next();
    let item = match deadline {
        Some(d) => tokio::time::timeout(d, next).await.map_err(|_| HandshakeError::HandshakeTimeout)?,
        None => next.await,
    };
    match item {
        Some(Ok(packet)) => Ok(packet),
        Some(Err(e)) => Err(e.into()),
        None => Err(crate::error::TransportError::Closed.into()),
    }
}

async fn swap_tls(
    framed: Framed<Transport, PacketCodec>,
    keys: TlsKeypair,
) -> Result<Framed<Transport, PacketCodec>, HandshakeError> {
    let parts = framed.into_parts();
    let FramedParts { io, codec, read_buf, write_buf, .. } = parts;
    let upgraded = upgrade_tls(io, keys).await?;
    let mut new_parts = FramedParts::new(upgraded, codec);
    new_parts.read_buf = read_buf;
    new_parts.write_buf = write_buf;
    Ok(Framed::from_parts(new_parts))
}

/// Parse a peer `CNXN` banner of the form
/// `"device::ro.product.name=x;features=f1,f2;..."`.
fn parse_cnxn_banner(version: u32, max_payload: u32, payload: &[u8]) -> Result<(u32, u32, HashSet<String>), HandshakeError> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim_end_matches('\0');
    let mut features = HashSet::new();
    for field in text.split(';') {
        if let Some(value) = field.strip_prefix("features=") {
            features.extend(value.split(',').filter(|s| !s.is_empty()).map(|s| s.to_string()));
        }
    }
    Ok((version, max_payload, features))
}
