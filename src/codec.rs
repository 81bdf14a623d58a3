//! The 24-byte packet header codec.

use crate::error::ProtocolError;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};

pub const HEADER_LEN: usize = 24;

/// Protocol version at and above which the legacy payload checksum is
/// zeroed on transmit and ignored on receive.
pub const CHECKSUM_CUTOVER_VERSION: u32 = 0x0100_0001;

fn cmd_id(bytes: &[u8; 4]) -> u32 {
    LittleEndian::read_u32(bytes)
}

const CNXN: u32 = 0x4e58_4e43;
const AUTH: u32 = 0x4854_5541;
const STLS: u32 = 0x534c_5453;
const OPEN: u32 = 0x4e45_504f;
const OKAY: u32 = 0x5941_4b4f;
const WRTE: u32 = 0x4554_5257;
const CLSE: u32 = 0x4553_4c43;

/// One of the seven ADB wire commands.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub enum Command {
    Cnxn,
    Auth,
    Stls,
    Open,
    Okay,
    Wrte,
    Clse,
}

impl Command {
    pub fn as_u32(self) -> u32 {
        match self {
            Command::Cnxn => CNXN,
            Command::Auth => AUTH,
            Command::Stls => STLS,
            Command::Open => OPEN,
            Command::Okay => OKAY,
            Command::Wrte => WRTE,
            Command::Clse => CLSE,
        }
    }

    pub fn from_u32(v: u32) -> Result<Self, ProtocolError> {
        Ok(match v {
            CNXN => Command::Cnxn,
            AUTH => Command::Auth,
            STLS => Command::Stls,
            OPEN => Command::Open,
            OKAY => Command::Okay,
            WRTE => Command::Wrte,
            CLSE => Command::Clse,
            other => return Err(ProtocolError::UnknownCommand(other)),
        })
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Command::Cnxn => "CNXN",
            Command::Auth => "AUTH",
            Command::Stls => "STLS",
            Command::Open => "OPEN",
            Command::Okay => "OKAY",
            Command::Wrte => "WRTE",
            Command::Clse => "CLSE",
        };
        f.write_str(s)
    }
}

/// A decoded wire packet: 24-byte header plus its payload.
#[derive(Clone)]
pub struct Packet {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Vec<u8>,
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("command", &self.command)
            .field("arg0", &self.arg0)
            .field("arg1", &self.arg1)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Unsigned sum of payload bytes, modulo 2^32 (legacy checksum, pre-0x01000001).
pub fn checksum(payload: &[u8]) -> u32 {
    payload.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

impl Packet {
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: Vec<u8>) -> Self {
        Packet { command, arg0, arg1, payload }
    }

    pub fn empty(command: Command, arg0: u32, arg1: u32) -> Self {
        Self::new(command, arg0, arg1, Vec::new())
    }
}

/// A decoded 24-byte header, before the payload has necessarily been read.
pub struct Header {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub data_length: u32,
    pub data_checksum: u32,
}

pub fn decode_header(bytes: &[u8; HEADER_LEN]) -> Result<Header, ProtocolError> {
    let raw_command = LittleEndian::read_u32(&bytes[0..4]);
    let command = Command::from_u32(raw_command)?;
    let arg0 = LittleEndian::read_u32(&bytes[4..8]);
    let arg1 = LittleEndian::read_u32(&bytes[8..12]);
    let data_length = LittleEndian::read_u32(&bytes[12..16]);
    let data_checksum = LittleEndian::read_u32(&bytes[16..20]);
    let magic = LittleEndian::read_u32(&bytes[20..24]);
    let expected_magic = raw_command ^ 0xFFFF_FFFF;
    if magic != expected_magic {
        return Err(ProtocolError::BadMagic { command, magic });
    }
    Ok(Header { command, arg0, arg1, data_length, data_checksum })
}

pub fn encode_header(header: &Header) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    let raw_command = header.command.as_u32();
    LittleEndian::write_u32(&mut buf[0..4], raw_command);
    LittleEndian::write_u32(&mut buf[4..8], header.arg0);
    LittleEndian::write_u32(&mut buf[8..12], header.arg1);
    LittleEndian::write_u32(&mut buf[12..16], header.data_length);
    LittleEndian::write_u32(&mut buf[16..20], header.data_checksum);
    LittleEndian::write_u32(&mut buf[20..24], raw_command ^ 0xFFFF_FFFF);
    buf
}

/// `tokio_util::codec::{Decoder, Encoder}` implementation for [`Packet`],
/// for use with `Framed<T, PacketCodec>`.
///
/// `max_payload` and `protocol_version` are updated in place once the
/// handshake negotiates them; both start at conservative defaults so the
/// codec can decode the initial `CNXN` exchange before negotiation.
pub struct PacketCodec {
    pub max_payload: usize,
    pub protocol_version: u32,
    decoding_header: Option<Header>,
}

impl PacketCodec {
    pub fn new(max_payload: usize) -> Self {
        PacketCodec { max_payload, protocol_version: CHECKSUM_CUTOVER_VERSION, decoding_header: None }
    }

    fn checksum_enforced(&self) -> bool {
        self.protocol_version < CHECKSUM_CUTOVER_VERSION
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        loop {
            if self.decoding_header.is_none() {
                if src.len() < HEADER_LEN {
                    src.reserve(HEADER_LEN - src.len());
                    return Ok(None);
                }
                let mut raw = [0u8; HEADER_LEN];
                raw.copy_from_slice(&src[..HEADER_LEN]);
                src.advance(HEADER_LEN);
                let header = decode_header(&raw)?;
                if header.data_length as usize > self.max_payload {
                    return Err(ProtocolError::PayloadTooLarge {
                        len: header.data_length as usize,
                        max: self.max_payload,
                    });
                }
                self.decoding_header = Some(header);
            }

            let header = self.decoding_header.as_ref().expect("checked above");
            let needed = header.data_length as usize;
            if src.len() < needed {
                src.reserve(needed - src.len());
                return Ok(None);
            }

            let header = self.decoding_header.take().expect("checked above");
            let payload = src.split_to(needed).to_vec();
            if self.checksum_enforced() {
                let computed = checksum(&payload);
                if computed != header.data_checksum {
                    return Err(ProtocolError::ChecksumMismatch { expected: header.data_checksum, computed });
                }
            }
            return Ok(Some(Packet::new(header.command, header.arg0, header.arg1, payload)));
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if packet.payload.len() > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge { len: packet.payload.len(), max: self.max_payload });
        }
        let data_checksum = if self.checksum_enforced() { checksum(&packet.payload) } else { 0 };
        let header = Header {
            command: packet.command,
            arg0: packet.arg0,
            arg1: packet.arg1,
            data_length: packet.payload.len() as u32,
            data_checksum,
        };
        dst.reserve(HEADER_LEN + packet.payload.len());
        dst.put_slice(&encode_header(&header));
        dst.put_slice(&packet.payload);
        Ok(())
    }
}
