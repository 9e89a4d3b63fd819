//! Frame codec for the node wire protocol
//!
//! Every message travels as `magic | command | length | checksum | payload`
//! with little-endian integers, a NUL-padded 12-byte ASCII command and a
//! bincode payload. Frames with a well-formed header but an unknown command
//! are skipped so newer peers can talk to us.

use crate::core::Block;
use crate::error::{HarnessError, Result};
use crate::network::message::{
    GetBlocksMessage, InvItem, Message, MessageKind, VersionMessage, MAX_INV_SIZE,
};
use crate::utils::{deserialize_limited, serialize, sha256d};
use log::debug;
use std::io::{ErrorKind, Read, Write};

pub const COMMAND_SIZE: usize = 12;
pub const FRAME_HEADER_SIZE: usize = 4 + COMMAND_SIZE + 4 + 4;
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
struct FrameHeader {
    command: String,
    length: usize,
    checksum: [u8; 4],
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    magic: u32,
}

impl FrameCodec {
    pub fn new(magic: u32) -> FrameCodec {
        FrameCodec { magic }
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    /// Encode a message into one complete frame
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let payload = encode_payload(message)?;
        self.encode_raw(message.kind().command(), &payload)
    }

    /// Frame an arbitrary command and payload
    pub fn encode_raw(&self, command: &str, payload: &[u8]) -> Result<Vec<u8>> {
        if command.is_empty() || command.len() > COMMAND_SIZE || !command.is_ascii() {
            return Err(HarnessError::Framing(format!("Invalid command {command:?}")));
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(HarnessError::Framing(format!(
                "Payload of {} bytes exceeds maximum of {MAX_PAYLOAD_SIZE}",
                payload.len()
            )));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&self.magic.to_le_bytes());
        let mut command_bytes = [0u8; COMMAND_SIZE];
        command_bytes[..command.len()].copy_from_slice(command.as_bytes());
        frame.extend_from_slice(&command_bytes);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&sha256d(payload)[..4]);
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    pub fn write_message<W: Write>(&self, writer: &mut W, message: &Message) -> Result<()> {
        let frame = self.encode(message)?;
        writer
            .write_all(&frame)
            .and_then(|_| writer.flush())
            .map_err(|e| HarnessError::Connection(format!("Failed to send {}: {e}", message.kind())))
    }

    /// Read the next known message.
    ///
    /// `Ok(None)` means the stream ended cleanly on a frame boundary. A stream
    /// that ends inside a frame, or any inconsistent field, is a framing error.
    pub fn read_message<R: Read>(&self, reader: &mut R) -> Result<Option<Message>> {
        loop {
            let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
            if !read_exact_or_eof(reader, &mut header_bytes)? {
                return Ok(None);
            }
            let header = self.parse_header(&header_bytes)?;

            let mut payload = vec![0u8; header.length];
            if !read_exact_or_eof(reader, &mut payload)? && header.length > 0 {
                return Err(HarnessError::Framing(format!(
                    "Stream ended before {} payload bytes of {}",
                    header.length, header.command
                )));
            }
            if sha256d(&payload)[..4] != header.checksum {
                return Err(HarnessError::Framing(format!(
                    "Checksum mismatch for {} frame",
                    header.command
                )));
            }

            match MessageKind::from_command(&header.command) {
                Some(kind) => return decode_payload(kind, &payload).map(Some),
                None => {
                    debug!(
                        "Skipping unknown command {:?} ({} bytes)",
                        header.command, header.length
                    );
                }
            }
        }
    }

    /// Decode every frame contained in `bytes`
    pub fn decode_all(&self, bytes: &[u8]) -> Result<Vec<Message>> {
        let mut cursor = std::io::Cursor::new(bytes);
        let mut messages = Vec::new();
        while let Some(message) = self.read_message(&mut cursor)? {
            messages.push(message);
        }
        Ok(messages)
    }

    fn parse_header(&self, bytes: &[u8; FRAME_HEADER_SIZE]) -> Result<FrameHeader> {
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != self.magic {
            return Err(HarnessError::Framing(format!(
                "Bad magic {magic:#010x}, expected {:#010x}",
                self.magic
            )));
        }

        let command = parse_command(&bytes[4..4 + COMMAND_SIZE])?;

        let length_offset = 4 + COMMAND_SIZE;
        let length = u32::from_le_bytes([
            bytes[length_offset],
            bytes[length_offset + 1],
            bytes[length_offset + 2],
            bytes[length_offset + 3],
        ]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(HarnessError::Framing(format!(
                "Declared length {length} of {command} exceeds maximum of {MAX_PAYLOAD_SIZE}"
            )));
        }

        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[length_offset + 4..FRAME_HEADER_SIZE]);

        Ok(FrameHeader {
            command,
            length,
            checksum,
        })
    }
}

// ASCII command followed only by NUL padding
fn parse_command(raw: &[u8]) -> Result<String> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    let (name, padding) = raw.split_at(end);
    if name.is_empty() {
        return Err(HarnessError::Framing("Empty command".to_string()));
    }
    if padding.iter().any(|b| *b != 0) {
        return Err(HarnessError::Framing(
            "Command has data after NUL padding".to_string(),
        ));
    }
    if !name.iter().all(|b| b.is_ascii_graphic()) {
        return Err(HarnessError::Framing(
            "Command is not printable ASCII".to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(name).into_owned())
}

// false on EOF before the first byte, framing error on EOF after it
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(HarnessError::Framing(format!(
                    "Truncated frame: got {filled} of {} bytes",
                    buf.len()
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(HarnessError::Connection(format!("Read failed: {e}"))),
        }
    }
    Ok(true)
}

fn encode_payload(message: &Message) -> Result<Vec<u8>> {
    match message {
        Message::Version(v) => serialize(v),
        Message::Verack => Ok(Vec::new()),
        Message::Ping(nonce) | Message::Pong(nonce) => serialize(nonce),
        Message::Inv(items) | Message::GetData(items) | Message::NotFound(items) => {
            if items.len() > MAX_INV_SIZE {
                return Err(HarnessError::Framing(format!(
                    "Inventory of {} items exceeds maximum of {MAX_INV_SIZE}",
                    items.len()
                )));
            }
            serialize(items)
        }
        Message::GetBlocks(req) => serialize(req),
        Message::Block(block) => block.serialize(),
    }
}

fn decode_payload(kind: MessageKind, payload: &[u8]) -> Result<Message> {
    let message = match kind {
        MessageKind::Version => Message::Version(decode_exact::<VersionMessage>(kind, payload)?),
        MessageKind::Verack => {
            if !payload.is_empty() {
                return Err(HarnessError::Framing(format!(
                    "verack carries {} unexpected bytes",
                    payload.len()
                )));
            }
            Message::Verack
        }
        MessageKind::Ping => Message::Ping(decode_exact::<u64>(kind, payload)?),
        MessageKind::Pong => Message::Pong(decode_exact::<u64>(kind, payload)?),
        MessageKind::Inv => Message::Inv(decode_inventory(kind, payload)?),
        MessageKind::GetData => Message::GetData(decode_inventory(kind, payload)?),
        MessageKind::NotFound => Message::NotFound(decode_inventory(kind, payload)?),
        MessageKind::GetBlocks => {
            Message::GetBlocks(decode_exact::<GetBlocksMessage>(kind, payload)?)
        }
        MessageKind::Block => Message::Block(decode_exact::<Block>(kind, payload)?),
    };
    Ok(message)
}

fn decode_inventory(kind: MessageKind, payload: &[u8]) -> Result<Vec<InvItem>> {
    let items = decode_exact::<Vec<InvItem>>(kind, payload)?;
    if items.len() > MAX_INV_SIZE {
        return Err(HarnessError::Framing(format!(
            "{kind} with {} items exceeds maximum of {MAX_INV_SIZE}",
            items.len()
        )));
    }
    Ok(items)
}

// The declared length must match the payload exactly. Lengths declared inside
// the payload are bounded by the frame limit before anything is allocated.
fn decode_exact<T: bincode::Decode<()>>(kind: MessageKind, payload: &[u8]) -> Result<T> {
    let (value, consumed) = deserialize_limited::<T, MAX_PAYLOAD_SIZE>(payload)
        .map_err(|e| HarnessError::Framing(format!("Malformed {kind} payload: {e}")))?;
    if consumed != payload.len() {
        return Err(HarnessError::Framing(format!(
            "{kind} payload has {} trailing bytes",
            payload.len() - consumed
        )));
    }
    Ok(value)
}
