use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;

/// Protocol tag of the control channel (one per multiplexer pair)
pub const PROTOCOL_CONTROL: &str = "plex/ctl";

/// Protocol tag shared by every virtual stream's data channel
pub const PROTOCOL_CHANNEL: &str = "plex/channel";

/// Length of randomly generated stream ids
pub const ID_LEN: usize = 32;

/// Longest id an OPEN frame can carry
pub const MAX_ID_LEN: usize = u16::MAX as usize;

/// Frame types
pub const FRAME_OPEN: u8 = 0x01; // Open a channel half
pub const FRAME_MESSAGE: u8 = 0x02; // Channel payload
pub const FRAME_CLOSE: u8 = 0x03; // Close a channel half

/// Frame header size (type + channel)
pub const HEADER_SIZE: usize = 5;

/// Generate a random stream id
pub fn random_id() -> Bytes {
    let mut id = vec![0u8; ID_LEN];
    rand::thread_rng().fill_bytes(&mut id);
    Bytes::from(id)
}

/// Short hex rendering of an id for logs
pub(crate) fn short_id(id: &[u8]) -> String {
    hex::encode(&id[..id.len().min(8)])
}

/// Link frame
///
/// Wire format:
/// ```text
/// [type: u8][channel: u32][body]
///
/// OPEN:    [protocol_len: u16][protocol][id_len: u16][id][handshake]
/// MESSAGE: [payload]
/// CLOSE:   (empty)
/// ```
///
/// `channel` is always the sender's local channel number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Open {
        channel: u32,
        protocol: String,
        id: Bytes,
        handshake: Bytes,
    },
    Message {
        channel: u32,
        payload: Bytes,
    },
    Close {
        channel: u32,
    },
}

impl Frame {
    /// Sender-local channel number carried by this frame
    pub fn channel(&self) -> u32 {
        match self {
            Frame::Open { channel, .. } | Frame::Message { channel, .. } | Frame::Close { channel } => {
                *channel
            }
        }
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE
            + match self {
                Frame::Open {
                    protocol,
                    id,
                    handshake,
                    ..
                } => 2 + protocol.len() + 2 + id.len() + handshake.len(),
                Frame::Message { payload, .. } => payload.len(),
                Frame::Close { .. } => 0,
            }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());

        match self {
            Frame::Open {
                channel,
                protocol,
                id,
                handshake,
            } => {
                if protocol.len() > u16::MAX as usize {
                    return Err(Error::FrameTooLarge(protocol.len(), u16::MAX as usize));
                }
                if id.len() > MAX_ID_LEN {
                    return Err(Error::FrameTooLarge(id.len(), MAX_ID_LEN));
                }
                buf.put_u8(FRAME_OPEN);
                buf.put_u32(*channel);
                buf.put_u16(protocol.len() as u16);
                buf.put_slice(protocol.as_bytes());
                buf.put_u16(id.len() as u16);
                buf.put_slice(id);
                buf.put_slice(handshake);
            }
            Frame::Message { channel, payload } => {
                buf.put_u8(FRAME_MESSAGE);
                buf.put_u32(*channel);
                buf.put_slice(payload);
            }
            Frame::Close { channel } => {
                buf.put_u8(FRAME_CLOSE);
                buf.put_u32(*channel);
            }
        }

        Ok(buf.freeze())
    }

    /// Decode frame from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "Frame too short: {} bytes (expected at least {})",
                buf.len(),
                HEADER_SIZE
            )));
        }

        let kind = buf.get_u8();
        let channel = buf.get_u32();

        match kind {
            FRAME_OPEN => {
                let protocol = take_prefixed(&mut buf, "protocol")?;
                let protocol = String::from_utf8(protocol.to_vec())
                    .map_err(|_| Error::Protocol("Protocol tag is not UTF-8".to_string()))?;
                let id = take_prefixed(&mut buf, "id")?;
                Ok(Frame::Open {
                    channel,
                    protocol,
                    id,
                    handshake: buf,
                })
            }
            FRAME_MESSAGE => Ok(Frame::Message {
                channel,
                payload: buf,
            }),
            FRAME_CLOSE => {
                if buf.has_remaining() {
                    return Err(Error::Protocol(format!(
                        "CLOSE frame carries {} trailing bytes",
                        buf.remaining()
                    )));
                }
                Ok(Frame::Close { channel })
            }
            other => Err(Error::Protocol(format!("Unknown frame type {:02x}", other))),
        }
    }
}

fn take_prefixed(buf: &mut Bytes, field: &str) -> Result<Bytes> {
    if buf.remaining() < 2 {
        return Err(Error::Protocol(format!("Missing {} length", field)));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(Error::Protocol(format!(
            "Length mismatch for {}: header says {} bytes, but {} bytes available",
            field,
            len,
            buf.remaining()
        )));
    }
    Ok(buf.split_to(len))
}

/// Control channel message
///
/// Exchanged exactly twice per rendezvous: once with `is_initiator = true`
/// (request) and once with `is_initiator = false` (acknowledgement, or a
/// decline when nobody took the request in time).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub is_initiator: bool,
    /// Answer to a request that no listener picked up
    pub declined: bool,
    pub id: Bytes,
}

impl ControlMessage {
    /// Open request
    pub fn request(id: Bytes) -> Self {
        Self {
            is_initiator: true,
            declined: false,
            id,
        }
    }

    /// Acknowledgement of an open request
    pub fn ack(id: Bytes) -> Self {
        Self {
            is_initiator: false,
            declined: false,
            id,
        }
    }

    /// Refusal of an open request
    pub fn decline(id: Bytes) -> Self {
        Self {
            is_initiator: false,
            declined: true,
            id,
        }
    }
}
