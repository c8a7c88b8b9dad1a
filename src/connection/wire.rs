//! Command/reply vocabulary encoded on top of the generic [`crate::frame`] primitive
//!
//! This encoding only needs to be internally consistent enough to drive
//! `PubConnection`/`SubConnection` against a real or fake broker — it is
//! deliberately not bit-exact to any particular broker implementation.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::MessageId;

#[derive(Debug, Clone)]
pub(crate) enum ClientFrame {
    Identify(Bytes),
    Sub { topic: String, channel: String },
    Rdy(u32),
    Fin(MessageId),
    Req { id: MessageId, delay_ms: u32 },
    Touch(MessageId),
    Cls,
    Nop,
    Pub { topic: String, payload: Bytes },
    Mpub { topic: String, payloads: Vec<Bytes> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServerFrame {
    Ok,
    Error(String),
    Message {
        id: MessageId,
        timestamp_ms: u64,
        attempts: u16,
        body: Bytes,
    },
    Heartbeat,
}

const TAG_IDENTIFY: u8 = 1;
const TAG_SUB: u8 = 2;
const TAG_RDY: u8 = 3;
const TAG_FIN: u8 = 4;
const TAG_REQ: u8 = 5;
const TAG_TOUCH: u8 = 6;
const TAG_CLS: u8 = 7;
const TAG_NOP: u8 = 8;
const TAG_PUB: u8 = 9;
const TAG_MPUB: u8 = 10;

const TAG_OK: u8 = 1;
const TAG_ERROR: u8 = 2;
const TAG_MESSAGE: u8 = 3;
const TAG_HEARTBEAT: u8 = 4;

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(u32::try_from(s.len()).expect("command string fits in u32"));
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut Bytes) -> Option<String> {
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return None;
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).ok()
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32(u32::try_from(b.len()).expect("payload fits in u32"));
    buf.put_slice(b);
}

fn get_bytes(buf: &mut Bytes) -> Option<Bytes> {
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return None;
    }
    Some(buf.copy_to_bytes(len))
}

impl ClientFrame {
    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Identify(payload) => {
                buf.put_u8(TAG_IDENTIFY);
                put_bytes(&mut buf, payload);
            }
            Self::Sub { topic, channel } => {
                buf.put_u8(TAG_SUB);
                put_str(&mut buf, topic);
                put_str(&mut buf, channel);
            }
            Self::Rdy(n) => {
                buf.put_u8(TAG_RDY);
                buf.put_u32(*n);
            }
            Self::Fin(id) => {
                buf.put_u8(TAG_FIN);
                buf.put_slice(&id.as_bytes());
            }
            Self::Req { id, delay_ms } => {
                buf.put_u8(TAG_REQ);
                buf.put_slice(&id.as_bytes());
                buf.put_u32(*delay_ms);
            }
            Self::Touch(id) => {
                buf.put_u8(TAG_TOUCH);
                buf.put_slice(&id.as_bytes());
            }
            Self::Cls => buf.put_u8(TAG_CLS),
            Self::Nop => buf.put_u8(TAG_NOP),
            Self::Pub { topic, payload } => {
                buf.put_u8(TAG_PUB);
                put_str(&mut buf, topic);
                put_bytes(&mut buf, payload);
            }
            Self::Mpub { topic, payloads } => {
                buf.put_u8(TAG_MPUB);
                put_str(&mut buf, topic);
                buf.put_u32(u32::try_from(payloads.len()).expect("batch fits in u32"));
                for payload in payloads {
                    put_bytes(&mut buf, payload);
                }
            }
        }
        buf.freeze()
    }

    #[cfg(test)]
    pub(crate) fn decode(mut buf: Bytes) -> Option<Self> {
        let tag = buf.first().copied()?;
        buf.advance(1);
        Some(match tag {
            TAG_IDENTIFY => Self::Identify(get_bytes(&mut buf)?),
            TAG_SUB => Self::Sub {
                topic: get_str(&mut buf)?,
                channel: get_str(&mut buf)?,
            },
            TAG_RDY => Self::Rdy(buf.get_u32()),
            TAG_FIN => Self::Fin(read_message_id(&mut buf)?),
            TAG_REQ => Self::Req {
                id: read_message_id(&mut buf)?,
                delay_ms: buf.get_u32(),
            },
            TAG_TOUCH => Self::Touch(read_message_id(&mut buf)?),
            TAG_CLS => Self::Cls,
            TAG_NOP => Self::Nop,
            TAG_PUB => Self::Pub {
                topic: get_str(&mut buf)?,
                payload: get_bytes(&mut buf)?,
            },
            TAG_MPUB => {
                let topic = get_str(&mut buf)?;
                let count = buf.get_u32();
                let payloads = (0..count)
                    .map(|_| get_bytes(&mut buf))
                    .collect::<Option<Vec<_>>>()?;
                Self::Mpub { topic, payloads }
            }
            _ => return None,
        })
    }
}

fn read_message_id(buf: &mut Bytes) -> Option<MessageId> {
    if buf.remaining() < 16 {
        return None;
    }
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Some(MessageId::from_bytes(raw))
}

impl ServerFrame {
    #[cfg(test)]
    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Ok => buf.put_u8(TAG_OK),
            Self::Error(msg) => {
                buf.put_u8(TAG_ERROR);
                put_str(&mut buf, msg);
            }
            Self::Message {
                id,
                timestamp_ms,
                attempts,
                body,
            } => {
                buf.put_u8(TAG_MESSAGE);
                buf.put_slice(&id.as_bytes());
                buf.put_u64(*timestamp_ms);
                buf.put_u16(*attempts);
                put_bytes(&mut buf, body);
            }
            Self::Heartbeat => buf.put_u8(TAG_HEARTBEAT),
        }
        buf.freeze()
    }

    pub(crate) fn decode(mut buf: Bytes) -> Option<Self> {
        let tag = buf.first().copied()?;
        buf.advance(1);
        Some(match tag {
            TAG_OK => Self::Ok,
            TAG_ERROR => Self::Error(get_str(&mut buf)?),
            TAG_MESSAGE => {
                let id = read_message_id(&mut buf)?;
                let timestamp_ms = buf.get_u64();
                let attempts = buf.get_u16();
                let body = get_bytes(&mut buf)?;
                Self::Message {
                    id,
                    timestamp_ms,
                    attempts,
                    body,
                }
            }
            TAG_HEARTBEAT => Self::Heartbeat,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{ClientFrame, ServerFrame};
    use crate::types::MessageId;

    #[test]
    fn client_frame_roundtrips() {
        let frames = vec![
            ClientFrame::Sub {
                topic: "orders".to_owned(),
                channel: "worker".to_owned(),
            },
            ClientFrame::Rdy(42),
            ClientFrame::Pub {
                topic: "orders".to_owned(),
                payload: Bytes::from_static(b"hello"),
            },
            ClientFrame::Mpub {
                topic: "orders".to_owned(),
                payloads: vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
            },
        ];

        for frame in frames {
            let encoded = frame.encode();
            let decoded = ClientFrame::decode(encoded).unwrap();
            assert_eq!(format!("{frame:?}"), format!("{decoded:?}"));
        }
    }

    #[test]
    fn server_frame_roundtrips() {
        let frame = ServerFrame::Message {
            id: MessageId::from_bytes([7; 16]),
            timestamp_ms: 1234,
            attempts: 3,
            body: Bytes::from_static(b"payload"),
        };
        let decoded = ServerFrame::decode(frame.encode()).unwrap();
        assert_eq!(frame, decoded);

        assert_eq!(ServerFrame::Ok, ServerFrame::decode(ServerFrame::Ok.encode()).unwrap());
    }
}
