//! Discovery datagram codec.
//!
//! The layout below is a placeholder: it has not been taken from a capture
//! of real device traffic. Replace this module once a capture is available;
//! callers only see [`Datagram`] and [`Announcement`].
//!
//! Every datagram starts with a four-byte header; integers are
//! little-endian.
//!
//! ```text
//!  0      2         3      4
//!  ┌──────┬─────────┬──────┐
//!  │ "RM" │ version │ kind │
//!  └──────┴─────────┴──────┘
//!
//!  Probe  (kind 1): header · app_id u64
//!  Reply  (kind 2): header · app_id u64 · ipv4 [4] · mac [6] · pairing u8
//!  Ack    (kind 3): header · app_id u64
//! ```

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rmbridge_types::BridgeError;

pub const MAGIC: [u8; 2] = *b"RM";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 4;

/// App id that matches every device.
pub const ANY_APP_ID: u64 = 0;

const KIND_PROBE: u8 = 1;
const KIND_REPLY: u8 = 2;
const KIND_ACK: u8 = 3;

const APP_ID_LEN: usize = 8;
const REPLY_BODY_LEN: usize = APP_ID_LEN + 4 + 6 + 1;

/// What a device says about itself in a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub app_id: u64,
    /// Address the device believes it has. Not trusted for connecting; the
    /// datagram source is used instead.
    pub ip: Ipv4Addr,
    pub mac: [u8; 6],
    pub pairing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datagram {
    Probe { app_id: u64 },
    Reply(Announcement),
    Ack { app_id: u64 },
}

impl Datagram {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + REPLY_BODY_LEN);
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        match self {
            Datagram::Probe { app_id } => {
                buf.put_u8(KIND_PROBE);
                buf.put_u64_le(*app_id);
            }
            Datagram::Reply(a) => {
                buf.put_u8(KIND_REPLY);
                buf.put_u64_le(a.app_id);
                buf.put_slice(&a.ip.octets());
                buf.put_slice(&a.mac);
                buf.put_u8(u8::from(a.pairing));
            }
            Datagram::Ack { app_id } => {
                buf.put_u8(KIND_ACK);
                buf.put_u64_le(*app_id);
            }
        }
        buf.freeze()
    }

    /// # Errors
    ///
    /// [`BridgeError::Decode`] for short datagrams, foreign magic, an
    /// unsupported version or an unknown kind.
    pub fn decode(mut buf: &[u8]) -> Result<Self, BridgeError> {
        if buf.remaining() < HEADER_LEN {
            return Err(BridgeError::Decode(format!(
                "datagram too short: {} bytes",
                buf.remaining()
            )));
        }

        let mut magic = [0u8; 2];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(BridgeError::Decode(format!("bad magic {magic:02x?}")));
        }
        let version = buf.get_u8();
        if version != VERSION {
            return Err(BridgeError::Decode(format!("unsupported version {version}")));
        }

        let kind = buf.get_u8();
        let body_len = match kind {
            KIND_PROBE | KIND_ACK => APP_ID_LEN,
            KIND_REPLY => REPLY_BODY_LEN,
            other => return Err(BridgeError::Decode(format!("unknown datagram kind {other}"))),
        };
        if buf.remaining() < body_len {
            return Err(BridgeError::Decode(format!(
                "kind {kind} needs {body_len} body bytes, got {}",
                buf.remaining()
            )));
        }

        let app_id = buf.get_u64_le();
        Ok(match kind {
            KIND_PROBE => Datagram::Probe { app_id },
            KIND_ACK => Datagram::Ack { app_id },
            _ => {
                let mut ip = [0u8; 4];
                buf.copy_to_slice(&mut ip);
                let mut mac = [0u8; 6];
                buf.copy_to_slice(&mut mac);
                let pairing = buf.get_u8() != 0;
                Datagram::Reply(Announcement {
                    app_id,
                    ip: Ipv4Addr::from(ip),
                    mac,
                    pairing,
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_layout() -> Result<(), BridgeError> {
        let reply = Datagram::Reply(Announcement {
            app_id: 0x0102_0304_0506_0708,
            ip: Ipv4Addr::new(192, 168, 2, 1),
            mac: [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
            pairing: true,
        });
        let bytes = reply.encode();

        assert_eq!(
            bytes.as_ref(),
            &[
                b'R', b'M', 1, 2, //
                8, 7, 6, 5, 4, 3, 2, 1, //
                192, 168, 2, 1, //
                0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, //
                1
            ]
        );
        assert_eq!(Datagram::decode(&bytes)?, reply);
        Ok(())
    }

    #[test]
    fn probe_and_ack_carry_app_id() -> Result<(), BridgeError> {
        assert_eq!(
            Datagram::decode(&Datagram::Probe { app_id: 42 }.encode())?,
            Datagram::Probe { app_id: 42 }
        );
        let ack = Datagram::Ack { app_id: 7 }.encode();
        assert_eq!(ack.len(), HEADER_LEN + 8);
        assert_eq!(ack[3], 3);
        Ok(())
    }

    #[test]
    fn malformed_datagrams_are_rejected() {
        let cases: [&[u8]; 5] = [
            b"RM",
            b"XX\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00",
            b"RM\x02\x01\x00\x00\x00\x00\x00\x00\x00\x00",
            b"RM\x01\x09\x00\x00\x00\x00\x00\x00\x00\x00",
            b"RM\x01\x02\x00\x00\x00\x00\x00\x00\x00\x00\xc0",
        ];
        for case in cases {
            assert!(
                matches!(Datagram::decode(case), Err(BridgeError::Decode(_))),
                "accepted {case:?}"
            );
        }
    }
}
