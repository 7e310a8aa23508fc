use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR: Header = 0;
const CONTROL: Header = 1;
const GRADIENT: Header = 2;
const REDUCED: Header = 3;
const SHARD: Header = 4;
const GATHERED: Header = 5;

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    /// A rank's local gradient, sent to the hub to be averaged.
    Gradient(&'a [f32]),
    /// The averaged gradient, sent back by the hub.
    Reduced(&'a [f32]),
    /// A rank's local values, sent to the hub to be concatenated.
    Shard(&'a [f32]),
    /// The values of every rank concatenated in rank order.
    Gathered(&'a [f32]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Join { rank: usize, world_size: usize },
    Disconnect,
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// Returns a short human readable name for this message's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(_) => "control",
            Msg::Err(_) => "err",
            Msg::Data(Payload::Gradient(_)) => "data/gradient",
            Msg::Data(Payload::Reduced(_)) => "data/reduced",
            Msg::Data(Payload::Shard(_)) => "data/shard",
            Msg::Data(Payload::Gathered(_)) => "data/gathered",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind_byte<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {kind}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL.to_be_bytes());

                // Derived `Serialize` with no non-string map keys cannot fail.
                let json = serde_json::to_vec(cmd).unwrap_or_default();
                buf.extend_from_slice(&json);
                None
            }
            Msg::Data(payload) => {
                let (kind, nums) = match payload {
                    Payload::Gradient(nums) => (GRADIENT, nums),
                    Payload::Reduced(nums) => (REDUCED, nums),
                    Payload::Shard(nums) => (SHARD, nums),
                    Payload::Gathered(nums) => (GATHERED, nums),
                };

                buf.extend_from_slice(&kind.to_be_bytes());
                Some(bytemuck::cast_slice(nums))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);
        let mut kind_bytes = [0; HEADER_SIZE];
        kind_bytes.copy_from_slice(kind_buf);
        let kind = Header::from_be_bytes(kind_bytes);

        match kind {
            ERR => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            GRADIENT | REDUCED | SHARD | GATHERED => {
                let nums: &[f32] = bytemuck::try_cast_slice(rest).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("{e:?}"))
                })?;

                let payload = match kind {
                    GRADIENT => Payload::Gradient(nums),
                    REDUCED => Payload::Reduced(nums),
                    SHARD => Payload::Shard(nums),
                    _ => Payload::Gathered(nums),
                };

                Ok(Self::Data(payload))
            }
            kind => Self::invalid_kind_byte(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_bytes(msg: &Msg<'_>) -> Vec<u32> {
        let mut buf = Vec::new();
        let tail = msg.serialize(&mut buf);
        if let Some(tail) = tail {
            buf.extend_from_slice(tail);
        }

        // Copy into a 4-aligned buffer like the receiver does.
        let mut aligned = vec![0u32; buf.len().div_ceil(4)];
        bytemuck::cast_slice_mut::<u32, u8>(&mut aligned)[..buf.len()].copy_from_slice(&buf);
        aligned.truncate(buf.len().div_ceil(4));
        aligned
    }

    #[test]
    fn control_message_survives_the_wire() {
        let msg = Msg::Control(Command::Join {
            rank: 3,
            world_size: 4,
        });
        let mut buf = Vec::new();
        assert!(msg.serialize(&mut buf).is_none());

        match Msg::deserialize(&buf).unwrap() {
            Msg::Control(cmd) => assert_eq!(
                cmd,
                Command::Join {
                    rank: 3,
                    world_size: 4
                }
            ),
            other => panic!("unexpected msg: {other:?}"),
        }
    }

    #[test]
    fn gradient_payload_is_zero_copy() {
        let grad = [1.0_f32, -2.5, 3.25];
        let msg = Msg::Data(Payload::Gradient(&grad));
        let aligned = roundtrip_bytes(&msg);
        let bytes = &bytemuck::cast_slice::<u32, u8>(&aligned)[..HEADER_SIZE + 12];

        match Msg::deserialize(bytes).unwrap() {
            Msg::Data(Payload::Gradient(g)) => assert_eq!(g, grad),
            other => panic!("unexpected msg: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let buf = 42u32.to_be_bytes();
        assert!(Msg::deserialize(&buf).is_err());
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(Msg::deserialize(&[0, 1]).is_err());
    }
}
