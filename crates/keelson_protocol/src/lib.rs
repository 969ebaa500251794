#![doc = include_str!("../README.md")]

mod impls;
pub mod input;
pub mod messages;
pub mod movement;
pub mod packet;
pub mod pool;
pub mod snapshot;

use std::io::Write;

use anyhow::Context;
pub use glam::{Vec2, Vec3};
pub use input::{InputData, InputFlags};
pub use messages::MessageKind;
pub use movement::{step, MovementSettings};
pub use packet::{ChannelTag, Packet, PacketKind};
pub use pool::PacketPool;
pub use snapshot::{StateFlags, StateSnapshot};
pub use {anyhow, uuid};

/// The maximum size in bytes of a single framed packet, header included.
///
/// Anything larger than this cannot be represented by the `u16` payload
/// length field and is rejected by both the encoder and the decoder.
pub const MAX_PACKET_SIZE: usize = packet::HEADER_SIZE + u16::MAX as usize;

/// The protocol version spoken by this library. Carried in the admission
/// handshake; peers with a different version are refused.
pub const PROTOCOL_VERSION: u16 = 1;

/// The `Encode` trait allows objects to be written to the wire. It is the
/// inverse of [`Decode`].
///
/// All multi-byte primitives are encoded little-endian. Strings and byte
/// slices are length-prefixed with a `u16`. There is no field tagging:
/// records are positional, and the first field of every application
/// message is its [`MessageKind`].
pub trait Encode {
    /// Writes this object to the provided writer.
    ///
    /// If this type also implements [`Decode`] then successful calls to
    /// this function must always successfully decode using the data that
    /// was written, consuming exactly the bytes that were produced.
    fn encode(&self, w: impl Write) -> anyhow::Result<()>;
}

/// The `Decode` trait allows objects to be read from the wire. It is the
/// inverse of [`Encode`].
///
/// `Decode` is parameterized by a lifetime so decoded values may borrow
/// from the byte slice they were read from.
pub trait Decode<'a>: Sized {
    /// Reads this object from the provided byte slice.
    ///
    /// Implementations are expected to shrink the slice from the front as
    /// bytes are read.
    fn decode(r: &mut &'a [u8]) -> anyhow::Result<Self>;
}

/// Types that are application messages carried in the payload of a
/// [`PacketKind::Data`] packet.
///
/// In serialized form, a message begins with its `u16` [`MessageKind`]
/// followed by the body. The implementations of [`Encode`] and [`Decode`]
/// on `Self` handle only the _body_, without the leading kind; this split
/// is what lets the dispatcher peek the kind without deserializing.
pub trait Message: std::fmt::Debug {
    /// The leading kind tag of this message.
    const KIND: MessageKind;
    /// The name of this message for debugging purposes.
    const NAME: &'static str;

    /// Encodes this message's kind tag first, followed by the body.
    fn encode_with_kind(&self, mut w: impl Write) -> anyhow::Result<()>
    where
        Self: Encode,
    {
        (Self::KIND as u16)
            .encode(&mut w)
            .context("failed to encode message kind")?;

        self.encode(w)
    }
}

/// Reads the [`MessageKind`] of a serialized message without
/// deserializing the rest of it.
///
/// Returns `None` when the payload is shorter than the kind tag itself.
/// An unassigned numeric tag decodes to [`MessageKind::Unknown`].
pub fn peek_message_kind(payload: &[u8]) -> Option<MessageKind> {
    let bytes: [u8; 2] = payload.get(..2)?.try_into().ok()?;
    Some(MessageKind::from_raw(u16::from_le_bytes(bytes)))
}

/// Decodes a full message payload as type `M`, checking that the leading
/// kind tag matches and that the body consumes the entire payload.
pub fn decode_message<M>(payload: &[u8]) -> anyhow::Result<M>
where
    M: Message + for<'a> Decode<'a>,
{
    let mut r = payload;

    let kind = u16::decode(&mut r).context("failed to decode message kind")?;

    anyhow::ensure!(
        kind == M::KIND as u16,
        "message kind mismatch while decoding '{}': expected {}, got {}",
        M::NAME,
        M::KIND as u16,
        kind
    );

    let msg = M::decode(&mut r)?;

    anyhow::ensure!(
        r.is_empty(),
        "missed {} bytes while decoding '{}'",
        r.len(),
        M::NAME
    );

    Ok(msg)
}

/// Encodes a full message (kind tag + body) into a fresh payload buffer.
pub fn encode_message<M>(msg: &M) -> anyhow::Result<Vec<u8>>
where
    M: Message + Encode,
{
    let mut buf = Vec::new();
    msg.encode_with_kind(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::PlayerInput;

    #[test]
    fn peek_does_not_consume() {
        let msg = PlayerInput {
            input: InputData::default(),
        };

        let payload = encode_message(&msg).unwrap();

        assert_eq!(peek_message_kind(&payload), Some(MessageKind::PlayerInput));
        // A second peek sees the same bytes.
        assert_eq!(peek_message_kind(&payload), Some(MessageKind::PlayerInput));

        let decoded: PlayerInput = decode_message(&payload).unwrap();
        assert_eq!(decoded.input.sequence, 0);
    }

    #[test]
    fn peek_rejects_short_payloads() {
        assert_eq!(peek_message_kind(&[]), None);
        assert_eq!(peek_message_kind(&[7]), None);
    }

    #[test]
    fn unknown_kind_peeks_as_unknown() {
        let payload = 999u16.to_le_bytes();
        assert_eq!(peek_message_kind(&payload), Some(MessageKind::Unknown));
    }

    #[test]
    fn kind_mismatch_is_an_error() {
        let msg = PlayerInput {
            input: InputData::default(),
        };

        let payload = encode_message(&msg).unwrap();
        let err = decode_message::<crate::messages::Ping>(&payload).unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }
}
