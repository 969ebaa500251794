//! The framed packet envelope and its windowed acknowledgment math.
//!
//! Wire layout, little-endian:
//!
//! ```text
//! kind:u8 | channel:u8 | sequence:u16 | ack:u16 | ack_bits:u32 | payload_len:u16 | payload
//! ```
//!
//! The `ack`/`ack_bits` pair carries a 33-packet receive window: `ack` is
//! the newest sequence seen from the remote, and bit `n` of `ack_bits`
//! acknowledges sequence `ack - n - 1`.

use std::fmt;

use anyhow::{bail, ensure};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Size in bytes of the fixed packet header.
pub const HEADER_SIZE: usize = 12;

/// Half the sequence space; the wrap-aware comparison pivot.
const SEQUENCE_HALF: u16 = 1 << 15;

/// Number of sequences acknowledged by `ack_bits`, in addition to `ack`
/// itself.
pub const ACK_WINDOW: u16 = 32;

/// The outer kind byte of a framed packet.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum PacketKind {
    Handshake = 0,
    HandshakeAck = 1,
    Ping = 2,
    Pong = 3,
    Disconnect = 4,
    /// Carries a serialized application message; see
    /// [`MessageKind`](crate::MessageKind).
    Data = 10,
    PlayerMove = 11,
    PlayerAttack = 12,
    PlayerState = 13,
    EntitySpawn = 20,
    EntityDespawn = 21,
    EntityUpdate = 22,
    Chat = 30,
}

impl PacketKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Handshake,
            1 => Self::HandshakeAck,
            2 => Self::Ping,
            3 => Self::Pong,
            4 => Self::Disconnect,
            10 => Self::Data,
            11 => Self::PlayerMove,
            12 => Self::PlayerAttack,
            13 => Self::PlayerState,
            20 => Self::EntitySpawn,
            21 => Self::EntityDespawn,
            22 => Self::EntityUpdate,
            30 => Self::Chat,
            _ => return None,
        })
    }
}

/// The delivery mode a packet was sent with.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum ChannelTag {
    /// Retransmitted until acknowledged.
    Reliable = 0,
    /// Fire and forget.
    #[default]
    Unreliable = 1,
    /// Unreliable, and the receiver drops anything older than the newest
    /// sequence it has seen.
    Sequenced = 2,
}

impl ChannelTag {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Reliable,
            1 => Self::Unreliable,
            2 => Self::Sequenced,
            _ => return None,
        })
    }
}

/// Returns whether sequence `s` is newer than `than`, accounting for
/// `u16` wrap-around.
///
/// `is_sequence_newer(1, 0xFFFF)` is true; `is_sequence_newer(0xFFFF, 1)`
/// is false.
pub fn is_sequence_newer(s: u16, than: u16) -> bool {
    (s > than && s - than <= SEQUENCE_HALF) || (s < than && than - s > SEQUENCE_HALF)
}

/// The receive-side acknowledgment window over a 16-bit sequence space.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct AckWindow {
    ack: u16,
    ack_bits: u32,
}

impl AckWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// The newest sequence recorded so far.
    pub fn ack(self) -> u16 {
        self.ack
    }

    /// The bitfield acknowledging the 32 sequences older than
    /// [`ack`](Self::ack).
    pub fn ack_bits(self) -> u32 {
        self.ack_bits
    }

    /// Returns whether `s` has been recorded, for any `s` within the
    /// 33-wide window around the current ack.
    pub fn is_acked(self, s: u16) -> bool {
        if s == self.ack {
            return true;
        }

        let age = self.ack.wrapping_sub(s);
        (1..=ACK_WINDOW).contains(&age) && self.ack_bits & (1 << (age - 1)) != 0
    }

    /// Records `s` as received.
    ///
    /// If `s` is newer than the current ack, the window shifts forward and
    /// the previous ack drops into the bitfield; if `s` falls inside the
    /// existing window, its bit is set; anything older than the window is
    /// forgotten.
    pub fn mark_acked(&mut self, s: u16) {
        if is_sequence_newer(s, self.ack) {
            let shift = s.wrapping_sub(self.ack);

            if shift > ACK_WINDOW {
                self.ack_bits = 0;
            } else {
                self.ack_bits <<= shift;
                self.ack_bits |= 1 << (shift - 1);
            }

            self.ack = s;
        } else if s != self.ack {
            let age = self.ack.wrapping_sub(s);
            if age <= ACK_WINDOW {
                self.ack_bits |= 1 << (age - 1);
            }
        }
    }
}

/// Returns whether the header pair `(ack, ack_bits)` acknowledges
/// sequence `s`. This is the sender-side counterpart of
/// [`AckWindow::is_acked`], evaluated against a remote peer's header.
pub fn header_acks(ack: u16, ack_bits: u32, s: u16) -> bool {
    if s == ack {
        return true;
    }

    let age = ack.wrapping_sub(s);
    (1..=ACK_WINDOW).contains(&age) && ack_bits & (1 << (age - 1)) != 0
}

/// A framed wire packet.
///
/// Packets are rented from a [`PacketPool`](crate::PacketPool) and must be
/// returned to it exactly once; the payload buffer's allocation survives
/// the round trip.
pub struct Packet {
    pub kind: PacketKind,
    pub channel: ChannelTag,
    pub sequence: u16,
    pub ack: u16,
    pub ack_bits: u32,
    payload: Vec<u8>,
}

impl Packet {
    pub(crate) fn empty() -> Self {
        Self {
            kind: PacketKind::Data,
            channel: ChannelTag::Unreliable,
            sequence: 0,
            ack: 0,
            ack_bits: 0,
            payload: Vec::new(),
        }
    }

    /// Zeroes every header field and empties the payload, keeping the
    /// payload buffer's allocation.
    pub fn reset(&mut self) {
        self.kind = PacketKind::Data;
        self.channel = ChannelTag::Unreliable;
        self.sequence = 0;
        self.ack = 0;
        self.ack_bits = 0;
        self.payload.clear();
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Replaces the payload with the given bytes.
    pub fn set_payload(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        ensure!(
            bytes.len() <= u16::MAX as usize,
            "payload of {} bytes exceeds the u16 length field",
            bytes.len()
        );

        self.payload.clear();
        self.payload.extend_from_slice(bytes);
        Ok(())
    }

    /// Encodes the full frame (header + payload) onto the end of `buf`.
    pub fn encode_frame(&self, buf: &mut Vec<u8>) -> anyhow::Result<()> {
        ensure!(
            self.payload.len() <= u16::MAX as usize,
            "payload of {} bytes exceeds the u16 length field",
            self.payload.len()
        );

        buf.reserve(HEADER_SIZE + self.payload.len());
        buf.write_u8(self.kind as u8)?;
        buf.write_u8(self.channel as u8)?;
        buf.write_u16::<LittleEndian>(self.sequence)?;
        buf.write_u16::<LittleEndian>(self.ack)?;
        buf.write_u32::<LittleEndian>(self.ack_bits)?;
        buf.write_u16::<LittleEndian>(self.payload.len() as u16)?;
        buf.extend_from_slice(&self.payload);

        Ok(())
    }

    /// Decodes one datagram into this packet, replacing its contents.
    ///
    /// The datagram must contain exactly one frame; trailing bytes are an
    /// error, as is a payload length that disagrees with the datagram.
    pub fn decode_frame(&mut self, mut datagram: &[u8]) -> anyhow::Result<()> {
        ensure!(
            datagram.len() >= HEADER_SIZE,
            "datagram of {} bytes is shorter than the packet header",
            datagram.len()
        );

        let raw_kind = datagram.read_u8()?;
        let Some(kind) = PacketKind::from_raw(raw_kind) else {
            bail!("unknown packet kind {raw_kind}");
        };

        let raw_channel = datagram.read_u8()?;
        let Some(channel) = ChannelTag::from_raw(raw_channel) else {
            bail!("unknown channel tag {raw_channel}");
        };

        let sequence = datagram.read_u16::<LittleEndian>()?;
        let ack = datagram.read_u16::<LittleEndian>()?;
        let ack_bits = datagram.read_u32::<LittleEndian>()?;
        let payload_len = datagram.read_u16::<LittleEndian>()? as usize;

        ensure!(
            datagram.len() == payload_len,
            "payload length field says {payload_len} but {} bytes remain",
            datagram.len()
        );

        self.kind = kind;
        self.channel = channel;
        self.sequence = sequence;
        self.ack = ack;
        self.ack_bits = ack_bits;
        self.payload.clear();
        self.payload.extend_from_slice(datagram);

        Ok(())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("kind", &self.kind)
            .field("channel", &self.channel)
            .field("sequence", &self.sequence)
            .field("ack", &self.ack)
            .field("ack_bits", &format_args!("{:#010x}", self.ack_bits))
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rand::{thread_rng, Rng};

    use super::*;

    #[test]
    fn sequence_wraparound() {
        assert!(is_sequence_newer(1, 0xFFFF));
        assert!(!is_sequence_newer(0xFFFF, 1));
        assert!(is_sequence_newer(1, 0));
        assert!(!is_sequence_newer(0, 1));
        assert!(!is_sequence_newer(5, 5));
    }

    #[test]
    fn mark_then_is_acked_within_window() {
        let mut win = AckWindow::new();
        win.mark_acked(100);

        for s in 68..=100u16 {
            let mut w = win;
            w.mark_acked(s);
            assert!(w.is_acked(s), "sequence {s} should be acked");
        }
    }

    #[test]
    fn advancing_keeps_previous_ack() {
        let mut win = AckWindow::new();
        win.mark_acked(10);
        win.mark_acked(11);

        assert!(win.is_acked(11));
        assert!(win.is_acked(10));
        assert!(!win.is_acked(9));
    }

    #[test]
    fn large_jump_clears_the_window() {
        let mut win = AckWindow::new();
        win.mark_acked(10);
        win.mark_acked(10 + ACK_WINDOW + 5);

        assert!(win.is_acked(10 + ACK_WINDOW + 5));
        assert!(!win.is_acked(10));
    }

    #[test]
    fn window_advances_across_wraparound() {
        let mut win = AckWindow::new();
        win.mark_acked(0xFFFE);
        win.mark_acked(0xFFFF);
        win.mark_acked(1);

        assert_eq!(win.ack(), 1);
        assert!(win.is_acked(0xFFFF));
        assert!(win.is_acked(0xFFFE));
    }

    #[test]
    fn out_of_order_arrivals_fill_bits() {
        let mut win = AckWindow::new();
        win.mark_acked(20);
        win.mark_acked(17);
        win.mark_acked(19);

        assert!(win.is_acked(20));
        assert!(win.is_acked(19));
        assert!(!win.is_acked(18));
        assert!(win.is_acked(17));
    }

    #[test]
    fn frame_round_trip_is_identity() {
        let mut rng = thread_rng();

        for _ in 0..1000 {
            let mut src = Packet::empty();
            src.kind = PacketKind::Data;
            src.channel = ChannelTag::Reliable;
            src.sequence = rng.gen();
            src.ack = rng.gen();
            src.ack_bits = rng.gen();

            let payload: Vec<u8> = (0..rng.gen_range(0..256)).map(|_| rng.gen()).collect();
            src.set_payload(&payload).unwrap();

            let mut bytes = Vec::new();
            src.encode_frame(&mut bytes).unwrap();

            let mut dst = Packet::empty();
            dst.decode_frame(&bytes).unwrap();

            assert_eq!(dst.kind, src.kind);
            assert_eq!(dst.channel, src.channel);
            assert_eq!(dst.sequence, src.sequence);
            assert_eq!(dst.ack, src.ack);
            assert_eq!(dst.ack_bits, src.ack_bits);
            assert_eq!(dst.payload(), src.payload());
        }
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let mut src = Packet::empty();
        src.set_payload(b"payload").unwrap();

        let mut bytes = Vec::new();
        src.encode_frame(&mut bytes).unwrap();

        let mut dst = Packet::empty();
        assert!(dst.decode_frame(&bytes[..HEADER_SIZE - 1]).is_err());
        assert!(dst.decode_frame(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn reset_preserves_buffer_capacity() {
        let mut p = Packet::empty();
        p.set_payload(&[0u8; 512]).unwrap();
        p.sequence = 9;
        p.ack = 3;
        p.ack_bits = 0xFF;

        let cap = p.payload.capacity();
        p.reset();

        assert_eq!(p.sequence, 0);
        assert_eq!(p.ack, 0);
        assert_eq!(p.ack_bits, 0);
        assert!(p.payload().is_empty());
        assert_eq!(p.payload.capacity(), cap);
    }
}
