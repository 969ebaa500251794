//! Client intent for a single simulation tick.

use std::io::Write;

use bitfield_struct::bitfield;
use glam::Vec2;

use crate::{Decode, Encode};

/// Inputs with a squared move magnitude above this are rejected by the
/// server and must not be produced by a well-behaved client.
pub const MAX_MOVE_LENGTH_SQUARED: f32 = 1.1;

/// Action buttons held during one input tick.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct InputFlags {
    pub jump: bool,
    pub sprint: bool,
    pub crouch: bool,
    #[bits(5)]
    _padding: u8,
}

impl Encode for InputFlags {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.into_bits().encode(w)
    }
}

impl Decode<'_> for InputFlags {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self::from_bits(u8::decode(r)?))
    }
}

/// One tick of client intent.
///
/// `sequence` increases strictly within a session and is how the server
/// acknowledges inputs back to the client; `tick` is the client's
/// estimate of the server tick the input is meant for.
#[derive(Copy, Clone, Default, PartialEq, Debug)]
pub struct InputData {
    pub tick: u32,
    pub sequence: u32,
    pub move_dir: Vec2,
    pub rotation: f32,
    pub flags: InputFlags,
}

impl InputData {
    /// Whether the move direction fits the unit-circle bound the server
    /// enforces (with a small tolerance for client-side rounding).
    pub fn is_move_valid(&self) -> bool {
        self.move_dir.length_squared() <= MAX_MOVE_LENGTH_SQUARED
    }
}

impl Encode for InputData {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.tick.encode(&mut w)?;
        self.sequence.encode(&mut w)?;
        self.move_dir.encode(&mut w)?;
        self.rotation.encode(&mut w)?;
        self.flags.encode(w)
    }
}

impl Decode<'_> for InputData {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            tick: u32::decode(r)?,
            sequence: u32::decode(r)?,
            move_dir: Vec2::decode(r)?,
            rotation: f32::decode(r)?,
            flags: InputFlags::decode(r)?,
        })
    }
}
