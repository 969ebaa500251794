//! Authoritative or predicted player state at a tick.

use std::io::Write;

use bitfield_struct::bitfield;
use glam::Vec3;

use crate::{Decode, Encode};

/// Bit-packed movement state.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct StateFlags {
    pub grounded: bool,
    pub sprinting: bool,
    pub crouching: bool,
    pub jumping: bool,
    pub falling: bool,
    #[bits(3)]
    _padding: u8,
}

impl Encode for StateFlags {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.into_bits().encode(w)
    }
}

impl Decode<'_> for StateFlags {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self::from_bits(u8::decode(r)?))
    }
}

/// A player's state at one tick.
///
/// When produced by the server, `last_processed_input` carries the
/// sequence of the most recent input accepted for that peer; the client
/// uses it to prune its pending input buffer during reconciliation.
#[derive(Copy, Clone, Default, PartialEq, Debug)]
pub struct StateSnapshot {
    pub tick: u32,
    pub last_processed_input: u32,
    pub position: Vec3,
    pub velocity: Vec3,
    pub rotation: f32,
    pub flags: StateFlags,
}

impl StateSnapshot {
    /// A fresh state at the spawn point.
    pub fn spawn(tick: u32) -> Self {
        Self {
            tick,
            flags: StateFlags::new().with_grounded(true),
            ..Self::default()
        }
    }
}

impl Encode for StateSnapshot {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.tick.encode(&mut w)?;
        self.last_processed_input.encode(&mut w)?;
        self.position.encode(&mut w)?;
        self.velocity.encode(&mut w)?;
        self.rotation.encode(&mut w)?;
        self.flags.encode(w)
    }
}

impl Decode<'_> for StateSnapshot {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            tick: u32::decode(r)?,
            last_processed_input: u32::decode(r)?,
            position: Vec3::decode(r)?,
            velocity: Vec3::decode(r)?,
            rotation: f32::decode(r)?,
            flags: StateFlags::decode(r)?,
        })
    }
}
