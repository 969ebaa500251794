#![doc = include_str!("../README.md")]

pub mod config;
pub mod dispatch;
mod handlers;
pub mod registry;
pub mod server;
pub mod session;
pub mod tick;

pub use config::{ClientVersion, GameConfig, ServerConfig};
pub use dispatch::{Context, Dispatcher};
pub use registry::PlayerRegistry;
pub use server::{GameServer, ServerState};
pub use session::{PlayerSession, SessionState};
pub use tick::TickStats;
