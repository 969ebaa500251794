#![doc = include_str!("../README.md")]

pub use keelson_auth as auth;
pub use keelson_client as client;
pub use keelson_protocol as protocol;
pub use keelson_server as server;
pub use keelson_transport as transport;

pub use keelson_client::{Misprediction, Predictor, ServerClock};
pub use keelson_protocol::{
    ChannelTag, InputData, MovementSettings, Packet, PacketKind, PacketPool, StateSnapshot,
};
pub use keelson_server::GameServer;
pub use keelson_transport::{ServerTransport, TransportEvent};
