#![doc = include_str!("../README.md")]

mod event;
mod peer;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
pub use event::{PeerId, TransportEvent};
use flume::{Receiver, Sender};
use keelson_protocol::messages::{Disconnect, Handshake};
use keelson_protocol::{
    ChannelTag, Decode, Encode, Packet, PacketKind, PacketPool, MAX_PACKET_SIZE, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use peer::{Ingress, PeerTable, PendingReliable};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

/// Reason sent to a peer refused because the peer table is full.
pub const REASON_SERVER_FULL: &str = "server full";

/// Transport settings. Validation happens in [`ServerTransport::bind`].
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Port to listen on. Zero picks an ephemeral port.
    pub port: u16,
    /// Maximum number of admitted peers.
    pub max_peers: usize,
    /// Cleartext preshared admission key carried in the handshake.
    pub connection_key: String,
    /// How long an unacked reliable packet waits before retransmission.
    pub retry_interval: Duration,
    /// Retransmission attempts before the peer is dropped.
    pub max_retries: u32,
    /// The tokio runtime the socket tasks run on. If `None`, the
    /// transport creates and owns its own runtime.
    pub tokio_handle: Option<Handle>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 0,
            max_peers: 100,
            connection_key: String::new(),
            retry_interval: Duration::from_millis(250),
            max_retries: 10,
            tokio_handle: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("transport is closed")]
    Closed,
}

/// Handle to the running transport. Internally refcounted; inexpensive
/// to clone.
#[derive(Clone)]
pub struct ServerTransport(Arc<TransportInner>);

struct TransportInner {
    config: TransportConfig,
    pool: Arc<PacketPool>,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    peers: Mutex<PeerTable>,
    events_send: Sender<TransportEvent>,
    events_recv: Receiver<TransportEvent>,
    outgoing_send: Sender<(SocketAddr, Vec<u8>)>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // Holding a runtime handle is not enough to keep tokio working; the
    // runtime itself must live as long as the socket tasks.
    _tokio_runtime: Option<Runtime>,
}

impl ServerTransport {
    /// Binds the UDP socket and starts the socket workers.
    ///
    /// Fails if the port cannot be bound, which the services treat as a
    /// fatal startup error.
    pub fn bind(config: TransportConfig, pool: Arc<PacketPool>) -> anyhow::Result<Self> {
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);

        let std_socket = StdUdpSocket::bind(bind_addr)
            .with_context(|| format!("failed to bind UDP port {}", config.port))?;
        std_socket.set_nonblocking(true)?;

        let runtime = if config.tokio_handle.is_none() {
            Some(Runtime::new()?)
        } else {
            None
        };

        let handle = match &runtime {
            Some(rt) => rt.handle().clone(),
            None => config.tokio_handle.clone().unwrap(),
        };

        let _guard = handle.enter();

        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let local_addr = socket.local_addr()?;

        let (events_send, events_recv) = flume::unbounded();
        let (outgoing_send, outgoing_recv) = flume::unbounded::<(SocketAddr, Vec<u8>)>();

        let transport = Self(Arc::new(TransportInner {
            config,
            pool,
            socket: Arc::clone(&socket),
            local_addr,
            peers: Mutex::new(PeerTable::new()),
            events_send,
            events_recv,
            outgoing_send,
            tasks: Mutex::new(Vec::new()),
            _tokio_runtime: runtime,
        }));

        let recv_task = {
            let transport = transport.clone();
            let socket = Arc::clone(&socket);

            handle.spawn(async move {
                let mut buf = vec![0u8; MAX_PACKET_SIZE];

                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((len, addr)) => transport.handle_datagram(addr, &buf[..len]),
                        Err(e) => {
                            debug!("socket receive error: {e}");
                        }
                    }
                }
            })
        };

        let send_task = {
            let socket = Arc::clone(&socket);

            handle.spawn(async move {
                while let Ok((addr, bytes)) = outgoing_recv.recv_async().await {
                    if let Err(e) = socket.send_to(&bytes, addr).await {
                        debug!("socket send error to {addr}: {e}");
                    }
                }
            })
        };

        let retransmit_task = {
            let transport = transport.clone();

            handle.spawn(async move {
                let mut ticker = interval(Duration::from_millis(50));

                loop {
                    ticker.tick().await;
                    transport.retransmit_pass();
                }
            })
        };

        {
            let mut tasks = transport.0.tasks.lock();
            tasks.push(recv_task);
            tasks.push(send_task);
            tasks.push(retransmit_task);
        }

        Ok(transport)
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.0.local_addr
    }

    /// The number of admitted peers.
    pub fn peer_count(&self) -> usize {
        self.0.peers.lock().len()
    }

    /// Drains the ingress queue, invoking `f` synchronously for each
    /// queued event. The simulation loop calls this exactly once per
    /// tick; no handler runs anywhere else.
    pub fn process_incoming(&self, mut f: impl FnMut(TransportEvent)) {
        while let Ok(event) = self.0.events_recv.try_recv() {
            f(event);
        }
    }

    /// Sends `packet` to `peer` on `channel`.
    ///
    /// Non-blocking: the frame is handed to the socket worker and the
    /// packet goes back to the pool before this returns. Reliable frames
    /// are retained (as bytes) for retransmission until acked.
    pub fn send_to(
        &self,
        peer: PeerId,
        mut packet: Packet,
        channel: ChannelTag,
    ) -> Result<(), TransportError> {
        let mut peers = self.0.peers.lock();

        let Some(state) = peers.get_mut(peer) else {
            self.0.pool.give(packet);
            return Err(TransportError::UnknownPeer(peer));
        };

        packet.channel = channel;
        packet.sequence = state.next_sequence(channel);
        packet.ack = state.recv_reliable.ack();
        packet.ack_bits = state.recv_reliable.ack_bits();

        let mut bytes = Vec::new();
        if let Err(e) = packet.encode_frame(&mut bytes) {
            self.0.pool.give(packet);
            warn!("failed to encode outgoing frame for {peer}: {e:#}");
            return Ok(());
        }

        if channel == ChannelTag::Reliable {
            state.pending.push(PendingReliable {
                sequence: packet.sequence,
                bytes: bytes.clone(),
                last_sent: Instant::now(),
                attempts: 1,
            });
        }

        let addr = state.addr;
        drop(peers);

        self.0.pool.give(packet);

        if self.0.outgoing_send.send((addr, bytes)).is_err() {
            return Err(TransportError::Closed);
        }

        Ok(())
    }

    /// Sends a `Disconnect` with `reason`, removes the peer, and queues a
    /// `PeerDisconnected` event for the next drain.
    pub fn disconnect(&self, peer: PeerId, reason: &str) {
        let removed = {
            let mut peers = self.0.peers.lock();
            peers.remove(peer)
        };

        let Some(mut state) = removed else {
            return;
        };

        state.drain_into(&self.0.pool);

        self.send_control(
            state.addr,
            PacketKind::Disconnect,
            &Disconnect {
                reason: reason.to_owned(),
            },
        );

        let _ = self.0.events_send.send(TransportEvent::PeerDisconnected {
            peer,
            reason: reason.to_owned(),
        });
    }

    /// Stops admitting peers, notifies every connected peer, and shuts
    /// the socket workers down.
    pub fn close(&self) {
        let addrs = {
            let mut peers = self.0.peers.lock();
            peers.accepting = false;
            peers.addrs()
        };

        // The writer task is about to be aborted, so the goodbyes go
        // straight out on the socket.
        for (peer, addr) in addrs {
            match self.encode_control(
                PacketKind::Disconnect,
                &Disconnect {
                    reason: "server shutting down".to_owned(),
                },
            ) {
                Ok(bytes) => {
                    if let Err(e) = self.0.socket.try_send_to(&bytes, addr) {
                        debug!("shutdown notice to {addr} failed: {e}");
                    }
                }
                Err(e) => warn!("failed to encode shutdown notice: {e:#}"),
            }

            if let Some(mut state) = self.0.peers.lock().remove(peer) {
                state.drain_into(&self.0.pool);
            }
        }

        for task in self.0.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Decodes one datagram and runs admission or channel semantics.
    /// Called on the socket worker.
    fn handle_datagram(&self, addr: SocketAddr, datagram: &[u8]) {
        let mut packet = self.0.pool.rent();

        if let Err(e) = packet.decode_frame(datagram) {
            self.0.pool.give(packet);
            warn!("malformed datagram from {addr}: {e:#}");
            let _ = self.0.events_send.send(TransportEvent::Error {
                message: format!("malformed datagram from {addr}: {e:#}"),
            });
            return;
        }

        if packet.kind == PacketKind::Handshake {
            self.handle_handshake(addr, packet);
            return;
        }

        let mut events = Vec::new();

        {
            let mut peers = self.0.peers.lock();

            let Some(peer) = peers.id_of(addr) else {
                // Not admitted; nothing to talk about.
                debug!("dropping {:?} packet from unknown address {addr}", packet.kind);
                self.0.pool.give(packet);
                return;
            };

            let state = peers.get_mut(peer).expect("peer indices out of sync");
            state.apply_acks(packet.ack, packet.ack_bits);

            if packet.kind == PacketKind::Disconnect {
                let reason = match Disconnect::decode(&mut packet.payload()) {
                    Ok(d) => d.reason,
                    Err(_) => "disconnected".to_owned(),
                };

                self.0.pool.give(packet);

                if let Some(mut state) = peers.remove(peer) {
                    state.drain_into(&self.0.pool);
                }

                events.push(TransportEvent::PeerDisconnected { peer, reason });
            } else {
                match state.ingress(packet) {
                    Ingress::Deliver(ready) => {
                        for packet in ready {
                            events.push(TransportEvent::PacketReceived { peer, packet });
                        }
                    }
                    Ingress::Drop(p) => self.0.pool.give(p),
                    Ingress::Overflow(p) => {
                        self.0.pool.give(p);

                        let state = peers.remove(peer);
                        if let Some(mut state) = state {
                            state.drain_into(&self.0.pool);
                            self.send_control(
                                state.addr,
                                PacketKind::Disconnect,
                                &Disconnect {
                                    reason: "reliability window overflow".to_owned(),
                                },
                            );
                        }

                        events.push(TransportEvent::PeerDisconnected {
                            peer,
                            reason: "reliability window overflow".to_owned(),
                        });
                    }
                }
            }
        }

        for event in events {
            let _ = self.0.events_send.send(event);
        }
    }

    fn handle_handshake(&self, addr: SocketAddr, packet: Packet) {
        let handshake = Handshake::decode(&mut packet.payload());
        self.0.pool.give(packet);

        let handshake = match handshake {
            Ok(h) => h,
            Err(e) => {
                warn!("malformed handshake from {addr}: {e:#}");
                return;
            }
        };

        if handshake.protocol_version != PROTOCOL_VERSION {
            self.refuse(addr, "protocol version mismatch");
            return;
        }

        if handshake.connection_key != self.0.config.connection_key {
            self.refuse(addr, "invalid connection key");
            return;
        }

        let admitted = {
            let mut peers = self.0.peers.lock();

            if peers.id_of(addr).is_some() {
                // Our ack got lost; answer again, no new peer.
                None
            } else if !peers.accepting || peers.len() >= self.0.config.max_peers {
                drop(peers);
                self.refuse(addr, REASON_SERVER_FULL);
                return;
            } else {
                Some(peers.insert(addr))
            }
        };

        self.send_control(addr, PacketKind::HandshakeAck, &());

        if let Some(peer) = admitted {
            let _ = self
                .0
                .events_send
                .send(TransportEvent::PeerConnected { peer, addr });
        }
    }

    fn refuse(&self, addr: SocketAddr, reason: &str) {
        debug!("refusing {addr}: {reason}");
        self.send_control(
            addr,
            PacketKind::Disconnect,
            &Disconnect {
                reason: reason.to_owned(),
            },
        );
    }

    /// Fire-and-forget control frame to a raw address, outside any
    /// peer's sequence space. Rides the same egress queue as regular
    /// sends, so a response queued before a disconnect departs first.
    fn send_control(&self, addr: SocketAddr, kind: PacketKind, body: &impl Encode) {
        match self.encode_control(kind, body) {
            Ok(bytes) => {
                let _ = self.0.outgoing_send.send((addr, bytes));
            }
            Err(e) => warn!("failed to encode control frame: {e:#}"),
        }
    }

    fn encode_control(&self, kind: PacketKind, body: &impl Encode) -> anyhow::Result<Vec<u8>> {
        let mut packet = self.0.pool.rent();
        packet.kind = kind;

        let mut payload = Vec::new();
        let frame = body
            .encode(&mut payload)
            .and_then(|()| packet.set_payload(&payload))
            .and_then(|()| {
                let mut bytes = Vec::new();
                packet.encode_frame(&mut bytes)?;
                Ok(bytes)
            });

        self.0.pool.give(packet);
        frame
    }

    /// Resends unacked reliable frames; drops peers that exhausted their
    /// retries. Runs on its own timer task.
    fn retransmit_pass(&self) {
        let retry = self.0.config.retry_interval;
        let max_retries = self.0.config.max_retries;

        let mut resend = Vec::new();
        let mut dead = Vec::new();

        {
            let mut peers = self.0.peers.lock();

            for (peer, addr) in peers.addrs() {
                let Some(state) = peers.get_mut(peer) else {
                    continue;
                };

                let mut exhausted = false;
                for pending in &mut state.pending {
                    if pending.last_sent.elapsed() < retry {
                        continue;
                    }

                    if pending.attempts >= max_retries {
                        exhausted = true;
                        break;
                    }

                    pending.attempts += 1;
                    pending.last_sent = Instant::now();
                    resend.push((addr, pending.bytes.clone()));
                }

                if exhausted {
                    dead.push(peer);
                }
            }
        }

        for (addr, bytes) in resend {
            let _ = self.0.outgoing_send.send((addr, bytes));
        }

        for peer in dead {
            warn!("{peer} failed reliable delivery after {max_retries} attempts");
            self.disconnect(peer, "reliable delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use keelson_protocol::{encode_message, messages::Ping, Message};

    use super::*;

    /// A bare std-socket client speaking just enough of the protocol for
    /// loopback tests.
    struct TestClient {
        socket: StdUdpSocket,
        server: SocketAddr,
        pool: PacketPool,
        sequence: u16,
    }

    impl TestClient {
        fn new(server: SocketAddr) -> Self {
            let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
            socket
                .set_read_timeout(Some(Duration::from_millis(500)))
                .unwrap();

            Self {
                socket,
                server,
                pool: PacketPool::new(),
                sequence: 0,
            }
        }

        fn send_raw(&self, kind: PacketKind, channel: ChannelTag, sequence: u16, payload: &[u8]) {
            let mut packet = self.pool.rent();
            packet.kind = kind;
            packet.channel = channel;
            packet.sequence = sequence;
            packet.set_payload(payload).unwrap();

            let mut bytes = Vec::new();
            packet.encode_frame(&mut bytes).unwrap();
            self.pool.give(packet);

            self.socket.send_to(&bytes, self.server).unwrap();
        }

        fn send_handshake(&self, key: &str) {
            let mut payload = Vec::new();
            Handshake {
                protocol_version: PROTOCOL_VERSION,
                connection_key: key.to_owned(),
            }
            .encode(&mut payload)
            .unwrap();

            self.send_raw(PacketKind::Handshake, ChannelTag::Unreliable, 0, &payload);
        }

        fn send_data(&mut self, channel: ChannelTag, payload: &[u8]) {
            self.sequence += 1;
            self.send_raw(PacketKind::Data, channel, self.sequence, payload);
        }

        fn recv(&self) -> Option<(PacketKind, Vec<u8>)> {
            let mut buf = [0u8; 65535];
            let (len, _) = self.socket.recv_from(&mut buf).ok()?;

            let mut packet = self.pool.rent();
            packet.decode_frame(&buf[..len]).unwrap();

            let out = (packet.kind, packet.payload().to_vec());
            self.pool.give(packet);
            Some(out)
        }

        fn connect(server: SocketAddr, key: &str) -> Self {
            let client = Self::new(server);
            client.send_handshake(key);

            let (kind, _) = client.recv().expect("no handshake response");
            assert_eq!(kind, PacketKind::HandshakeAck);
            client
        }
    }

    fn bind_transport(max_peers: usize, key: &str) -> (ServerTransport, Arc<PacketPool>) {
        let pool = Arc::new(PacketPool::new());
        let transport = ServerTransport::bind(
            TransportConfig {
                max_peers,
                connection_key: key.to_owned(),
                ..TransportConfig::default()
            },
            Arc::clone(&pool),
        )
        .unwrap();

        (transport, pool)
    }

    /// Drains events until `pred` matches or the deadline passes.
    fn wait_for(
        transport: &ServerTransport,
        pool: &PacketPool,
        mut pred: impl FnMut(&TransportEvent) -> bool,
    ) -> Option<TransportEvent> {
        for _ in 0..100 {
            let mut found = None;

            transport.process_incoming(|event| {
                if found.is_none() && pred(&event) {
                    found = Some(event);
                } else if let TransportEvent::PacketReceived { packet, .. } = event {
                    pool.give(packet);
                }
            });

            if found.is_some() {
                return found;
            }

            std::thread::sleep(Duration::from_millis(10));
        }

        None
    }

    #[test]
    fn handshake_admits_peer() {
        let (transport, pool) = bind_transport(4, "sesame");
        let _client = TestClient::connect(transport.local_addr(), "sesame");

        let event = wait_for(&transport, &pool, |e| {
            matches!(e, TransportEvent::PeerConnected { .. })
        });

        assert!(event.is_some());
        assert_eq!(transport.peer_count(), 1);
        transport.close();
    }

    #[test]
    fn wrong_key_is_refused() {
        let (transport, pool) = bind_transport(4, "sesame");

        let client = TestClient::new(transport.local_addr());
        client.send_handshake("not-sesame");

        let (kind, _) = client.recv().expect("expected a refusal");
        assert_eq!(kind, PacketKind::Disconnect);

        let event = wait_for(&transport, &pool, |e| {
            matches!(e, TransportEvent::PeerConnected { .. })
        });
        assert!(event.is_none());
        assert_eq!(transport.peer_count(), 0);
        transport.close();
    }

    #[test]
    fn capacity_overflow_refuses_with_server_full() {
        let (transport, pool) = bind_transport(1, "");

        let _first = TestClient::connect(transport.local_addr(), "");
        wait_for(&transport, &pool, |e| {
            matches!(e, TransportEvent::PeerConnected { .. })
        })
        .expect("first peer should be admitted");

        let second = TestClient::new(transport.local_addr());
        second.send_handshake("");

        let (kind, payload) = second.recv().expect("expected a refusal");
        assert_eq!(kind, PacketKind::Disconnect);

        let reason = Disconnect::decode(&mut payload.as_slice()).unwrap().reason;
        assert_eq!(reason, REASON_SERVER_FULL);
        transport.close();
    }

    #[test]
    fn data_flows_in_and_pool_balances() {
        let (transport, pool) = bind_transport(4, "");
        let mut client = TestClient::connect(transport.local_addr(), "");

        wait_for(&transport, &pool, |e| {
            matches!(e, TransportEvent::PeerConnected { .. })
        })
        .expect("peer should connect");

        let payload = encode_message(&Ping { client_time_ms: 42 }).unwrap();
        client.send_data(ChannelTag::Unreliable, &payload);

        let event = wait_for(&transport, &pool, |e| {
            matches!(e, TransportEvent::PacketReceived { .. })
        })
        .expect("packet should arrive");

        let TransportEvent::PacketReceived { packet, .. } = event else {
            unreachable!();
        };

        assert_eq!(packet.kind, PacketKind::Data);
        assert_eq!(
            keelson_protocol::peek_message_kind(packet.payload()),
            Some(Ping::KIND)
        );

        pool.give(packet);
        transport.close();
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn send_to_reaches_the_peer() {
        let (transport, pool) = bind_transport(4, "");
        let client = TestClient::connect(transport.local_addr(), "");

        let TransportEvent::PeerConnected { peer, .. } = wait_for(&transport, &pool, |e| {
            matches!(e, TransportEvent::PeerConnected { .. })
        })
        .expect("peer should connect") else {
            unreachable!();
        };

        let mut packet = pool.rent();
        packet.kind = PacketKind::Data;
        packet.set_payload(b"state").unwrap();
        transport.send_to(peer, packet, ChannelTag::Unreliable).unwrap();

        let (kind, payload) = client.recv().expect("client should receive the frame");
        assert_eq!(kind, PacketKind::Data);
        assert_eq!(payload, b"state");

        assert_eq!(pool.in_use(), 0);
        transport.close();
    }

    #[test]
    fn peer_disconnect_produces_event() {
        let (transport, pool) = bind_transport(4, "");
        let client = TestClient::connect(transport.local_addr(), "");

        wait_for(&transport, &pool, |e| {
            matches!(e, TransportEvent::PeerConnected { .. })
        })
        .expect("peer should connect");

        let mut payload = Vec::new();
        Disconnect {
            reason: "quit".to_owned(),
        }
        .encode(&mut payload)
        .unwrap();
        client.send_raw(PacketKind::Disconnect, ChannelTag::Unreliable, 1, &payload);

        let event = wait_for(&transport, &pool, |e| {
            matches!(e, TransportEvent::PeerDisconnected { .. })
        })
        .expect("disconnect should surface");

        let TransportEvent::PeerDisconnected { reason, .. } = event else {
            unreachable!();
        };
        assert_eq!(reason, "quit");
        assert_eq!(transport.peer_count(), 0);
        transport.close();
    }

    #[test]
    fn reliable_frames_are_retransmitted_until_acked() {
        let pool = Arc::new(PacketPool::new());
        let transport = ServerTransport::bind(
            TransportConfig {
                retry_interval: Duration::from_millis(100),
                ..TransportConfig::default()
            },
            Arc::clone(&pool),
        )
        .unwrap();

        let client = TestClient::connect(transport.local_addr(), "");

        let TransportEvent::PeerConnected { peer, .. } = wait_for(&transport, &pool, |e| {
            matches!(e, TransportEvent::PeerConnected { .. })
        })
        .expect("peer should connect") else {
            unreachable!();
        };

        let mut packet = pool.rent();
        packet.kind = PacketKind::Data;
        packet.set_payload(b"must arrive").unwrap();
        transport.send_to(peer, packet, ChannelTag::Reliable).unwrap();

        // Never acked, so the same sequence keeps coming.
        let (_, first) = client.recv().expect("initial send");
        let (_, second) = client.recv().expect("first retransmit");
        assert_eq!(first, second);

        transport.close();
        assert_eq!(pool.in_use(), 0);
    }
}
