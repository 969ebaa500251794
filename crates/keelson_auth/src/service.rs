//! The auth service's drain loop over the shared datagram transport.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use keelson_protocol::messages::{
    LoginRequest, Ping, Pong, RegisterRequest, TokenValidationRequest,
};
use keelson_protocol::{
    decode_message, encode_message, peek_message_kind, ChannelTag, Decode, Encode, Message,
    MessageKind, Packet, PacketKind, PacketPool,
};
use keelson_transport::{PeerId, ServerTransport, TransportEvent};
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::endpoints::AuthEndpoints;
use crate::token::unix_now;

/// How long recorded login attempts are retained for auditing before the
/// periodic cleanup removes them.
const ATTEMPT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// How often the cleanup pass runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Hard deadline for the final cleanup during shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// The running auth service: a 10 Hz (by default) loop that drains the
/// transport queue and serves register/login/validate requests.
pub struct AuthService {
    transport: ServerTransport,
    pool: Arc<PacketPool>,
    endpoints: Arc<AuthEndpoints>,
    tick_period: Duration,
    current_tick: u32,
    peer_ips: HashMap<PeerId, IpAddr>,
    unknown_messages: u64,
}

impl AuthService {
    pub fn new(
        transport: ServerTransport,
        pool: Arc<PacketPool>,
        endpoints: Arc<AuthEndpoints>,
        tick_rate: u32,
    ) -> Self {
        Self {
            transport,
            pool,
            endpoints,
            tick_period: Duration::from_secs_f64(f64::from(tick_rate).recip()),
            current_tick: 0,
            peer_ips: HashMap::new(),
            unknown_messages: 0,
        }
    }

    /// Runs until the shutdown flag flips, then drains maintenance with
    /// a bounded deadline and closes the transport.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(addr = %self.transport.local_addr(), "auth service listening");

        let mut ticker = interval(self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_cleanup = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            if *shutdown.borrow() {
                break;
            }

            let tick_start = Instant::now();
            self.current_tick = self.current_tick.wrapping_add(1);

            self.process_tick().await;

            if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                last_cleanup = Instant::now();
                self.cleanup().await;
            }

            let elapsed = tick_start.elapsed();
            if elapsed > self.tick_period {
                warn!(
                    tick = self.current_tick,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "auth tick exceeded its budget"
                );
            }
        }

        info!("auth service shutting down");
        let _ = tokio::time::timeout(SHUTDOWN_DRAIN, self.cleanup()).await;
        self.transport.close();

        Ok(())
    }

    /// Drains the ingress queue once and serves everything on it.
    async fn process_tick(&mut self) {
        let mut events = Vec::new();
        self.transport.process_incoming(|event| events.push(event));

        for event in events {
            match event {
                TransportEvent::PeerConnected { peer, addr } => {
                    debug!(%peer, %addr, "client connected");
                    self.peer_ips.insert(peer, addr.ip());
                }
                TransportEvent::PeerDisconnected { peer, reason } => {
                    debug!(%peer, reason, "client disconnected");
                    self.peer_ips.remove(&peer);
                }
                TransportEvent::PacketReceived { peer, packet } => {
                    self.handle_packet(peer, packet).await;
                }
                TransportEvent::Error { message } => {
                    warn!("transport error: {message}");
                }
            }
        }
    }

    async fn handle_packet(&mut self, peer: PeerId, packet: Packet) {
        match packet.kind {
            PacketKind::Ping => {
                let pong = match Ping::decode(&mut packet.payload()) {
                    Ok(ping) => Pong {
                        client_time_ms: ping.client_time_ms,
                        server_tick: self.current_tick,
                    },
                    Err(e) => {
                        warn!(%peer, "malformed ping: {e:#}");
                        self.pool.give(packet);
                        return;
                    }
                };

                self.pool.give(packet);
                self.send_body(peer, PacketKind::Pong, &pong, ChannelTag::Unreliable);
            }
            PacketKind::Data => self.handle_data(peer, packet).await,
            other => {
                debug!(%peer, kind = ?other, "packet kind not served here");
                self.pool.give(packet);
            }
        }
    }

    async fn handle_data(&mut self, peer: PeerId, packet: Packet) {
        let Some(ip) = self.peer_ips.get(&peer).copied() else {
            self.pool.give(packet);
            return;
        };

        let kind = peek_message_kind(packet.payload());
        let now = unix_now();

        match kind {
            Some(MessageKind::RegisterRequest) => {
                match decode_message::<RegisterRequest>(packet.payload()) {
                    Ok(req) => {
                        self.pool.give(packet);
                        let resp = self.endpoints.register(&req, now).await;
                        self.send_message(peer, &resp);
                    }
                    Err(e) => self.drop_malformed(peer, packet, e),
                }
            }
            Some(MessageKind::LoginRequest) => {
                match decode_message::<LoginRequest>(packet.payload()) {
                    Ok(req) => {
                        self.pool.give(packet);
                        let resp = self.endpoints.login(&req, ip, now).await;
                        self.send_message(peer, &resp);
                    }
                    Err(e) => self.drop_malformed(peer, packet, e),
                }
            }
            Some(MessageKind::TokenValidationRequest) => {
                match decode_message::<TokenValidationRequest>(packet.payload()) {
                    Ok(req) => {
                        self.pool.give(packet);
                        let resp = self.endpoints.validate_token(&req, now).await;
                        self.send_message(peer, &resp);
                    }
                    Err(e) => self.drop_malformed(peer, packet, e),
                }
            }
            other => {
                self.unknown_messages += 1;
                warn!(
                    %peer,
                    kind = ?other,
                    total = self.unknown_messages,
                    "dropping message this service does not handle"
                );
                self.pool.give(packet);
            }
        }
    }

    fn drop_malformed(&self, peer: PeerId, packet: Packet, error: anyhow::Error) {
        warn!(%peer, "malformed message: {error:#}");
        self.pool.give(packet);
    }

    /// Responses ride the reliable channel; clients block on them.
    fn send_message<M: Message + Encode>(&self, peer: PeerId, msg: &M) {
        let payload = match encode_message(msg) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode {}: {e:#}", M::NAME);
                return;
            }
        };

        let mut packet = self.pool.rent();
        packet.kind = PacketKind::Data;

        if let Err(e) = packet.set_payload(&payload) {
            warn!("oversized {}: {e:#}", M::NAME);
            self.pool.give(packet);
            return;
        }

        if let Err(e) = self.transport.send_to(peer, packet, ChannelTag::Reliable) {
            debug!("failed to send {}: {e}", M::NAME);
        }
    }

    fn send_body<B: Encode>(&self, peer: PeerId, kind: PacketKind, body: &B, channel: ChannelTag) {
        let mut payload = Vec::new();
        if let Err(e) = body.encode(&mut payload) {
            warn!("failed to encode {kind:?} body: {e:#}");
            return;
        }

        let mut packet = self.pool.rent();
        packet.kind = kind;

        if packet.set_payload(&payload).is_ok() {
            if let Err(e) = self.transport.send_to(peer, packet, channel) {
                debug!("failed to send {kind:?}: {e}");
            }
        } else {
            self.pool.give(packet);
        }
    }

    async fn cleanup(&self) {
        match self.endpoints.cleanup_attempts(unix_now(), ATTEMPT_RETENTION).await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "cleaned up old login attempts"),
            Err(e) => warn!("login attempt cleanup failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{SocketAddr, UdpSocket as StdUdpSocket};

    use keelson_protocol::messages::{
        Handshake, LoginResponse, LoginResult, RegisterResponse, RegisterResult,
        TokenValidationResponse,
    };
    use keelson_protocol::PROTOCOL_VERSION;
    use keelson_transport::TransportConfig;
    use tokio::runtime::Handle;

    use super::*;
    use crate::endpoints::AccountPolicy;
    use crate::repository::MemoryRepository;
    use crate::token::TokenAuthority;

    struct WireClient {
        socket: StdUdpSocket,
        server: SocketAddr,
        pool: PacketPool,
        sequence: u16,
    }

    impl WireClient {
        fn connect(server: SocketAddr) -> Self {
            let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
            socket
                .set_read_timeout(Some(Duration::from_millis(500)))
                .unwrap();

            let client = Self {
                socket,
                server,
                pool: PacketPool::new(),
                sequence: 0,
            };

            let mut payload = Vec::new();
            Handshake {
                protocol_version: PROTOCOL_VERSION,
                connection_key: String::new(),
            }
            .encode(&mut payload)
            .unwrap();

            let mut packet = client.pool.rent();
            packet.kind = PacketKind::Handshake;
            packet.set_payload(&payload).unwrap();
            let mut bytes = Vec::new();
            packet.encode_frame(&mut bytes).unwrap();
            client.pool.give(packet);
            client.socket.send_to(&bytes, server).unwrap();

            let (kind, _) = client.recv_frame().expect("no handshake response");
            assert_eq!(kind, PacketKind::HandshakeAck);

            client
        }

        fn send_message<M: Message + Encode>(&mut self, msg: &M) {
            self.sequence += 1;

            let mut packet = self.pool.rent();
            packet.kind = PacketKind::Data;
            packet.channel = ChannelTag::Reliable;
            packet.sequence = self.sequence;
            packet
                .set_payload(&encode_message(msg).unwrap())
                .unwrap();

            let mut bytes = Vec::new();
            packet.encode_frame(&mut bytes).unwrap();
            self.pool.give(packet);
            self.socket.send_to(&bytes, self.server).unwrap();
        }

        fn recv_frame(&self) -> Option<(PacketKind, Vec<u8>)> {
            let mut buf = [0u8; 65535];
            let (len, _) = self.socket.recv_from(&mut buf).ok()?;

            let mut packet = self.pool.rent();
            packet.decode_frame(&buf[..len]).unwrap();
            let out = (packet.kind, packet.payload().to_vec());
            self.pool.give(packet);
            Some(out)
        }

        fn recv_message<M: Message + for<'a> Decode<'a>>(&self) -> Option<M> {
            for _ in 0..32 {
                let (kind, payload) = self.recv_frame()?;

                if kind != PacketKind::Data {
                    continue;
                }
                if peek_message_kind(&payload) != Some(M::KIND) {
                    continue;
                }

                return decode_message::<M>(&payload).ok();
            }
            None
        }
    }

    fn make_service() -> AuthService {
        let pool = Arc::new(PacketPool::new());
        let transport = ServerTransport::bind(
            TransportConfig {
                tokio_handle: Some(Handle::current()),
                ..TransportConfig::default()
            },
            Arc::clone(&pool),
        )
        .unwrap();

        let endpoints = Arc::new(AuthEndpoints::new(
            Arc::new(MemoryRepository::new()),
            TokenAuthority::new(
                b"a-test-secret-of-at-least-32-bytes!".to_vec(),
                "keelson-auth",
                "keelson-game",
                Duration::from_secs(3600),
            ),
            AccountPolicy::default(),
        ));

        AuthService::new(transport, pool, endpoints, 10)
    }

    async fn pump(service: &mut AuthService, ticks: usize) {
        for _ in 0..ticks {
            tokio::time::sleep(Duration::from_millis(10)).await;
            service.current_tick = service.current_tick.wrapping_add(1);
            service.process_tick().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn register_login_validate_over_the_wire() {
        let mut service = make_service();
        let mut client = WireClient::connect(service.transport.local_addr());

        client.send_message(&keelson_protocol::messages::RegisterRequest {
            username: "alice".to_owned(),
            email: "a@x.y".to_owned(),
            password: "Passw0rd!".to_owned(),
            confirm: "Passw0rd!".to_owned(),
        });
        pump(&mut service, 4).await;

        let reg = client
            .recv_message::<RegisterResponse>()
            .expect("no register response");
        assert_eq!(reg.result, RegisterResult::Success);
        let user_id = reg.user_id.expect("success carries the account id");

        client.send_message(&LoginRequest {
            identifier: "alice".to_owned(),
            password: "Passw0rd!".to_owned(),
        });
        pump(&mut service, 4).await;

        let login = client
            .recv_message::<LoginResponse>()
            .expect("no login response");
        assert_eq!(login.result, LoginResult::Success);
        assert!(!login.token.is_empty());

        client.send_message(&TokenValidationRequest {
            token: login.token.clone(),
        });
        pump(&mut service, 4).await;

        let validation = client
            .recv_message::<TokenValidationResponse>()
            .expect("no validation response");
        assert!(validation.valid);
        assert_eq!(validation.user_id, Some(user_id));
        assert_eq!(validation.username, "alice");

        service.transport.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wrong_password_over_the_wire() {
        let mut service = make_service();
        let mut client = WireClient::connect(service.transport.local_addr());

        client.send_message(&keelson_protocol::messages::RegisterRequest {
            username: "bob".to_owned(),
            email: "b@x.y".to_owned(),
            password: "Passw0rd!".to_owned(),
            confirm: "Passw0rd!".to_owned(),
        });
        pump(&mut service, 4).await;
        client
            .recv_message::<RegisterResponse>()
            .expect("no register response");

        client.send_message(&LoginRequest {
            identifier: "bob".to_owned(),
            password: "nope".to_owned(),
        });
        pump(&mut service, 4).await;

        let login = client
            .recv_message::<LoginResponse>()
            .expect("no login response");
        assert_eq!(login.result, LoginResult::InvalidCredentials);
        assert!(login.token.is_empty());

        service.transport.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ping_is_echoed_with_the_server_tick() {
        let mut service = make_service();
        let client = WireClient::connect(service.transport.local_addr());

        let mut payload = Vec::new();
        Ping {
            client_time_ms: 4242,
        }
        .encode(&mut payload)
        .unwrap();

        let mut packet = client.pool.rent();
        packet.kind = PacketKind::Ping;
        packet.channel = ChannelTag::Unreliable;
        packet.sequence = 1;
        packet.set_payload(&payload).unwrap();
        let mut bytes = Vec::new();
        packet.encode_frame(&mut bytes).unwrap();
        client.pool.give(packet);
        client.socket.send_to(&bytes, client.server).unwrap();

        pump(&mut service, 4).await;

        let pong = loop {
            let (kind, payload) = client.recv_frame().expect("no pong");
            if kind == PacketKind::Pong {
                break Pong::decode(&mut payload.as_slice()).unwrap();
            }
        };

        assert_eq!(pong.client_time_ms, 4242);
        assert!(pong.server_tick > 0);

        service.transport.close();
    }
}
