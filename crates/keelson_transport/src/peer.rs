//! Per-peer connection state and the peer table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use keelson_protocol::packet::{is_sequence_newer, AckWindow};
use keelson_protocol::{ChannelTag, Packet, PacketPool};

use crate::PeerId;

/// Out-of-order reliable packets held back per peer before this many
/// buffered entries become a protocol violation.
pub(crate) const MAX_HOLDBACK: usize = 1024;

/// A reliable packet awaiting acknowledgment, kept as raw frame bytes so
/// retransmission does not touch the pool.
pub(crate) struct PendingReliable {
    pub(crate) sequence: u16,
    pub(crate) bytes: Vec<u8>,
    pub(crate) last_sent: Instant,
    pub(crate) attempts: u32,
}

/// Connection state for one admitted peer.
pub(crate) struct Peer {
    pub(crate) addr: SocketAddr,
    /// Next outgoing sequence per channel; each channel has its own
    /// sequence space.
    send_seq: [u16; 3],
    /// Receive window over the peer's reliable sequence space; its
    /// ack/ack_bits ride in the header of every packet we send back.
    pub(crate) recv_reliable: AckWindow,
    /// Next reliable sequence to hand to the consumer.
    reliable_expected: u16,
    /// Reliable packets that arrived ahead of a gap.
    holdback: HashMap<u16, Packet>,
    /// Newest sequenced-channel sequence delivered.
    latest_sequenced: Option<u16>,
    /// Our unacked reliable sends.
    pub(crate) pending: Vec<PendingReliable>,
}

/// What to do with one incoming data-bearing packet.
pub(crate) enum Ingress {
    /// Hand these packets to the consumer, in order.
    Deliver(Vec<Packet>),
    /// Duplicate or stale; the caller returns the packet to the pool.
    Drop(Packet),
    /// The peer overflowed its hold-back allowance.
    Overflow(Packet),
}

impl Peer {
    pub(crate) fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            send_seq: [0; 3],
            recv_reliable: AckWindow::new(),
            reliable_expected: 1,
            holdback: HashMap::new(),
            latest_sequenced: None,
            pending: Vec::new(),
        }
    }

    /// Assigns the next outgoing sequence on `channel`.
    pub(crate) fn next_sequence(&mut self, channel: ChannelTag) -> u16 {
        let seq = &mut self.send_seq[channel as usize];
        *seq = seq.wrapping_add(1);
        *seq
    }

    /// Applies the ack header of an incoming packet to our pending
    /// reliable sends.
    pub(crate) fn apply_acks(&mut self, ack: u16, ack_bits: u32) {
        self.pending
            .retain(|p| !keelson_protocol::packet::header_acks(ack, ack_bits, p.sequence));
    }

    /// Runs receive-side channel semantics for one packet.
    pub(crate) fn ingress(&mut self, packet: Packet) -> Ingress {
        match packet.channel {
            ChannelTag::Unreliable => Ingress::Deliver(vec![packet]),
            ChannelTag::Sequenced => {
                let newer = match self.latest_sequenced {
                    Some(latest) => is_sequence_newer(packet.sequence, latest),
                    None => true,
                };

                if newer {
                    self.latest_sequenced = Some(packet.sequence);
                    Ingress::Deliver(vec![packet])
                } else {
                    Ingress::Drop(packet)
                }
            }
            ChannelTag::Reliable => self.ingress_reliable(packet),
        }
    }

    fn ingress_reliable(&mut self, packet: Packet) -> Ingress {
        let seq = packet.sequence;
        self.recv_reliable.mark_acked(seq);

        if seq == self.reliable_expected {
            let mut ready = vec![packet];
            self.reliable_expected = self.reliable_expected.wrapping_add(1);

            while let Some(next) = self.holdback.remove(&self.reliable_expected) {
                ready.push(next);
                self.reliable_expected = self.reliable_expected.wrapping_add(1);
            }

            Ingress::Deliver(ready)
        } else if is_sequence_newer(seq, self.reliable_expected) {
            if self.holdback.contains_key(&seq) {
                Ingress::Drop(packet)
            } else if self.holdback.len() >= MAX_HOLDBACK {
                Ingress::Overflow(packet)
            } else {
                self.holdback.insert(seq, packet);
                Ingress::Deliver(Vec::new())
            }
        } else {
            // Already delivered; a retransmit whose ack got lost.
            Ingress::Drop(packet)
        }
    }

    /// Returns every held-back packet to the pool. Called on removal.
    pub(crate) fn drain_into(&mut self, pool: &PacketPool) {
        for (_, p) in self.holdback.drain() {
            pool.give(p);
        }
    }
}

/// Both indices over admitted peers, guarded by a single mutex in the
/// transport.
#[derive(Default)]
pub(crate) struct PeerTable {
    peers: HashMap<PeerId, Peer>,
    by_addr: HashMap<SocketAddr, PeerId>,
    next_id: u64,
    pub(crate) accepting: bool,
}

impl PeerTable {
    pub(crate) fn new() -> Self {
        Self {
            accepting: true,
            ..Self::default()
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn get_mut(&mut self, peer: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&peer)
    }

    pub(crate) fn id_of(&self, addr: SocketAddr) -> Option<PeerId> {
        self.by_addr.get(&addr).copied()
    }

    pub(crate) fn insert(&mut self, addr: SocketAddr) -> PeerId {
        self.next_id += 1;
        let id = PeerId(self.next_id);

        self.peers.insert(id, Peer::new(addr));
        self.by_addr.insert(addr, id);

        id
    }

    pub(crate) fn remove(&mut self, peer: PeerId) -> Option<Peer> {
        let removed = self.peers.remove(&peer)?;
        self.by_addr.remove(&removed.addr);
        Some(removed)
    }

    pub(crate) fn addrs(&self) -> Vec<(PeerId, SocketAddr)> {
        self.peers.iter().map(|(id, p)| (*id, p.addr)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    fn packet(pool: &PacketPool, channel: ChannelTag, sequence: u16) -> Packet {
        let mut p = pool.rent();
        p.channel = channel;
        p.sequence = sequence;
        p
    }

    #[test]
    fn reliable_delivers_in_order_across_gaps() {
        let pool = PacketPool::new();
        let mut peer = Peer::new(addr());

        // 1 arrives, then 3 ahead of 2.
        let Ingress::Deliver(ready) = peer.ingress(packet(&pool, ChannelTag::Reliable, 1)) else {
            panic!("expected delivery");
        };
        assert_eq!(ready.len(), 1);
        ready.into_iter().for_each(|p| pool.give(p));

        let Ingress::Deliver(ready) = peer.ingress(packet(&pool, ChannelTag::Reliable, 3)) else {
            panic!("expected holdback");
        };
        assert!(ready.is_empty());

        let Ingress::Deliver(ready) = peer.ingress(packet(&pool, ChannelTag::Reliable, 2)) else {
            panic!("expected delivery");
        };
        let seqs: Vec<u16> = ready.iter().map(|p| p.sequence).collect();
        assert_eq!(seqs, [2, 3]);
        ready.into_iter().for_each(|p| pool.give(p));

        peer.drain_into(&pool);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn reliable_retransmits_are_dropped() {
        let pool = PacketPool::new();
        let mut peer = Peer::new(addr());

        match peer.ingress(packet(&pool, ChannelTag::Reliable, 1)) {
            Ingress::Deliver(ready) => ready.into_iter().for_each(|p| pool.give(p)),
            _ => panic!("expected delivery"),
        }

        match peer.ingress(packet(&pool, ChannelTag::Reliable, 1)) {
            Ingress::Drop(p) => pool.give(p),
            _ => panic!("expected drop of retransmit"),
        }

        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn sequenced_drops_older() {
        let pool = PacketPool::new();
        let mut peer = Peer::new(addr());

        match peer.ingress(packet(&pool, ChannelTag::Sequenced, 5)) {
            Ingress::Deliver(ready) => ready.into_iter().for_each(|p| pool.give(p)),
            _ => panic!("expected delivery"),
        }

        match peer.ingress(packet(&pool, ChannelTag::Sequenced, 3)) {
            Ingress::Drop(p) => pool.give(p),
            _ => panic!("expected drop of older sequenced packet"),
        }

        match peer.ingress(packet(&pool, ChannelTag::Sequenced, 6)) {
            Ingress::Deliver(ready) => ready.into_iter().for_each(|p| pool.give(p)),
            _ => panic!("expected delivery"),
        }

        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn channel_sequences_are_independent() {
        let mut peer = Peer::new(addr());

        assert_eq!(peer.next_sequence(ChannelTag::Reliable), 1);
        assert_eq!(peer.next_sequence(ChannelTag::Reliable), 2);
        assert_eq!(peer.next_sequence(ChannelTag::Unreliable), 1);
        assert_eq!(peer.next_sequence(ChannelTag::Sequenced), 1);
    }

    #[test]
    fn acks_clear_pending_sends() {
        let mut peer = Peer::new(addr());

        for sequence in 1..=3u16 {
            peer.pending.push(PendingReliable {
                sequence,
                bytes: Vec::new(),
                last_sent: Instant::now(),
                attempts: 1,
            });
        }

        // Remote acked 3 and 1, but not 2.
        let mut win = AckWindow::new();
        win.mark_acked(1);
        win.mark_acked(3);
        peer.apply_acks(win.ack(), win.ack_bits());

        let left: Vec<u16> = peer.pending.iter().map(|p| p.sequence).collect();
        assert_eq!(left, [2]);
    }
}
