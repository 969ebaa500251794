//! A process-wide pool of [`Packet`] envelopes.
//!
//! The ownership rule is strict: every rented packet is returned exactly
//! once. The transport returns send-path packets once bytes are queued on
//! the socket; receive-path packets are returned by the handler that
//! consumed them. The in-use count exists so tests can assert the balance
//! after a workload.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::Packet;

/// A thread-safe free list of packet envelopes.
///
/// Constructed once at startup and shared by reference (or `Arc`) with
/// every component that touches packets.
#[derive(Default)]
pub struct PacketPool {
    free: Mutex<Vec<Packet>>,
    in_use: AtomicUsize,
}

impl PacketPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rents a packet with zeroed header fields and an empty payload.
    ///
    /// The payload buffer's allocation may be reused from a previously
    /// returned packet.
    pub fn rent(&self) -> Packet {
        self.in_use.fetch_add(1, Ordering::Relaxed);

        match self.free.lock().pop() {
            Some(p) => {
                debug_assert_eq!(p.sequence, 0);
                debug_assert!(p.payload().is_empty());
                p
            }
            None => Packet::empty(),
        }
    }

    /// Returns a rented packet to the pool.
    pub fn give(&self, mut packet: Packet) {
        packet.reset();
        self.free.lock().push(packet);

        let prev = self.in_use.fetch_sub(1, Ordering::Relaxed);
        debug_assert_ne!(prev, 0, "packet pool in-use count underflowed");
    }

    /// The number of packets currently rented out.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_give_balances() {
        let pool = PacketPool::new();
        assert_eq!(pool.in_use(), 0);

        let a = pool.rent();
        let b = pool.rent();
        assert_eq!(pool.in_use(), 2);

        pool.give(a);
        pool.give(b);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn rented_packets_are_zeroed() {
        let pool = PacketPool::new();

        let mut p = pool.rent();
        p.sequence = 42;
        p.ack = 7;
        p.ack_bits = 0xDEAD;
        p.set_payload(b"leftovers").unwrap();
        pool.give(p);

        let p = pool.rent();
        assert_eq!(p.sequence, 0);
        assert_eq!(p.ack, 0);
        assert_eq!(p.ack_bits, 0);
        assert!(p.payload().is_empty());
        pool.give(p);
    }

    #[test]
    fn pool_is_shared_across_threads() {
        use std::sync::Arc;

        let pool = Arc::new(PacketPool::new());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let p = pool.rent();
                    pool.give(p);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(pool.in_use(), 0);
    }
}
