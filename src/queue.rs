//! Signal queue: the ordered FIFO of packets waiting for the track.
//!
//! Every producer (refresh engine, turnout scheduler, POM facade, m3
//! programmer) appends here; the signal generator pulls from the head.
//!
//! # Locking
//!
//! One [`parking_lot::Mutex`] guards the deque. Acquisition waits at most
//! [`QUEUE_LOCK_WAIT`]. When that expires an enqueue drops its packet and a
//! pop returns nothing; losing a packet is preferred over stalling the
//! bitstream.
//!
//! # Replacement-on-match
//!
//! With `replace` set, an enqueue looks for a queued packet with the same
//! address, format and command, scanning from the tail. If found, that
//! packet takes over the new payload, function snapshot and repeat count and
//! the new packet is discarded. The scan stops at an emergency-stop or
//! MM-reverse packet for the same decoder, so a newer speed never moves
//! ahead of a direction change.
//!
//! ```rust
//! use rs_cmdstation::config::FormatConfig;
//! use rs_cmdstation::factory::loco;
//! use rs_cmdstation::{DecoderFormat, SignalQueue};
//!
//! let cfg = FormatConfig::default();
//! let queue = SignalQueue::new();
//! for step in [10, 20, 30] {
//!     let p = loco::speed(&cfg, DecoderFormat::Dcc28, 3, 0x80 | step, [0; 4]).unwrap();
//!     queue.enqueue(p, true);
//! }
//! assert_eq!(queue.len(), 1);
//! assert_eq!(queue.pop(None).unwrap().speed(), Some(0x80 | 30));
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use crate::factory::broadcast;
use crate::format::DecoderFormat;
use crate::packet::{Command, Packet};

/// Bounded wait for the queue mutex.
pub const QUEUE_LOCK_WAIT: Duration = Duration::from_millis(20);

/// Fallback producer consulted when the queue is empty.
pub trait RefreshSource {
    /// Next refresh packet, or `None` when nothing is due.
    fn refresh_packet(&self) -> Option<Packet>;
}

/// The packet FIFO.
pub struct SignalQueue {
    packets: Mutex<VecDeque<Packet>>,
    lock_wait: Duration,
}

impl Default for SignalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for SignalQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SignalQueue")
            .field("len", &self.len())
            .field("lock_wait", &self.lock_wait)
            .finish()
    }
}

impl SignalQueue {
    /// Creates an empty queue with the default lock wait.
    pub fn new() -> Self {
        Self {
            packets: Mutex::new(VecDeque::new()),
            lock_wait: QUEUE_LOCK_WAIT,
        }
    }

    /// Override the bounded lock wait.
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Append a packet at the tail.
    ///
    /// Returns `false` if the packet was dropped on lock timeout.
    pub fn enqueue(&self, pkt: Packet, replace: bool) -> bool {
        self.enqueue_batch(core::iter::once(pkt), replace)
    }

    /// Append several packets at the tail without interleaving.
    ///
    /// Returns `false` if the whole batch was dropped on lock timeout.
    pub fn enqueue_batch<I>(&self, pkts: I, replace: bool) -> bool
    where
        I: IntoIterator<Item = Packet>,
    {
        let Some(mut q) = self.packets.try_lock_for(self.lock_wait) else {
            warn!(target: "queue", "signal queue lock timeout, packets dropped");
            return false;
        };
        for pkt in pkts {
            let idle_after = pkt.fmt == DecoderFormat::Dcc14 && pkt.cmd == Command::SetSpeed;
            if replace && Self::replace_in(&mut q, &pkt) {
                continue;
            }
            q.push_back(pkt);
            if idle_after {
                q.push_back(broadcast::idle(1));
            }
        }
        true
    }

    fn replace_in(q: &mut VecDeque<Packet>, pkt: &Packet) -> bool {
        for queued in q.iter_mut().rev() {
            if queued.adr != pkt.adr || queued.fmt != pkt.fmt {
                continue;
            }
            if queued.cmd.is_direction_barrier() {
                return false;
            }
            if queued.cmd == pkt.cmd {
                queued.value = pkt.value;
                queued.funcs = pkt.funcs;
                queued.repeat = pkt.repeat;
                return true;
            }
        }
        false
    }

    /// Put a packet back at the head.
    ///
    /// Used by the generator for packets it cannot dispatch yet. On lock
    /// timeout the packet is lost and `false` is returned.
    pub fn push_front(&self, pkt: Packet) -> bool {
        match self.packets.try_lock_for(self.lock_wait) {
            Some(mut q) => {
                q.push_front(pkt);
                true
            }
            None => {
                warn!(target: "queue", cmd = ?pkt.cmd, adr = pkt.adr, "push-back lost on lock timeout");
                false
            }
        }
    }

    /// Take the head packet.
    ///
    /// When the queue is empty and `refresh` is given, a refresh packet is
    /// synthesised instead. The queue lock is released before the refresh
    /// source runs.
    pub fn pop(&self, refresh: Option<&dyn RefreshSource>) -> Option<Packet> {
        let head = {
            let mut q = self.packets.try_lock_for(self.lock_wait)?;
            q.pop_front()
        };
        match head {
            Some(p) => Some(p),
            None => refresh.and_then(|r| r.refresh_packet()),
        }
    }

    /// Drop every queued packet. Returns how many were removed.
    pub fn flush(&self) -> usize {
        match self.packets.try_lock_for(self.lock_wait) {
            Some(mut q) => {
                let n = q.len();
                q.clear();
                n
            }
            None => {
                warn!(target: "queue", "flush skipped on lock timeout");
                0
            }
        }
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the queued packets, head first.
    pub fn snapshot(&self) -> Vec<Packet> {
        self.packets.lock().iter().cloned().collect()
    }

    /// Remove and return every queued packet, head first.
    pub fn drain(&self) -> Vec<Packet> {
        self.packets.lock().drain(..).collect()
    }
}
