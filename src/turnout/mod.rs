//! Magnetic-accessory (turnout) scheduling.
//!
//! Coils must not stay energised, and a power supply should not see many
//! coils switching at once. The [`TurnoutScheduler`] therefore:
//!
//! - keeps at most [`MAX_TURNOUT_ACTIVE`] accessories energised,
//! - never energises two outputs of the same four-output decoder group,
//! - spaces consecutive ON packets by at least [`TURNOUT_MIN_DELAY_MS`],
//! - sends the OFF packet after the requested duration, clipped to the
//!   configured `[min_time_ms, max_time_ms]` window, or earlier on an
//!   explicit OFF once the minimum time has passed.
//!
//! The scheduler itself is synchronous and takes `now_ms` explicitly, like
//! the rest of the core. The `runtime` feature adds a tokio task that owns a
//! scheduler and feeds it from a bounded mailbox (see [`service`]).
//!
//! ```rust
//! use std::sync::Arc;
//! use rs_cmdstation::hal::MockLocoDb;
//! use rs_cmdstation::turnout::{TurnoutContext, TurnoutMsg, TurnoutScheduler};
//! use rs_cmdstation::{Command, Config, DecoderFormat, EventBus, SignalQueue};
//!
//! let ctx = TurnoutContext {
//!     queue: Arc::new(SignalQueue::new()),
//!     db: Arc::new(MockLocoDb::new(DecoderFormat::Dcc28)),
//!     events: Arc::new(EventBus::new()),
//!     config: Config::default().shared(),
//! };
//! let mut sched = TurnoutScheduler::new(ctx.clone());
//!
//! sched.handle(TurnoutMsg::On { adr: 1, dir: 0, duration_ms: 200 }, 0);
//! sched.poll(0);
//! sched.poll(200);
//!
//! let cmds: Vec<Command> = ctx.queue.drain().iter().map(|p| p.cmd).collect();
//! assert_eq!(cmds, [Command::MagnetOn, Command::MagnetOff]);
//! ```

#[cfg(feature = "runtime")]
pub mod service;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::SharedConfig;
use crate::events::{EventBus, EventData, EventKind};
use crate::factory::accessory;
use crate::format::turnout_group;
use crate::packet::Packet;
use crate::queue::SignalQueue;
use crate::traits::LocoDatabase;

/// Maximum number of simultaneously energised accessories.
pub const MAX_TURNOUT_ACTIVE: usize = 16;

/// Minimum spacing between two ON packets.
pub const TURNOUT_MIN_DELAY_MS: u64 = 20;

/// Capacity of the request mailbox.
pub const TURNOUT_MAILBOX: usize = 16;

/// Request sent to the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnoutMsg {
    /// Energise output `dir` for `duration_ms`.
    On {
        /// Accessory address.
        adr: u16,
        /// Output (0 or 1).
        dir: u8,
        /// Requested energising time.
        duration_ms: u32,
    },
    /// Release the accessory as soon as its minimum time has passed.
    Off {
        /// Accessory address.
        adr: u16,
    },
}

/// Shared collaborators of the scheduler.
#[derive(Clone)]
pub struct TurnoutContext {
    /// Packet sink.
    pub queue: Arc<SignalQueue>,
    /// Accessory descriptors.
    pub db: Arc<dyn LocoDatabase>,
    /// Event sink.
    pub events: Arc<EventBus>,
    /// Timing and repeat configuration.
    pub config: SharedConfig,
}

/// Snapshot published by the scheduler after each step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TurnoutStatus {
    /// Energised addresses in switch-on order.
    pub active: Vec<u16>,
    /// Requests waiting for a free slot.
    pub pending: usize,
}

#[derive(Debug)]
struct TurnoutAction {
    adr: u16,
    dir: u8,
    on: Packet,
    off: Packet,
    start: u64,
    duration_ms: u32,
    req_off: bool,
}

impl TurnoutAction {
    fn deadline(&self, min_ms: u32) -> u64 {
        let planned = self.start + u64::from(self.duration_ms);
        if self.req_off {
            planned.min(self.start + u64::from(min_ms))
        } else {
            planned
        }
    }

    fn shares_group(&self, adr: u16) -> bool {
        turnout_group(self.adr) == turnout_group(adr)
    }
}

/// Owner of the pending and active turnout lists.
pub struct TurnoutScheduler {
    ctx: TurnoutContext,
    request: Vec<TurnoutAction>,
    active: heapless::Vec<TurnoutAction, MAX_TURNOUT_ACTIVE>,
    last: Option<u64>,
    status: Arc<RwLock<TurnoutStatus>>,
}

impl TurnoutScheduler {
    /// Create an idle scheduler.
    pub fn new(ctx: TurnoutContext) -> Self {
        Self {
            ctx,
            request: Vec::new(),
            active: heapless::Vec::new(),
            last: None,
            status: Arc::new(RwLock::new(TurnoutStatus::default())),
        }
    }

    /// Shared status, updated after every `handle` and `poll`.
    pub fn status(&self) -> Arc<RwLock<TurnoutStatus>> {
        Arc::clone(&self.status)
    }

    /// True if `adr` is energised or waiting.
    pub fn is_known(&self, adr: u16) -> bool {
        self.active.iter().chain(self.request.iter()).any(|a| a.adr == adr)
    }

    /// Energised addresses.
    pub fn active(&self) -> Vec<u16> {
        self.active.iter().map(|a| a.adr).collect()
    }

    /// Number of waiting requests.
    pub fn pending(&self) -> usize {
        self.request.len()
    }

    /// Accept a mailbox message.
    pub fn handle(&mut self, msg: TurnoutMsg, now: u64) {
        match msg {
            TurnoutMsg::On { adr, dir, duration_ms } => self.request_on(adr, dir, duration_ms, now),
            TurnoutMsg::Off { adr } => {
                for a in self.active.iter_mut().chain(self.request.iter_mut()) {
                    if a.adr == adr {
                        a.req_off = true;
                    }
                }
            }
        }
        self.publish();
    }

    fn request_on(&mut self, adr: u16, dir: u8, duration_ms: u32, now: u64) {
        if self.is_known(adr) {
            debug!(target: "turnout", adr, "already switching, request ignored");
            return;
        }
        let Some(desc) = self.ctx.db.get_turnout(adr, true) else {
            warn!(target: "turnout", adr, "no accessory descriptor");
            return;
        };
        let (formats, duration_ms) = {
            let cfg = self.ctx.config.read();
            (cfg.formats.clone(), cfg.turnout.clip(duration_ms))
        };
        let packets = accessory::magnet(&formats, desc.fmt, adr, dir, true)
            .zip(accessory::magnet(&formats, desc.fmt, adr, dir, false));
        let Some((on, off)) = packets else {
            warn!(target: "turnout", adr, dir, fmt = %desc.fmt, "not a track accessory");
            return;
        };
        self.request.push(TurnoutAction {
            adr,
            dir,
            on,
            off,
            start: now,
            duration_ms,
            req_off: false,
        });
    }

    /// Run one scheduling step: finish due actions, then start at most one.
    pub fn poll(&mut self, now: u64) {
        self.check_done(now);
        self.check_start(now);
        self.publish();
    }

    fn check_done(&mut self, now: u64) {
        let min_ms = self.ctx.config.read().turnout.min_time_ms;
        let mut i = 0;
        while i < self.active.len() {
            if now < self.active[i].deadline(min_ms) {
                i += 1;
                continue;
            }
            let a = self.active.remove(i);
            self.ctx.queue.enqueue(a.off, false);
            self.ctx.db.set_turnout_state(a.adr, false, a.dir);
            debug!(target: "turnout", adr = a.adr, dir = a.dir, "coil off");
            self.ctx.events.fire(
                EventKind::Turnout,
                EventData::Turnout {
                    adr: a.adr,
                    dir: a.dir,
                    on: false,
                },
            );
        }
    }

    fn startable(&self) -> Option<usize> {
        if self.active.is_full() {
            return None;
        }
        self.request
            .iter()
            .position(|r| !self.active.iter().any(|a| a.shares_group(r.adr)))
    }

    fn check_start(&mut self, now: u64) {
        if matches!(self.last, Some(last) if now < last + TURNOUT_MIN_DELAY_MS) {
            return;
        }
        let Some(pos) = self.startable() else {
            return;
        };
        let mut a = self.request.remove(pos);
        self.ctx.queue.enqueue(a.on.clone(), false);
        a.start = now;
        self.last = Some(now);

        self.ctx.db.set_turnout_state(a.adr, true, a.dir);
        debug!(target: "turnout", adr = a.adr, dir = a.dir, duration_ms = a.duration_ms, "coil on");
        self.ctx.events.fire(
            EventKind::Turnout,
            EventData::Turnout {
                adr: a.adr,
                dir: a.dir,
                on: true,
            },
        );
        if let Err(a) = self.active.push(a) {
            warn!(target: "turnout", adr = a.adr, "active list full");
        }
    }

    /// Earliest time at which [`poll`](Self::poll) has work to do.
    ///
    /// `None` means nothing is pending and the caller may wait for the next
    /// message indefinitely.
    pub fn next_wakeup(&self) -> Option<u64> {
        let min_ms = self.ctx.config.read().turnout.min_time_ms;
        let done = self.active.iter().map(|a| a.deadline(min_ms)).min();
        let start = self
            .startable()
            .map(|_| self.last.map_or(0, |l| l + TURNOUT_MIN_DELAY_MS));
        match (done, start) {
            (Some(d), Some(s)) => Some(d.min(s)),
            (d, s) => d.or(s),
        }
    }

    fn publish(&self) {
        let mut status = self.status.write();
        status.active = self.active();
        status.pending = self.request.len();
    }
}
