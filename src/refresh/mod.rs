//! Loco refresh and function-state engine.
//!
//! [`RefreshEngine`] keeps the table of live decoders, hosts the speed and
//! function command paths, and feeds the signal generator with
//! state-restating packets whenever the [`SignalQueue`] runs dry.
//!
//! # Overview
//!
//! - Live entries sit in a generational [`Arena`](arena::Arena), indexed by
//!   address and kept in creation order for the round-robin refresh pointer.
//! - Consist members are linked into a ring through
//!   [`LiveLoco::consist_next`] handles.
//! - All state lives behind one core mutex with a bounded wait
//!   ([`CORE_LOCK_WAIT`]). A command that cannot get the lock fails with
//!   [`CoreError::LockTimeout`].
//! - Packets and events produced under the lock are collected and only
//!   enqueued / fired after the lock is released. The core mutex and the
//!   queue mutex are never held together.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rs_cmdstation::hal::{MockClock, MockConfigStore, MockLocoDb};
//! use rs_cmdstation::{Command, Config, DecoderFormat, EventBus, RefreshEngine, SignalQueue};
//!
//! let queue = Arc::new(SignalQueue::new());
//! let db = Arc::new(MockLocoDb::new(DecoderFormat::Dcc28));
//! let engine = RefreshEngine::new(
//!     Arc::clone(&queue),
//!     db,
//!     Arc::new(EventBus::new()),
//!     Config::default().shared(),
//!     Arc::new(MockConfigStore::new()),
//!     Arc::new(MockClock::new()),
//! );
//!
//! engine.set_speed(10, 0x90).unwrap();
//! engine.set_speed(10, 0x10).unwrap();
//!
//! let cmds: Vec<Command> = queue.drain().iter().map(|p| p.cmd).collect();
//! assert_eq!(cmds, [Command::SetSpeed, Command::EmergencyStop, Command::SetSpeed]);
//! ```

pub mod arena;
pub mod cycle;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::config::{FormatConfig, SharedConfig, SignalFlags, StoreCause};
use crate::consist::{Consist, ConsistManager, MAX_CONSISTLENGTH};
use crate::error::{CoreError, Result};
use crate::events::{EventBus, EventData, EventKind};
use crate::factory::{accessory, loco};
use crate::format::{DecoderFormat, MAX_FUNCS, MAX_LOCO_ADR};
use crate::packet::{is_forward, make_speed, speed_step, Packet, SPEED_FORWARD};
use crate::queue::{RefreshSource, SignalQueue};
use crate::traits::{Clock, ConfigStore, LocoDatabase, LocoDescriptor};

use arena::{Arena, Handle};

/// Bounded wait for the core mutex.
pub const CORE_LOCK_WAIT: Duration = Duration::from_millis(100);

/// Interval between accessory keep-alive NOPs.
pub const NOP_INTERVAL_MS: u64 = 100;

/// Address of the placeholder refreshed when no loco is live.
pub const DUMMY_ADR: u16 = 3;

// ============================================================================
// Live entries
// ============================================================================

/// One decoder in the refresh list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveLoco {
    /// Copy of the persistent descriptor.
    pub desc: LocoDescriptor,
    /// Speed byte (bit 7 = forward).
    pub speed: u8,
    /// Function bitmap F0..F127.
    pub funcs: [u32; 4],
    /// Runs reversed relative to its consist head.
    pub consist_reverse: bool,
    /// Next member of the consist ring.
    pub consist_next: Option<Handle>,
    /// Refresh visits so far.
    pub age: u32,
    /// Eviction deadline in milliseconds.
    pub purge_at: Option<u64>,
}

impl LiveLoco {
    /// Fresh entry: stopped, forward, all functions off.
    pub fn new(desc: LocoDescriptor, purge_at: Option<u64>) -> Self {
        Self {
            desc,
            speed: SPEED_FORWARD,
            funcs: [0; 4],
            consist_reverse: false,
            consist_next: None,
            age: 0,
            purge_at,
        }
    }

    fn touch(&mut self, purge_ms: Option<u64>, now: u64) {
        self.purge_at = purge_ms.map(|p| now.saturating_add(p));
    }

    fn expired(&self, now: u64) -> bool {
        matches!(self.purge_at, Some(t) if now >= t)
    }

    /// Snapshot for host queries.
    pub fn state(&self) -> LocoState {
        LocoState {
            adr: self.desc.adr,
            fmt: self.desc.fmt,
            maxfunc: self.desc.maxfunc,
            speed: self.speed,
            funcs: self.funcs,
            in_consist: self.consist_next.is_some(),
            consist_reverse: self.consist_reverse,
        }
    }
}

/// Host-visible state of a live loco.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LocoState {
    /// Address.
    pub adr: u16,
    /// Decoder format.
    pub fmt: DecoderFormat,
    /// Highest supported function.
    pub maxfunc: u8,
    /// Speed byte (bit 7 = forward).
    pub speed: u8,
    /// Function bitmap.
    pub funcs: [u32; 4],
    /// Linked into a consist ring.
    pub in_consist: bool,
    /// Reversed within its consist.
    pub consist_reverse: bool,
}

// ============================================================================
// Core state
// ============================================================================

struct Core {
    arena: Arena<LiveLoco>,
    index: HashMap<u16, Handle>,
    order: Vec<Handle>,
    ptr: usize,
    consists: ConsistManager,
    dummy: LiveLoco,
    next_nop_at: u64,
    nop_ext: bool,
}

impl Core {
    fn new() -> Self {
        let dummy = LocoDescriptor::new(DUMMY_ADR, DecoderFormat::Dcc28).with_maxfunc(0);
        Self {
            arena: Arena::new(),
            index: HashMap::new(),
            order: Vec::new(),
            ptr: 0,
            consists: ConsistManager::new(),
            dummy: LiveLoco::new(dummy, None),
            next_nop_at: 0,
            nop_ext: false,
        }
    }

    fn lookup(&self, adr: u16) -> Option<Handle> {
        self.index.get(&adr).copied()
    }

    /// Handles of the ring through `h`, starting at `h`.
    fn ring(&self, h: Handle) -> Vec<Handle> {
        let mut out = vec![h];
        let mut cur = self.arena.get(h).and_then(|e| e.consist_next);
        while let Some(n) = cur {
            if n == h || out.len() >= MAX_CONSISTLENGTH {
                break;
            }
            out.push(n);
            cur = self.arena.get(n).and_then(|e| e.consist_next);
        }
        out
    }

    fn remove_handle(&mut self, h: Handle) -> Option<LiveLoco> {
        let entry = self.arena.remove(h)?;
        self.index.remove(&entry.desc.adr);
        if let Some(pos) = self.order.iter().position(|x| *x == h) {
            self.order.remove(pos);
            if pos < self.ptr {
                self.ptr -= 1;
            } else if pos == self.ptr {
                self.ptr = 0;
            }
        }

        // Close the ring around the removed entry.
        if let Some(next) = entry.consist_next.filter(|n| *n != h) {
            let mut cur = next;
            for _ in 0..MAX_CONSISTLENGTH {
                let Some(e) = self.arena.get_mut(cur) else {
                    break;
                };
                if e.consist_next == Some(h) {
                    e.consist_next = Some(next);
                    break;
                }
                match e.consist_next {
                    Some(n) => cur = n,
                    None => break,
                }
            }
        }
        Some(entry)
    }

    fn unlink(&mut self, adrs: &[u16]) {
        for adr in adrs {
            if let Some(e) = self.lookup(*adr).and_then(|h| self.arena.get_mut(h)) {
                e.consist_next = None;
                e.consist_reverse = false;
            }
        }
    }
}

/// Per-call snapshot of the configuration.
struct Ctx {
    now: u64,
    formats: FormatConfig,
    purge: Option<u64>,
}

/// Packets and events produced under the core lock.
#[derive(Default)]
struct Outbox {
    batches: Vec<(Vec<Packet>, bool)>,
    events: Vec<(EventKind, EventData)>,
}

impl Outbox {
    fn batch(&mut self, pkts: Vec<Packet>, replace: bool) {
        if !pkts.is_empty() {
            self.batches.push((pkts, replace));
        }
    }

    fn event(&mut self, kind: EventKind, data: EventData) {
        self.events.push((kind, data));
    }

    fn loco(&mut self, kind: EventKind, e: &LiveLoco) {
        self.event(
            kind,
            EventData::Loco {
                adr: e.desc.adr,
                speed: e.speed,
                funcs: e.funcs,
            },
        );
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The refresh list and the loco command paths.
pub struct RefreshEngine {
    core: Mutex<Core>,
    queue: Arc<SignalQueue>,
    db: Arc<dyn LocoDatabase>,
    events: Arc<EventBus>,
    config: SharedConfig,
    store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    lock_wait: Duration,
}

impl core::fmt::Debug for RefreshEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RefreshEngine")
            .field("lock_wait", &self.lock_wait)
            .finish_non_exhaustive()
    }
}

impl RefreshEngine {
    /// Create an engine with an empty refresh list.
    pub fn new(
        queue: Arc<SignalQueue>,
        db: Arc<dyn LocoDatabase>,
        events: Arc<EventBus>,
        config: SharedConfig,
        store: Arc<dyn ConfigStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            core: Mutex::new(Core::new()),
            queue,
            db,
            events,
            config,
            store,
            clock,
            lock_wait: CORE_LOCK_WAIT,
        }
    }

    /// Override the bounded wait for the core mutex.
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Core>> {
        self.core
            .try_lock_for(self.lock_wait)
            .ok_or(CoreError::LockTimeout)
    }

    fn ctx(&self) -> Ctx {
        let cfg = self.config.read();
        Ctx {
            now: self.clock.now_ms(),
            formats: cfg.formats.clone(),
            purge: cfg.system.purge_ms(),
        }
    }

    /// Run `f` under the core lock, then flush its outbox unlocked.
    fn run<T>(&self, f: impl FnOnce(&mut Core, &mut Outbox, &Ctx) -> Result<T>) -> Result<T> {
        let ctx = self.ctx();
        let mut out = Outbox::default();
        let res = {
            let mut core = self.lock()?;
            f(&mut core, &mut out, &ctx)
        };
        for (pkts, replace) in out.batches {
            self.queue.enqueue_batch(pkts, replace);
        }
        for (kind, data) in out.events {
            self.events.fire(kind, data);
        }
        res
    }

    fn materialise(&self, core: &mut Core, adr: u16, ctx: &Ctx, out: &mut Outbox) -> Result<Handle> {
        let desc = self.db.get_loco(adr, true).ok_or(CoreError::NoMemory)?;
        if adr > desc.fmt.max_address() {
            return Err(CoreError::Address(u32::from(adr)));
        }
        let fmt = desc.fmt;
        let entry = LiveLoco::new(desc, ctx.purge.map(|p| ctx.now.saturating_add(p)));
        let h = core.arena.insert(entry);
        core.index.insert(adr, h);
        core.order.push(h);
        debug!(target: "refresh", adr, %fmt, "loco entered refresh list");
        out.event(EventKind::NewLoco, EventData::NewLoco { adr, fmt });
        Ok(h)
    }

    fn link_consist(&self, core: &mut Core, c: &Consist, ctx: &Ctx, out: &mut Outbox) -> Result<()> {
        let mut ring: Vec<(Handle, bool)> = Vec::with_capacity(c.len());
        for m in c.members() {
            let adr = m.unsigned_abs();
            let h = match core.lookup(adr) {
                Some(h) => h,
                None => self.materialise(core, adr, ctx, out)?,
            };
            ring.push((h, *m < 0));
        }
        for (i, (h, rev)) in ring.iter().enumerate() {
            let next = ring[(i + 1) % ring.len()].0;
            if let Some(e) = core.arena.get_mut(*h) {
                e.consist_next = Some(next);
                e.consist_reverse = *rev;
            }
        }
        debug!(target: "refresh", members = ?c.members(), "consist ring linked");
        Ok(())
    }

    /// Rebuild the rings touching `adrs` after a consist change.
    fn relink(&self, core: &mut Core, adrs: &[u16], ctx: &Ctx, out: &mut Outbox) -> Result<()> {
        core.unlink(adrs);
        for adr in adrs {
            let Some(c) = core.consists.find(*adr).cloned() else {
                continue;
            };
            if c.addresses().any(|a| core.lookup(a).is_some()) {
                self.link_consist(core, &c, ctx, out)?;
            }
        }
        Ok(())
    }

    fn ensure(
        &self,
        core: &mut Core,
        adr: u16,
        create: bool,
        ctx: &Ctx,
        out: &mut Outbox,
    ) -> Result<Option<Handle>> {
        if let Some(h) = core.lookup(adr) {
            return Ok(Some(h));
        }
        if !create {
            return Ok(None);
        }
        if adr == 0 || adr > MAX_LOCO_ADR {
            return Err(CoreError::Address(u32::from(adr)));
        }
        let h = self.materialise(core, adr, ctx, out)?;
        if let Some(c) = core.consists.find(adr).cloned() {
            self.link_consist(core, &c, ctx, out)?;
        }
        Ok(Some(h))
    }

    fn ensure_live(&self, core: &mut Core, adr: u16, ctx: &Ctx, out: &mut Outbox) -> Result<Handle> {
        self.ensure(core, adr, true, ctx, out)?
            .ok_or(CoreError::UnknownLoco(adr))
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Look up a live entry, creating it when `create` is set.
    pub fn call(&self, adr: u16, create: bool) -> Result<Option<LocoState>> {
        self.run(|core, out, ctx| {
            let h = self.ensure(core, adr, create, ctx, out)?;
            Ok(h.and_then(|h| core.arena.get(h)).map(LiveLoco::state))
        })
    }

    /// State of a loco, creating its entry on first query.
    pub fn loco_state(&self, adr: u16) -> Result<LocoState> {
        self.call(adr, true)?.ok_or(CoreError::UnknownLoco(adr))
    }

    /// Addresses in the refresh list, in refresh order.
    pub fn live_addresses(&self) -> Result<Vec<u16>> {
        let core = self.lock()?;
        Ok(core
            .order
            .iter()
            .filter_map(|h| core.arena.get(*h))
            .map(|e| e.desc.adr)
            .collect())
    }

    /// True if any live entry is an m3 decoder.
    pub fn m3_in_refresh(&self) -> Result<bool> {
        let core = self.lock()?;
        Ok(core
            .order
            .iter()
            .filter_map(|h| core.arena.get(*h))
            .any(|e| e.desc.fmt.is_m3()))
    }

    /// Drop a loco from the refresh list. Returns `true` if it was live.
    pub fn remove(&self, adr: u16) -> Result<bool> {
        let mut core = self.lock()?;
        let Some(h) = core.lookup(adr) else {
            return Ok(false);
        };
        Ok(core.remove_handle(h).is_some())
    }

    // ------------------------------------------------------------------------
    // Speed
    // ------------------------------------------------------------------------

    /// Set speed and direction (bit 7 = forward).
    ///
    /// Drives every consist member, each with its own orientation. A
    /// direction flip while running puts an emergency stop in the old
    /// direction ahead of the new speed.
    pub fn set_speed(&self, adr: u16, speed: u8) -> Result<()> {
        self.run(|core, out, ctx| {
            let h = self.ensure_live(core, adr, ctx, out)?;
            let caller_rev = core.arena.get(h).is_some_and(|e| e.consist_reverse);
            let forward = is_forward(speed);

            for m in core.ring(h) {
                let Some(e) = core.arena.get_mut(m) else {
                    continue;
                };
                e.touch(ctx.purge, ctx.now);
                let fmt = e.desc.fmt;
                let step = speed_step(speed).min(fmt.speed_steps());
                let new = make_speed(forward ^ caller_rev ^ e.consist_reverse, step);
                if new == e.speed {
                    continue;
                }
                let old = e.speed;
                e.speed = new;

                let pkts = speed_packets(&ctx.formats, e, old);
                let replace = pkts.len() == 1;
                out.batch(pkts, replace);
                out.loco(EventKind::LocoSpeed, e);
            }
            Ok(())
        })
    }

    /// Emergency stop, keeping the direction, for the loco and its consist.
    pub fn emergency_stop(&self, adr: u16) -> Result<()> {
        self.run(|core, out, ctx| {
            let h = self.ensure_live(core, adr, ctx, out)?;
            for m in core.ring(h) {
                let Some(e) = core.arena.get_mut(m) else {
                    continue;
                };
                e.touch(ctx.purge, ctx.now);
                e.speed &= SPEED_FORWARD;
                let pkt = loco::emergency_stop(&ctx.formats, e.desc.fmt, e.desc.adr, e.speed, e.funcs);
                out.batch(pkt.into_iter().collect(), false);
                out.loco(EventKind::LocoSpeed, e);
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------------

    /// Change the functions selected by `mask` (F0..F31) to `new`.
    ///
    /// Only changed function groups are transmitted, in group order.
    pub fn set_func_masked(&self, adr: u16, new: u32, mask: u32) -> Result<()> {
        self.run(|core, out, ctx| {
            let h = self.ensure_live(core, adr, ctx, out)?;
            let Some(e) = core.arena.get_mut(h) else {
                return Err(CoreError::UnknownLoco(adr));
            };
            e.touch(ctx.purge, ctx.now);
            let old = e.funcs[0];
            let change = (old & mask) ^ (new & mask);
            if change == 0 {
                return Ok(());
            }
            e.funcs[0] = (old & !mask) | (new & mask);
            out.batch(func_packets(&ctx.formats, e, change), true);
            out.loco(EventKind::LocoFunction, e);
            Ok(())
        })
    }

    /// Switch one function (F0..F127).
    pub fn set_function(&self, adr: u16, f: u8, on: bool) -> Result<()> {
        if usize::from(f) >= MAX_FUNCS {
            return Err(CoreError::Value(u32::from(f)));
        }
        if f < 32 {
            let bit = 1u32 << f;
            return self.set_func_masked(adr, if on { bit } else { 0 }, bit);
        }
        self.run(|core, out, ctx| {
            let h = self.ensure_live(core, adr, ctx, out)?;
            let Some(e) = core.arena.get_mut(h) else {
                return Err(CoreError::UnknownLoco(adr));
            };
            e.touch(ctx.purge, ctx.now);
            let (word, bit) = (usize::from(f / 32), 1u32 << (f % 32));
            if (e.funcs[word] & bit != 0) == on {
                return Ok(());
            }
            e.funcs[word] ^= bit;
            if f <= e.desc.maxfunc {
                let pkt = loco::function(&ctx.formats, e.desc.fmt, e.desc.adr, e.speed, f, e.funcs);
                out.batch(pkt.into_iter().collect(), true);
            }
            out.loco(EventKind::LocoFunction, e);
            Ok(())
        })
    }

    /// DCC binary state.
    pub fn binstate(&self, adr: u16, state: u16, on: bool) -> Result<()> {
        self.run(|core, out, ctx| {
            let h = self.ensure_live(core, adr, ctx, out)?;
            let Some(e) = core.arena.get_mut(h) else {
                return Err(CoreError::UnknownLoco(adr));
            };
            e.touch(ctx.purge, ctx.now);
            if !e.desc.fmt.is_dcc() {
                return Err(CoreError::NotImplemented);
            }
            let pkt = loco::binstate(&ctx.formats, e.desc.fmt, adr, state, on)
                .ok_or(CoreError::Value(u32::from(state)))?;
            out.batch(vec![pkt], false);
            Ok(())
        })
    }

    // ------------------------------------------------------------------------
    // Descriptor changes
    // ------------------------------------------------------------------------

    /// Change a loco's decoder format.
    pub fn set_format(&self, adr: u16, fmt: DecoderFormat) -> Result<()> {
        if !fmt.is_loco() {
            return Err(CoreError::Value(fmt as u32));
        }
        if adr == 0 || adr > fmt.max_address() {
            return Err(CoreError::Address(u32::from(adr)));
        }
        self.run(|core, out, ctx| {
            self.db.set_loco_fmt(adr, fmt)?;
            if let Some(e) = core.lookup(adr).and_then(|h| core.arena.get_mut(h)) {
                e.touch(ctx.purge, ctx.now);
                e.desc.fmt = fmt;
                e.speed = make_speed(is_forward(e.speed), speed_step(e.speed).min(fmt.speed_steps()));
                e.age = 0;
                out.loco(EventKind::Protocol, e);
            }
            Ok(())
        })
    }

    /// Change a loco's highest function index.
    pub fn set_maxfunc(&self, adr: u16, maxfunc: u8) -> Result<()> {
        if usize::from(maxfunc) >= MAX_FUNCS {
            return Err(CoreError::Value(u32::from(maxfunc)));
        }
        self.run(|core, _out, ctx| {
            self.db.set_loco_maxfunc(adr, maxfunc)?;
            if let Some(e) = core.lookup(adr).and_then(|h| core.arena.get_mut(h)) {
                e.touch(ctx.purge, ctx.now);
                e.desc.maxfunc = maxfunc;
                e.age = 0;
            }
            Ok(())
        })
    }

    /// Set the purge timeout in minutes (0 disables purging).
    ///
    /// Every live entry gets a fresh deadline.
    pub fn set_purge(&self, minutes: u32) -> Result<()> {
        self.config.write().system.loco_purge_min = minutes;
        self.store.trigger_store(StoreCause::System);
        self.run(|core, _out, ctx| {
            for h in core.order.clone() {
                if let Some(e) = core.arena.get_mut(h) {
                    e.touch(ctx.purge, ctx.now);
                }
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------------
    // Consists
    // ------------------------------------------------------------------------

    /// Couple `b` to `a` (negative = reversed) and relink live rings.
    pub fn consist_couple(&self, a: i16, b: i16) -> Result<()> {
        self.run(|core, out, ctx| {
            let c = core.consists.couple(a, b)?;
            let adrs: Vec<u16> = c.addresses().collect();
            self.relink(core, &adrs, ctx, out)
        })
    }

    /// Dissolve the consist containing `adr`.
    pub fn consist_remove(&self, adr: u16) -> Result<bool> {
        self.run(|core, _out, _ctx| match core.consists.remove(adr) {
            Some(c) => {
                let adrs: Vec<u16> = c.addresses().collect();
                core.unlink(&adrs);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    /// Take one loco out of its consist.
    pub fn consist_remove_loco(&self, adr: u16) -> Result<bool> {
        self.run(|core, out, ctx| {
            let Some(adrs) = core
                .consists
                .find(adr)
                .map(|c| c.addresses().collect::<Vec<u16>>())
            else {
                return Ok(false);
            };
            core.consists.remove_loco(adr);
            self.relink(core, &adrs, ctx, out)?;
            Ok(true)
        })
    }

    /// All consist records.
    pub fn consist_list(&self) -> Result<Vec<Consist>> {
        Ok(self.lock()?.consists.list().to_vec())
    }

    // ------------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------------

    fn next_refresh(&self, core: &mut Core, ctx: &Ctx) -> Option<Packet> {
        if ctx.formats.sigflags.contains(SignalFlags::DCCNOP) && ctx.now >= core.next_nop_at {
            core.next_nop_at = ctx.now + NOP_INTERVAL_MS;
            let ext = core.nop_ext;
            core.nop_ext = !ext;
            return Some(if ext {
                accessory::ext_acc_nop()
            } else {
                accessory::acc_nop()
            });
        }

        if core.order.is_empty() {
            let step = core.dummy.age;
            core.dummy.age = step.wrapping_add(1);
            return cycle::refresh_packet(&ctx.formats, &core.dummy, step);
        }

        if core.ptr >= core.order.len() {
            core.ptr = 0;
        }
        let h = core.order[core.ptr];
        let expired = core.arena.get(h).is_some_and(|e| e.expired(ctx.now));
        if ctx.purge.is_some() && expired {
            if let Some(e) = core.remove_handle(h) {
                debug!(target: "refresh", adr = e.desc.adr, "purged inactive loco");
            }
            return None;
        }
        core.ptr += 1;

        let e = core.arena.get_mut(h)?;
        let step = e.age;
        e.age = step.wrapping_add(1);
        cycle::refresh_packet(&ctx.formats, e, step)
    }
}

impl RefreshSource for RefreshEngine {
    /// Next refresh packet.
    ///
    /// Returns `None` on lock timeout or when this visit purged an entry.
    fn refresh_packet(&self) -> Option<Packet> {
        let ctx = self.ctx();
        let mut core = self.core.try_lock_for(self.lock_wait)?;
        self.next_refresh(&mut core, &ctx)
    }
}

// ============================================================================
// Packet builders
// ============================================================================

/// Packets for a speed change from `old` to the entry's current speed.
fn speed_packets(cfg: &FormatConfig, e: &LiveLoco, old: u8) -> Vec<Packet> {
    let (fmt, adr, new) = (e.desc.fmt, e.desc.adr, e.speed);
    let mut pkts = Vec::with_capacity(3);

    if speed_step(old) != 0 && is_forward(old) != is_forward(new) {
        pkts.extend(loco::emergency_stop(cfg, fmt, adr, old, e.funcs));
        if fmt.is_mm() {
            pkts.extend(loco::mm_reverse(cfg, fmt, adr, new));
        }
    }

    let step = speed_step(new);
    if fmt == DecoderFormat::Mm2x27a && step != 0 && step % 2 == 0 {
        let upper = make_speed(is_forward(new), step + 1);
        pkts.extend(loco::speed(cfg, fmt, adr, upper, e.funcs));
    }
    pkts.extend(loco::speed(cfg, fmt, adr, new, e.funcs));
    pkts
}

/// Packets covering every bit of `change` (F0..F31), one group per packet.
fn func_packets(cfg: &FormatConfig, e: &LiveLoco, mut change: u32) -> Vec<Packet> {
    let (fmt, adr, speed, funcs) = (e.desc.fmt, e.desc.adr, e.speed, e.funcs);
    let maxfunc = e.desc.maxfunc;
    let mut pkts = Vec::new();

    while change != 0 {
        let f = change.trailing_zeros() as u8;
        let (pkt, covered) = match fmt {
            DecoderFormat::Mm1x14 => match f {
                0 => (loco::speed(cfg, fmt, adr, speed, funcs), 1),
                1..=4 => (loco::function(cfg, fmt, adr, speed, f, funcs), loco::word_mask(1, 4)),
                _ => (None, loco::word_mask(f, 31)),
            },
            DecoderFormat::Mm2x14 | DecoderFormat::Mm2x27a | DecoderFormat::Mm2x27b => match f {
                0..=4 => (loco::function(cfg, fmt, adr, speed, f, funcs), 1 << f),
                _ => (None, loco::word_mask(f, 31)),
            },
            DecoderFormat::DccSdf => (loco::speed(cfg, fmt, adr, speed, funcs), u32::MAX),
            DecoderFormat::Dcc14 if f == 0 => (loco::speed(cfg, fmt, adr, speed, funcs), 1),
            DecoderFormat::Dcc14 | DecoderFormat::Dcc28 | DecoderFormat::Dcc126 => {
                match loco::dcc_group(f) {
                    Some((cmd, first, last)) if first <= maxfunc => (
                        loco::dcc_func_group(cfg, fmt, adr, cmd, funcs),
                        loco::word_mask(first, last),
                    ),
                    Some((_, first, last)) => (None, loco::word_mask(first, last)),
                    None => (None, loco::word_mask(f, 31)),
                }
            }
            DecoderFormat::M3x126 if f <= loco::M3_GROUP_LAST => (
                loco::m3_func_group(cfg, adr, funcs),
                loco::word_mask(0, loco::M3_GROUP_LAST),
            ),
            DecoderFormat::M3x126 if f <= maxfunc => (loco::m3_single(cfg, adr, f, funcs), 1 << f),
            _ => (None, 1 << f),
        };
        pkts.extend(pkt);
        change &= !covered;
    }
    pkts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SystemConfig};
    use crate::hal::{MockClock, MockConfigStore, MockLocoDb};
    use crate::packet::{Command, Payload};

    struct Fixture {
        queue: Arc<SignalQueue>,
        db: Arc<MockLocoDb>,
        clock: MockClock,
        config: SharedConfig,
        engine: RefreshEngine,
    }

    fn fixture(config: Config) -> Fixture {
        let queue = Arc::new(SignalQueue::new());
        let db = Arc::new(MockLocoDb::new(DecoderFormat::Dcc28));
        let clock = MockClock::new();
        let config = config.shared();
        let engine = RefreshEngine::new(
            Arc::clone(&queue),
            Arc::clone(&db) as Arc<dyn LocoDatabase>,
            Arc::new(EventBus::new()),
            Arc::clone(&config),
            Arc::new(MockConfigStore::new()),
            Arc::new(clock.clone()),
        );
        Fixture {
            queue,
            db,
            clock,
            config,
            engine,
        }
    }

    fn cmds(q: &SignalQueue) -> Vec<Command> {
        q.drain().iter().map(|p| p.cmd).collect()
    }

    #[test]
    fn call_creates_once() {
        let f = fixture(Config::default());
        assert_eq!(f.engine.call(5, false).unwrap(), None);
        let s = f.engine.call(5, true).unwrap().unwrap();
        assert_eq!(s.speed, 0x80);
        f.engine.call(5, true).unwrap();
        assert_eq!(f.engine.live_addresses().unwrap(), vec![5]);
    }

    #[test]
    fn call_rejects_out_of_range() {
        let f = fixture(Config::default());
        assert_eq!(f.engine.call(0, true), Err(CoreError::Address(0)));
        assert_eq!(f.engine.call(10240, true), Err(CoreError::Address(10240)));
    }

    #[test]
    fn mm_address_above_format_limit() {
        let f = fixture(Config::default());
        f.db.insert(LocoDescriptor::new(300, DecoderFormat::Mm2x14));
        assert_eq!(f.engine.call(300, true), Err(CoreError::Address(300)));
    }

    #[test]
    fn speed_clipped_to_format() {
        let f = fixture(Config::default());
        f.db.insert(LocoDescriptor::new(5, DecoderFormat::Mm2x14));
        f.engine.set_speed(5, 0xFF).unwrap();
        assert_eq!(f.engine.loco_state(5).unwrap().speed, 0x80 | 14);
    }

    #[test]
    fn same_speed_twice_is_one_packet() {
        let f = fixture(Config::default());
        f.engine.set_speed(3, 0x85).unwrap();
        f.engine.set_speed(3, 0x85).unwrap();
        assert_eq!(f.queue.len(), 1);
    }

    #[test]
    fn reversal_from_standstill_has_no_estop() {
        let f = fixture(Config::default());
        f.engine.set_speed(3, 0x05).unwrap();
        assert_eq!(cmds(&f.queue), vec![Command::SetSpeed]);
    }

    #[test]
    fn mm_reversal_adds_reverse_packet() {
        let f = fixture(Config::default());
        f.db.insert(LocoDescriptor::new(24, DecoderFormat::Mm2x14));
        f.engine.set_speed(24, 0x85).unwrap();
        f.engine.set_speed(24, 0x05).unwrap();
        let pkts = f.queue.drain();
        let got: Vec<Command> = pkts.iter().map(|p| p.cmd).collect();
        assert_eq!(
            got,
            vec![
                Command::SetSpeed,
                Command::EmergencyStop,
                Command::MmReverse,
                Command::SetSpeed
            ]
        );
        assert_eq!(pkts[2].repeat, loco::MM_REVERSE_REPEAT);
        assert_eq!(pkts[1].value, Payload::Word(0x80));
    }

    #[test]
    fn emergency_stop_keeps_direction() {
        let f = fixture(Config::default());
        f.engine.set_speed(3, 0x0A).unwrap();
        f.queue.flush();
        f.engine.emergency_stop(3).unwrap();
        assert_eq!(f.engine.loco_state(3).unwrap().speed, 0x00);
        let pkts = f.queue.drain();
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0].cmd, Command::EmergencyStop);
        assert!(pkts[0].repeat >= 5);
    }

    #[test]
    fn masked_noop_without_change() {
        let f = fixture(Config::default());
        f.engine.set_func_masked(3, 0xFF, 0).unwrap();
        f.engine.set_func_masked(3, 0, 0xFF).unwrap();
        assert!(f.queue.is_empty());
    }

    #[test]
    fn masked_keeps_unmasked_bits() {
        let f = fixture(Config::default());
        f.engine.set_func_masked(3, 0b1111, 0b1111).unwrap();
        f.engine.set_func_masked(3, 0, 0b0011).unwrap();
        assert_eq!(f.engine.loco_state(3).unwrap().funcs[0], 0b1100);
    }

    #[test]
    fn mm2_functions_individual() {
        let f = fixture(Config::default());
        f.db.insert(LocoDescriptor::new(8, DecoderFormat::Mm2x14));
        f.engine.set_func_masked(8, 0b10111, 0b11111).unwrap();
        assert_eq!(
            cmds(&f.queue),
            vec![Command::SetSpeed, Command::MmF1, Command::MmF2, Command::MmF4]
        );
    }

    #[test]
    fn mm1_function_group() {
        let f = fixture(Config::default());
        f.db.insert(LocoDescriptor::new(8, DecoderFormat::Mm1x14));
        f.engine.set_func_masked(8, 0b11110, 0b11110).unwrap();
        assert_eq!(cmds(&f.queue), vec![Command::MmFuncGroup]);
    }

    #[test]
    fn m3_group_and_singles() {
        let f = fixture(Config::default());
        f.db
            .insert(LocoDescriptor::new(9, DecoderFormat::M3x126).with_maxfunc(31));
        let bits = 1 | 1 << 3 | 1 << 16 | 1 << 20;
        f.engine.set_func_masked(9, bits, bits).unwrap();
        let pkts = f.queue.drain();
        let got: Vec<(Command, u32)> = pkts.iter().map(|p| (p.cmd, p.param)).collect();
        assert_eq!(
            got,
            vec![
                (Command::M3Func, 0),
                (Command::M3SingleFunc, 16),
                (Command::M3SingleFunc, 20)
            ]
        );
    }

    #[test]
    fn dcc14_f0_through_speed() {
        let f = fixture(Config::default());
        f.db.insert(LocoDescriptor::new(4, DecoderFormat::Dcc14));
        f.engine.set_func_masked(4, 0b11, 0b11).unwrap();
        assert_eq!(
            cmds(&f.queue),
            vec![Command::SetSpeed, Command::Idle, Command::DccFuncF0F4]
        );
    }

    #[test]
    fn high_function_uses_group() {
        let f = fixture(Config::default());
        f.db
            .insert(LocoDescriptor::new(3, DecoderFormat::Dcc126).with_maxfunc(68));
        f.engine.set_function(3, 40, true).unwrap();
        f.engine.set_function(3, 40, true).unwrap();
        assert_eq!(cmds(&f.queue), vec![Command::DccFuncF37F44]);
        assert_eq!(f.engine.loco_state(3).unwrap().funcs[1], 1 << 8);
        assert_eq!(f.engine.set_function(3, 128, true), Err(CoreError::Value(128)));
    }

    #[test]
    fn binstate_only_dcc() {
        let f = fixture(Config::default());
        f.engine.binstate(3, 200, true).unwrap();
        assert_eq!(cmds(&f.queue), vec![Command::DccBinStateLong]);

        f.db.insert(LocoDescriptor::new(8, DecoderFormat::Mm2x14));
        assert_eq!(f.engine.binstate(8, 1, true), Err(CoreError::NotImplemented));
        assert_eq!(f.engine.binstate(3, 40000, true), Err(CoreError::Value(40000)));
    }

    #[test]
    fn refresh_round_robin() {
        let f = fixture(Config::default());
        f.db.insert(LocoDescriptor::new(1, DecoderFormat::Dcc28).with_maxfunc(0));
        f.db.insert(LocoDescriptor::new(2, DecoderFormat::Dcc28).with_maxfunc(0));
        f.engine.call(1, true).unwrap();
        f.engine.call(2, true).unwrap();
        let adrs: Vec<u16> = (0..4)
            .map(|_| f.engine.refresh_packet().unwrap().adr)
            .collect();
        assert_eq!(adrs, vec![1, 2, 1, 2]);
    }

    #[test]
    fn refresh_dummy_when_empty() {
        let f = fixture(Config::default());
        let p = f.engine.refresh_packet().unwrap();
        assert_eq!(p.adr, DUMMY_ADR);
        assert_eq!(p.fmt, DecoderFormat::Dcc28);
        assert_eq!(p.speed(), Some(0x80));
        assert!(f.engine.live_addresses().unwrap().is_empty());
    }

    #[test]
    fn refresh_nops_alternate() {
        let mut cfg = Config::default();
        cfg.formats.sigflags.set(SignalFlags::DCCNOP, true);
        let f = fixture(cfg);
        assert_eq!(f.engine.refresh_packet().unwrap().cmd, Command::DccAccNop);
        assert_eq!(f.engine.refresh_packet().unwrap().adr, DUMMY_ADR);
        f.clock.advance(NOP_INTERVAL_MS);
        assert_eq!(f.engine.refresh_packet().unwrap().cmd, Command::DccExtAccNop);
    }

    #[test]
    fn purge_evicts_lazily_and_restarts() {
        let f = fixture(Config::default().with_system(SystemConfig::default().with_loco_purge_min(1)));
        f.engine.call(1, true).unwrap();
        f.engine.call(2, true).unwrap();
        f.clock.advance(30_000);
        f.engine.set_speed(2, 0x81).unwrap();
        f.clock.advance(40_000);

        // 1 expired, 2 touched 40 s ago
        assert!(f.engine.refresh_packet().is_none());
        assert_eq!(f.engine.live_addresses().unwrap(), vec![2]);
        assert_eq!(f.engine.refresh_packet().unwrap().adr, 2);
    }

    #[test]
    fn descriptor_changes_refresh_purge_deadline() {
        let f = fixture(Config::default().with_system(SystemConfig::default().with_loco_purge_min(1)));
        f.engine.call(1, true).unwrap();
        f.engine.call(2, true).unwrap();
        f.clock.advance(50_000);
        f.engine.set_format(1, DecoderFormat::Dcc126).unwrap();
        f.engine.set_maxfunc(2, 12).unwrap();
        f.clock.advance(20_000);

        assert_eq!(f.engine.refresh_packet().unwrap().adr, 1);
        assert_eq!(f.engine.refresh_packet().unwrap().adr, 2);
        assert_eq!(f.engine.live_addresses().unwrap(), vec![1, 2]);
    }

    #[test]
    fn purge_disabled_keeps_entries() {
        let f = fixture(Config::default());
        f.engine.call(1, true).unwrap();
        f.clock.advance(10 * 60_000);
        assert_eq!(f.engine.refresh_packet().unwrap().adr, 1);
    }

    #[test]
    fn set_purge_updates_config_and_deadlines() {
        let f = fixture(Config::default());
        f.engine.call(1, true).unwrap();
        f.engine.set_purge(2).unwrap();
        assert_eq!(f.config.read().system.loco_purge_min, 2);
        f.clock.advance(2 * 60_000);
        assert!(f.engine.refresh_packet().is_none());
        assert!(f.engine.live_addresses().unwrap().is_empty());
    }

    #[test]
    fn remove_and_recreate_is_fresh() {
        let f = fixture(Config::default());
        f.engine.set_speed(3, 0x90).unwrap();
        f.engine.set_func_masked(3, 1, 1).unwrap();
        assert!(f.engine.remove(3).unwrap());
        assert!(!f.engine.remove(3).unwrap());
        let s = f.engine.loco_state(3).unwrap();
        assert_eq!(s.speed, 0x80);
        assert_eq!(s.funcs, [0; 4]);
    }

    #[test]
    fn m3_in_refresh_tracks_formats() {
        let f = fixture(Config::default());
        f.engine.call(3, true).unwrap();
        assert!(!f.engine.m3_in_refresh().unwrap());
        f.db.insert(LocoDescriptor::new(9, DecoderFormat::M3x126));
        f.engine.call(9, true).unwrap();
        assert!(f.engine.m3_in_refresh().unwrap());
        f.engine.remove(9).unwrap();
        assert!(!f.engine.m3_in_refresh().unwrap());
    }

    #[test]
    fn set_format_clips_speed() {
        let f = fixture(Config::default());
        f.engine.set_speed(3, 0x80 | 100).unwrap();
        f.db.insert(LocoDescriptor::new(3, DecoderFormat::Dcc126));
        f.engine.set_format(3, DecoderFormat::Dcc14).unwrap();
        let s = f.engine.loco_state(3).unwrap();
        assert_eq!(s.fmt, DecoderFormat::Dcc14);
        assert_eq!(s.speed, 0x80 | 14);
        assert_eq!(f.db.get_loco(3, false).unwrap().fmt, DecoderFormat::Dcc14);
        assert!(f.engine.set_format(3, DecoderFormat::AccDcc).is_err());
    }

    #[test]
    fn consist_ring_materialises_members() {
        let f = fixture(Config::default());
        f.engine.consist_couple(10, -11).unwrap();
        f.engine.consist_couple(10, 12).unwrap();
        assert!(f.engine.live_addresses().unwrap().is_empty());

        f.engine.call(11, true).unwrap();
        let mut live = f.engine.live_addresses().unwrap();
        live.sort_unstable();
        assert_eq!(live, vec![10, 11, 12]);
        assert!(f.engine.loco_state(11).unwrap().consist_reverse);
        assert!(f.engine.loco_state(12).unwrap().in_consist);
    }

    #[test]
    fn consist_speed_from_reversed_member() {
        let f = fixture(Config::default());
        f.engine.consist_couple(10, -11).unwrap();
        // Forward for 11 means reverse for the head
        f.engine.set_speed(11, 0x90).unwrap();
        assert_eq!(f.engine.loco_state(11).unwrap().speed, 0x90);
        assert_eq!(f.engine.loco_state(10).unwrap().speed, 0x10);
    }

    #[test]
    fn consist_remove_loco_shrinks_ring() {
        let f = fixture(Config::default());
        f.engine.consist_couple(1, 2).unwrap();
        f.engine.consist_couple(1, 3).unwrap();
        f.engine.call(1, true).unwrap();
        assert!(f.engine.consist_remove_loco(2).unwrap());
        f.queue.flush();

        f.engine.set_speed(1, 0x85).unwrap();
        let mut adrs: Vec<u16> = f.queue.drain().iter().map(|p| p.adr).collect();
        adrs.sort_unstable();
        assert_eq!(adrs, vec![1, 3]);
        assert!(!f.engine.loco_state(2).unwrap().in_consist);
    }

    #[test]
    fn consist_dissolve_unlinks() {
        let f = fixture(Config::default());
        f.engine.consist_couple(1, -2).unwrap();
        f.engine.call(1, true).unwrap();
        assert!(f.engine.consist_remove(2).unwrap());
        assert!(f.engine.consist_list().unwrap().is_empty());
        let s = f.engine.loco_state(2).unwrap();
        assert!(!s.in_consist);
        assert!(!s.consist_reverse);
    }

    #[test]
    fn removing_member_closes_ring() {
        let f = fixture(Config::default());
        f.engine.consist_couple(1, 2).unwrap();
        f.engine.consist_couple(1, 3).unwrap();
        f.engine.call(1, true).unwrap();
        f.engine.remove(2).unwrap();
        f.queue.flush();
        f.engine.set_speed(3, 0x84).unwrap();
        let mut adrs: Vec<u16> = f.queue.drain().iter().map(|p| p.adr).collect();
        adrs.sort_unstable();
        assert_eq!(adrs, vec![1, 3]);
    }

    #[test]
    fn lock_timeout_aborts_command() {
        let f = fixture(Config::default());
        let engine = f.engine.with_lock_wait(Duration::from_millis(1));
        let _guard = engine.core.lock();
        assert_eq!(engine.set_speed(3, 0x81), Err(CoreError::LockTimeout));
        assert!(engine.refresh_packet().is_none());
    }
}
