//! Mock implementations for testing without a track.
//!
//! This module provides test doubles for every collaborator trait, so the
//! core can be developed and tested on the desktop.
//!
//! # Available Mocks
//!
//! | Mock | Trait | Purpose |
//! |------|-------|---------|
//! | [`MockClock`] | [`Clock`] | Controllable, cloneable time source |
//! | [`MockDelay`] | [`Delay`] | Instant delay that advances a [`MockClock`] |
//! | [`MockSignalGenerator`] | [`SignalGenerator`] | Mode history, sent packets, scripted replies |
//! | [`MockAccessoryBus`] | [`AccessoryBus`] | Records bus switch calls |
//! | [`MockLocoDb`] | [`LocoDatabase`] | In-memory loco and accessory tables |
//! | [`MockConfigStore`] | [`ConfigStore`] | Records store triggers |
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rs_cmdstation::hal::MockSignalGenerator;
//! use rs_cmdstation::traits::SignalGenerator;
//! use rs_cmdstation::{factory::broadcast, SignalQueue};
//!
//! let queue = Arc::new(SignalQueue::new());
//! let generator = MockSignalGenerator::new().with_queue(Arc::clone(&queue));
//!
//! queue.enqueue(broadcast::idle(1), false);
//! assert!(generator.is_idle());
//! assert_eq!(generator.sent().len(), 1);
//! assert!(queue.is_empty());
//! ```
//!
//! [`Clock`]: crate::traits::Clock
//! [`Delay`]: crate::traits::Delay
//! [`SignalGenerator`]: crate::traits::SignalGenerator
//! [`AccessoryBus`]: crate::traits::AccessoryBus
//! [`LocoDatabase`]: crate::traits::LocoDatabase
//! [`ConfigStore`]: crate::traits::ConfigStore

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{short_string, StoreCause};
use crate::error::{CoreError, Result};
use crate::format::{DecoderFormat, MAX_DCC_ACCESSORY, MAX_LOCO_ADR};
use crate::packet::{DecoderReply, DecoderType, Packet};
use crate::queue::SignalQueue;
use crate::traits::{
    AccessoryBus, Clock, ConfigStore, Delay, LocoDatabase, LocoDescriptor, Mode, SignalGenerator,
    TurnoutDescriptor,
};

// ============================================================================
// Time
// ============================================================================

/// Mock clock for testing.
///
/// Clones share the same counter, so a test can keep one handle and give
/// another to the component under test.
///
/// # Example
///
/// ```rust
/// use rs_cmdstation::hal::MockClock;
/// use rs_cmdstation::traits::Clock;
///
/// let clock = MockClock::new();
/// let shared = clock.clone();
///
/// clock.set(1000);
/// shared.advance(500);
/// assert_eq!(clock.now_ms(), 1500);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    current_ms: Arc<AtomicU64>,
}

impl MockClock {
    /// Creates a new mock clock starting at 0ms.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the current time in milliseconds.
    pub fn set(&self, ms: u64) {
        self.current_ms.store(ms, Ordering::SeqCst);
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, ms: u64) {
        self.current_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.current_ms.load(Ordering::SeqCst)
    }
}

/// Delay that completes immediately after advancing a [`MockClock`].
///
/// Every requested wait is recorded.
#[derive(Debug, Clone)]
pub struct MockDelay {
    clock: MockClock,
    waits: Arc<Mutex<Vec<u32>>>,
}

impl MockDelay {
    /// Delay driving `clock`.
    pub fn new(clock: MockClock) -> Self {
        Self {
            clock,
            waits: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Waits requested so far, in order.
    pub fn waits(&self) -> Vec<u32> {
        self.waits.lock().clone()
    }

    /// Sum of all waits.
    pub fn total_ms(&self) -> u64 {
        self.waits.lock().iter().map(|&w| u64::from(w)).sum()
    }
}

impl Delay for MockDelay {
    fn delay_ms(&self, ms: u32) -> impl core::future::Future<Output = ()> + Send {
        self.clock.advance(u64::from(ms));
        self.waits.lock().push(ms);
        core::future::ready(())
    }
}

// ============================================================================
// Signal generation
// ============================================================================

type Responder = Box<dyn Fn(&Packet) -> Option<DecoderReply> + Send + Sync>;

#[derive(Debug)]
struct GeneratorState {
    mode: Mode,
    history: Vec<Mode>,
    beacon: u32,
    announce: u16,
    search: Option<u32>,
    voltage_stable: bool,
    stuck: bool,
}

/// Mock signal generator.
///
/// With a queue attached, every [`is_idle`](SignalGenerator::is_idle) call
/// drains the queue into [`sent`](Self::sent), answering packets that carry
/// a reply handler. Answers come from the responder closure; without one,
/// or when it returns `None`, the packet gets a no-answer notification.
pub struct MockSignalGenerator {
    state: Mutex<GeneratorState>,
    queue: Option<Arc<SignalQueue>>,
    sent: Mutex<Vec<Packet>>,
    responder: Mutex<Option<Responder>>,
}

impl Default for MockSignalGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for MockSignalGenerator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MockSignalGenerator")
            .field("state", &*self.state.lock())
            .field("sent", &self.sent.lock().len())
            .finish_non_exhaustive()
    }
}

impl MockSignalGenerator {
    /// A generator in [`Mode::Stop`] with stable voltage and no decoder on
    /// the programming track.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                mode: Mode::Stop,
                history: Vec::new(),
                beacon: 0x5A5A_1234,
                announce: 1,
                search: None,
                voltage_stable: true,
                stuck: false,
            }),
            queue: None,
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
        }
    }

    /// Attach the queue this generator consumes.
    pub fn with_queue(mut self, queue: Arc<SignalQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// UID returned by the next searches.
    pub fn set_search_result(&self, uid: Option<u32>) {
        self.state.lock().search = uid;
    }

    /// Simulate track voltage (not) settling.
    pub fn set_voltage_stable(&self, stable: bool) {
        self.state.lock().voltage_stable = stable;
    }

    /// Simulate a generator that never drains.
    pub fn set_stuck(&self, stuck: bool) {
        self.state.lock().stuck = stuck;
    }

    /// Script decoder answers.
    pub fn set_responder<F>(&self, f: F)
    where
        F: Fn(&Packet) -> Option<DecoderReply> + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Box::new(f));
    }

    /// Every mode set so far.
    pub fn mode_history(&self) -> Vec<Mode> {
        self.state.lock().history.clone()
    }

    /// Packets consumed from the attached queue.
    pub fn sent(&self) -> Vec<Packet> {
        self.sent.lock().clone()
    }

    fn transmit(&self, queue: &SignalQueue) {
        let pkts = queue.drain();
        let responder = self.responder.lock();
        for p in &pkts {
            if p.reply.is_none() {
                continue;
            }
            let reply = responder.as_ref().and_then(|r| r(p)).unwrap_or_else(|| {
                let dtype = if p.fmt.is_m3() {
                    DecoderType::M3
                } else {
                    DecoderType::Loco
                };
                DecoderReply::no_answer(p.adr, dtype, p.cva.cv)
            });
            p.deliver_reply(&reply);
        }
        self.sent.lock().extend(pkts);
    }
}

impl SignalGenerator for MockSignalGenerator {
    fn set_mode(&self, mode: Mode) {
        let mut s = self.state.lock();
        s.mode = mode;
        s.history.push(mode);
    }

    fn mode(&self) -> Mode {
        self.state.lock().mode
    }

    fn m3_beacon(&self) -> u32 {
        self.state.lock().beacon
    }

    fn m3_announce(&self) -> u16 {
        self.state.lock().announce
    }

    fn search_m3_loco(&self) -> Option<u32> {
        self.state.lock().search
    }

    fn is_idle(&self) -> bool {
        if self.state.lock().stuck {
            return false;
        }
        if let Some(queue) = &self.queue {
            self.transmit(queue);
        }
        true
    }

    fn is_voltage_stable(&self) -> bool {
        self.state.lock().voltage_stable
    }
}

/// Mock field-bus accessory dispatcher.
#[derive(Debug, Default)]
pub struct MockAccessoryBus {
    calls: Mutex<Vec<(u16, u8, bool)>>,
}

impl MockAccessoryBus {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded `(adr, dir, on)` calls.
    pub fn calls(&self) -> Vec<(u16, u8, bool)> {
        self.calls.lock().clone()
    }
}

impl AccessoryBus for MockAccessoryBus {
    fn switch(&self, adr: u16, dir: u8, on: bool) -> Result<()> {
        self.calls.lock().push((adr, dir, on));
        Ok(())
    }
}

// ============================================================================
// Persistence
// ============================================================================

#[derive(Debug, Default)]
struct Tables {
    locos: BTreeMap<u16, LocoDescriptor>,
    turnouts: BTreeMap<u16, TurnoutDescriptor>,
}

/// In-memory loco and accessory database.
///
/// Locos created on demand get `default_fmt`; accessories created on demand
/// are DCC accessories.
///
/// # Example
///
/// ```rust
/// use rs_cmdstation::hal::MockLocoDb;
/// use rs_cmdstation::traits::{LocoDatabase, LocoDescriptor};
/// use rs_cmdstation::DecoderFormat;
///
/// let db = MockLocoDb::new(DecoderFormat::Dcc28);
/// db.insert(LocoDescriptor::new(78, DecoderFormat::Mm2x14));
///
/// assert_eq!(db.get_loco(3, true).unwrap().fmt, DecoderFormat::Dcc28);
/// assert_eq!(db.loco_addresses(), vec![3, 78]);
/// assert!(db.get_loco(4, false).is_none());
/// ```
#[derive(Debug)]
pub struct MockLocoDb {
    default_fmt: DecoderFormat,
    tables: Mutex<Tables>,
}

impl MockLocoDb {
    /// An empty database.
    pub fn new(default_fmt: DecoderFormat) -> Self {
        Self {
            default_fmt,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Insert or replace a loco.
    pub fn insert(&self, desc: LocoDescriptor) {
        self.tables.lock().locos.insert(desc.adr, desc);
    }

    /// Insert or replace an accessory.
    pub fn insert_turnout(&self, desc: TurnoutDescriptor) {
        self.tables.lock().turnouts.insert(desc.adr, desc);
    }
}

impl LocoDatabase for MockLocoDb {
    fn get_loco(&self, adr: u16, create: bool) -> Option<LocoDescriptor> {
        let mut t = self.tables.lock();
        if let Some(d) = t.locos.get(&adr) {
            return Some(d.clone());
        }
        if !create || adr == 0 || adr > MAX_LOCO_ADR {
            return None;
        }
        let d = LocoDescriptor::new(adr, self.default_fmt);
        t.locos.insert(adr, d.clone());
        Some(d)
    }

    fn lookup_loco_sorted(&self, index: usize) -> Option<LocoDescriptor> {
        self.tables.lock().locos.values().nth(index).cloned()
    }

    fn index_sorted_next(&self, adr: u16) -> Option<u16> {
        let t = self.tables.lock();
        t.locos
            .range((Bound::Excluded(adr), Bound::Unbounded))
            .next()
            .map(|(&a, _)| a)
    }

    fn index_sorted_prev(&self, adr: u16) -> Option<u16> {
        self.tables.lock().locos.range(..adr).next_back().map(|(&a, _)| a)
    }

    fn iterate_loco(&self, visit: &mut dyn FnMut(&LocoDescriptor) -> bool) {
        let snapshot: Vec<LocoDescriptor> = self.tables.lock().locos.values().cloned().collect();
        for d in &snapshot {
            if !visit(d) {
                break;
            }
        }
    }

    fn set_loco_fmt(&self, adr: u16, fmt: DecoderFormat) -> Result<()> {
        let mut t = self.tables.lock();
        let d = t.locos.get_mut(&adr).ok_or(CoreError::UnknownLoco(adr))?;
        d.fmt = fmt;
        Ok(())
    }

    fn set_loco_maxfunc(&self, adr: u16, maxfunc: u8) -> Result<()> {
        let mut t = self.tables.lock();
        let d = t.locos.get_mut(&adr).ok_or(CoreError::UnknownLoco(adr))?;
        d.maxfunc = maxfunc;
        Ok(())
    }

    fn set_loco_name(&self, adr: u16, name: &str) -> Result<()> {
        let mut t = self.tables.lock();
        let d = t.locos.get_mut(&adr).ok_or(CoreError::UnknownLoco(adr))?;
        d.name = short_string(name);
        Ok(())
    }

    fn remove_loco(&self, adr: u16) -> bool {
        self.tables.lock().locos.remove(&adr).is_some()
    }

    fn get_turnout(&self, adr: u16, create: bool) -> Option<TurnoutDescriptor> {
        let mut t = self.tables.lock();
        if let Some(d) = t.turnouts.get(&adr) {
            return Some(d.clone());
        }
        if !create || adr == 0 || adr > MAX_DCC_ACCESSORY {
            return None;
        }
        let d = TurnoutDescriptor::new(adr, DecoderFormat::AccDcc);
        t.turnouts.insert(adr, d.clone());
        Some(d)
    }

    fn set_turnout_fmt(&self, adr: u16, fmt: DecoderFormat) -> Result<()> {
        let mut t = self.tables.lock();
        let d = t.turnouts.get_mut(&adr).ok_or(CoreError::UnknownTurnout(adr))?;
        d.fmt = fmt;
        Ok(())
    }

    fn set_turnout_state(&self, adr: u16, on: bool, dir: u8) {
        if let Some(d) = self.tables.lock().turnouts.get_mut(&adr) {
            d.on = on;
            d.dir = dir;
        }
    }
}

/// Records every store trigger.
#[derive(Debug, Default)]
pub struct MockConfigStore {
    causes: Mutex<Vec<StoreCause>>,
}

impl MockConfigStore {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers received so far, in order.
    pub fn causes(&self) -> Vec<StoreCause> {
        self.causes.lock().clone()
    }
}

impl ConfigStore for MockConfigStore {
    fn trigger_store(&self, cause: StoreCause) {
        self.causes.lock().push(cause);
    }
}

// ============================================================================
// Tests
// ============================================================================
