//! Fire-and-forget event dispatch.
//!
//! Components announce state changes (new loco, speed, functions, turnout
//! movements, configuration) on an [`EventBus`]. Host front-ends subscribe
//! per [`EventKind`] with a handler that returns whether it wants to stay
//! subscribed.
//!
//! Handlers run on the thread that fired the event, after every core lock
//! has been released. The subscription list is snapshotted before dispatch,
//! so a handler may subscribe or fire further events itself.
//!
//! # Example
//!
//! ```
//! use rs_cmdstation::events::{Event, EventBus, EventData, EventKind, Originator};
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//!
//! let bus = EventBus::new();
//! let seen = Arc::new(AtomicU32::new(0));
//! let s = Arc::clone(&seen);
//! bus.subscribe(EventKind::LocoSpeed, move |ev: &Event| {
//!     if let EventData::Loco { adr, .. } = ev.data {
//!         s.store(u32::from(adr), Ordering::SeqCst);
//!     }
//!     true
//! });
//!
//! bus.fire(EventKind::LocoSpeed, EventData::Loco { adr: 10, speed: 0x90, funcs: [0; 4] });
//! assert_eq!(seen.load(Ordering::SeqCst), 10);
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::format::DecoderFormat;
use crate::traits::Mode;

// ============================================================================
// Event Types
// ============================================================================

/// Event categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum EventKind {
    /// A loco entered the refresh list.
    NewLoco,
    /// Loco speed or direction changed.
    LocoSpeed,
    /// Loco function state changed.
    LocoFunction,
    /// Turnout energised or released.
    Turnout,
    /// Accessory configuration changed.
    Accessory,
    /// Control surface changes.
    Controls,
    /// Protocol or format changes.
    Protocol,
    /// Booster state.
    Booster,
    /// Feedback module state.
    Feedback,
    /// New feedback module found.
    FbNew,
    /// System operating mode.
    SysStatus,
    /// Environment readings.
    Environment,
    /// Averaged track current.
    Current,
    /// Instantaneous track current.
    InstantaneousCurrent,
    /// Boot-mode entry.
    EnBoot,
}

/// Who caused an event.
///
/// Front-ends tag their own calls so their handlers can ignore the echo.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Originator(pub u32);

impl Originator {
    /// The core itself.
    pub const CORE: Self = Self(0);
}

/// Event payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventData {
    /// No payload.
    None,
    /// Loco state after the change.
    Loco {
        /// Loco address.
        adr: u16,
        /// Speed byte (bit 7 = forward).
        speed: u8,
        /// Function bitmap.
        funcs: [u32; 4],
    },
    /// New loco with its format.
    NewLoco {
        /// Loco address.
        adr: u16,
        /// Decoder format.
        fmt: DecoderFormat,
    },
    /// Turnout state after the change.
    Turnout {
        /// Accessory address.
        adr: u16,
        /// Direction.
        dir: u8,
        /// Coil energised.
        on: bool,
    },
    /// Turnout timing limits.
    TurnoutTiming {
        /// Minimum energising time.
        min_ms: u32,
        /// Maximum energising time.
        max_ms: u32,
    },
    /// Operating mode.
    Mode(Mode),
}

/// One dispatched event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    /// Category.
    pub kind: EventKind,
    /// Causing party.
    pub origin: Originator,
    /// Payload.
    pub data: EventData,
}

// ============================================================================
// Bus
// ============================================================================

/// Handle returned by [`EventBus::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    subs: Vec<Subscription>,
    next_id: u64,
}

/// Event dispatcher shared by every component.
#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.registry.lock().subs.len())
            .finish()
    }
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind.
    ///
    /// The handler returns `false` to unsubscribe itself.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let mut reg = self.registry.lock();
        let id = SubscriptionId(reg.next_id);
        reg.next_id += 1;
        reg.subs.push(Subscription {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a subscription. Returns `true` if it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut reg = self.registry.lock();
        let before = reg.subs.len();
        reg.subs.retain(|s| s.id != id);
        reg.subs.len() != before
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().subs.len()
    }

    /// Fire an event caused by the core.
    pub fn fire(&self, kind: EventKind, data: EventData) {
        self.fire_from(Originator::CORE, kind, data);
    }

    /// Fire an event on behalf of `origin`.
    pub fn fire_from(&self, origin: Originator, kind: EventKind, data: EventData) {
        let event = Event { kind, origin, data };
        let targets: Vec<(SubscriptionId, Handler)> = {
            let reg = self.registry.lock();
            reg.subs
                .iter()
                .filter(|s| s.kind == kind)
                .map(|s| (s.id, Arc::clone(&s.handler)))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let mut dropped = Vec::new();
        for (id, handler) in targets {
            if !handler(&event) {
                dropped.push(id);
            }
        }
        if !dropped.is_empty() {
            self.registry.lock().subs.retain(|s| !dropped.contains(&s.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn counter(bus: &EventBus, kind: EventKind, keep: bool) -> Arc<AtomicUsize> {
        let n = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&n);
        bus.subscribe(kind, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            keep
        });
        n
    }

    #[test]
    fn dispatch_by_kind() {
        let bus = EventBus::new();
        let speed = counter(&bus, EventKind::LocoSpeed, true);
        let turnout = counter(&bus, EventKind::Turnout, true);

        bus.fire(EventKind::LocoSpeed, EventData::None);
        bus.fire(EventKind::LocoSpeed, EventData::None);

        assert_eq!(speed.load(Ordering::SeqCst), 2);
        assert_eq!(turnout.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_returning_false_unsubscribes() {
        let bus = EventBus::new();
        let once = counter(&bus, EventKind::NewLoco, false);

        bus.fire(EventKind::NewLoco, EventData::None);
        bus.fire(EventKind::NewLoco, EventData::None);

        assert_eq!(once.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn explicit_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe(EventKind::Booster, |_| true);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
    }

    #[test]
    fn originator_is_delivered() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        bus.subscribe(EventKind::Protocol, move |ev| {
            *s.lock() = Some(ev.origin);
            true
        });

        bus.fire_from(Originator(7), EventKind::Protocol, EventData::None);
        assert_eq!(*seen.lock(), Some(Originator(7)));
    }

    #[test]
    fn handler_may_fire_reentrantly() {
        let bus = Arc::new(EventBus::new());
        let inner = counter(&bus, EventKind::LocoFunction, true);
        let b = Arc::clone(&bus);
        bus.subscribe(EventKind::LocoSpeed, move |_| {
            b.fire(EventKind::LocoFunction, EventData::None);
            true
        });

        bus.fire(EventKind::LocoSpeed, EventData::None);
        assert_eq!(inner.load(Ordering::SeqCst), 1);
    }
}
