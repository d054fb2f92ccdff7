//! The command station: one object owning every core component.
//!
//! `CommandStation` wires the signal queue, the refresh engine, the POM
//! facade and the event bus to the external collaborators. Host front-ends
//! keep an `Arc<CommandStation>` and call into it from any thread; the
//! signal generator pulls packets through [`CommandStation::next_packet`].
//!
//! ```rust
//! use std::sync::Arc;
//! use rs_cmdstation::hal::{MockAccessoryBus, MockClock, MockConfigStore, MockLocoDb, MockSignalGenerator};
//! use rs_cmdstation::station::{Collaborators, CommandStation};
//! use rs_cmdstation::{Command, Config, DecoderFormat};
//!
//! let station = CommandStation::new(
//!     Config::default(),
//!     Collaborators {
//!         generator: Arc::new(MockSignalGenerator::new()),
//!         db: Arc::new(MockLocoDb::new(DecoderFormat::Dcc28)),
//!         store: Arc::new(MockConfigStore::new()),
//!         bus: Arc::new(MockAccessoryBus::new()),
//!         clock: Arc::new(MockClock::new()),
//!     },
//! );
//!
//! station.refresh().set_speed(3, 0x90).unwrap();
//! assert_eq!(station.next_packet(true).unwrap().cmd, Command::SetSpeed);
//! // queue empty: the refresh cycle takes over
//! assert_eq!(station.next_packet(true).unwrap().adr, 3);
//! ```

use std::sync::Arc;

use tracing::info;

use crate::config::{Config, SharedConfig};
use crate::events::{EventBus, EventData, EventKind};
use crate::m3prog::M3Programmer;
use crate::packet::Packet;
use crate::pom::Pom;
use crate::queue::{RefreshSource, SignalQueue};
use crate::refresh::RefreshEngine;
use crate::traits::{AccessoryBus, Clock, ConfigStore, Delay, LocoDatabase, Mode, SignalGenerator};

#[cfg(feature = "runtime")]
use crate::turnout::{service::TurnoutHandle, TurnoutContext};

/// External collaborators the core drives.
#[derive(Clone)]
pub struct Collaborators {
    /// Signal generation layer.
    pub generator: Arc<dyn SignalGenerator>,
    /// Loco and accessory database.
    pub db: Arc<dyn LocoDatabase>,
    /// Configuration persistence.
    pub store: Arc<dyn ConfigStore>,
    /// Field-bus accessories.
    pub bus: Arc<dyn AccessoryBus>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Owns and wires the core components.
pub struct CommandStation {
    queue: Arc<SignalQueue>,
    refresh: Arc<RefreshEngine>,
    pom: Pom,
    events: Arc<EventBus>,
    config: SharedConfig,
    hw: Collaborators,
}

impl core::fmt::Debug for CommandStation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandStation")
            .field("queue", &self.queue)
            .field("refresh", &self.refresh)
            .finish_non_exhaustive()
    }
}

impl CommandStation {
    /// Build a station from its configuration and collaborators.
    pub fn new(config: Config, hw: Collaborators) -> Self {
        let sys = &config.system;
        info!(
            target: "station",
            purge_min = sys.loco_purge_min,
            mm_short_ms = sys.mm_short_ms,
            dcc_short_ms = sys.dcc_short_ms,
            long_pause = sys.long_pause(),
            default_format = %config.default_loco_format(),
            "station configured"
        );
        let config = config.shared();
        let queue = Arc::new(SignalQueue::new());
        let events = Arc::new(EventBus::new());
        let refresh = Arc::new(RefreshEngine::new(
            Arc::clone(&queue),
            Arc::clone(&hw.db),
            Arc::clone(&events),
            config.clone(),
            Arc::clone(&hw.store),
            Arc::clone(&hw.clock),
        ));
        let pom = Pom::new(Arc::clone(&queue), config.clone());
        Self {
            queue,
            refresh,
            pom,
            events,
            config,
            hw,
        }
    }

    /// The packet queue.
    pub fn queue(&self) -> &Arc<SignalQueue> {
        &self.queue
    }

    /// Loco commands and the refresh cycle.
    pub fn refresh(&self) -> &Arc<RefreshEngine> {
        &self.refresh
    }

    /// Programming on main.
    pub fn pom(&self) -> &Pom {
        &self.pom
    }

    /// Event bus for host front-ends.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Shared configuration.
    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// The signal generator this station drives.
    pub fn generator(&self) -> &Arc<dyn SignalGenerator> {
        &self.hw.generator
    }

    /// Next packet for the track.
    ///
    /// With `refresh` set, an empty queue yields the next refresh packet.
    pub fn next_packet(&self, refresh: bool) -> Option<Packet> {
        let source: Option<&dyn RefreshSource> = if refresh {
            Some(self.refresh.as_ref())
        } else {
            None
        };
        self.queue.pop(source)
    }

    /// Give a packet back to the head of the queue.
    pub fn push_back(&self, pkt: Packet) -> bool {
        self.queue.push_front(pkt)
    }

    /// Switch the operating mode and announce it.
    pub fn set_mode(&self, mode: Mode) {
        self.hw.generator.set_mode(mode);
        info!(target: "station", mode = mode.as_str(), "mode changed");
        self.events.fire(EventKind::SysStatus, EventData::Mode(mode));
    }

    /// Start the turnout task on the current tokio runtime.
    #[cfg(feature = "runtime")]
    pub fn spawn_turnouts(&self) -> TurnoutHandle {
        let ctx = TurnoutContext {
            queue: Arc::clone(&self.queue),
            db: Arc::clone(&self.hw.db),
            events: Arc::clone(&self.events),
            config: self.config.clone(),
        };
        crate::turnout::service::spawn(
            ctx,
            Arc::clone(&self.hw.clock),
            Arc::clone(&self.hw.generator),
            Arc::clone(&self.hw.bus),
            Arc::clone(&self.hw.store),
        )
    }

    /// A programming-track sequencer using `delay` for its waits.
    pub fn m3_programmer<D: Delay>(&self, delay: D) -> M3Programmer<D> {
        M3Programmer::new(
            Arc::clone(&self.hw.generator),
            Arc::clone(&self.queue),
            self.config.clone(),
            delay,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DecoderFormat;
    use crate::hal::{MockAccessoryBus, MockClock, MockConfigStore, MockLocoDb, MockSignalGenerator};
    use crate::packet::Command;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn station() -> (CommandStation, Arc<MockSignalGenerator>) {
        let generator = Arc::new(MockSignalGenerator::new());
        let st = CommandStation::new(
            Config::default(),
            Collaborators {
                generator: Arc::clone(&generator) as Arc<dyn SignalGenerator>,
                db: Arc::new(MockLocoDb::new(DecoderFormat::Dcc28)),
                store: Arc::new(MockConfigStore::new()),
                bus: Arc::new(MockAccessoryBus::new()),
                clock: Arc::new(MockClock::new()),
            },
        );
        (st, generator)
    }

    #[test]
    fn without_refresh_empty_queue_yields_nothing() {
        let (st, _) = station();
        st.refresh().set_speed(3, 0x90).unwrap();
        assert!(st.next_packet(false).is_some());
        assert!(st.next_packet(false).is_none());
        assert!(st.next_packet(true).is_some());
    }

    #[test]
    fn push_back_goes_to_head() {
        let (st, _) = station();
        st.refresh().set_speed(3, 0x90).unwrap();
        let first = st.next_packet(false).unwrap();
        st.pom().booster_conf(1, 2).unwrap();
        assert!(st.push_back(first));
        assert_eq!(st.next_packet(false).unwrap().cmd, Command::SetSpeed);
        assert_eq!(st.next_packet(false).unwrap().cmd, Command::DccPomWrite);
    }

    #[test]
    fn set_mode_fires_sys_status() {
        let (st, generator) = station();
        let seen = Arc::new(AtomicBool::new(false));
        let s = Arc::clone(&seen);
        st.events().subscribe(EventKind::SysStatus, move |ev| {
            s.store(ev.data == EventData::Mode(Mode::Go), Ordering::SeqCst);
            true
        });
        st.set_mode(Mode::Go);
        assert_eq!(generator.mode(), Mode::Go);
        assert!(seen.load(Ordering::SeqCst));
    }
}
