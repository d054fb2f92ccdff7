//! Tokio task around the [`TurnoutScheduler`].
//!
//! The task owns the scheduler. Host front-ends talk to it through a
//! cloneable [`TurnoutHandle`], which applies the operating-mode gate,
//! routes bus accessories directly and posts track accessories into a
//! bounded mailbox.
//!
//! ```text
//! TurnoutHandle ──► mpsc (16) ──► TurnoutService::run ──► SignalQueue
//!       │                              │
//!       └──► AccessoryBus (BiDiB)      └──► sleeps until next_wakeup()
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{TurnoutContext, TurnoutMsg, TurnoutScheduler, TurnoutStatus, TURNOUT_MAILBOX};
use crate::config::StoreCause;
use crate::error::{CoreError, Result};
use crate::events::{EventData, EventKind};
use crate::traits::{AccessoryBus, Clock, ConfigStore, SignalGenerator};

/// Budget for posting into a full mailbox.
pub const MAILBOX_SEND_WAIT: Duration = Duration::from_millis(100);

// =============================================================================
// Service
// =============================================================================

/// Long-running scheduler task.
pub struct TurnoutService {
    scheduler: TurnoutScheduler,
    clock: Arc<dyn Clock>,
    rx: mpsc::Receiver<TurnoutMsg>,
}

impl TurnoutService {
    /// Create the service and the sender side of its mailbox.
    pub fn new(scheduler: TurnoutScheduler, clock: Arc<dyn Clock>) -> (Self, mpsc::Sender<TurnoutMsg>) {
        let (tx, rx) = mpsc::channel(TURNOUT_MAILBOX);
        (
            Self {
                scheduler,
                clock,
                rx,
            },
            tx,
        )
    }

    /// Run until every sender is gone and no coil is left energised.
    pub async fn run(mut self) {
        info!(target: "turnout", "turnout service started");
        let mut open = true;
        loop {
            let wake = self.scheduler.next_wakeup();
            if open {
                let received = match wake {
                    Some(at) => {
                        let wait = Duration::from_millis(at.saturating_sub(self.clock.now_ms()));
                        timeout(wait, self.rx.recv()).await.ok()
                    }
                    None => Some(self.rx.recv().await),
                };
                match received {
                    Some(Some(msg)) => self.scheduler.handle(msg, self.clock.now_ms()),
                    Some(None) => {
                        debug!(target: "turnout", "mailbox closed, finishing active coils");
                        open = false;
                    }
                    None => {}
                }
            } else {
                let Some(at) = wake else {
                    break;
                };
                let wait = at.saturating_sub(self.clock.now_ms());
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }
            self.scheduler.poll(self.clock.now_ms());
        }
        info!(target: "turnout", "turnout service stopped");
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Front-end to a running [`TurnoutService`].
#[derive(Clone)]
pub struct TurnoutHandle {
    tx: mpsc::Sender<TurnoutMsg>,
    status: Arc<RwLock<TurnoutStatus>>,
    ctx: TurnoutContext,
    generator: Arc<dyn SignalGenerator>,
    bus: Arc<dyn AccessoryBus>,
    store: Arc<dyn ConfigStore>,
}

impl core::fmt::Debug for TurnoutHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TurnoutHandle")
            .field("status", &*self.status.read())
            .finish_non_exhaustive()
    }
}

/// Start the turnout task on the current tokio runtime.
pub fn spawn(
    ctx: TurnoutContext,
    clock: Arc<dyn Clock>,
    generator: Arc<dyn SignalGenerator>,
    bus: Arc<dyn AccessoryBus>,
    store: Arc<dyn ConfigStore>,
) -> TurnoutHandle {
    let scheduler = TurnoutScheduler::new(ctx.clone());
    let status = scheduler.status();
    let (service, tx) = TurnoutService::new(scheduler, clock);
    tokio::spawn(service.run());
    TurnoutHandle {
        tx,
        status,
        ctx,
        generator,
        bus,
        store,
    }
}

impl TurnoutHandle {
    /// Mode gate, descriptor lookup and bus routing.
    ///
    /// Returns the mailbox message for track accessories, `None` once a bus
    /// accessory has been switched.
    fn route(&self, adr: u16, dir: u8, on: bool, duration_ms: u32) -> Result<Option<TurnoutMsg>> {
        let mode = self.generator.mode();
        if !mode.accepts_turnouts() {
            warn!(target: "turnout", adr, mode = mode.as_str(), "switch refused");
            return Err(CoreError::PowerOff);
        }
        if dir > 1 {
            return Err(CoreError::Value(u32::from(dir)));
        }
        let desc = self
            .ctx
            .db
            .get_turnout(adr, true)
            .ok_or(CoreError::UnknownTurnout(adr))?;

        if desc.fmt.is_bus_accessory() {
            self.bus.switch(adr, dir, on)?;
            self.ctx.db.set_turnout_state(adr, on, dir);
            self.ctx
                .events
                .fire(EventKind::Turnout, EventData::Turnout { adr, dir, on });
            return Ok(None);
        }

        Ok(Some(if on {
            TurnoutMsg::On {
                adr,
                dir,
                duration_ms,
            }
        } else {
            TurnoutMsg::Off { adr }
        }))
    }

    /// Switch an accessory, waiting up to [`MAILBOX_SEND_WAIT`] for room.
    pub async fn switch(&self, adr: u16, dir: u8, on: bool, duration_ms: u32) -> Result<()> {
        let Some(msg) = self.route(adr, dir, on, duration_ms)? else {
            return Ok(());
        };
        self.tx
            .send_timeout(msg, MAILBOX_SEND_WAIT)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => CoreError::QueueFull,
                SendTimeoutError::Closed(_) => CoreError::Busy,
            })
    }

    /// Switch without waiting; fails with `QueueFull` if the mailbox is full.
    pub fn try_switch(&self, adr: u16, dir: u8, on: bool, duration_ms: u32) -> Result<()> {
        let Some(msg) = self.route(adr, dir, on, duration_ms)? else {
            return Ok(());
        };
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => CoreError::QueueFull,
            TrySendError::Closed(_) => CoreError::Busy,
        })
    }

    /// True while `adr` is energised.
    pub fn is_active(&self, adr: u16) -> bool {
        self.status.read().active.contains(&adr)
    }

    /// Requests waiting for a slot.
    pub fn pending(&self) -> usize {
        self.status.read().pending
    }

    /// Latest scheduler snapshot.
    pub fn status(&self) -> TurnoutStatus {
        self.status.read().clone()
    }

    /// Set the minimum energising time.
    pub fn set_min_time(&self, ms: u32) {
        self.update_timing(|t| t.set_min_time_ms(ms));
    }

    /// Set the maximum energising time.
    pub fn set_max_time(&self, ms: u32) {
        self.update_timing(|t| t.set_max_time_ms(ms));
    }

    fn update_timing(&self, f: impl FnOnce(&mut crate::config::TurnoutConfig)) {
        let (min_ms, max_ms) = {
            let mut cfg = self.ctx.config.write();
            f(&mut cfg.turnout);
            (cfg.turnout.min_time_ms, cfg.turnout.max_time_ms)
        };
        self.store.trigger_store(StoreCause::Turnout);
        debug!(target: "turnout", min_ms, max_ms, "timing changed");
        self.ctx
            .events
            .fire(EventKind::Accessory, EventData::TurnoutTiming { min_ms, max_ms });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::format::DecoderFormat;
    use crate::hal::{MockAccessoryBus, MockConfigStore, MockLocoDb, MockSignalGenerator, TokioClock};
    use crate::packet::Command;
    use crate::queue::SignalQueue;
    use crate::events::EventBus;
    use crate::traits::{LocoDatabase, Mode, TurnoutDescriptor};

    struct Rig {
        handle: TurnoutHandle,
        queue: Arc<SignalQueue>,
        db: Arc<MockLocoDb>,
        generator: Arc<MockSignalGenerator>,
        bus: Arc<MockAccessoryBus>,
        store: Arc<MockConfigStore>,
    }

    fn rig() -> Rig {
        let queue = Arc::new(SignalQueue::new());
        let db = Arc::new(MockLocoDb::new(DecoderFormat::Dcc28));
        let generator = Arc::new(MockSignalGenerator::new());
        generator.set_mode(Mode::Go);
        let bus = Arc::new(MockAccessoryBus::new());
        let store = Arc::new(MockConfigStore::new());
        let ctx = TurnoutContext {
            queue: Arc::clone(&queue),
            db: Arc::clone(&db) as Arc<dyn LocoDatabase>,
            events: Arc::new(EventBus::new()),
            config: Config::default().shared(),
        };
        let handle = spawn(
            ctx,
            Arc::new(TokioClock::new()),
            Arc::clone(&generator) as Arc<dyn SignalGenerator>,
            Arc::clone(&bus) as Arc<dyn AccessoryBus>,
            Arc::clone(&store) as Arc<dyn ConfigStore>,
        );
        Rig {
            handle,
            queue,
            db,
            generator,
            bus,
            store,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn switch_on_then_auto_off() {
        let r = rig();
        r.handle.switch(12, 1, true, 250).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(r.handle.is_active(12));
        assert_eq!(r.queue.drain()[0].cmd, Command::MagnetOn);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!r.handle.is_active(12));
        assert_eq!(r.queue.drain()[0].cmd, Command::MagnetOff);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_off_after_min_time() {
        let r = rig();
        r.handle.switch(12, 0, true, 5000).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        r.handle.switch(12, 0, false, 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!r.handle.is_active(12));
        let cmds: Vec<Command> = r.queue.drain().iter().map(|p| p.cmd).collect();
        assert_eq!(cmds, vec![Command::MagnetOn, Command::MagnetOff]);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_outside_go_and_halt() {
        let r = rig();
        r.generator.set_mode(Mode::Stop);
        assert_eq!(r.handle.switch(1, 0, true, 100).await, Err(CoreError::PowerOff));
        r.generator.set_mode(Mode::Halt);
        assert!(r.handle.switch(1, 0, true, 100).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn bus_accessory_bypasses_scheduler() {
        let r = rig();
        r.db.insert_turnout(TurnoutDescriptor::new(40, DecoderFormat::AccBidib));
        r.handle.switch(40, 1, true, 100).await.unwrap();
        assert_eq!(r.bus.calls(), vec![(40, 1, true)]);
        assert!(r.queue.is_empty());
        assert!(r.db.get_turnout(40, false).unwrap().on);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_direction_rejected() {
        let r = rig();
        assert_eq!(r.handle.try_switch(1, 2, true, 100), Err(CoreError::Value(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn timing_persisted_and_nudged() {
        let r = rig();
        r.handle.set_max_time(300);
        r.handle.set_min_time(800);
        let cfg = r.handle.ctx.config.read().turnout.clone();
        assert_eq!(cfg.min_time_ms, 800);
        assert_eq!(cfg.max_time_ms, 800);
        assert_eq!(r.store.causes(), vec![StoreCause::Turnout, StoreCause::Turnout]);
    }
}
