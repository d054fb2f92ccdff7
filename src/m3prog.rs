//! m3 programming-track sequencer.
//!
//! Every action runs inside the same frame:
//!
//! 1. remember the operating mode and the m3 beacon/announce values,
//! 2. switch to [`Mode::TestDrive`] and wait for stable track voltage,
//!    then settle for [`SETTLE_MS`],
//! 3. optionally send the inverted "deregister" beacon,
//! 4. send the station beacon,
//! 5. run the action,
//! 6. drain the queue, send the closing beacons, wait [`CLOSING_WAIT_MS`],
//! 7. restore the saved mode.
//!
//! Step 6 and 7 run even when the action fails. Only one action may be in
//! flight; a second caller gets [`CoreError::Busy`].
//!
//! ```rust
//! use std::sync::Arc;
//! use rs_cmdstation::hal::{MockClock, MockDelay, MockSignalGenerator};
//! use rs_cmdstation::m3prog::M3Programmer;
//! use rs_cmdstation::traits::{Mode, SignalGenerator};
//! use rs_cmdstation::{Config, SignalQueue};
//!
//! # tokio_test_block_on(async {
//! let queue = Arc::new(SignalQueue::new());
//! let generator = Arc::new(MockSignalGenerator::new().with_queue(Arc::clone(&queue)));
//! generator.set_mode(Mode::Go);
//! generator.set_search_result(Some(0xCAFE_0001));
//!
//! let prog = M3Programmer::new(generator.clone(), queue, Config::default().shared(), MockDelay::new(MockClock::new()));
//! assert_eq!(prog.read_uid(false).await.unwrap(), 0xCAFE_0001);
//! assert_eq!(generator.mode(), Mode::Go);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::SharedConfig;
use crate::error::{CoreError, Result};
use crate::factory::m3::{self, MAX_M3_CV, MAX_M3_SUB};
use crate::format::MAX_M3_ADR;
use crate::packet::{CvAddr, DecoderReply, Packet, ReplyAction, ReplyHandler, ReplyKind};
use crate::queue::SignalQueue;
use crate::traits::{Delay, Mode, SignalGenerator};

/// Repeat count of the opening beacons.
pub const OPENING_BEACONS: u8 = 10;
/// Repeat count of the closing beacons.
pub const CLOSING_BEACONS: u8 = 3;
/// Polling granularity for voltage and drain checks.
pub const POLL_MS: u32 = 10;
/// Give up waiting for stable track voltage after this long.
pub const VOLTAGE_TIMEOUT_MS: u32 = 1000;
/// Give up waiting for the queue to drain after this long.
pub const DRAIN_TIMEOUT_MS: u32 = 5000;
/// Settle time after the voltage is stable.
pub const SETTLE_MS: u32 = 250;
/// Wait after the closing beacons.
pub const CLOSING_WAIT_MS: u32 = 2000;

struct Session {
    mode: Mode,
    beacon: u32,
    announce: u16,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs m3 programming actions on the programming track.
pub struct M3Programmer<D: Delay> {
    generator: Arc<dyn SignalGenerator>,
    queue: Arc<SignalQueue>,
    config: SharedConfig,
    delay: D,
    busy: AtomicBool,
}

impl<D: Delay> M3Programmer<D> {
    /// Create a sequencer.
    pub fn new(
        generator: Arc<dyn SignalGenerator>,
        queue: Arc<SignalQueue>,
        config: SharedConfig,
        delay: D,
    ) -> Self {
        Self {
            generator,
            queue,
            config,
            delay,
            busy: AtomicBool::new(false),
        }
    }

    /// True while an action is running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------------

    /// Search the single decoder on the track. Returns 0 if none answered.
    pub async fn read_uid(&self, deregister: bool) -> Result<u32> {
        self.run(deregister, async {
            let uid = self.generator.search_m3_loco().unwrap_or(0);
            debug!(target: "m3prog", uid = format_args!("{uid:08X}"), "uid search finished");
            Ok(uid)
        })
        .await
    }

    /// Assign a new address to the decoder with `uid`.
    pub async fn set_address(&self, uid: u32, adr: u16) -> Result<()> {
        if adr == 0 || adr > MAX_M3_ADR {
            return Err(CoreError::Address(u32::from(adr)));
        }
        let cfg = self.config.read().formats.clone();
        let pkt = m3::new_addr(&cfg, uid, adr).ok_or(CoreError::NoMemory)?;
        self.run(false, async {
            self.queue.enqueue(pkt, false);
            self.drain().await
        })
        .await
    }

    /// Read `bytes` bytes starting at `cva`, trying up to `repeat` times.
    ///
    /// Returns `None` if the decoder never answered.
    pub async fn read_cv(&self, adr: u16, cva: CvAddr, bytes: u8, repeat: u8) -> Result<Option<Vec<u8>>> {
        check_cv(adr, cva)?;
        if !matches!(bytes, 1 | 2 | 4 | 8) {
            return Err(CoreError::Value(u32::from(bytes)));
        }
        let cfg = self.config.read().formats.clone();
        let result: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        let handler = ReplyHandler::new(move |r: &DecoderReply| {
            if r.kind == ReplyKind::Answer {
                *sink.lock() = Some(r.data().to_vec());
            }
            ReplyAction::Release
        });

        self.run(false, async {
            for attempt in 0..repeat.max(1) {
                if result.lock().is_some() {
                    break;
                }
                let pkt = m3::cv_read(&cfg, adr, cva, bytes, Some(handler.clone()))
                    .ok_or(CoreError::NoMemory)?;
                debug!(target: "m3prog", adr, cv = cva.cv, sub = cva.sub, attempt, "cv read");
                self.queue.enqueue(pkt, false);
                self.queue.enqueue(self.beacon(1), false);
                self.drain().await?;
            }
            Ok(result.lock().take())
        })
        .await
    }

    /// Write one byte at `cva`, sent `repeat` times.
    pub async fn write_cv(&self, adr: u16, cva: CvAddr, val: u8, repeat: u8) -> Result<()> {
        check_cv(adr, cva)?;
        let pkt = m3::cv_write(adr, cva, val, repeat.max(1), None).ok_or(CoreError::NoMemory)?;
        self.run(false, async {
            debug!(target: "m3prog", adr, cv = cva.cv, sub = cva.sub, val, "cv write");
            self.queue.enqueue(pkt, false);
            self.drain().await
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Frame
    // ------------------------------------------------------------------------

    async fn run<T>(&self, deregister: bool, action: impl Future<Output = Result<T>>) -> Result<T> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(CoreError::Busy);
        }
        let _guard = BusyGuard(&self.busy);

        let session = Session {
            mode: self.generator.mode(),
            beacon: self.generator.m3_beacon(),
            announce: self.generator.m3_announce(),
        };
        let res = match self.begin(&session, deregister).await {
            Ok(()) => action.await,
            Err(e) => Err(e),
        };
        let closed = self.end(&session).await;
        res.and_then(|v| closed.map(|()| v))
    }

    fn beacon(&self, repeat: u8) -> Packet {
        m3::beacon(self.generator.m3_beacon(), self.generator.m3_announce(), repeat)
    }

    async fn begin(&self, s: &Session, deregister: bool) -> Result<()> {
        info!(target: "m3prog", from = s.mode.as_str(), "switching to programming track");
        self.generator.set_mode(Mode::TestDrive);

        let mut waited = 0;
        while !self.generator.is_voltage_stable() {
            if waited >= VOLTAGE_TIMEOUT_MS {
                warn!(target: "m3prog", waited_ms = waited, "track voltage did not settle");
                return Err(CoreError::Timeout("track voltage"));
            }
            self.delay.delay_ms(POLL_MS).await;
            waited += POLL_MS;
        }
        self.delay.delay_ms(SETTLE_MS).await;

        if deregister {
            let pkt = m3::beacon(!s.beacon, !s.announce, OPENING_BEACONS);
            self.queue.enqueue(pkt, false);
        }
        self.queue
            .enqueue(m3::beacon(s.beacon, s.announce, OPENING_BEACONS), false);
        Ok(())
    }

    async fn end(&self, s: &Session) -> Result<()> {
        let drained = self.drain().await;
        self.queue
            .enqueue(m3::beacon(s.beacon, s.announce, CLOSING_BEACONS), false);
        self.delay.delay_ms(CLOSING_WAIT_MS).await;
        self.generator.set_mode(s.mode);
        info!(target: "m3prog", to = s.mode.as_str(), "programming track released");
        drained
    }

    async fn drain(&self) -> Result<()> {
        let mut waited = 0;
        while !self.generator.is_idle() {
            if waited >= DRAIN_TIMEOUT_MS {
                warn!(target: "m3prog", queued = self.queue.len(), "signal queue did not drain");
                return Err(CoreError::Timeout("signal queue drain"));
            }
            self.delay.delay_ms(POLL_MS).await;
            waited += POLL_MS;
        }
        Ok(())
    }
}

fn check_cv(adr: u16, cva: CvAddr) -> Result<()> {
    if adr == 0 || adr > MAX_M3_ADR {
        return Err(CoreError::Address(u32::from(adr)));
    }
    if cva.cv > u32::from(MAX_M3_CV) || cva.sub > MAX_M3_SUB {
        return Err(CoreError::Cv(cva.cv));
    }
    Ok(())
}
