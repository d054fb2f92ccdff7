//! Seams to the hardware side of the command station.
//!
//! The core never touches the track directly. It hands packets to a signal
//! generation layer, asks it for operating-mode and m3 beacon information, and
//! measures time through a [`Clock`].
//!
//! # Key Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`SignalGenerator`] | Operating mode, m3 beacon, idle and voltage status |
//! | [`AccessoryBus`] | Accessories reached over a bus instead of the track |
//! | [`Clock`] | Monotonic millisecond time source |
//! | [`Delay`] | Async delay for the programming-track sequencer |
//!
//! # Implementation
//!
//! For testing and desktop development, use the mock implementations
//! from [`crate::hal::mock`]. Std-backed clocks and delays live in
//! `hal::system`.
//!
//! # Example
//!
//! ```rust
//! use rs_cmdstation::traits::{Clock, Mode, SignalGenerator};
//! use rs_cmdstation::hal::{MockClock, MockSignalGenerator};
//!
//! let generator = MockSignalGenerator::new();
//! generator.set_mode(Mode::Go);
//! assert!(generator.mode().accepts_turnouts());
//!
//! let clock = MockClock::new();
//! clock.advance(250);
//! assert_eq!(clock.now_ms(), 250);
//! ```

use crate::error::Result;

/// Operating mode of the signal generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Mode {
    /// Track power off.
    #[default]
    Stop,
    /// Short circuit detected.
    Short,
    /// Track powered, all locos held at speed 0.
    Halt,
    /// Signal on, booster outputs not yet enabled.
    SigOn,
    /// Normal operation.
    Go,
    /// DCC programming track.
    DccProg,
    /// Reset packets on the track.
    Reset,
    /// m3 programming track (test drive).
    TestDrive,
    /// Tams programming mode.
    TamsProg,
    /// Booster over temperature.
    OverTemp,
    /// Temperature back to normal.
    TempOk,
    /// Supply failure.
    PowerFail,
}

impl Mode {
    /// Turnout switching is only accepted in `HALT` and `GO`.
    #[inline]
    pub const fn accepts_turnouts(&self) -> bool {
        matches!(self, Mode::Halt | Mode::Go)
    }

    /// Returns the mode as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Mode::Stop => "stop",
            Mode::Short => "short",
            Mode::Halt => "halt",
            Mode::SigOn => "sigon",
            Mode::Go => "go",
            Mode::DccProg => "dccprog",
            Mode::Reset => "reset",
            Mode::TestDrive => "testdrive",
            Mode::TamsProg => "tamsprog",
            Mode::OverTemp => "overtemp",
            Mode::TempOk => "tempok",
            Mode::PowerFail => "powerfail",
        }
    }
}

/// Signal generation layer as seen from the core.
///
/// Packets are pulled through [`CommandStation::next_packet`]; this trait
/// only covers the control surface the core drives directly.
///
/// [`CommandStation::next_packet`]: crate::CommandStation::next_packet
pub trait SignalGenerator: Send + Sync {
    /// Switch the operating mode.
    fn set_mode(&self, mode: Mode);

    /// Current operating mode.
    fn mode(&self) -> Mode;

    /// Current m3 beacon (station identity).
    fn m3_beacon(&self) -> u32;

    /// Current m3 announce counter.
    fn m3_announce(&self) -> u16;

    /// Run the binary-tree UID search on the programming track.
    ///
    /// Returns the UID of the single decoder found, or `None`.
    fn search_m3_loco(&self) -> Option<u32>;

    /// True once the queue is drained and the last packet left the track.
    fn is_idle(&self) -> bool;

    /// True when the track voltage has settled after a mode switch.
    fn is_voltage_stable(&self) -> bool;
}

/// Accessories switched over a field bus (BiDiB and similar).
pub trait AccessoryBus: Send + Sync {
    /// Dispatch a switch command for a bus accessory.
    fn switch(&self, adr: u16, dir: u8, on: bool) -> Result<()>;
}

/// Time source.
///
/// Provides monotonic time in milliseconds. On desktop this wraps
/// `std::time::Instant`; tests use [`MockClock`](crate::hal::MockClock).
///
/// # Example
///
/// ```rust
/// use rs_cmdstation::traits::Clock;
/// use rs_cmdstation::hal::MockClock;
///
/// let clock = MockClock::new();
/// assert_eq!(clock.now_ms(), 0);
///
/// clock.advance(100);
/// assert_eq!(clock.now_ms(), 100);
/// ```
pub trait Clock: Send + Sync {
    /// Returns current time in milliseconds since an arbitrary epoch.
    ///
    /// Must be monotonically increasing.
    fn now_ms(&self) -> u64;
}

/// Async delay.
///
/// Used by the m3 programming sequencer for its settle and drain waits.
pub trait Delay: Send + Sync {
    /// Delay for the specified number of milliseconds.
    fn delay_ms(&self, ms: u32) -> impl core::future::Future<Output = ()> + Send;
}
