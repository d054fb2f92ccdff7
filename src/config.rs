//! Command station configuration.
//!
//! Uses `heapless::String` for names so the structures stay allocation-free,
//! and the same `Default` + `with_*` builder style throughout.
//!
//! Configuration is process-wide. Readers take a short read lock on
//! [`SharedConfig`] and treat what they see as eventually consistent;
//! writers persist through [`ConfigStore::trigger_store`].
//!
//! # Example
//!
//! ```rust
//! use rs_cmdstation::config::{Config, FormatConfig, SignalFlags, SystemConfig};
//!
//! let config = Config::default()
//!     .with_formats(FormatConfig::default().with_dcc_repeat(3).with_sigflags(SignalFlags::RAILCOM))
//!     .with_system(SystemConfig::default().with_loco_purge_min(30));
//!
//! assert_eq!(config.formats.dcc_repeat, 3);
//! assert!(config.formats.sigflags.contains(SignalFlags::RAILCOM));
//! ```
//!
//! [`ConfigStore::trigger_store`]: crate::traits::ConfigStore::trigger_store

use std::sync::Arc;

use heapless::String as HString;
use parking_lot::RwLock;

use crate::format::DecoderFormat;

/// Maximum length for short config strings (loco names)
pub const MAX_SHORT_STRING: usize = 32;

/// Type alias for short config strings
pub type ShortString = HString<MAX_SHORT_STRING>;

/// Lower bound for the turnout minimum switching time.
pub const MIN_MINTIME_MS: u32 = 100;
/// Upper bound for the turnout maximum switching time.
pub const MAX_MAXTIME_MS: u32 = 5000;

/// Create a ShortString from a &str, truncating if too long
pub fn short_string(s: &str) -> ShortString {
    let mut hs = ShortString::new();
    let take = s.len().min(MAX_SHORT_STRING);
    // Find valid UTF-8 boundary
    let valid_end = s
        .char_indices()
        .take_while(|(i, c)| i + c.len_utf8() <= take)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    let _ = hs.push_str(&s[..valid_end]);
    hs
}

// ============================================================================
// Flag sets
// ============================================================================

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self(1 << $bit);)*

            /// No flags set.
            pub const fn empty() -> Self {
                Self(0)
            }

            /// Raw bits.
            pub const fn bits(&self) -> u32 {
                self.0
            }

            /// True if every flag in `other` is set.
            pub const fn contains(&self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Set or clear the flags in `other`.
            pub fn set(&mut self, other: Self, on: bool) {
                if on {
                    self.0 |= other.0;
                } else {
                    self.0 &= !other.0;
                }
            }
        }

        impl core::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

flag_set! {
    /// Signal generation options.
    SignalFlags {
        /// RailCom cutout enabled.
        RAILCOM = 0,
        /// DCC-A automatic logon enabled.
        DCCA = 1,
        /// Accessory NOP keep-alives in the refresh cycle.
        DCCNOP = 2,
        /// m3 beacon enabled.
        M3 = 3,
    }
}

flag_set! {
    /// System-wide options.
    SystemFlags {
        /// Long inter-packet pause.
        LONGPAUSE = 0,
        /// Unknown locos default to DCC instead of Motorola.
        DEFAULTDCC = 1,
    }
}

// ============================================================================
// Main Config
// ============================================================================

/// Complete command station configuration
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Per-format repeat counts and signal flags
    pub formats: FormatConfig,
    /// Purge, short-circuit and system flags
    pub system: SystemConfig,
    /// Turnout switching times
    pub turnout: TurnoutConfig,
}

impl Config {
    /// Set format configuration
    pub fn with_formats(mut self, formats: FormatConfig) -> Self {
        self.formats = formats;
        self
    }

    /// Set system configuration
    pub fn with_system(mut self, system: SystemConfig) -> Self {
        self.system = system;
        self
    }

    /// Set turnout configuration
    pub fn with_turnout(mut self, turnout: TurnoutConfig) -> Self {
        self.turnout = turnout;
        self
    }

    /// Wrap into a shared handle.
    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    /// Format assigned to locos unknown to the database.
    pub fn default_loco_format(&self) -> DecoderFormat {
        if self.system.sysflags.contains(SystemFlags::DEFAULTDCC) {
            DecoderFormat::Dcc28
        } else {
            DecoderFormat::Mm2x14
        }
    }
}

/// Process-wide configuration handle.
pub type SharedConfig = Arc<RwLock<Config>>;

/// Why a configuration store was triggered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreCause {
    /// Format or repeat settings changed.
    Formats,
    /// System settings changed.
    System,
    /// Turnout timing changed.
    Turnout,
    /// Loco database changed.
    Locos,
}

// ============================================================================
// Format Config
// ============================================================================

/// Repeat counts per decoder family and signal generation flags
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FormatConfig {
    /// Motorola packet repetitions
    pub mm_repeat: u8,
    /// DCC packet repetitions
    pub dcc_repeat: u8,
    /// m3 packet repetitions
    pub m3_repeat: u8,
    /// Accessory packet repetitions
    pub acc_repeat: u8,
    /// DCC POM packet repetitions
    pub dcc_pom_repeat: u8,
    /// Signal generation flags
    pub sigflags: SignalFlags,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            mm_repeat: 2,
            dcc_repeat: 2,
            m3_repeat: 2,
            acc_repeat: 2,
            dcc_pom_repeat: 5,
            sigflags: SignalFlags::RAILCOM | SignalFlags::M3,
        }
    }
}

impl FormatConfig {
    /// Set the Motorola repeat count
    pub fn with_mm_repeat(mut self, n: u8) -> Self {
        self.mm_repeat = n.max(1);
        self
    }

    /// Set the DCC repeat count
    pub fn with_dcc_repeat(mut self, n: u8) -> Self {
        self.dcc_repeat = n.max(1);
        self
    }

    /// Set the m3 repeat count
    pub fn with_m3_repeat(mut self, n: u8) -> Self {
        self.m3_repeat = n.max(1);
        self
    }

    /// Set the accessory repeat count
    pub fn with_acc_repeat(mut self, n: u8) -> Self {
        self.acc_repeat = n.max(1);
        self
    }

    /// Set the POM repeat count
    pub fn with_pom_repeat(mut self, n: u8) -> Self {
        self.dcc_pom_repeat = n.max(1);
        self
    }

    /// Set the signal flags
    pub fn with_sigflags(mut self, flags: SignalFlags) -> Self {
        self.sigflags = flags;
        self
    }

    /// Repeat count for a loco or accessory format.
    pub fn repeat_for(&self, fmt: DecoderFormat) -> u8 {
        if fmt.is_turnout() {
            self.acc_repeat
        } else if fmt.is_mm() {
            self.mm_repeat
        } else if fmt.is_m3() {
            self.m3_repeat
        } else {
            self.dcc_repeat
        }
    }
}

// ============================================================================
// System Config
// ============================================================================

/// System-level settings
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SystemConfig {
    /// Minutes of inactivity before a loco leaves the refresh list (0 = never)
    pub loco_purge_min: u32,
    /// Motorola short-circuit sensitivity in milliseconds
    pub mm_short_ms: u32,
    /// DCC short-circuit sensitivity in milliseconds
    pub dcc_short_ms: u32,
    /// System flags
    pub sysflags: SystemFlags,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            loco_purge_min: 0,
            mm_short_ms: 50,
            dcc_short_ms: 50,
            sysflags: SystemFlags::DEFAULTDCC,
        }
    }
}

impl SystemConfig {
    /// Set the purge timeout in minutes
    pub fn with_loco_purge_min(mut self, minutes: u32) -> Self {
        self.loco_purge_min = minutes;
        self
    }

    /// Set short-circuit sensitivities
    pub fn with_short_ms(mut self, mm: u32, dcc: u32) -> Self {
        self.mm_short_ms = mm;
        self.dcc_short_ms = dcc;
        self
    }

    /// Set the system flags
    pub fn with_sysflags(mut self, flags: SystemFlags) -> Self {
        self.sysflags = flags;
        self
    }

    /// True if the signal generator should stretch the inter-packet pause.
    pub fn long_pause(&self) -> bool {
        self.sysflags.contains(SystemFlags::LONGPAUSE)
    }

    /// Purge timeout in milliseconds, `None` when purging is off.
    pub fn purge_ms(&self) -> Option<u64> {
        (self.loco_purge_min > 0).then(|| u64::from(self.loco_purge_min) * 60_000)
    }
}

// ============================================================================
// Turnout Config
// ============================================================================

/// Turnout coil timing
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TurnoutConfig {
    /// Minimum energising time in milliseconds
    pub min_time_ms: u32,
    /// Maximum energising time in milliseconds
    pub max_time_ms: u32,
}

impl Default for TurnoutConfig {
    fn default() -> Self {
        Self {
            min_time_ms: MIN_MINTIME_MS,
            max_time_ms: MAX_MAXTIME_MS,
        }
    }
}

impl TurnoutConfig {
    /// Set the minimum time, nudging the maximum up if they cross.
    pub fn with_min_time_ms(mut self, ms: u32) -> Self {
        self.set_min_time_ms(ms);
        self
    }

    /// Set the maximum time, nudging the minimum down if they cross.
    pub fn with_max_time_ms(mut self, ms: u32) -> Self {
        self.set_max_time_ms(ms);
        self
    }

    /// Set the minimum time in place.
    pub fn set_min_time_ms(&mut self, ms: u32) {
        self.min_time_ms = ms.clamp(MIN_MINTIME_MS, MAX_MAXTIME_MS);
        if self.max_time_ms < self.min_time_ms {
            self.max_time_ms = self.min_time_ms;
        }
    }

    /// Set the maximum time in place.
    pub fn set_max_time_ms(&mut self, ms: u32) {
        self.max_time_ms = ms.clamp(MIN_MINTIME_MS, MAX_MAXTIME_MS);
        if self.min_time_ms > self.max_time_ms {
            self.min_time_ms = self.max_time_ms;
        }
    }

    /// Clip a requested duration to `[min, max]`.
    pub fn clip(&self, ms: u32) -> u32 {
        ms.clamp(self.min_time_ms, self.max_time_ms)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.formats.dcc_repeat, 2);
        assert_eq!(config.formats.dcc_pom_repeat, 5);
        assert_eq!(config.system.loco_purge_min, 0);
        assert_eq!(config.turnout.min_time_ms, 100);
        assert_eq!(config.turnout.max_time_ms, 5000);
    }

    #[test]
    fn repeat_for_family() {
        let f = FormatConfig::default()
            .with_mm_repeat(4)
            .with_dcc_repeat(3)
            .with_m3_repeat(5)
            .with_acc_repeat(6);
        assert_eq!(f.repeat_for(DecoderFormat::Mm2x27a), 4);
        assert_eq!(f.repeat_for(DecoderFormat::DccSdf), 3);
        assert_eq!(f.repeat_for(DecoderFormat::M3x126), 5);
        assert_eq!(f.repeat_for(DecoderFormat::AccMm), 6);
    }

    #[test]
    fn repeat_never_zero() {
        let f = FormatConfig::default().with_dcc_repeat(0);
        assert_eq!(f.dcc_repeat, 1);
    }

    #[test]
    fn flags_set_and_clear() {
        let mut flags = SignalFlags::empty();
        assert!(!flags.contains(SignalFlags::DCCNOP));
        flags.set(SignalFlags::DCCNOP | SignalFlags::DCCA, true);
        assert!(flags.contains(SignalFlags::DCCNOP));
        assert!(flags.contains(SignalFlags::DCCA));
        flags.set(SignalFlags::DCCA, false);
        assert!(!flags.contains(SignalFlags::DCCA));
        assert_eq!(flags.bits(), 1 << 2);
    }

    #[test]
    fn default_loco_format_follows_flag() {
        let dcc = Config::default();
        assert_eq!(dcc.default_loco_format(), DecoderFormat::Dcc28);

        let mm = Config::default()
            .with_system(SystemConfig::default().with_sysflags(SystemFlags::empty()));
        assert_eq!(mm.default_loco_format(), DecoderFormat::Mm2x14);
    }

    #[test]
    fn system_builders() {
        let s = SystemConfig::default()
            .with_short_ms(20, 80)
            .with_sysflags(SystemFlags::LONGPAUSE);
        assert_eq!((s.mm_short_ms, s.dcc_short_ms), (20, 80));
        assert!(s.long_pause());
        assert!(!SystemConfig::default().long_pause());
    }

    #[test]
    fn purge_ms_disabled_at_zero() {
        assert_eq!(SystemConfig::default().purge_ms(), None);
        assert_eq!(
            SystemConfig::default().with_loco_purge_min(2).purge_ms(),
            Some(120_000)
        );
    }

    // =========================================================================
    // TurnoutConfig Tests
    // =========================================================================

    #[test]
    fn turnout_min_clamped() {
        let t = TurnoutConfig::default().with_min_time_ms(10);
        assert_eq!(t.min_time_ms, MIN_MINTIME_MS);
    }

    #[test]
    fn turnout_max_clamped() {
        let t = TurnoutConfig::default().with_max_time_ms(60_000);
        assert_eq!(t.max_time_ms, MAX_MAXTIME_MS);
    }

    #[test]
    fn turnout_crossed_min_nudges_max() {
        let t = TurnoutConfig::default()
            .with_max_time_ms(300)
            .with_min_time_ms(800);
        assert_eq!(t.min_time_ms, 800);
        assert_eq!(t.max_time_ms, 800);
    }

    #[test]
    fn turnout_crossed_max_nudges_min() {
        let t = TurnoutConfig::default()
            .with_min_time_ms(800)
            .with_max_time_ms(300);
        assert_eq!(t.max_time_ms, 300);
        assert_eq!(t.min_time_ms, 300);
    }

    #[test]
    fn turnout_clip() {
        let t = TurnoutConfig::default().with_min_time_ms(200).with_max_time_ms(1000);
        assert_eq!(t.clip(0), 200);
        assert_eq!(t.clip(500), 500);
        assert_eq!(t.clip(9000), 1000);
    }

    // =========================================================================
    // String Helper Tests
    // =========================================================================

    #[test]
    fn short_string_truncation() {
        let long_input = "a".repeat(100);
        let s = short_string(&long_input);
        assert_eq!(s.len(), MAX_SHORT_STRING);
    }

    #[test]
    fn short_string_utf8_boundary() {
        let input = "ÄÖÜ".repeat(20);
        let s = short_string(&input);
        assert!(s.len() <= MAX_SHORT_STRING);
        assert!(core::str::from_utf8(s.as_bytes()).is_ok());
    }

    #[test]
    fn shared_config_is_writable() {
        let shared = Config::default().shared();
        shared.write().formats.dcc_repeat = 7;
        assert_eq!(shared.read().formats.dcc_repeat, 7);
    }
}
