//! Packet factories.
//!
//! Each factory validates its arguments, builds one [`Packet`], sets the
//! repeat count from the [`FormatConfig`] of the decoder family and hands it
//! back. Factories never touch the queue; the caller enqueues.
//!
//! A factory returns `None` when an argument is out of range. Callers treat
//! that as a soft drop and report their own error.
//!
//! # Families
//!
//! | Module | Packets |
//! |--------|---------|
//! | [`loco`] | Speed, functions, emergency stop, MM reverse, binary state |
//! | [`accessory`] | Magnet on/off, accessory NOPs, extended accessory aspect |
//! | [`pom`] | POM, xPOM and short-form POM |
//! | [`m3`] | m3 beacon, search, address assignment, CV access |
//! | [`dcca`] | DCC-A automatic logon |
//! | [`broadcast`] | Idle, reset, model time and date, system time |
//!
//! # Example
//!
//! ```rust
//! use rs_cmdstation::config::FormatConfig;
//! use rs_cmdstation::factory::loco;
//! use rs_cmdstation::{Command, DecoderFormat};
//!
//! let cfg = FormatConfig::default().with_dcc_repeat(3);
//! let pkt = loco::speed(&cfg, DecoderFormat::Dcc28, 10, 0x90, [0; 4]).unwrap();
//! assert_eq!(pkt.cmd, Command::SetSpeed);
//! assert_eq!(pkt.repeat, 3);
//!
//! assert!(loco::speed(&cfg, DecoderFormat::Dcc28, 0, 0x90, [0; 4]).is_none());
//! ```
//!
//! [`Packet`]: crate::Packet
//! [`FormatConfig`]: crate::config::FormatConfig

pub mod accessory;
pub mod broadcast;
pub mod dcca;
pub mod loco;
pub mod m3;
pub mod pom;

pub use pom::PomTarget;

/// Minimum repeat for safety-relevant packets (emergency stop, binary state).
pub const MIN_SAFETY_REPEAT: u8 = 5;
