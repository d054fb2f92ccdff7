//! # rs-cmdstation
//!
//! Core of a model-railroad command station: it keeps DCC, Motorola and
//! m3 decoders refreshed, queues on-track packets for the signal generator,
//! drives turnout coils and runs decoder programming.
//!
//! ## Features
//!
//! - **Packet factories**: validated packets for every loco, accessory, POM, m3 and DCC-A command
//! - **Signal queue**: one FIFO with replacement-on-match and bounded lock waits
//! - **Refresh engine**: live loco state, round-robin refresh, purge and consists
//! - **Turnout scheduler**: energising windows, group exclusion, pacing
//! - **POM facade** and **m3 programming-track sequencer**
//!
//! ## Architecture
//!
//! The crate is structured to allow testing on desktop without a track:
//!
//! - `traits` - Signal generator, database, store, clock and delay seams
//! - `factory` - Packet construction
//! - `queue` - Signal queue
//! - `refresh` - Loco commands and refresh cycle
//! - `turnout` - Accessory scheduling (tokio task under `runtime`)
//! - `station` - Wires everything together
//! - `hal` - Concrete implementations (mocks for testing, std/tokio clocks)
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rs_cmdstation::hal::{MockClock, MockConfigStore, MockLocoDb};
//! use rs_cmdstation::{Command, Config, DecoderFormat, EventBus, RefreshEngine, SignalQueue};
//!
//! let queue = Arc::new(SignalQueue::new());
//! let engine = RefreshEngine::new(
//!     Arc::clone(&queue),
//!     Arc::new(MockLocoDb::new(DecoderFormat::Dcc28)),
//!     Arc::new(EventBus::new()),
//!     Config::default().shared(),
//!     Arc::new(MockConfigStore::new()),
//!     Arc::new(MockClock::new()),
//! );
//!
//! // forward, step 16, then reverse: an emergency stop separates the two
//! engine.set_speed(10, 0x90).unwrap();
//! engine.set_speed(10, 0x10).unwrap();
//! let cmds: Vec<Command> = queue.drain().iter().map(|p| p.cmd).collect();
//! assert_eq!(cmds, [Command::SetSpeed, Command::EmergencyStop, Command::SetSpeed]);
//! ```

#![warn(missing_docs)]

/// Configuration sections and persistence causes.
pub mod config;
/// Consist membership.
pub mod consist;
/// Error kinds and protocol codes.
pub mod error;
/// Event bus for host front-ends.
pub mod events;
/// Packet construction per command family.
pub mod factory;
/// Decoder formats and address limits.
pub mod format;
/// Hardware abstraction layer with mock implementations for testing.
pub mod hal;
/// m3 programming-track sequencer.
pub mod m3prog;
/// Packets, command codes and decoder replies.
pub mod packet;
/// Programming on main.
pub mod pom;
/// Signal queue.
pub mod queue;
/// Live loco state and the refresh cycle.
pub mod refresh;
/// Command station wiring.
pub mod station;
/// Core traits for external collaborators.
pub mod traits;
/// Turnout scheduling.
pub mod turnout;

// Re-exports for convenience
pub use config::{Config, FormatConfig, SharedConfig, SignalFlags, StoreCause, SystemConfig, TurnoutConfig};
pub use consist::{Consist, ConsistManager};
pub use error::{CoreError, Result};
pub use events::{Event, EventBus, EventData, EventKind, Originator};
pub use format::DecoderFormat;
pub use m3prog::M3Programmer;
pub use packet::{Command, CvAddr, DecoderReply, Packet, Payload, ReplyAction, ReplyHandler};
pub use pom::Pom;
pub use queue::{RefreshSource, SignalQueue};
pub use refresh::{LocoState, RefreshEngine};
pub use station::{Collaborators, CommandStation};
pub use traits::{
    AccessoryBus, Clock, ConfigStore, Delay, LocoDatabase, LocoDescriptor, Mode, SignalGenerator,
    TurnoutDescriptor,
};
pub use turnout::{TurnoutMsg, TurnoutScheduler, TurnoutStatus};

#[cfg(feature = "runtime")]
pub use turnout::service::TurnoutHandle;
