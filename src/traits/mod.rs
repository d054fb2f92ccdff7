//! Trait definitions for the collaborators the command core depends on.
//!
//! This module defines the abstractions that let the core run against real
//! signal-generation hardware or against the desktop mocks in
//! [`crate::hal`].
//!
//! # Submodules
//!
//! - `hardware`: Signal generator, accessory bus, clock, delay
//! - `database`: Loco/accessory database and configuration persistence

pub mod database;
pub mod hardware;

pub use database::*;
pub use hardware::*;
