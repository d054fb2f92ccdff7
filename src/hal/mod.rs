//! Hardware Abstraction Layer implementations.
//!
//! This module contains concrete implementations of the traits
//! defined in [`crate::traits`].
//!
//! # Available Implementations
//!
//! - `mock`: Test doubles for desktop development
//! - `system`: Std clock, tokio clock and delay (`runtime` feature)

pub mod mock;
pub mod system;

pub use mock::*;
pub use system::*;
