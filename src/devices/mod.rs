//! In-tree devices
//!
//! Only the CLINT lives here; every other peripheral plugs in through
//! [`crate::MmioHandler`].

pub mod clint;

pub use clint::Clint;
