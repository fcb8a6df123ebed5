//! # Persistence Module
//!
//! Durable storage for captured infrared signals.
//!
//! Each learned command lives in its own file below the configured commands
//! directory, so the store is easy to inspect, back up or hand-edit:
//!
//! ```text
//! commands/
//! ├── livingroom/
//! │   ├── tv-power      "2600500000012a..."
//! │   └── tv-volup
//! └── fan
//! ```
//!
//! ## Error Handling Strategy
//! Store failures are reported as [`signal_store::StoreError`] and never leave
//! the command dispatcher; a broken file affects only the command it belongs to.

pub mod signal_store;

pub use signal_store::{SignalStore, StoreError};
