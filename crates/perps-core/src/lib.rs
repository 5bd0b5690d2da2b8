//! # Perps Core
//!
//! Data model for the Solana perps dashboard.
//!
//! Everything the refresh job writes and the dashboard reads is defined here:
//! the fixed time windows, the tracked protocols with their capability table,
//! the [`Metric`] presence type, and the [`CacheDocument`] root.

pub mod error;
pub mod metric;
pub mod models;
pub mod protocol;
pub mod window;

pub use error::*;
pub use metric::*;
pub use models::*;
pub use protocol::*;
pub use window::*;
