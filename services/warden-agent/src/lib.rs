//! # Warden Agent
//!
//! Host service that loads the IPsec configuration, applies it through the
//! platform backend and keeps the tunnel up until asked to stop.

pub mod app;
pub mod logging;

pub use app::{run, Args};
