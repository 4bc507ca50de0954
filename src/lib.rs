//! sleepproxy - Sleep Proxy for LAN hosts
//!
//! Watches a link for traffic addressed to sleeping hosts, answers address
//! resolution on their behalf and wakes them with magic packets when the
//! traffic is wanted. Frames are captured and parsed in userspace.

pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod neighbor;
pub mod protocol;
pub mod telemetry;

pub use error::{Error, Result};
