//! livecap - Livestream Capture Supervisor
//!
//! Watches a configured set of creator endpoints (channel feeds and live
//! rooms) and records broadcasts as they go live: push notifications,
//! channel polling and a persistent chat-protocol connection feed per-target
//! watchers, which drive per-broadcast recorders that supervise external or
//! in-process downloaders.

pub mod channel;
pub mod config;
pub mod downloader;
pub mod error;
pub mod hooks;
pub mod ingress;
pub mod logging;
pub mod recorder;
pub mod room;
pub mod schedule;
pub mod status;
pub mod utils;

pub use error::{Error, Result};
