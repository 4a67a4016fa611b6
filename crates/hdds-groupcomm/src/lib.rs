// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS Group Communication Server
//!
//! Members connect over TCP, pick an id, and exchange broadcast and private
//! messages. One member is always the group coordinator.
//!
//! # Features
//!
//! - **Membership**: unique ids, join/leave announcements, `/who` listing
//! - **Coordinator Election**: the longest-standing member coordinates and a
//!   successor is elected as soon as the coordinator leaves
//! - **Failure Detection**: periodic PING sweeps, silent members are removed
//!   once the timeout elapses
//! - **Routing**: broadcast fan-out and private delivery with sender feedback
//!
//! # Quick Start
//!
//! ```bash
//! # Default port 8888, ping every 20s, timeout after 40s
//! hdds-groupcomm
//!
//! # Faster failure detection
//! hdds-groupcomm --ping-interval 5 --timeout 10
//!
//! # Using config file
//! hdds-groupcomm --config groupcomm.json
//! ```
//!
//! # Configuration File
//!
//! ```json
//! {
//!   "bind_address": "0.0.0.0",
//!   "port": 8888,
//!   "ping_interval_secs": 20,
//!   "timeout_secs": 40,
//!   "max_members": 1000
//! }
//! ```

pub mod config;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use server::{
    DepartureReason, Group, GroupServer, HeartbeatConfig, HeartbeatMonitor, Message,
    MessageKind, ServerError,
};
