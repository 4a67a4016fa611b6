// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Group member records.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Network endpoint a member connected from. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Point-in-time view of a registered member.
///
/// Records are owned by the registry; this is a detached copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Unique, case-sensitive member id
    pub id: String,

    /// Where the member connected from
    pub endpoint: Endpoint,

    /// Registration timestamp
    pub joined_at: Instant,

    /// Last confirmed successful communication
    pub last_liveness: Instant,

    /// Whether this member is the group coordinator
    pub is_coordinator: bool,
}

impl Member {
    /// True if the member was heard from no more than `timeout` ago.
    ///
    /// Inclusive bound rather than the strict `elapsed < timeout` form, so a
    /// fresh touch counts as responsive for every timeout including zero.
    pub fn is_responsive(&self, timeout: Duration) -> bool {
        self.last_liveness.elapsed() <= timeout
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.endpoint)?;
        if self.is_coordinator {
            write!(f, " [COORDINATOR]")?;
        }
        Ok(())
    }
}
