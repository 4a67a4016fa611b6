// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message delivery.
//!
//! The router resolves the destination set of a message against a snapshot
//! of member transport handles and pushes the encoded line onto each
//! destination's outbound queue.
//!
//! # Delivery rules
//!
//! - BROADCAST, SYSTEM and PING go to every handle; the sender's own handle
//!   is skipped with [`SenderPolicy::Exclude`]
//! - a SYSTEM message carrying a recipient goes to that recipient only
//! - PRIVATE goes to the recipient, with a SYSTEM confirmation to the sender.
//!   An unknown recipient gets the sender a SYSTEM notice instead
//! - PONG is never routed
//!
//! Sends are best-effort. A closed or full queue is logged and counted, and
//! the remaining destinations are still served. Removing unreachable members
//! is left to the heartbeat monitor.

use super::protocol::{Message, MessageKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Handle to a member's connection.
///
/// Wraps the sending half of the connection's outbound line queue.
#[derive(Debug, Clone)]
pub struct MemberHandle {
    tx: mpsc::Sender<String>,
}

/// Member id to transport handle.
pub type HandleTable = HashMap<String, MemberHandle>;

impl MemberHandle {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Create a handle together with the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Queue one line without waiting.
    pub fn send_line(&self, line: String) -> Result<(), mpsc::error::TrySendError<String>> {
        self.tx.try_send(line)
    }

    /// True once the connection dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Whether a fan-out includes the sender's own handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderPolicy {
    Include,
    Exclude,
}

/// Delivery error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("User {0} not found")]
    RecipientNotFound(String),

    #[error("Failed to send to {member}: {reason}")]
    TransportSendFailure { member: String, reason: String },
}

/// Outcome of one [`DeliveryRouter::deliver`] call.
#[derive(Debug, Default, Clone)]
pub struct DeliveryReport {
    /// Members the message itself was queued for
    pub delivered: Vec<String>,

    /// Members whose queue rejected the message
    pub failed: Vec<String>,

    /// Set when the message could not be routed at all
    pub error: Option<DeliveryError>,
}

/// Delivery statistics.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub lines_delivered: AtomicU64,
    pub send_failures: AtomicU64,
    pub recipients_not_found: AtomicU64,
}

/// Point-in-time copy of [`DeliveryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStatsSnapshot {
    pub lines_delivered: u64,
    pub send_failures: u64,
    pub recipients_not_found: u64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            lines_delivered: self.lines_delivered.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            recipients_not_found: self.recipients_not_found.load(Ordering::Relaxed),
        }
    }
}

/// Routes messages to member handles.
#[derive(Debug, Default)]
pub struct DeliveryRouter {
    stats: DeliveryStats,
}

impl DeliveryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `msg` according to its kind.
    pub fn deliver(
        &self,
        msg: &Message,
        handles: &HandleTable,
        policy: SenderPolicy,
    ) -> DeliveryReport {
        debug!("[{}] {}", msg.kind, msg.display_line());

        match msg.kind {
            MessageKind::Private => self.deliver_private(msg, handles),
            MessageKind::System if msg.recipient.is_some() => {
                let mut report = DeliveryReport::default();
                let recipient = msg.recipient.as_deref().unwrap_or_default();
                if let Err(e) = self.deliver_to(recipient, msg, handles) {
                    report.failed.push(recipient.to_string());
                    report.error = Some(e);
                } else {
                    report.delivered.push(recipient.to_string());
                }
                report
            }
            MessageKind::Broadcast | MessageKind::System | MessageKind::Ping => {
                self.fan_out(msg, handles, policy)
            }
            MessageKind::Pong => {
                debug!("PONG from {} is not routed", msg.sender_id());
                DeliveryReport::default()
            }
        }
    }

    /// Send `msg` to a single member.
    pub fn deliver_to(
        &self,
        member: &str,
        msg: &Message,
        handles: &HandleTable,
    ) -> Result<(), DeliveryError> {
        let handle = handles
            .get(member)
            .ok_or_else(|| DeliveryError::RecipientNotFound(member.to_string()))?;
        self.send(member, handle, msg.encode())
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.stats.snapshot()
    }

    fn fan_out(&self, msg: &Message, handles: &HandleTable, policy: SenderPolicy) -> DeliveryReport {
        let line = msg.encode();
        let sender = msg.sender.as_deref();
        let mut report = DeliveryReport::default();

        for (member, handle) in handles {
            if policy == SenderPolicy::Exclude && sender == Some(member.as_str()) {
                continue;
            }
            match self.send(member, handle, line.clone()) {
                Ok(()) => report.delivered.push(member.clone()),
                Err(_) => report.failed.push(member.clone()),
            }
        }

        report
    }

    fn deliver_private(&self, msg: &Message, handles: &HandleTable) -> DeliveryReport {
        let sender = msg.sender_id();
        let recipient = msg.recipient.as_deref().unwrap_or("");
        let mut report = DeliveryReport::default();

        let Some(handle) = handles.get(recipient) else {
            self.stats
                .recipients_not_found
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                "Cannot send private message from {}: recipient '{}' not found",
                sender, recipient
            );

            let notice = if recipient.is_empty() {
                Message::system_to(sender, "No recipient specified")
            } else {
                Message::system_to(sender, format!("User {} not found", recipient))
            };
            if let Some(sender_handle) = handles.get(sender) {
                let _ = self.send(sender, sender_handle, notice.encode());
            }

            report.error = Some(DeliveryError::RecipientNotFound(recipient.to_string()));
            return report;
        };

        match self.send(recipient, handle, msg.encode()) {
            Ok(()) => report.delivered.push(recipient.to_string()),
            Err(e) => {
                report.failed.push(recipient.to_string());
                report.error = Some(e);
                return report;
            }
        }

        if sender != recipient {
            if let Some(sender_handle) = handles.get(sender) {
                let confirmation =
                    Message::system_to(sender, format!("Private message sent to {}", recipient));
                let _ = self.send(sender, sender_handle, confirmation.encode());
            }
        }

        report
    }

    fn send(&self, member: &str, handle: &MemberHandle, line: String) -> Result<(), DeliveryError> {
        match handle.send_line(line) {
            Ok(()) => {
                self.stats.lines_delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "outbound queue full",
                    mpsc::error::TrySendError::Closed(_) => "connection closed",
                };
                warn!("Failed to send to {}: {}", member, reason);
                Err(DeliveryError::TransportSendFailure {
                    member: member.to_string(),
                    reason: reason.to_string(),
                })
            }
        }
    }
}
