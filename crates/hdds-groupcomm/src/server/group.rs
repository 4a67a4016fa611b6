// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared group state: membership registry plus delivery router.
//!
//! Joins and departures go through here so that a member closing its
//! connection and a member timed out by the heartbeat monitor produce the
//! same registry change and the same notifications.

use super::member::Endpoint;
use super::protocol::Message;
use super::registry::{MembershipRegistry, Registration, RegistryError, Removal};
use super::router::{DeliveryReport, DeliveryRouter, MemberHandle, SenderPolicy};
use tracing::{debug, info};

/// Why a member left the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepartureReason {
    /// Connection closed or `/quit`.
    Left,
    /// Removed by the heartbeat monitor.
    Timeout,
}

/// Group membership and message routing.
pub struct Group {
    registry: MembershipRegistry,
    router: DeliveryRouter,
}

impl Group {
    pub fn new(max_members: usize) -> Self {
        Self {
            registry: MembershipRegistry::with_max_members(max_members),
            router: DeliveryRouter::new(),
        }
    }

    pub fn registry(&self) -> &MembershipRegistry {
        &self.registry
    }

    pub fn router(&self) -> &DeliveryRouter {
        &self.router
    }

    /// Register a member.
    pub fn join(
        &self,
        id: &str,
        endpoint: Endpoint,
        handle: MemberHandle,
    ) -> Result<Registration, RegistryError> {
        self.registry.register(id, endpoint, handle)
    }

    /// Welcome notice for a freshly registered member.
    pub fn welcome_message(&self, id: &str, registration: &Registration) -> Message {
        if registration.is_coordinator {
            return Message::system_to(
                id,
                "You are the first member to join.\n\
                 *** YOU ARE NOW THE GROUP COORDINATOR ***\n\
                 You are responsible for maintaining the group state.",
            );
        }

        let coordinator_id = &registration.coordinator_id;
        let details = self
            .registry
            .member(coordinator_id)
            .map(|c| format!("{} (IP: {}, Port: {})", c.id, c.endpoint.host, c.endpoint.port))
            .unwrap_or_else(|| "Unknown".to_string());

        Message::system_to(
            id,
            format!(
                "Welcome to the group, {}!\nCurrent Coordinator: {}\nCoordinator Details: {}",
                id, coordinator_id, details
            ),
        )
    }

    /// Tell everyone but `id` that `id` joined.
    pub fn announce_join(&self, id: &str) -> DeliveryReport {
        let mut handles = self.registry.handles();
        handles.remove(id);
        let msg = Message::system(format!("{} has joined the group", id));
        self.router.deliver(&msg, &handles, SenderPolicy::Include)
    }

    /// Route a member's message against the current handles.
    pub fn route(&self, msg: &Message, policy: SenderPolicy) -> DeliveryReport {
        let handles = self.registry.handles();
        self.router.deliver(msg, &handles, policy)
    }

    /// Remove `id` and notify the remaining members.
    ///
    /// Returns `None` if `id` was already gone.
    pub fn depart(&self, id: &str, reason: DepartureReason) -> Option<Removal> {
        self.finish_departure(id, self.registry.remove(id), reason)
    }

    /// Like [`Group::depart`], but only removes the registration the caller
    /// made. A session ending after its member was evicted and re-joined
    /// leaves the new registration untouched.
    pub fn depart_registration(
        &self,
        id: &str,
        registration: &Registration,
        reason: DepartureReason,
    ) -> Option<Removal> {
        let removed = self
            .registry
            .remove_registration(id, registration.generation);
        self.finish_departure(id, removed, reason)
    }

    fn finish_departure(
        &self,
        id: &str,
        removed: Result<Removal, RegistryError>,
        reason: DepartureReason,
    ) -> Option<Removal> {
        let removal = match removed {
            Ok(removal) => removal,
            Err(e) => {
                debug!("Departure of {} ignored: {}", id, e);
                return None;
            }
        };

        info!("{} left the group ({:?})", id, reason);

        let handles = self.registry.handles();
        if handles.is_empty() {
            debug!("No members left to notify");
            return Some(removal);
        }

        match (&removal.new_coordinator, reason) {
            (Some(new_id), _) => {
                let details = self
                    .registry
                    .member(new_id)
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| new_id.clone());
                let notice = Message::system_to(
                    new_id.as_str(),
                    format!(
                        "You are now the COORDINATOR of this group. Details: {}",
                        details
                    ),
                );
                let _ = self.router.deliver_to(new_id, &notice, &handles);

                let cause = match reason {
                    DepartureReason::Left => "has left",
                    DepartureReason::Timeout => "disconnected (timeout)",
                };
                let announcement = Message::system(format!(
                    "COORDINATOR {} {}. {} is the new COORDINATOR",
                    id, cause, new_id
                ));
                self.router
                    .deliver(&announcement, &handles, SenderPolicy::Include);
            }
            (None, DepartureReason::Left) => {
                let msg = Message::system(format!("{} has left the group", id));
                self.router.deliver(&msg, &handles, SenderPolicy::Include);
            }
            (None, DepartureReason::Timeout) => {
                let msg = Message::system(format!("{} disconnected (timeout)", id));
                self.router.deliver(&msg, &handles, SenderPolicy::Include);
            }
        }

        Some(removal)
    }
}
