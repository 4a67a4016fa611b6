// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Membership registry.
//!
//! Single table of group members, their transport handles and the current
//! coordinator. Every operation that reads and then writes membership or
//! coordinator state runs under the write lock as one step, so concurrent
//! joins and departures serialize and the coordinator invariants hold after
//! each of them:
//!
//! - member ids are unique
//! - a non-empty registry has exactly one coordinator, named by `coordinator`
//! - an empty registry has no coordinator
//!
//! Liveness timestamps are per-member atomics and only need the read lock.

use super::member::{Endpoint, Member};
use super::router::{HandleTable, MemberHandle};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

/// Registry error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("ID {0} is already in use")]
    DuplicateId(String),

    #[error("Member {0} not found")]
    NotFound(String),

    #[error("Group is full ({0} members)")]
    GroupFull(usize),
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Whether the new member became coordinator
    pub is_coordinator: bool,

    /// Coordinator at the time of registration
    pub coordinator_id: String,

    /// Identifies this registration among later ones under the same id
    pub generation: u64,
}

/// Result of a successful removal.
#[derive(Debug, Clone)]
pub struct Removal {
    /// The removed member as it was just before removal
    pub member: Member,

    /// Whether the removed member was coordinator
    pub was_coordinator: bool,

    /// Member elected to replace the removed coordinator
    pub new_coordinator: Option<String>,
}

struct MemberEntry {
    endpoint: Endpoint,
    joined_at: Instant,
    /// Nanoseconds since the registry epoch
    liveness: AtomicU64,
    is_coordinator: bool,
    generation: u64,
    handle: MemberHandle,
}

#[derive(Default)]
struct RegistryState {
    members: HashMap<String, MemberEntry>,
    coordinator: Option<String>,
    next_generation: u64,
}

impl RegistryState {
    /// Earliest join time wins, ties broken by id.
    fn elect(&mut self) -> Option<String> {
        let new_id = self
            .members
            .iter()
            .min_by(|(a_id, a), (b_id, b)| {
                a.joined_at.cmp(&b.joined_at).then_with(|| a_id.cmp(b_id))
            })
            .map(|(id, _)| id.clone())?;

        if let Some(entry) = self.members.get_mut(&new_id) {
            entry.is_coordinator = true;
        }
        self.coordinator = Some(new_id.clone());
        Some(new_id)
    }
}

/// Registry of all group members.
pub struct MembershipRegistry {
    epoch: Instant,
    max_members: usize,
    state: RwLock<RegistryState>,
}

impl MembershipRegistry {
    /// Create a new empty registry without a member limit.
    pub fn new() -> Self {
        Self::with_max_members(usize::MAX)
    }

    /// Create a new empty registry accepting at most `max_members` members.
    pub fn with_max_members(max_members: usize) -> Self {
        Self {
            epoch: Instant::now(),
            max_members,
            state: RwLock::new(RegistryState::default()),
        }
    }

    fn now_ticks(&self) -> u64 {
        let nanos = Instant::now().duration_since(self.epoch).as_nanos();
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }

    fn ticks_to_instant(&self, ticks: u64) -> Instant {
        self.epoch + Duration::from_nanos(ticks)
    }

    fn to_member(&self, id: &str, entry: &MemberEntry) -> Member {
        Member {
            id: id.to_string(),
            endpoint: entry.endpoint.clone(),
            joined_at: entry.joined_at,
            last_liveness: self.ticks_to_instant(entry.liveness.load(Ordering::Acquire)),
            is_coordinator: entry.is_coordinator,
        }
    }

    /// Register a member. The first member of an empty registry becomes
    /// coordinator.
    pub fn register(
        &self,
        id: &str,
        endpoint: Endpoint,
        handle: MemberHandle,
    ) -> Result<Registration, RegistryError> {
        let mut state = self.state.write();

        if state.members.contains_key(id) {
            return Err(RegistryError::DuplicateId(id.to_string()));
        }
        if state.members.len() >= self.max_members {
            return Err(RegistryError::GroupFull(self.max_members));
        }

        let is_coordinator = state.members.is_empty();
        let generation = state.next_generation;
        state.next_generation += 1;
        let now = Instant::now();
        state.members.insert(
            id.to_string(),
            MemberEntry {
                endpoint,
                joined_at: now,
                liveness: AtomicU64::new(self.now_ticks()),
                is_coordinator,
                generation,
                handle,
            },
        );

        if is_coordinator {
            state.coordinator = Some(id.to_string());
            info!("{} registered as COORDINATOR", id);
        } else {
            info!("{} registered as member", id);
        }

        let coordinator_id = state.coordinator.clone().unwrap_or_default();
        Ok(Registration {
            is_coordinator,
            coordinator_id,
            generation,
        })
    }

    /// Remove a member, electing a new coordinator when needed.
    pub fn remove(&self, id: &str) -> Result<Removal, RegistryError> {
        self.remove_matching(id, None)
    }

    /// Remove `id` only if it is still the registration numbered
    /// `generation`. A later registration under the same id is left alone
    /// and reported as `NotFound`.
    pub fn remove_registration(&self, id: &str, generation: u64) -> Result<Removal, RegistryError> {
        self.remove_matching(id, Some(generation))
    }

    fn remove_matching(&self, id: &str, generation: Option<u64>) -> Result<Removal, RegistryError> {
        let mut state = self.state.write();

        let current = state.members.get(id).map(|entry| entry.generation);
        if current.is_none() || (generation.is_some() && current != generation) {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        let entry = state
            .members
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let member = self.to_member(id, &entry);
        let was_coordinator = entry.is_coordinator;

        let new_coordinator = if state.members.is_empty() {
            state.coordinator = None;
            info!("{} removed, group is now empty", id);
            None
        } else if was_coordinator {
            let elected = state.elect();
            if let Some(new_id) = &elected {
                info!("{} removed, {} elected as new COORDINATOR", id, new_id);
            }
            elected
        } else {
            info!("{} removed from group", id);
            None
        };

        Ok(Removal {
            member,
            was_coordinator,
            new_coordinator,
        })
    }

    /// Record successful communication with a member. Unknown ids are ignored.
    pub fn touch_liveness(&self, id: &str) {
        let state = self.state.read();
        match state.members.get(id) {
            Some(entry) => {
                entry.liveness.fetch_max(self.now_ticks(), Ordering::AcqRel);
            }
            None => debug!("Liveness update for unknown member {}", id),
        }
    }

    /// True if `id` is registered and was heard from no more than `timeout` ago.
    ///
    /// The bound is inclusive, unlike a strict `elapsed < timeout`, so a member
    /// touched just now is responsive even with a zero timeout.
    pub fn is_responsive(&self, id: &str, timeout: Duration) -> bool {
        let state = self.state.read();
        state.members.get(id).is_some_and(|entry| {
            let last = self.ticks_to_instant(entry.liveness.load(Ordering::Acquire));
            Instant::now().saturating_duration_since(last) <= timeout
        })
    }

    /// All members ordered by join time, then id.
    pub fn snapshot(&self) -> Vec<Member> {
        let state = self.state.read();
        let mut members: Vec<Member> = state
            .members
            .iter()
            .map(|(id, entry)| self.to_member(id, entry))
            .collect();
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        members
    }

    /// Current coordinator id.
    pub fn coordinator_id(&self) -> Option<String> {
        self.state.read().coordinator.clone()
    }

    /// Get a member by id.
    pub fn member(&self, id: &str) -> Option<Member> {
        let state = self.state.read();
        state.members.get(id).map(|entry| self.to_member(id, entry))
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.state.read().members.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.state.read().members.len()
    }

    /// Transport handles of all members, copied out so sends happen without
    /// holding the lock.
    pub fn handles(&self) -> HandleTable {
        let state = self.state.read();
        state
            .members
            .iter()
            .map(|(id, entry)| (id.clone(), entry.handle.clone()))
            .collect()
    }

    /// Member list as shown by `/who`.
    pub fn formatted_member_list(&self) -> String {
        let members = self.snapshot();
        let mut out = format!("=== GROUP MEMBERS (Total: {}) ===", members.len());
        for member in &members {
            out.push('\n');
            out.push_str(&member.to_string());
        }
        out
    }
}

impl Default for MembershipRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn handle() -> MemberHandle {
        let (handle, _rx) = MemberHandle::channel(8);
        handle
    }

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1", port)
    }

    fn assert_invariants(reg: &MembershipRegistry) {
        let members = reg.snapshot();
        let coordinators: Vec<_> = members.iter().filter(|m| m.is_coordinator).collect();
        match reg.coordinator_id() {
            Some(id) => {
                assert_eq!(coordinators.len(), 1);
                assert_eq!(coordinators[0].id, id);
            }
            None => {
                assert!(members.is_empty());
                assert!(coordinators.is_empty());
            }
        }
    }

    #[test]
    fn test_registry_new() {
        let reg = MembershipRegistry::new();
        assert_eq!(reg.count(), 0);
        assert!(reg.coordinator_id().is_none());
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn test_first_member_becomes_coordinator() {
        let reg = MembershipRegistry::new();

        let first = reg.register("alice", endpoint(5000), handle()).unwrap();
        assert!(first.is_coordinator);
        assert_eq!(first.coordinator_id, "alice");

        for (i, id) in ["bob", "carol", "dave"].iter().enumerate() {
            let r = reg.register(id, endpoint(5001 + i as u16), handle()).unwrap();
            assert!(!r.is_coordinator);
            assert_eq!(r.coordinator_id, "alice");
            assert_eq!(reg.coordinator_id().as_deref(), Some("alice"));
        }

        assert_eq!(reg.count(), 4);
        assert_invariants(&reg);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let reg = MembershipRegistry::new();
        reg.register("alice", endpoint(5000), handle()).unwrap();

        let err = reg.register("alice", endpoint(6000), handle()).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateId("alice".into()));
        assert_eq!(reg.count(), 1);
        assert_eq!(reg.member("alice").unwrap().endpoint.port, 5000);

        // Ids are case sensitive
        assert!(reg.register("Alice", endpoint(6000), handle()).is_ok());
        assert_eq!(reg.count(), 2);
    }

    #[test]
    fn test_max_members() {
        let reg = MembershipRegistry::with_max_members(2);
        reg.register("a", endpoint(1), handle()).unwrap();
        reg.register("b", endpoint(2), handle()).unwrap();
        assert_eq!(
            reg.register("c", endpoint(3), handle()).unwrap_err(),
            RegistryError::GroupFull(2)
        );
        assert_eq!(reg.count(), 2);
    }

    #[test]
    fn test_remove_coordinator_elects_replacement() {
        let reg = MembershipRegistry::new();
        reg.register("A", endpoint(1), handle()).unwrap();
        reg.register("B", endpoint(2), handle()).unwrap();
        reg.register("C", endpoint(3), handle()).unwrap();

        let removal = reg.remove("A").unwrap();
        assert!(removal.was_coordinator);
        assert_eq!(removal.member.id, "A");

        assert_eq!(reg.count(), 2);
        let new_id = reg.coordinator_id().expect("coordinator elected");
        assert!(new_id == "B" || new_id == "C");
        assert_eq!(removal.new_coordinator.as_deref(), Some(new_id.as_str()));
        assert!(reg.member(&new_id).unwrap().is_coordinator);
        assert_invariants(&reg);
    }

    #[tokio::test(start_paused = true)]
    async fn test_election_prefers_earliest_join() {
        let reg = MembershipRegistry::new();
        reg.register("zed", endpoint(1), handle()).unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        reg.register("yan", endpoint(2), handle()).unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        reg.register("abe", endpoint(3), handle()).unwrap();

        let removal = reg.remove("zed").unwrap();
        assert_eq!(removal.new_coordinator.as_deref(), Some("yan"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_election_tie_broken_by_id() {
        // Paused clock: every member joins at the same instant
        let reg = MembershipRegistry::new();
        reg.register("mallory", endpoint(1), handle()).unwrap();
        reg.register("trent", endpoint(2), handle()).unwrap();
        reg.register("bob", endpoint(3), handle()).unwrap();
        reg.register("eve", endpoint(4), handle()).unwrap();

        let removal = reg.remove("mallory").unwrap();
        assert_eq!(removal.new_coordinator.as_deref(), Some("bob"));

        let order: Vec<_> = reg.snapshot().into_iter().map(|m| m.id).collect();
        assert_eq!(order, vec!["bob", "eve", "trent"]);
    }

    #[test]
    fn test_remove_regular_member_keeps_coordinator() {
        let reg = MembershipRegistry::new();
        reg.register("alice", endpoint(1), handle()).unwrap();
        reg.register("bob", endpoint(2), handle()).unwrap();

        let removal = reg.remove("bob").unwrap();
        assert!(!removal.was_coordinator);
        assert!(removal.new_coordinator.is_none());
        assert_eq!(reg.coordinator_id().as_deref(), Some("alice"));
    }

    #[test]
    fn test_remove_unknown() {
        let reg = MembershipRegistry::new();
        assert_eq!(
            reg.remove("ghost").unwrap_err(),
            RegistryError::NotFound("ghost".into())
        );
    }

    #[test]
    fn test_remove_all_then_reuse() {
        let reg = MembershipRegistry::new();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            reg.register(id, endpoint(i as u16), handle()).unwrap();
        }
        for id in ["b", "a", "c"] {
            reg.remove(id).unwrap();
            assert_invariants(&reg);
        }

        assert_eq!(reg.count(), 0);
        assert!(reg.coordinator_id().is_none());

        let r = reg.register("D", endpoint(9), handle()).unwrap();
        assert!(r.is_coordinator);
        assert_eq!(reg.coordinator_id().as_deref(), Some("D"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness() {
        let reg = MembershipRegistry::new();
        reg.register("alice", endpoint(1), handle()).unwrap();

        reg.touch_liveness("alice");
        assert!(reg.is_responsive("alice", Duration::ZERO));
        assert!(reg.is_responsive("alice", Duration::from_secs(40)));

        tokio::time::advance(Duration::from_secs(41)).await;
        assert!(!reg.is_responsive("alice", Duration::from_secs(40)));

        reg.touch_liveness("alice");
        assert!(reg.is_responsive("alice", Duration::ZERO));
        assert!(reg.member("alice").unwrap().is_responsive(Duration::ZERO));
    }

    #[test]
    fn test_touch_unknown_is_noop() {
        let reg = MembershipRegistry::new();
        reg.touch_liveness("ghost");
        assert!(!reg.is_responsive("ghost", Duration::from_secs(40)));
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn test_handles_snapshot() {
        let reg = MembershipRegistry::new();
        reg.register("alice", endpoint(1), handle()).unwrap();
        reg.register("bob", endpoint(2), handle()).unwrap();

        let handles = reg.handles();
        assert_eq!(handles.len(), 2);
        assert!(handles.contains_key("alice"));
        assert!(handles.contains_key("bob"));

        reg.remove("alice").unwrap();
        // Earlier snapshots are unaffected
        assert_eq!(handles.len(), 2);
        assert_eq!(reg.handles().len(), 1);
    }

    #[test]
    fn test_formatted_member_list() {
        let reg = MembershipRegistry::new();
        reg.register("alice", Endpoint::new("10.0.0.1", 4000), handle())
            .unwrap();
        reg.register("bob", Endpoint::new("10.0.0.2", 4001), handle())
            .unwrap();

        let list = reg.formatted_member_list();
        assert!(list.starts_with("=== GROUP MEMBERS (Total: 2) ==="));
        assert!(list.contains("alice (10.0.0.1:4000) [COORDINATOR]"));
        assert!(list.contains("bob (10.0.0.2:4001)"));
    }

    #[test]
    fn test_concurrent_register_remove() {
        let reg = Arc::new(MembershipRegistry::new());

        for round in 0..50 {
            let ids: Vec<String> = (0..8).map(|i| format!("m{}-{}", round, i)).collect();

            let joins: Vec<_> = ids
                .iter()
                .cloned()
                .map(|id| {
                    let reg = reg.clone();
                    std::thread::spawn(move || {
                        reg.register(&id, Endpoint::new("127.0.0.1", 1), handle())
                            .unwrap()
                    })
                })
                .collect();
            let coordinators = joins
                .into_iter()
                .map(|j| j.join().unwrap())
                .filter(|r| r.is_coordinator)
                .count();
            assert_eq!(coordinators, 1);
            assert_invariants(&reg);

            let leaves: Vec<_> = ids
                .iter()
                .cloned()
                .map(|id| {
                    let reg = reg.clone();
                    std::thread::spawn(move || reg.remove(&id).unwrap())
                })
                .collect();
            let elections = leaves
                .into_iter()
                .map(|j| j.join().unwrap())
                .filter(|r| r.new_coordinator.is_some())
                .count();
            assert!(elections < ids.len());

            assert_eq!(reg.count(), 0);
            assert!(reg.coordinator_id().is_none());
        }
    }

    #[test]
    fn test_remove_registration_ignores_later_registration() {
        let reg = MembershipRegistry::new();
        let first = reg.register("alice", endpoint(5000), handle()).unwrap();
        reg.register("bob", endpoint(5001), handle()).unwrap();

        reg.remove("alice").unwrap();
        let second = reg.register("alice", endpoint(5002), handle()).unwrap();
        assert_ne!(first.generation, second.generation);

        assert_eq!(
            reg.remove_registration("alice", first.generation).unwrap_err(),
            RegistryError::NotFound("alice".into())
        );
        assert!(reg.is_registered("alice"));
        assert_eq!(reg.count(), 2);

        let removal = reg.remove_registration("alice", second.generation).unwrap();
        assert_eq!(removal.member.endpoint.port, 5002);
        assert!(!reg.is_registered("alice"));
        assert_invariants(&reg);
    }
}
