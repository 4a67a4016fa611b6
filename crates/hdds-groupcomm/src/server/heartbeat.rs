// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Heartbeat-based failure detection.
//!
//! While running, the monitor drives two fixed schedules:
//!
//! - **ping sweep** every `ping_interval`, first at `ping_interval`: a PING
//!   is queued for every member, and each successful send refreshes that
//!   member's liveness
//! - **timeout sweep** every `ping_interval`, first at `2 * ping_interval`:
//!   every member silent for longer than `timeout` is removed through
//!   [`Group::depart`] with [`DepartureReason::Timeout`]
//!
//! A failed ping is not an error by itself. It only matters if the member
//! stays silent until a timeout sweep catches it.

use super::group::{DepartureReason, Group};
use super::protocol::Message;
use super::router::SenderPolicy;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Heartbeat schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            timeout: Duration::from_secs(40),
        }
    }
}

struct RunningTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Periodic ping and timeout sweeps over a [`Group`].
pub struct HeartbeatMonitor {
    group: Arc<Group>,
    config: HeartbeatConfig,
    task: Mutex<Option<RunningTask>>,
}

impl HeartbeatMonitor {
    pub fn new(group: Arc<Group>, config: HeartbeatConfig) -> Self {
        Self {
            group,
            config,
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Start both schedules. Returns `false` if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock();
        if task.is_some() {
            return false;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let group = self.group.clone();
        let config = self.config;

        let handle = tokio::spawn(async move {
            let start = Instant::now();
            let mut ping = interval_at(start + config.ping_interval, config.ping_interval);
            let mut check = interval_at(start + config.ping_interval * 2, config.ping_interval);
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
            check.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ping.tick() => {
                        ping_sweep(&group);
                    }
                    _ = check.tick() => {
                        timeout_sweep(&group, config.timeout);
                    }
                }
            }

            debug!("Heartbeat task exiting");
        });

        *task = Some(RunningTask { stop_tx, handle });
        info!(
            "Heartbeat monitor started (ping every {:?}, timeout {:?})",
            self.config.ping_interval, self.config.timeout
        );
        true
    }

    /// Cancel both schedules and wait for an in-flight sweep to finish.
    pub async fn stop(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };

        let _ = task.stop_tx.send(true);
        if let Err(e) = task.handle.await {
            warn!("Heartbeat task ended abnormally: {}", e);
        }
        info!("Heartbeat monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Run one ping sweep now. Returns the number of members pinged.
    pub fn ping_sweep(&self) -> usize {
        ping_sweep(&self.group)
    }

    /// Run one timeout sweep now. Returns the ids that were removed.
    pub fn timeout_sweep(&self) -> Vec<String> {
        timeout_sweep(&self.group, self.config.timeout)
    }
}

fn ping_sweep(group: &Group) -> usize {
    let handles = group.registry().handles();
    if handles.is_empty() {
        return 0;
    }

    debug!("Sending ping to {} members", handles.len());
    let report = group
        .router()
        .deliver(&Message::ping(), &handles, SenderPolicy::Include);

    for id in &report.delivered {
        group.registry().touch_liveness(id);
    }
    for id in &report.failed {
        debug!("Ping to {} failed", id);
    }

    report.delivered.len()
}

fn timeout_sweep(group: &Group, timeout: Duration) -> Vec<String> {
    let mut removed = Vec::new();

    for member in group.registry().snapshot() {
        if group.registry().is_responsive(&member.id, timeout) {
            continue;
        }

        warn!(
            "Member {} timed out (no response for {:?})",
            member.id, timeout
        );
        if group.depart(&member.id, DepartureReason::Timeout).is_some() {
            removed.push(member.id);
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::member::Endpoint;
    use crate::server::protocol::{decode, MessageKind};
    use crate::server::router::MemberHandle;
    use tokio::sync::mpsc;

    fn join(group: &Group, id: &str) -> mpsc::Receiver<String> {
        let (handle, rx) = MemberHandle::channel(64);
        group
            .join(id, Endpoint::new("127.0.0.1", 5000), handle)
            .unwrap();
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<crate::server::protocol::Message> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(decode(&line).unwrap());
        }
        out
    }

    fn monitor(group: &Arc<Group>) -> HeartbeatMonitor {
        HeartbeatMonitor::new(group.clone(), HeartbeatConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_sweep_touches_reachable_members() {
        let group = Arc::new(Group::new(10));
        let mut alice = join(&group, "alice");
        let bob = join(&group, "bob");
        drop(bob);

        tokio::time::advance(Duration::from_secs(30)).await;
        let pinged = monitor(&group).ping_sweep();
        assert_eq!(pinged, 1);

        let timeout = Duration::from_secs(10);
        assert!(group.registry().is_responsive("alice", timeout));
        assert!(!group.registry().is_responsive("bob", timeout));

        let got = drain(&mut alice);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageKind::Ping);
        assert_eq!(got[0].sender_id(), "SERVER");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_sweep_removes_silent_member() {
        let group = Arc::new(Group::new(10));
        let mut alice = join(&group, "alice");
        let bob = join(&group, "bob");
        drop(bob);
        let monitor = monitor(&group);

        tokio::time::advance(Duration::from_secs(41)).await;
        monitor.ping_sweep();
        drain(&mut alice);

        let removed = monitor.timeout_sweep();
        assert_eq!(removed, vec!["bob".to_string()]);
        assert!(!group.registry().is_registered("bob"));
        assert_eq!(group.registry().coordinator_id().as_deref(), Some("alice"));

        let got = drain(&mut alice);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].content, "bob disconnected (timeout)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_of_coordinator_reelects() {
        let group = Arc::new(Group::new(10));
        let alice = join(&group, "alice");
        drop(alice);
        tokio::time::advance(Duration::from_millis(10)).await;
        let mut bob = join(&group, "bob");
        let monitor = monitor(&group);

        tokio::time::advance(Duration::from_secs(41)).await;
        monitor.ping_sweep();
        drain(&mut bob);

        assert_eq!(monitor.timeout_sweep(), vec!["alice".to_string()]);
        assert_eq!(group.registry().coordinator_id().as_deref(), Some("bob"));

        let got = drain(&mut bob);
        assert_eq!(got.len(), 2);
        assert!(got[0].content.starts_with("You are now the COORDINATOR"));
        assert_eq!(
            got[1].content,
            "COORDINATOR alice disconnected (timeout). bob is the new COORDINATOR"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_responsive_members_survive() {
        let group = Arc::new(Group::new(10));
        let _alice = join(&group, "alice");
        let monitor = monitor(&group);

        tokio::time::advance(Duration::from_secs(39)).await;
        assert!(monitor.timeout_sweep().is_empty());
        assert_eq!(group.registry().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_sweeps_remove_dead_member() {
        let group = Arc::new(Group::new(10));
        let mut alice = join(&group, "alice");
        let bob = join(&group, "bob");
        drop(bob);

        let monitor = monitor(&group);
        assert!(monitor.start());
        assert!(!monitor.start());
        assert!(monitor.is_running());

        // Pings at 20s and 40s, timeout sweeps at 40s and 60s
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(group.registry().is_registered("alice"));
        assert!(!group.registry().is_registered("bob"));

        let messages = drain(&mut alice);
        let pings = messages
            .iter()
            .filter(|m| m.kind == MessageKind::Ping)
            .count();
        assert_eq!(pings, 3);
        assert!(messages
            .iter()
            .any(|m| m.content == "bob disconnected (timeout)"));

        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sweeps_after_stop() {
        let group = Arc::new(Group::new(10));
        let mut alice = join(&group, "alice");
        let monitor = monitor(&group);

        monitor.start();
        tokio::time::sleep(Duration::from_secs(5)).await;
        monitor.stop().await;

        let bob = join(&group, "bob");
        drop(bob);
        tokio::time::sleep(Duration::from_secs(300)).await;

        assert!(group.registry().is_registered("bob"));
        assert!(drain(&mut alice).is_empty());

        // Stop is idempotent
        monitor.stop().await;
    }
}
