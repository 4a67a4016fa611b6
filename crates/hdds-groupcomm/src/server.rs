// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Group server core implementation.

use crate::config::ServerConfig;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

pub mod connection;
pub mod group;
pub mod heartbeat;
pub mod member;
pub mod protocol;
pub mod registry;
pub mod router;

pub use connection::{ClientConnection, ConnectionError};
pub use group::{DepartureReason, Group};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor};
pub use member::{Endpoint, Member};
pub use protocol::{Message, MessageKind, ProtocolError};
pub use registry::{MembershipRegistry, Registration, RegistryError, Removal};
pub use router::{
    DeliveryError, DeliveryReport, DeliveryRouter, DeliveryStatsSnapshot, MemberHandle,
    SenderPolicy,
};

use protocol::{ClientInput, Command, HandshakeReply, HELP_TEXT, SERVER_SENDER};

/// Group server - accepts members over TCP and runs the heartbeat monitor.
#[derive(Clone)]
pub struct GroupServer {
    config: Arc<ServerConfig>,
    group: Arc<Group>,
    heartbeat: Arc<HeartbeatMonitor>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
}

/// What the session loop does after handling a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

impl GroupServer {
    /// Create a new group server.
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let group = Arc::new(Group::new(config.max_members));
        let heartbeat = Arc::new(HeartbeatMonitor::new(group.clone(), config.heartbeat()));

        Ok(Self {
            config: Arc::new(config),
            group,
            heartbeat,
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }

        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(format!("{}: {}", addr, e)))?;

        self.serve(listener).await
    }

    /// Serve members on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        info!("Group server listening on {}", local_addr);

        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();

        self.heartbeat.start();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            info!("New connection from {}", peer_addr);

                            let group = self.group.clone();
                            let config = self.config.clone();
                            let shutdown = self.shutdown.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    peer_addr,
                                    group,
                                    config,
                                    shutdown,
                                ).await {
                                    warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.heartbeat.stop().await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Handle a client connection from handshake to departure.
    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        group: Arc<Group>,
        config: Arc<ServerConfig>,
        shutdown: Arc<Notify>,
    ) -> Result<(), ServerError> {
        let mut conn = ClientConnection::new(stream, peer_addr, config.max_line_length);

        let shutdown = shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();

        conn.write_line(&HandshakeReply::SubmitId.to_line()).await?;

        let id = tokio::select! {
            line = conn.read_line() => match line? {
                Some(line) => line.trim().to_string(),
                None => {
                    debug!("{} closed before submitting an id", peer_addr);
                    return Ok(());
                }
            },
            _ = &mut shutdown => return Ok(()),
        };

        if let Err(e) = protocol::validate_member_id(&id, config.max_id_length) {
            warn!("Rejected id from {}: {}", peer_addr, e);
            conn.write_line(&HandshakeReply::Error(e.to_string()).to_line())
                .await?;
            let _ = conn.shutdown().await;
            return Ok(());
        }

        let (handle, mut outbound_rx) = MemberHandle::channel(config.outbound_queue_capacity);
        let registration = match group.join(&id, Endpoint::from(peer_addr), handle) {
            Ok(registration) => registration,
            Err(e) => {
                warn!("Rejected {} from {}: {}", id, peer_addr, e);
                conn.write_line(&HandshakeReply::Error(e.to_string()).to_line())
                    .await?;
                let _ = conn.shutdown().await;
                return Ok(());
            }
        };

        let result = Self::run_session(
            &mut conn,
            &id,
            &registration,
            &group,
            &mut outbound_rx,
            shutdown.as_mut(),
        )
        .await;

        // No-op when the heartbeat monitor already removed this registration
        group.depart_registration(&id, &registration, DepartureReason::Left);
        let _ = conn.shutdown().await;

        result
    }

    /// Session loop of a registered member.
    async fn run_session(
        conn: &mut ClientConnection,
        id: &str,
        registration: &Registration,
        group: &Group,
        outbound_rx: &mut mpsc::Receiver<String>,
        mut shutdown: Pin<&mut Notified<'_>>,
    ) -> Result<(), ServerError> {
        let accepted = HandshakeReply::Accepted {
            id: id.to_string(),
            is_coordinator: registration.is_coordinator,
        };
        conn.write_line(&accepted.to_line()).await?;
        conn.write_line(&group.welcome_message(id, registration).encode())
            .await?;
        group.announce_join(id);

        info!(
            "{} joined from {} (coordinator: {})",
            id,
            conn.peer_addr(),
            registration.coordinator_id
        );

        loop {
            tokio::select! {
                line = conn.read_line() => {
                    let Some(line) = line? else {
                        info!("Connection closed: {} ({})", id, conn.peer_addr());
                        return Ok(());
                    };
                    if Self::process_line(conn, id, &line, group).await? == Flow::Close {
                        return Ok(());
                    }
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(line) => conn.write_line(&line).await?,
                        None => {
                            // Handle dropped by the registry
                            info!("{} was removed from the group, closing session", id);
                            let notice = Message::system_to(
                                id,
                                "You have been removed from the group (no heartbeat response)",
                            );
                            conn.write_line(&notice.encode()).await?;
                            return Ok(());
                        }
                    }
                }
                _ = &mut shutdown => {
                    debug!("Session {} shutting down", id);
                    let notice = Message::system_to(id, "Server is shutting down");
                    let _ = conn.write_line(&notice.encode()).await;
                    return Ok(());
                }
            }
        }
    }

    /// Process one line from a registered member.
    async fn process_line(
        conn: &mut ClientConnection,
        id: &str,
        line: &str,
        group: &Group,
    ) -> Result<Flow, ServerError> {
        let Some(input) = ClientInput::parse(line) else {
            return Ok(Flow::Continue);
        };

        match input {
            ClientInput::Command(command) => {
                let reply = match command {
                    Command::Who => group.registry().formatted_member_list(),
                    Command::Help => HELP_TEXT.to_string(),
                    Command::Quit => {
                        info!("{} requested to leave", id);
                        let goodbye = Message::system_to(id, format!("Goodbye, {}", id));
                        conn.write_line(&goodbye.encode()).await?;
                        return Ok(Flow::Close);
                    }
                    Command::Unknown(cmd) => {
                        format!("Unknown command: {}. Type /help for help.", cmd)
                    }
                };
                conn.write_line(&Message::system_to(id, reply).encode())
                    .await?;
            }

            ClientInput::Private { recipient, content } => {
                group.route(
                    &Message::private(id, recipient, content),
                    SenderPolicy::Exclude,
                );
            }

            ClientInput::Broadcast(content) => {
                group.route(&Message::broadcast(id, content), SenderPolicy::Exclude);
            }

            ClientInput::Message(mut msg) => {
                msg.sender = Some(id.to_string());

                match msg.kind {
                    MessageKind::Pong => {
                        group.registry().touch_liveness(id);
                    }
                    MessageKind::Ping => {
                        group.registry().touch_liveness(id);
                        conn.write_line(&Message::pong(SERVER_SENDER).encode())
                            .await?;
                    }
                    MessageKind::System => {
                        warn!("{} tried to send a SYSTEM message", id);
                        let reply =
                            Message::system_to(id, "Members cannot send SYSTEM messages");
                        conn.write_line(&reply.encode()).await?;
                    }
                    MessageKind::Broadcast | MessageKind::Private => {
                        group.route(&msg, SenderPolicy::Exclude);
                    }
                }
            }
        }

        Ok(Flow::Continue)
    }

    /// Signal the server and every session to shut down.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Get the current member count.
    pub fn member_count(&self) -> usize {
        self.group.registry().count()
    }

    /// Check if server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get delivery statistics.
    pub fn delivery_stats(&self) -> DeliveryStatsSnapshot {
        self.group.router().stats()
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<ConnectionError> for ServerError {
    fn from(e: ConnectionError) -> Self {
        Self::Io(e.to_string())
    }
}
