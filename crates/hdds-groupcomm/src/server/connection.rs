// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client connection handling for the group server.

use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A connected client speaking the newline-delimited protocol.
pub struct ClientConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer_addr: SocketAddr,
    max_line_length: usize,
    line_buf: Vec<u8>,
}

impl ClientConnection {
    /// Create a new client connection.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, max_line_length: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer_addr,
            max_line_length,
            line_buf: Vec::with_capacity(256),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read one line, without its terminator.
    ///
    /// Returns `Ok(None)` once the peer closed the connection. Cancel safe:
    /// a partially received line is kept for the next call.
    pub async fn read_line(&mut self) -> Result<Option<String>, ConnectionError> {
        loop {
            let budget = (self.max_line_length + 1).saturating_sub(self.line_buf.len());
            let n = (&mut self.reader)
                .take(budget as u64)
                .read_until(b'\n', &mut self.line_buf)
                .await?;

            if self.line_buf.last() == Some(&b'\n') {
                return Ok(Some(self.take_line()));
            }
            if self.line_buf.len() > self.max_line_length {
                self.line_buf.clear();
                return Err(ConnectionError::LineTooLong(self.max_line_length));
            }
            if n == 0 {
                // EOF, flush a final unterminated line first
                if self.line_buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> String {
        while matches!(self.line_buf.last(), Some(b'\n') | Some(b'\r')) {
            self.line_buf.pop();
        }
        let line = String::from_utf8_lossy(&self.line_buf).into_owned();
        self.line_buf.clear();
        line
    }

    /// Write one line and flush.
    pub async fn write_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shutdown the write side of the connection.
    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Connection error types.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: line exceeds {0} bytes")]
    LineTooLong(usize),
}
