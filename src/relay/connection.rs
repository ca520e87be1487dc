// Copyright 2025 the Portward authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::SocketTuning;

/// Notification raised by a connection's receive or send task. Exactly one of
/// `data` / `error` is set, and each event is delivered once per listener.
pub struct ConnectionEvent {
    pub source: Arc<Connection>,
    pub data: Option<Vec<u8>>,
    pub error: Option<io::Error>,
}

/// Callbacks invoked synchronously from a connection's receive and send
/// tasks. Implementations must not block beyond the time to enqueue a send.
pub trait ConnectionListener: Send + Sync {
    fn data_received(&self, event: &ConnectionEvent);
    fn error_raised(&self, event: &ConnectionEvent);
}

/// Message on the outbound queue. `Shutdown` unblocks the send loop once the
/// receive side has failed, so it exits instead of waiting forever.
enum Outbound {
    Data(Vec<u8>),
    Shutdown,
}

/// A network connection with the ability to notify registered listeners of
/// incoming data and I/O errors.
///
/// The receive task reads into a reusable scratch buffer and copies exactly
/// the bytes read into a fresh buffer before dispatching, so listeners never
/// observe the scratch buffer being overwritten by the next read. The send
/// task drains the outbound queue in FIFO order.
pub struct Connection {
    peer: String,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    read_buffer_size: usize,
    total_read: AtomicU64,
    total_written: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Connection {
    /// Wrap an accepted socket, applying the configured tuning.
    pub fn accepted(stream: TcpStream, tuning: &SocketTuning) -> Result<Arc<Self>> {
        tuning.apply(&stream)?;
        let conn = Self::from_stream(stream, tuning.read_buffer_size);
        debug!("created {conn}");
        Ok(conn)
    }

    /// Dial `host:port` and wrap the resulting socket.
    pub async fn connect(host: &str, port: u16, tuning: &SocketTuning) -> Result<Arc<Self>> {
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("failed to connect to {host}:{port}"))?;
        tuning.apply(&stream)?;
        let conn = Self::from_stream(stream, tuning.read_buffer_size);
        debug!("opened {conn}");
        Ok(conn)
    }

    fn from_stream(stream: TcpStream, read_buffer_size: usize) -> Arc<Self> {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            peer,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            listeners: RwLock::new(Vec::new()),
            read_buffer_size,
            total_read: AtomicU64::new(0),
            total_written: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the receive and send tasks. Call once, after listeners for the
    /// relay wiring are registered.
    pub fn start(self: &Arc<Self>) {
        debug!(peer = %self.peer, "starting sender and receiver");
        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.send_loop().await });
        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.receive_loop().await });
    }

    /// Queue `data` for transmission. Never blocks: the outbound queue is
    /// unbounded. Data queued after close is dropped.
    pub fn send(&self, data: Vec<u8>) {
        if self.closed.load(Ordering::SeqCst) {
            trace!(peer = %self.peer, "dropping {} bytes queued after close", data.len());
            return;
        }
        trace!(peer = %self.peer, bytes = data.len(), "queueing");
        if self.outbound_tx.send(Outbound::Data(data)).is_err() {
            trace!(peer = %self.peer, "outbound queue is gone, dropping buffer");
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Close the connection. Idempotent: a compare-and-set guard makes
    /// concurrent invocations (peer cascade + administrative removal) a
    /// no-op after the first.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            debug!("closing {self}");
            let _ = self.outbound_tx.send(Outbound::Shutdown);
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn total_read(&self) -> u64 {
        self.total_read.load(Ordering::Relaxed)
    }

    pub fn total_written(&self) -> u64 {
        self.total_written.load(Ordering::Relaxed)
    }

    async fn receive_loop(self: Arc<Self>) {
        let reader = match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut reader) = reader else {
            return;
        };
        let mut buffer = vec![0u8; self.read_buffer_size];
        debug!(peer = %self.peer, "starting receiver");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = reader.read(&mut buffer) => match result {
                    Ok(0) => {
                        self.raise_error(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("EOF on {}", self.peer),
                        ));
                        break;
                    }
                    Ok(n) => {
                        self.total_read.fetch_add(n as u64, Ordering::Relaxed);
                        trace!(peer = %self.peer, bytes = n, "read");
                        let event = ConnectionEvent {
                            source: Arc::clone(&self),
                            data: Some(buffer[..n].to_vec()),
                            error: None,
                        };
                        for listener in self.listeners_snapshot() {
                            listener.data_received(&event);
                        }
                    }
                    Err(error) => {
                        self.raise_error(error);
                        break;
                    }
                }
            }
        }
        debug!(peer = %self.peer, "ending receiver");
    }

    async fn send_loop(self: Arc<Self>) {
        let writer = match self.writer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut writer) = writer else {
            return;
        };
        let rx = match self.outbound_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut rx) = rx else {
            return;
        };
        debug!(peer = %self.peer, "starting sender");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(Outbound::Data(data)) => {
                        if let Err(error) = Self::write_all(&mut writer, &data).await {
                            self.raise_error(error);
                            break;
                        }
                        self.total_written.fetch_add(data.len() as u64, Ordering::Relaxed);
                        trace!(peer = %self.peer, bytes = data.len(), "sent");
                    }
                    Some(Outbound::Shutdown) | None => break,
                }
            }
        }
        let _ = writer.shutdown().await;
        debug!(peer = %self.peer, "ending sender");
    }

    async fn write_all(writer: &mut OwnedWriteHalf, data: &[u8]) -> io::Result<()> {
        writer.write_all(data).await?;
        writer.flush().await
    }

    /// Close the connection and dispatch exactly one error event for the
    /// failed loop. Closing pushes the shutdown sentinel and cancels, so the
    /// sibling loop terminates promptly and `is_closed` reflects the death.
    fn raise_error(self: &Arc<Self>, error: io::Error) {
        debug!(peer = %self.peer, %error, "connection error");
        self.close();
        let event = ConnectionEvent {
            source: Arc::clone(self),
            data: None,
            error: Some(error),
        };
        for listener in self.listeners_snapshot() {
            listener.error_raised(&event);
        }
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn ConnectionListener>> {
        match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connection[{}, total_read={}, total_written={}]",
            self.peer,
            self.total_read(),
            self.total_written()
        )
    }
}
