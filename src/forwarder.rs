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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SocketTuning;
use crate::entry::HostPort;
use crate::relay::{pair, Connection};

const BIND_MAX_ATTEMPTS: u32 = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One port-forwarding definition: a listening socket on `local_port` whose
/// accepted connections are each relayed to `target`.
///
/// States: unbound → bound → closed, with an error path unbound → closed when
/// binding exhausts its retries. Close is idempotent and cooperative: it
/// cancels the accept loop rather than force-closing active relays, which are
/// torn down individually by their own error/close paths.
pub struct Forwarder {
    local_port: u16,
    target: HostPort,
    tuning: SocketTuning,
    bound: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Forwarder {
    pub fn new(local_port: u16, target: HostPort, tuning: SocketTuning) -> Arc<Self> {
        Arc::new(Self {
            local_port,
            target,
            tuning,
            bound: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Bind the listening socket and run the accept loop until closed.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        debug!("forwarding local port {} to {}", self.local_port, self.target);
        let listener = match self.bind_with_retry().await {
            Ok(listener) => listener,
            Err(error) => {
                self.closed.store(true, Ordering::SeqCst);
                return Err(error);
            }
        };
        self.bound.store(true, Ordering::SeqCst);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Forwarder[{self}] was closed, leaving the accept loop");
                    break;
                }
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted on port {}", self.local_port);
                        if let Err(error) = self.handle_client(stream).await {
                            warn!(%peer, "failed to set up relay to {}: {error:#}", self.target);
                        }
                    }
                    Err(error) => {
                        if self.is_closed() {
                            break;
                        }
                        warn!("accept failed on port {}: {error}", self.local_port);
                        // brief pause to avoid a busy loop on persistent errors
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn bind_with_retry(&self) -> Result<TcpListener> {
        let mut attempts = 0;
        loop {
            match TcpListener::bind(("0.0.0.0", self.local_port)).await {
                Ok(listener) => {
                    debug!(
                        "bound to port {} on attempt {}/{}",
                        self.local_port,
                        attempts + 1,
                        BIND_MAX_ATTEMPTS
                    );
                    return Ok(listener);
                }
                Err(error) if error.kind() == io::ErrorKind::AddrInUse => {
                    attempts += 1;
                    if attempts >= BIND_MAX_ATTEMPTS {
                        return Err(error).with_context(|| {
                            format!(
                                "failed to bind to port {} after {} attempts",
                                self.local_port, BIND_MAX_ATTEMPTS
                            )
                        });
                    }
                    debug!(
                        "could not bind to port {} on attempt {}/{}",
                        self.local_port, attempts, BIND_MAX_ATTEMPTS
                    );
                    tokio::select! {
                        _ = sleep(BIND_RETRY_DELAY) => {}
                        _ = self.cancel.cancelled() => {
                            bail!("forwarder for port {} was closed while binding", self.local_port)
                        }
                    }
                }
                Err(error) => {
                    return Err(error)
                        .with_context(|| format!("failed to bind to port {}", self.local_port));
                }
            }
        }
    }

    /// Dial the target and cross-wire the relay pair for one accepted client.
    /// A dial failure aborts only this client, not the accept loop.
    async fn handle_client(&self, stream: TcpStream) -> Result<()> {
        let client = Connection::accepted(stream, &self.tuning)?;
        let upstream =
            Connection::connect(self.target.host(), self.target.port(), &self.tuning).await?;
        pair::wire(&client, &upstream);
        upstream.start();
        client.start();
        Ok(())
    }

    /// Close this forwarder and release its listening socket. Idempotent.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            debug!("closing Forwarder[{self}]");
            self.bound.store(false, Ordering::SeqCst);
            self.cancel.cancel();
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn target(&self) -> &HostPort {
        &self.target
    }
}

impl fmt::Display for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.local_port, self.target)
    }
}
