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

//! The administration service: the registry of live forwarders, the control
//! protocol server mutating it, and the one-shot client used for
//! out-of-process control.
//!
//! A request is one framed string holding commands separated by `,`, `;` or
//! `|`, executed in order with one response line per command:
//!
//! ```text
//! +<local_port>=<host>:<port>   add a forwarding entry
//! -<local_port>                 remove a forwarding entry
//! list                          list all entries
//! stop                          close all entries and exit the process
//! clear                         close all entries, keep running
//! ```
//!
//! Processing stops at the first `stop`/`clear`; commands after it in the
//! same batch are ignored.

pub mod wire;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::SocketTuning;
use crate::entry::EntryDescriptor;
use crate::forwarder::Forwarder;

const BOUND_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The process-wide registry of forwarders, keyed by local port, and the
/// control plane that mutates it.
///
/// The registry mutex covers every check-then-act sequence, including the
/// create path's wait-until-bound, so concurrent control connections and
/// startup registration cannot race a port into two forwarders.
pub struct Admin {
    registry: Mutex<BTreeMap<u16, Arc<Forwarder>>>,
    tuning: SocketTuning,
}

impl Admin {
    pub fn new(tuning: SocketTuning) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(BTreeMap::new()),
            tuning,
        })
    }

    /// Register and start a forwarder for `desc`, blocking until it is bound
    /// or has failed to bind.
    ///
    /// An occupied port is a conflict: the existing rule is never replaced,
    /// and the error names its target. A bind failure removes the
    /// registration again and is surfaced to the caller.
    pub async fn create_entry(&self, desc: &EntryDescriptor) -> Result<Arc<Forwarder>> {
        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.get(&desc.port()) {
            bail!(
                "Port {} is already mapped to {}, cannot map it again to {}",
                desc.port(),
                existing.target(),
                desc.target()
            );
        }

        let forwarder = Forwarder::new(desc.port(), desc.target().clone(), self.tuning.clone());
        registry.insert(desc.port(), Arc::clone(&forwarder));

        let task = Arc::clone(&forwarder);
        tokio::spawn(async move {
            let label = task.to_string();
            if let Err(e) = Arc::clone(&task).run().await {
                error!("Forwarder[{label}] terminated: {e:#}");
            }
        });

        while !forwarder.is_bound() && !forwarder.is_closed() {
            sleep(BOUND_POLL_INTERVAL).await;
        }
        if !forwarder.is_bound() {
            registry.remove(&desc.port());
            bail!("could not bind to local port {}", desc.port());
        }

        info!("forwarding local port {} to {}", desc.port(), desc.target());
        Ok(forwarder)
    }

    /// Remove the entry for `port` and close its forwarder.
    pub async fn remove_entry(&self, port: u16) -> Result<String> {
        let mut registry = self.registry.lock().await;
        match registry.remove(&port) {
            Some(forwarder) => {
                forwarder.close();
                Ok(format!("port definition for '{port}' was removed"))
            }
            None => bail!("port '{port}' was not defined and couldn't be removed"),
        }
    }

    /// Render a point-in-time snapshot of the registry, ordered by port.
    pub async fn list_entries(&self) -> String {
        let registry = self.registry.lock().await;
        if registry.is_empty() {
            return "No entry defined".to_string();
        }
        let mut out = String::from("List of entries:");
        for forwarder in registry.values() {
            out.push_str("\n- ");
            out.push_str(&forwarder.to_string());
        }
        out
    }

    /// Close every registered forwarder and clear the registry. Does not
    /// terminate the process.
    pub async fn stop_all(&self) -> String {
        let mut registry = self.registry.lock().await;
        for forwarder in registry.values() {
            forwarder.close();
        }
        registry.clear();
        "the application is now ready to terminate".to_string()
    }

    /// Run the control-protocol server on `port`. Each accepted connection
    /// carries one request and receives one response.
    pub async fn run_server(self: Arc<Self>, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind the admin service to port {port}"))?;
        println!("admin service running on port {port}");
        info!("admin service running on port {port}");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    // a failed accept must not take the forwarders down
                    warn!("admin service accept failed: {error}");
                    sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let admin = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = admin.serve(stream).await {
                    error!(%peer, "control connection failed: {e:#}");
                }
            });
        }
    }

    async fn serve(&self, mut stream: TcpStream) -> Result<()> {
        let request = wire::read_string(&mut stream).await?;
        debug!("received commands '{request}'");
        let (response, stop) = self.execute_batch(&request).await;
        wire::write_string(&mut stream, &response).await?;
        if stop {
            info!("stop requested, exiting");
            std::process::exit(0);
        }
        Ok(())
    }

    /// Execute one command batch, accumulating one response line per token.
    /// Returns the response and whether the process should exit after it is
    /// sent.
    async fn execute_batch(&self, request: &str) -> (String, bool) {
        let mut response = String::new();
        let mut stop = false;
        for token in request.split([',', ';', '|']) {
            let cmd = token.trim();
            debug!("processing command '{cmd}'");
            if cmd.starts_with("stop") || cmd.starts_with("clear") {
                // terminal for the batch: any remaining tokens are ignored
                response.push_str(&self.stop_all().await);
                response.push('\n');
                stop = cmd.starts_with("stop");
                break;
            }
            let line = if cmd.starts_with("list") {
                self.list_entries().await
            } else if let Some(rest) = cmd.strip_prefix('+') {
                match self.execute_set(rest).await {
                    Ok(line) => line,
                    Err(e) => e.to_string(),
                }
            } else if let Some(rest) = cmd.strip_prefix('-') {
                match self.execute_remove(rest).await {
                    Ok(line) => line,
                    Err(e) => e.to_string(),
                }
            } else {
                format!("Command not understood, ignoring it: {cmd}")
            };
            response.push_str(&line);
            response.push('\n');
        }
        (response, stop)
    }

    async fn execute_set(&self, definition: &str) -> Result<String> {
        let desc = EntryDescriptor::parse(definition)?;
        self.create_entry(&desc).await?;
        Ok(format!(
            "forwarding port {} to {}",
            desc.port(),
            desc.target()
        ))
    }

    async fn execute_remove(&self, port_str: &str) -> Result<String> {
        let port = port_str
            .trim()
            .parse::<u16>()
            .map_err(|_| anyhow!("'{port_str}' is not a valid port number"))?;
        self.remove_entry(port).await
    }

    /// Send one command batch to a running admin service and return its
    /// response. The out-of-process control client.
    pub async fn execute_command(
        host: &str,
        port: u16,
        command: &str,
        tuning: &SocketTuning,
    ) -> Result<String> {
        let mut stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("failed to connect to the admin service at {host}:{port}"))?;
        tuning.apply(&stream)?;
        wire::write_string(&mut stream, command).await?;
        wire::read_string(&mut stream).await
    }
}
