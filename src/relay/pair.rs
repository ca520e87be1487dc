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

use std::sync::Arc;

use tracing::{debug, trace};

use super::connection::{Connection, ConnectionEvent, ConnectionListener};

/// Forwards data events from one connection to its paired connection, and
/// closes the pair's other leg when a fatal error is raised.
struct RelayListener {
    other: Arc<Connection>,
}

impl ConnectionListener for RelayListener {
    fn data_received(&self, event: &ConnectionEvent) {
        if let Some(data) = &event.data {
            trace!(bytes = data.len(), to = %self.other, "relaying");
            self.other.send(data.clone());
        }
    }

    fn error_raised(&self, event: &ConnectionEvent) {
        if let Some(error) = &event.error {
            debug!(from = %event.source, %error, "closing peer leg after error");
        }
        self.other.close();
    }
}

/// Cross-wire two connections into a relay pair: data received on either leg
/// is enqueued for send on the other, and a terminal error on either leg
/// closes both. Call before starting either connection's loops.
pub fn wire(client: &Arc<Connection>, upstream: &Arc<Connection>) {
    client.add_listener(Arc::new(RelayListener {
        other: Arc::clone(upstream),
    }));
    upstream.add_listener(Arc::new(RelayListener {
        other: Arc::clone(client),
    }));
}
