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

//! Parsing of forwarding rule definitions.
//!
//! A rule has the form `<local_port>=<host>:<port>`. The target side is split
//! on the *last* colon so IPv6 literals (`[::1]:8080`) parse correctly;
//! brackets are stripped for storage and restored when rendering.

use std::fmt;

use anyhow::{anyhow, bail, Result};

/// An immutable host + port endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    host: String,
    port: u16,
    ipv6_literal: bool,
}

impl HostPort {
    /// Parse a `<host>:<port>` string, tolerating bracketed IPv6 literals.
    pub fn parse(source: &str) -> Result<Self> {
        let trimmed = source.trim();
        let (body, ipv6_literal) = if trimmed.starts_with('[') {
            (trimmed.replace(['[', ']'], ""), true)
        } else {
            (trimmed.to_string(), false)
        };
        let idx = body
            .rfind(':')
            .ok_or_else(|| anyhow!("'{source}' is not a valid <host>:<port> target"))?;
        let host = body[..idx].to_string();
        if host.is_empty() {
            bail!("'{source}' is not a valid <host>:<port> target");
        }
        let port_str = &body[idx + 1..];
        let port = port_str
            .trim()
            .parse::<u16>()
            .map_err(|_| anyhow!("'{port_str}' is not a valid port number"))?;
        Ok(Self {
            host,
            port,
            ipv6_literal,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ipv6_literal(&self) -> bool {
        self.ipv6_literal
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ipv6_literal {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One forwarding rule: a local port and the target it relays to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDescriptor {
    port: u16,
    target: HostPort,
}

impl EntryDescriptor {
    /// Parse a combined `<local_port>=<host>:<port>` definition. Surrounding
    /// whitespace is ignored.
    pub fn parse(desc: &str) -> Result<Self> {
        let desc = desc.trim();
        let invalid = || {
            anyhow!("'{desc}' is not a valid forwarding definition, expected <local_port>=<host>:<port>")
        };
        let idx = desc.find('=').ok_or_else(invalid)?;
        let (port_str, target) = (&desc[..idx], &desc[idx + 1..]);
        if port_str.is_empty() || !port_str.bytes().all(|b| b.is_ascii_digit()) || target.is_empty()
        {
            return Err(invalid());
        }
        Self::from_parts(port_str, target)
    }

    /// Build a descriptor from a pre-split port string and target string.
    pub fn from_parts(port_str: &str, target: &str) -> Result<Self> {
        let port = port_str
            .trim()
            .parse::<u16>()
            .map_err(|_| anyhow!("'{port_str}' is not a valid port number, ignoring it"))?;
        let target = HostPort::parse(target)?;
        Ok(Self { port, target })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn target(&self) -> &HostPort {
        &self.target
    }
}

impl fmt::Display for EntryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.port, self.target)
    }
}
