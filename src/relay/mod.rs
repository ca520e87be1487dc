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

//! The per-connection relay engine.
//!
//! A [`Connection`] owns one established socket and runs an independent
//! receive task and send task. Registered listeners are notified of incoming
//! data and of terminal I/O errors. [`pair::wire`] cross-registers two
//! connections so that data received on one is enqueued for send on the
//! other, and a fatal error on either leg tears down both.

pub mod connection;
pub mod pair;

pub use connection::{Connection, ConnectionEvent, ConnectionListener};
