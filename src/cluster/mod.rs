// Copyright 2024 The RangeDB Authors.
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

//! Cached views over the cluster liveness registry.
//!
//! Servers register themselves in the registry: a session token node one
//! level below the per server path while the server lives, and the root
//! tablet's location at a well known path. The locator only ever reads the
//! registry through [`LivenessRegistry`], a cached multi-reader view.

mod etcd;
mod memory;

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use anyhow::{bail, Result};
use compact_str::CompactString;

pub use self::etcd::EtcdRegistry;
pub use self::memory::MemoryRegistry;
use crate::locator::TabletLockChecker;

/// A server address of the form `host:port`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ServerId(CompactString);

impl ServerId {
    pub fn new(server: impl Into<CompactString>) -> Self {
        Self(server.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ServerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A server minted liveness token, reissued whenever the server reregisters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SessionId(CompactString);

impl SessionId {
    pub fn new(session: impl Into<CompactString>) -> Self {
        Self(session.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry paths, relative to the cluster root.
pub mod paths {
    use super::{ServerId, SessionId};

    /// The root tablet's location node.
    pub const ROOT_TABLET: &str = "/root_tablet";

    pub fn server(server: &ServerId) -> String {
        format!("/servers/{server}")
    }

    pub fn server_session(server: &ServerId, session: &SessionId) -> String {
        format!("/servers/{server}/{session}")
    }
}

/// Tag prefixing server session token blobs.
pub const SERVICE_TAG: &str = "SRV";

/// Formats the blob a server writes to its session token node.
pub fn format_session_token(server: &ServerId) -> Vec<u8> {
    format!("{SERVICE_TAG}|{server}").into_bytes()
}

/// Formats the blob stored at the root tablet location node.
pub fn format_root_location(server: &ServerId, session: &SessionId) -> Vec<u8> {
    format!("{server}|{session}").into_bytes()
}

/// Parses the root tablet location blob, `host:port|session`.
pub fn parse_root_location(blob: &[u8]) -> Result<(ServerId, SessionId)> {
    let text = std::str::from_utf8(blob)?;
    let Some((server, session)) = text.split_once('|') else {
        bail!("malformed root tablet location: {}", text)
    };
    if server.is_empty() || session.is_empty() {
        bail!("malformed root tablet location: {}", text)
    }
    Ok((ServerId::new(server), SessionId::new(session)))
}

/// A cached, multi-reader view over the registry namespace. Reads never touch
/// the network; `invalidate` drops cached nodes so a stale view cannot
/// outlive an explicit eviction.
pub trait LivenessRegistry: Send + Sync {
    fn get(&self, path: &str) -> Option<Vec<u8>>;

    fn invalidate(&self, path: &str);
}

/// Answers lock liveness questions from the cached registry view: a session
/// is held exactly while its token node exists.
pub struct RegistryLockChecker {
    registry: Arc<dyn LivenessRegistry>,
}

impl RegistryLockChecker {
    pub fn new(registry: Arc<dyn LivenessRegistry>) -> Self {
        Self { registry }
    }
}

impl TabletLockChecker for RegistryLockChecker {
    fn is_lock_held(&self, server: &ServerId, session: &SessionId) -> bool {
        self.registry.get(&paths::server_session(server, session)).is_some()
    }

    fn invalidate_cache(&self, server: &ServerId) {
        self.registry.invalidate(&paths::server(server));
    }
}
