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

//! Tablet location discovery and caching.
//!
//! Tablet locations resolve recursively through a three level hierarchy: the
//! root tablet names the metadata tablets, the metadata tablets name the user
//! tablets. [`TabletCache`] caches one table's routings and refreshes them
//! lazily through its parent locator; [`RootTabletLocator`] anchors the
//! recursion in the liveness registry. Every location handed out is fenced by
//! the owning server's session token: a routing whose server lost its session
//! is evicted, never returned.

mod cache;
mod registry;
mod root;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

pub use self::cache::TabletCache;
pub use self::registry::LocatorRegistry;
pub use self::root::RootTabletLocator;
use crate::cluster::{ServerId, SessionId};
use crate::data::{BinnedMutations, BinnedRanges, Mutation, RowRange};
use crate::extent::KeyExtent;

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("tablet {row} has multiple locations: {first} and {second}")]
    InconsistentMetadata { row: String, first: ServerId, second: ServerId },
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl LocatorError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }
}

pub type Result<T, E = LocatorError> = std::result::Result<T, E>;

/// A tablet routing: where one tablet is currently hosted, fenced by the
/// hosting server's session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabletLocation {
    pub extent: KeyExtent,
    pub server: ServerId,
    pub session: SessionId,
}

impl TabletLocation {
    pub fn new(extent: KeyExtent, server: ServerId, session: SessionId) -> Self {
        Self { extent, server, session }
    }
}

/// The outcome of one metadata read: tablets with a live location column and
/// tablets registered without one. Locationless tablets populate nothing but
/// prove the metadata region is not empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TabletLocations {
    pub locations: Vec<TabletLocation>,
    pub locationless: Vec<KeyExtent>,
}

impl TabletLocations {
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty() && self.locationless.is_empty()
    }
}

/// The capability set shared by every locator in the hierarchy. Parents are
/// referenced through this trait, never through a concrete type.
#[async_trait]
pub trait TabletLocator: Send + Sync {
    /// Resolves the tablet owning `row`, or the one owning its immediate
    /// successor when `skip_row` is set. With `retry` the call keeps
    /// refreshing on a fixed backoff until a routing appears; without it a
    /// hole answers `None`.
    async fn locate_tablet(&self, row: &[u8], skip_row: bool, retry: bool) -> Result<Option<TabletLocation>>;

    /// Groups `ranges` by destination server and extent into `binned`,
    /// returning the ranges that could not be fully covered.
    async fn bin_ranges(&self, ranges: Vec<RowRange>, binned: &mut BinnedRanges) -> Result<Vec<RowRange>>;

    /// Routes each mutation to the server and extent owning its row, or into
    /// `failures`.
    async fn bin_mutations(
        &self,
        mutations: Vec<Mutation>,
        binned: &mut BinnedMutations,
        failures: &mut Vec<Mutation>,
    ) -> Result<()>;

    /// Drops every cached entry overlapping `extent`.
    async fn invalidate_extent(&self, extent: &KeyExtent);

    /// Queues `extents` for eviction and batched refresh on next access.
    async fn invalidate_extents(&self, extents: Vec<KeyExtent>);

    /// Drops every cached entry hosted by `server` and the lock checker's
    /// memo of it.
    async fn invalidate_server(&self, server: &ServerId);

    /// Drops the whole cache.
    async fn invalidate_all(&self);
}

/// Reads tablet location records out of a parent metadata tablet. The wire
/// transport behind it is external; implementations must be thread safe and
/// report transport failures to `parent_locator` themselves.
#[async_trait]
pub trait LocationObtainer: Send + Sync {
    /// Reads the metadata tablet `parent` for the tablet registered at or
    /// after `row`, scanning no further than `stop_row`. `None` signals a
    /// transport failure already reported to `parent_locator`.
    async fn lookup_tablet(
        &self,
        parent: &TabletLocation,
        row: &[u8],
        stop_row: &[u8],
        parent_locator: &dyn TabletLocator,
    ) -> Result<Option<TabletLocations>>;

    /// Batched form: reads each metadata extent of `lookups` on `server` for
    /// the given metadata row ranges. Extents that fail are reported to
    /// `parent_locator` and omitted from the result.
    async fn lookup_tablets(
        &self,
        server: &ServerId,
        lookups: &HashMap<KeyExtent, Vec<RowRange>>,
        parent_locator: &dyn TabletLocator,
    ) -> Result<Vec<TabletLocation>>;
}

/// Answers whether a server still holds its session token, from a cached
/// view of the liveness registry.
pub trait TabletLockChecker: Send + Sync {
    fn is_lock_held(&self, server: &ServerId, session: &SessionId) -> bool;

    fn invalidate_cache(&self, server: &ServerId);
}
