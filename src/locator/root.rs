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

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::{Result, TabletLocation, TabletLocator, TabletLockChecker};
use crate::cluster::{self, LivenessRegistry, ServerId};
use crate::data::{BinnedMutations, BinnedRanges, Mutation, RowRange, TabletServerMutations};
use crate::extent::KeyExtent;

const ROOT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Locator of the singleton root tablet. There is nothing to cache: the
/// location is read from the registry's well known root path on every
/// resolution, and fenced like any other routing.
pub struct RootTabletLocator {
    registry: Arc<dyn LivenessRegistry>,
    lock_checker: Arc<dyn TabletLockChecker>,
}

impl RootTabletLocator {
    pub fn new(registry: Arc<dyn LivenessRegistry>, lock_checker: Arc<dyn TabletLockChecker>) -> Self {
        Self { registry, lock_checker }
    }

    fn root_location(&self) -> Option<TabletLocation> {
        let blob = self.registry.get(cluster::paths::ROOT_TABLET)?;
        let (server, session) = match cluster::parse_root_location(&blob) {
            Ok(location) => location,
            Err(err) => {
                debug!("ignoring root tablet location: {}", err);
                return None;
            },
        };
        if self.lock_checker.is_lock_held(&server, &session) {
            Some(TabletLocation::new(KeyExtent::root(), server, session))
        } else {
            trace!("root tablet server {} no longer holds session {}", server, session);
            None
        }
    }
}

#[async_trait]
impl TabletLocator for RootTabletLocator {
    async fn locate_tablet(&self, _row: &[u8], _skip_row: bool, retry: bool) -> Result<Option<TabletLocation>> {
        let mut location = self.root_location();
        while retry && location.is_none() {
            tokio::time::sleep(ROOT_RETRY_DELAY).await;
            location = self.root_location();
        }
        Ok(location)
    }

    async fn bin_ranges(&self, ranges: Vec<RowRange>, binned: &mut BinnedRanges) -> Result<Vec<RowRange>> {
        let Some(location) = self.root_location() else {
            return Ok(ranges);
        };
        binned.entry(location.server).or_default().entry(location.extent).or_default().extend(ranges);
        Ok(Vec::new())
    }

    async fn bin_mutations(
        &self,
        mutations: Vec<Mutation>,
        binned: &mut BinnedMutations,
        failures: &mut Vec<Mutation>,
    ) -> Result<()> {
        match self.root_location() {
            Some(location) => {
                let bin = binned
                    .entry(location.server)
                    .or_insert_with(|| TabletServerMutations::new(location.session.clone()));
                for mutation in mutations {
                    bin.add(location.extent.clone(), mutation);
                }
            },
            None => failures.extend(mutations),
        }
        Ok(())
    }

    async fn invalidate_extent(&self, _extent: &KeyExtent) {}

    async fn invalidate_extents(&self, _extents: Vec<KeyExtent>) {}

    async fn invalidate_server(&self, server: &ServerId) {
        self.lock_checker.invalidate_cache(server);
        self.registry.invalidate(&cluster::paths::server(server));
        self.registry.invalidate(cluster::paths::ROOT_TABLET);
    }

    async fn invalidate_all(&self) {}
}
