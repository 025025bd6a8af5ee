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

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::{LocationObtainer, LocatorError, Result, TabletLocation, TabletLocator, TabletLockChecker};
use crate::cluster::{ServerId, SessionId};
use crate::data::{BinnedMutations, BinnedRanges, Mutation, RowRange, TabletServerMutations};
use crate::extent::{KeyExtent, TableId};
use crate::keys::{self, Row};

const LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Cache key: a tablet's end row, with the unbounded tablet keyed greatest.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum EndRowKey {
    Row(Row),
    Max,
}

impl EndRowKey {
    fn of(extent: &KeyExtent) -> Self {
        match extent.end_row() {
            Some(end) => Self::Row(end.to_vec()),
            None => Self::Max,
        }
    }
}

#[derive(Default)]
struct MetaCache {
    entries: BTreeMap<EndRowKey, TabletLocation>,
    bad_extents: HashSet<KeyExtent>,
}

impl MetaCache {
    /// The cached tablet owning `row`, if any: the first entry with
    /// end row >= `row`, provided its previous end row lies below `row`.
    /// Anything else is a hole.
    fn locate(&self, row: &[u8]) -> Option<&TabletLocation> {
        let from = Bound::Included(EndRowKey::Row(row.to_vec()));
        let (_, location) = self.entries.range((from, Bound::Unbounded)).next()?;
        match location.extent.prev_end_row() {
            Some(prev) if prev >= row => None,
            _ => Some(location),
        }
    }
}

/// Deletes every cached entry overlapping `extent`: starting from the first
/// entry whose end row lies beyond the extent's previous end row, delete until
/// an entry starts at or beyond the extent's end row.
fn remove_overlapping(entries: &mut BTreeMap<EndRowKey, TabletLocation>, extent: &KeyExtent) {
    let from = match extent.prev_end_row() {
        None => Bound::Unbounded,
        Some(prev) => Bound::Excluded(EndRowKey::Row(prev.to_vec())),
    };
    let mut doomed = Vec::new();
    for (key, location) in entries.range((from, Bound::Unbounded)) {
        let stop = match (location.extent.prev_end_row(), extent.end_row()) {
            (Some(prev), Some(end)) => prev >= end,
            _ => false,
        };
        if stop {
            break;
        }
        doomed.push(key.clone());
    }
    for key in doomed {
        entries.remove(&key);
    }
}

/// Per operation memo of lock checks: the registry backed checker is shared
/// process wide, so one verdict per (server, session) pair per operation is
/// enough and keeps it off the hot path.
struct LockSession<'a> {
    checker: &'a dyn TabletLockChecker,
    held: HashSet<(ServerId, SessionId)>,
    lost: HashSet<(ServerId, SessionId)>,
}

impl<'a> LockSession<'a> {
    fn new(checker: &'a dyn TabletLockChecker) -> Self {
        Self { checker, held: HashSet::new(), lost: HashSet::new() }
    }

    /// Passes `location` through only while its server still holds the
    /// session it was cached under.
    fn check(&mut self, location: Option<&TabletLocation>) -> Option<TabletLocation> {
        let location = location?;
        let key = (location.server.clone(), location.session.clone());
        if self.held.contains(&key) {
            return Some(location.clone());
        }
        if self.lost.contains(&key) {
            return None;
        }
        if self.checker.is_lock_held(&location.server, &location.session) {
            self.held.insert(key);
            Some(location.clone())
        } else {
            trace!("server {} no longer holds session {}", location.server, location.session);
            self.lost.insert(key);
            None
        }
    }
}

/// The per table locator: an ordered cache of tablet routings, refreshed
/// lazily through the parent locator and fenced by server sessions.
pub struct TabletCache {
    table: TableId,
    parent: Arc<dyn TabletLocator>,
    obtainer: Arc<dyn LocationObtainer>,
    lock_checker: Arc<dyn TabletLockChecker>,
    last_meta_row: Row,
    state: RwLock<MetaCache>,
}

impl TabletCache {
    pub fn new(
        table: TableId,
        parent: Arc<dyn TabletLocator>,
        obtainer: Arc<dyn LocationObtainer>,
        lock_checker: Arc<dyn TabletLockChecker>,
    ) -> Self {
        let last_meta_row = keys::last_meta_row(table.as_str());
        Self { table, parent, obtainer, lock_checker, last_meta_row, state: RwLock::new(MetaCache::default()) }
    }

    pub fn table(&self) -> &TableId {
        &self.table
    }

    /// Inserts a freshly obtained location: evict whatever it overlaps, then
    /// cache it unless its server already lost the session, leaving the
    /// region uncovered rather than stale.
    fn update_cache(&self, state: &mut MetaCache, location: TabletLocation, session: &mut LockSession<'_>) -> Result<()> {
        if location.extent.table() != &self.table {
            return Err(anyhow!("unexpected extent {} for table {}", location.extent, self.table).into());
        }
        remove_overlapping(&mut state.entries, &location.extent);
        if session.check(Some(&location)).is_none() {
            return Ok(());
        }
        state.bad_extents.remove(&location.extent);
        state.entries.insert(EndRowKey::of(&location.extent), location);
        Ok(())
    }

    /// Refreshes the cache region around `row` from the parent metadata
    /// tablet. Called with the write lock held.
    async fn lookup_tablet_location(
        &self,
        state: &mut MetaCache,
        row: &[u8],
        retry: bool,
        session: &mut LockSession<'_>,
    ) -> Result<()> {
        let meta_row = keys::meta_row(self.table.as_str(), Some(row));
        let Some(mut parent_location) = self.parent.locate_tablet(&meta_row, false, retry).await? else {
            return Ok(());
        };
        let mut found = self
            .obtainer
            .lookup_tablet(&parent_location, &meta_row, &self.last_meta_row, self.parent.as_ref())
            .await?;
        // A metadata tablet may have been emptied by tablets merging away;
        // walk forward until entries turn up or the table's rows run out.
        while let Some(locations) = &found {
            if !locations.is_empty() {
                break;
            }
            let Some(parent_end_row) = parent_location.extent.end_row() else {
                break;
            };
            if parent_end_row >= self.last_meta_row.as_slice() {
                break;
            }
            let parent_end_row = parent_end_row.to_vec();
            match self.parent.locate_tablet(&parent_end_row, true, retry).await? {
                Some(next) => {
                    parent_location = next;
                    found = self
                        .obtainer
                        .lookup_tablet(&parent_location, &meta_row, &self.last_meta_row, self.parent.as_ref())
                        .await?;
                },
                None => break,
            }
        }
        let Some(locations) = found else {
            return Ok(());
        };
        // One read may return overlapping extents; clip each against the one
        // cached before it so the newer entry does not evict it again.
        let mut last_end_row: Option<Row> = None;
        for location in locations.locations {
            let clip_to = match (&last_end_row, location.extent.prev_end_row()) {
                (Some(last), Some(prev)) if prev < last.as_slice() => Some(last.clone()),
                _ => None,
            };
            let location = match clip_to {
                Some(prev_end_row) => {
                    let clipped = KeyExtent::new(
                        location.extent.table().clone(),
                        location.extent.end_row().map(<[u8]>::to_vec),
                        Some(prev_end_row),
                    );
                    TabletLocation::new(clipped, location.server, location.session)
                },
                None => location,
            };
            last_end_row = location.extent.end_row().map(<[u8]>::to_vec);
            self.update_cache(state, location, session)?;
        }
        Ok(())
    }

    /// Drains deferred invalidations: evict each queued extent, then refresh
    /// the vacated regions in bulk through the batched obtainer call. Called
    /// with the write lock held.
    async fn process_invalidated(&self, state: &mut MetaCache, session: &mut LockSession<'_>) -> Result<()> {
        if state.bad_extents.is_empty() {
            return Ok(());
        }
        let invalidated: Vec<KeyExtent> = state.bad_extents.drain().collect();
        let mut lookups = Vec::with_capacity(invalidated.len());
        for extent in invalidated {
            remove_overlapping(&mut state.entries, &extent);
            lookups.push(extent.to_meta_range());
        }
        debug!("table {}: refreshing {} invalidated extents", self.table, lookups.len());
        let mut binned = BinnedRanges::new();
        // ranges the parent cannot place stay evicted until next lookup
        self.parent.bin_ranges(lookups, &mut binned).await?;
        let mut servers: Vec<ServerId> = binned.keys().cloned().collect();
        servers.shuffle(&mut rand::thread_rng());
        for server in servers {
            let locations = self.obtainer.lookup_tablets(&server, &binned[&server], self.parent.as_ref()).await?;
            for location in locations {
                self.update_cache(state, location, session)?;
            }
        }
        Ok(())
    }

    /// One locate pass: probe under the read lock, and on miss, hole, or lost
    /// lock upgrade to the write lock, re-probe, and refresh from the parent.
    async fn locate_internal(
        &self,
        row: &[u8],
        skip_row: bool,
        retry: bool,
        session: &mut LockSession<'_>,
    ) -> Result<Option<TabletLocation>> {
        let row = if skip_row { keys::successor(row) } else { row.to_vec() };
        {
            let state = self.state.read().await;
            if state.bad_extents.is_empty() {
                if let Some(location) = session.check(state.locate(&row)) {
                    return Ok(Some(location));
                }
            }
        }
        let mut state = self.state.write().await;
        self.process_invalidated(&mut state, session).await?;
        if let Some(location) = session.check(state.locate(&row)) {
            return Ok(Some(location));
        }
        self.lookup_tablet_location(&mut state, &row, retry, session).await?;
        Ok(session.check(state.locate(&row)))
    }

    /// Locate against an already write-locked cache, refreshing on miss.
    async fn locate_locked(
        &self,
        state: &mut MetaCache,
        row: &[u8],
        skip_row: bool,
        session: &mut LockSession<'_>,
    ) -> Result<Option<TabletLocation>> {
        let row = if skip_row { keys::successor(row) } else { row.to_vec() };
        if let Some(location) = session.check(state.locate(&row)) {
            return Ok(Some(location));
        }
        self.lookup_tablet_location(state, &row, false, session).await?;
        Ok(session.check(state.locate(&row)))
    }

    /// Cache-only binning pass: walk each range across the cached tablets,
    /// failing it on the first hole or lost lock.
    fn bin_cached_ranges(
        state: &MetaCache,
        ranges: Vec<RowRange>,
        binned: &mut BinnedRanges,
        session: &mut LockSession<'_>,
    ) -> Vec<RowRange> {
        let mut failures = Vec::new();
        'ranges: for range in ranges {
            let Some(mut location) = session.check(state.locate(&range.locate_row())) else {
                failures.push(range);
                continue;
            };
            let mut covering = Vec::new();
            loop {
                let Some(end_row) = location.extent.end_row().map(<[u8]>::to_vec) else {
                    break;
                };
                if !range.extends_after(&end_row) {
                    break;
                }
                let probe = keys::successor(&end_row);
                match session.check(state.locate(&probe)) {
                    Some(next) => {
                        covering.push(location);
                        location = next;
                    },
                    None => {
                        failures.push(range);
                        continue 'ranges;
                    },
                }
            }
            covering.push(location);
            for location in covering {
                add_range(binned, location, range.clone());
            }
        }
        failures
    }

    /// Lookup binning pass over the leftovers of the cached pass: each range
    /// walks again with metadata refreshes allowed, and fails on its own
    /// holes only.
    async fn bin_lookup_ranges(
        &self,
        state: &mut MetaCache,
        ranges: Vec<RowRange>,
        binned: &mut BinnedRanges,
        session: &mut LockSession<'_>,
    ) -> Result<Vec<RowRange>> {
        let mut failures = Vec::new();
        'ranges: for range in ranges {
            let Some(mut location) = self.locate_locked(state, &range.locate_row(), false, session).await? else {
                failures.push(range);
                continue;
            };
            let mut covering = Vec::new();
            loop {
                let Some(end_row) = location.extent.end_row().map(<[u8]>::to_vec) else {
                    break;
                };
                if !range.extends_after(&end_row) {
                    break;
                }
                match self.locate_locked(state, &end_row, true, session).await? {
                    Some(next) => {
                        covering.push(location);
                        location = next;
                    },
                    None => {
                        failures.push(range);
                        continue 'ranges;
                    },
                }
            }
            covering.push(location);
            for location in covering {
                add_range(binned, location, range.clone());
            }
        }
        Ok(failures)
    }

    /// Routes one located mutation into its server's bin. The bin is pinned
    /// to the session observed at creation; a location carrying any other
    /// session for the same server hands the mutation back as a failure.
    fn add_mutation(
        binned: &mut BinnedMutations,
        location: &TabletLocation,
        mutation: Mutation,
        session: &mut LockSession<'_>,
    ) -> std::result::Result<(), Mutation> {
        match binned.get_mut(&location.server) {
            Some(bin) => {
                if bin.session() == &location.session {
                    bin.add(location.extent.clone(), mutation);
                    Ok(())
                } else {
                    Err(mutation)
                }
            },
            None => {
                if session.check(Some(location)).is_none() {
                    return Err(mutation);
                }
                let bin = binned
                    .entry(location.server.clone())
                    .or_insert_with(|| TabletServerMutations::new(location.session.clone()));
                bin.add(location.extent.clone(), mutation);
                Ok(())
            },
        }
    }
}

fn add_range(binned: &mut BinnedRanges, location: TabletLocation, range: RowRange) {
    binned.entry(location.server).or_default().entry(location.extent).or_default().push(range);
}

#[async_trait]
impl TabletLocator for TabletCache {
    async fn locate_tablet(&self, row: &[u8], skip_row: bool, retry: bool) -> Result<Option<TabletLocation>> {
        loop {
            let mut session = LockSession::new(self.lock_checker.as_ref());
            let location = self.locate_internal(row, skip_row, retry, &mut session).await?;
            if retry && location.is_none() {
                trace!("table {}: no tablet found for row {:?}, retrying", self.table, row);
                tokio::time::sleep(LOOKUP_RETRY_DELAY).await;
                continue;
            }
            return Ok(location);
        }
    }

    async fn bin_ranges(&self, ranges: Vec<RowRange>, binned: &mut BinnedRanges) -> Result<Vec<RowRange>> {
        let mut session = LockSession::new(self.lock_checker.as_ref());
        let failures;
        {
            let state = self.state.read().await;
            if state.bad_extents.is_empty() {
                failures = Self::bin_cached_ranges(&state, ranges, binned, &mut session);
            } else {
                drop(state);
                let mut state = self.state.write().await;
                self.process_invalidated(&mut state, &mut session).await?;
                failures = Self::bin_cached_ranges(&state, ranges, binned, &mut session);
            }
        }
        if failures.is_empty() {
            return Ok(failures);
        }
        let mut state = self.state.write().await;
        self.bin_lookup_ranges(&mut state, failures, binned, &mut session).await
    }

    async fn bin_mutations(
        &self,
        mutations: Vec<Mutation>,
        binned: &mut BinnedMutations,
        failures: &mut Vec<Mutation>,
    ) -> Result<()> {
        if mutations.iter().any(|mutation| mutation.row().is_empty()) {
            return Err(LocatorError::invalid_argument("mutation with empty row"));
        }
        let mut session = LockSession::new(self.lock_checker.as_ref());
        let mut missed = Vec::new();
        {
            let state = self.state.read().await;
            if state.bad_extents.is_empty() {
                for mutation in mutations {
                    match session.check(state.locate(mutation.row())) {
                        Some(location) => {
                            if let Err(mutation) = Self::add_mutation(binned, &location, mutation, &mut session) {
                                missed.push(mutation);
                            }
                        },
                        None => missed.push(mutation),
                    }
                }
            } else {
                missed = mutations;
            }
        }
        if missed.is_empty() {
            return Ok(());
        }
        // lookups are cheapest in row order
        missed.sort_by(|left, right| left.row().cmp(right.row()));
        let mut state = self.state.write().await;
        self.process_invalidated(&mut state, &mut session).await?;
        for mutation in missed {
            let row = mutation.row().to_vec();
            match self.locate_locked(&mut state, &row, false, &mut session).await? {
                Some(location) => {
                    if let Err(mutation) = Self::add_mutation(binned, &location, mutation, &mut session) {
                        failures.push(mutation);
                    }
                },
                None => failures.push(mutation),
            }
        }
        Ok(())
    }

    async fn invalidate_extent(&self, extent: &KeyExtent) {
        let mut state = self.state.write().await;
        remove_overlapping(&mut state.entries, extent);
    }

    async fn invalidate_extents(&self, extents: Vec<KeyExtent>) {
        let mut state = self.state.write().await;
        state.bad_extents.extend(extents);
    }

    async fn invalidate_server(&self, server: &ServerId) {
        let mut state = self.state.write().await;
        let doomed: Vec<EndRowKey> = state
            .entries
            .iter()
            .filter(|(_, location)| &location.server == server)
            .map(|(key, _)| key.clone())
            .collect();
        let invalidated = doomed.len();
        for key in doomed {
            state.entries.remove(&key);
        }
        drop(state);
        self.lock_checker.invalidate_cache(server);
        if invalidated > 0 {
            debug!("table {}: invalidated {} cache entries for server {}", self.table, invalidated, server);
        }
    }

    async fn invalidate_all(&self) {
        let mut state = self.state.write().await;
        let invalidated = state.entries.len();
        state.entries.clear();
        debug!("table {}: invalidated all {} cache entries", self.table, invalidated);
    }
}
