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

use std::collections::HashMap;

use compact_str::CompactString;

use crate::cluster::{ServerId, SessionId};
use crate::extent::KeyExtent;
use crate::keys::{self, Row};

/// A contiguous range of rows with independently inclusive or exclusive
/// bounds. `None` bounds are unbounded.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RowRange {
    start: Option<Row>,
    start_inclusive: bool,
    end: Option<Row>,
    end_inclusive: bool,
}

impl RowRange {
    pub fn new(start: Option<Row>, start_inclusive: bool, end: Option<Row>, end_inclusive: bool) -> Self {
        Self { start, start_inclusive, end, end_inclusive }
    }

    /// The whole row space.
    pub fn all() -> Self {
        Self::new(None, true, None, true)
    }

    /// The range holding exactly one row.
    pub fn row(row: impl Into<Row>) -> Self {
        let row = row.into();
        Self::new(Some(row.clone()), true, Some(row), true)
    }

    pub fn start_row(&self) -> Option<&[u8]> {
        self.start.as_deref()
    }

    pub fn start_inclusive(&self) -> bool {
        self.start_inclusive
    }

    pub fn end_row(&self) -> Option<&[u8]> {
        self.end.as_deref()
    }

    pub fn end_inclusive(&self) -> bool {
        self.end_inclusive
    }

    pub fn contains_row(&self, row: &[u8]) -> bool {
        let after_start = match &self.start {
            None => true,
            Some(start) if self.start_inclusive => start.as_slice() <= row,
            Some(start) => start.as_slice() < row,
        };
        let before_end = match &self.end {
            None => true,
            Some(end) if self.end_inclusive => row <= end.as_slice(),
            Some(end) => row < end.as_slice(),
        };
        after_start && before_end
    }

    /// The first row this range can cover, the row to locate its first tablet
    /// with. An exclusive start bound starts at the successor row.
    pub(crate) fn locate_row(&self) -> Row {
        match &self.start {
            None => Row::new(),
            Some(start) if self.start_inclusive => start.clone(),
            Some(start) => keys::successor(start),
        }
    }

    /// Whether this range covers any row past `end_row`, that is whether
    /// binning must keep walking into the tablet after the one ending there.
    pub(crate) fn extends_after(&self, end_row: &[u8]) -> bool {
        match &self.end {
            None => true,
            Some(end) if self.end_inclusive => end.as_slice() > end_row,
            Some(end) => {
                let stop = keys::successor(end_row);
                end.as_slice() > stop.as_slice()
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnUpdate {
    pub family: CompactString,
    pub qualifier: CompactString,
    pub value: Vec<u8>,
}

/// A batch of column updates to one row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    row: Row,
    updates: Vec<ColumnUpdate>,
}

impl Mutation {
    pub fn new(row: impl Into<Row>) -> Self {
        Self { row: row.into(), updates: Vec::new() }
    }

    pub fn put(
        &mut self,
        family: impl Into<CompactString>,
        qualifier: impl Into<CompactString>,
        value: impl Into<Vec<u8>>,
    ) {
        self.updates.push(ColumnUpdate { family: family.into(), qualifier: qualifier.into(), value: value.into() });
    }

    pub fn row(&self) -> &[u8] {
        &self.row
    }

    pub fn updates(&self) -> &[ColumnUpdate] {
        &self.updates
    }
}

/// Mutations grouped by extent for one server, in insertion order per extent.
/// The group is pinned to the server session observed when it was created so
/// mutations never mix sessions of a reincarnated server.
#[derive(Debug)]
pub struct TabletServerMutations {
    session: SessionId,
    mutations: HashMap<KeyExtent, Vec<Mutation>>,
}

impl TabletServerMutations {
    pub fn new(session: SessionId) -> Self {
        Self { session, mutations: HashMap::new() }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn add(&mut self, extent: KeyExtent, mutation: Mutation) {
        self.mutations.entry(extent).or_default().push(mutation);
    }

    pub fn mutations(&self) -> &HashMap<KeyExtent, Vec<Mutation>> {
        &self.mutations
    }
}

/// Ranges grouped by destination server and extent.
pub type BinnedRanges = HashMap<ServerId, HashMap<KeyExtent, Vec<RowRange>>>;

/// Mutations grouped by destination server.
pub type BinnedMutations = HashMap<ServerId, TabletServerMutations>;
