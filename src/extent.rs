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

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

use anyhow::{bail, Result};
use compact_str::CompactString;

use crate::data::RowRange;
use crate::keys::{self, Row};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TableId(CompactString);

impl TableId {
    pub fn new(id: impl Into<CompactString>) -> Self {
        Self(id.into())
    }

    pub fn root() -> Self {
        Self(CompactString::new(keys::ROOT_TABLE_ID))
    }

    pub fn metadata() -> Self {
        Self(CompactString::new(keys::METADATA_TABLE_ID))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == keys::ROOT_TABLE_ID
    }

    pub fn is_metadata(&self) -> bool {
        self.0 == keys::METADATA_TABLE_ID
    }
}

impl AsRef<str> for TableId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a tablet: the half-open row range `(prev_end_row, end_row]` of
/// one table. `end_row = None` reads as +∞ and `prev_end_row = None` as −∞.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyExtent {
    table: TableId,
    end_row: Option<Row>,
    prev_end_row: Option<Row>,
}

impl KeyExtent {
    pub fn new(table: TableId, end_row: Option<Row>, prev_end_row: Option<Row>) -> Self {
        Self { table, end_row, prev_end_row }
    }

    /// The root tablet's extent.
    pub fn root() -> Self {
        Self::new(TableId::root(), None, None)
    }

    /// The extent of an unsplit table: the whole row space.
    pub fn whole_table(table: TableId) -> Self {
        Self::new(table, None, None)
    }

    pub fn table(&self) -> &TableId {
        &self.table
    }

    pub fn end_row(&self) -> Option<&[u8]> {
        self.end_row.as_deref()
    }

    pub fn prev_end_row(&self) -> Option<&[u8]> {
        self.prev_end_row.as_deref()
    }

    /// A tablet owns the rows `r` with `prev_end_row < r <= end_row`.
    pub fn contains_row(&self, row: &[u8]) -> bool {
        self.prev_end_row.as_deref().map_or(true, |prev| prev < row)
            && self.end_row.as_deref().map_or(true, |end| row <= end)
    }

    /// Two extents overlap iff they share at least one row: neither's end row
    /// may reach at or below the other's previous end row.
    pub fn overlaps(&self, other: &KeyExtent) -> bool {
        fn ends_before(end: Option<&[u8]>, prev: Option<&[u8]>) -> bool {
            match (end, prev) {
                (Some(end), Some(prev)) => end <= prev,
                _ => false,
            }
        }

        self.table == other.table
            && !ends_before(self.end_row(), other.prev_end_row())
            && !ends_before(other.end_row(), self.prev_end_row())
    }

    /// The metadata row this tablet is registered under.
    pub fn to_meta_row(&self) -> Row {
        keys::meta_row(self.table.as_str(), self.end_row())
    }

    /// The range of metadata rows under which tablets overlapping this extent
    /// are registered.
    pub fn to_meta_range(&self) -> RowRange {
        let (start, start_inclusive) = match self.prev_end_row() {
            // "T;" sorts before the metadata row of any bounded tablet of T.
            None => (keys::meta_row(self.table.as_str(), Some(b"")), true),
            Some(prev) => (keys::meta_row(self.table.as_str(), Some(prev)), false),
        };
        RowRange::new(Some(start), start_inclusive, Some(self.to_meta_row()), true)
    }

    /// Decodes a metadata row back into the extent it registers.
    pub fn from_meta_row(row: &[u8], prev_end_row: Option<Row>) -> Result<Self> {
        if let Some(separator) = row.iter().position(|b| *b == keys::META_ROW_SEPARATOR) {
            let table = std::str::from_utf8(&row[..separator])?;
            let end_row = row[separator + 1..].to_vec();
            Ok(Self::new(TableId::new(table), Some(end_row), prev_end_row))
        } else if row.last() == Some(&keys::META_ROW_TERMINATOR) {
            let table = std::str::from_utf8(&row[..row.len() - 1])?;
            Ok(Self::new(TableId::new(table), None, prev_end_row))
        } else {
            bail!("invalid metadata row: {:?}", row)
        }
    }
}

fn cmp_end_rows(left: Option<&[u8]>, right: Option<&[u8]>) -> Ordering {
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(left), Some(right)) => left.cmp(right),
    }
}

fn cmp_prev_end_rows(left: Option<&[u8]>, right: Option<&[u8]>) -> Ordering {
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(left), Some(right)) => left.cmp(right),
    }
}

impl Ord for KeyExtent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.table
            .cmp(&other.table)
            .then_with(|| cmp_end_rows(self.end_row(), other.end_row()))
            .then_with(|| cmp_prev_end_rows(self.prev_end_row(), other.prev_end_row()))
    }
}

impl PartialOrd for KeyExtent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for KeyExtent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table)?;
        match self.end_row() {
            Some(end) => write!(f, ";{}", String::from_utf8_lossy(end))?,
            None => write!(f, "<")?,
        }
        match self.prev_end_row() {
            Some(prev) => write!(f, ";{}", String::from_utf8_lossy(prev)),
            None => write!(f, "<"),
        }
    }
}
