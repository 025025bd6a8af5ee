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

//! The slice of the metadata table vocabulary the locator understands.
//!
//! Each tablet occupies one metadata row, keyed by [`KeyExtent::to_meta_row`].
//! The row carries at most one location column (qualified by the hosting
//! server's session) and a previous end row column completing the extent.

use std::collections::BTreeMap;

use anyhow::anyhow;
use compact_str::CompactString;

use crate::cluster::{ServerId, SessionId};
use crate::extent::KeyExtent;
use crate::keys::Row;
use crate::locator::{LocatorError, Result, TabletLocation, TabletLocations};

/// Column family of a tablet's current location; the qualifier carries the
/// server session.
pub const LOCATION_FAMILY: &str = "loc";
/// Column family of a location assignment still in flight. Routing to it is
/// as good as routing to a current location: the lock check arbitrates.
pub const FUTURE_LOCATION_FAMILY: &str = "future";
/// Column family of per tablet bookkeeping columns.
pub const TABLET_FAMILY: &str = "tablet";
/// Qualifier of the previous end row column under [`TABLET_FAMILY`].
pub const PREV_ROW_QUALIFIER: &str = "prevrow";

/// A fully qualified metadata cell key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetaKey {
    pub row: Row,
    pub family: CompactString,
    pub qualifier: CompactString,
}

impl MetaKey {
    pub fn new(row: impl Into<Row>, family: impl Into<CompactString>, qualifier: impl Into<CompactString>) -> Self {
        Self { row: row.into(), family: family.into(), qualifier: qualifier.into() }
    }
}

/// Encodes a previous end row column value: a presence flag byte, then the row.
pub fn encode_prev_row(prev_end_row: Option<&[u8]>) -> Vec<u8> {
    match prev_end_row {
        None => vec![0],
        Some(row) => {
            let mut value = Vec::with_capacity(row.len() + 1);
            value.push(1);
            value.extend_from_slice(row);
            value
        },
    }
}

pub fn decode_prev_row(value: &[u8]) -> Result<Option<Row>> {
    match value {
        [0] => Ok(None),
        [1, row @ ..] => Ok(Some(row.to_vec())),
        _ => Err(anyhow!("malformed previous end row value: {:?}", value).into()),
    }
}

/// Folds one sorted scan of metadata entries into the tablets it describes.
///
/// Location columns precede the prev row column within a row, so a tablet is
/// emitted when its prev row column closes the row: located if a location was
/// seen, locationless otherwise. Two location columns on one row mean the
/// server layer double assigned the tablet; that is fatal to the read.
pub fn parse_locations(entries: &BTreeMap<MetaKey, Vec<u8>>) -> Result<TabletLocations> {
    let mut parsed = TabletLocations::default();
    let mut current_row: Option<&[u8]> = None;
    let mut location: Option<(ServerId, SessionId)> = None;
    for (key, value) in entries {
        if current_row != Some(key.row.as_slice()) {
            current_row = Some(key.row.as_slice());
            location = None;
        }
        if key.family == LOCATION_FAMILY || key.family == FUTURE_LOCATION_FAMILY {
            let server = match std::str::from_utf8(value) {
                Ok(server) => ServerId::new(server),
                Err(_) => return Err(anyhow!("malformed server address in metadata row {:?}", key.row).into()),
            };
            if let Some((first, _)) = location {
                return Err(LocatorError::InconsistentMetadata {
                    row: String::from_utf8_lossy(&key.row).into_owned(),
                    first,
                    second: server,
                });
            }
            location = Some((server, SessionId::new(key.qualifier.clone())));
        } else if key.family == TABLET_FAMILY && key.qualifier == PREV_ROW_QUALIFIER {
            let prev_end_row = decode_prev_row(value)?;
            let extent = KeyExtent::from_meta_row(&key.row, prev_end_row)?;
            match location.take() {
                Some((server, session)) => parsed.locations.push(TabletLocation::new(extent, server, session)),
                None => parsed.locationless.push(extent),
            }
        }
    }
    Ok(parsed)
}
