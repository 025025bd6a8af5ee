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

//! Row key vocabulary shared across the locator tree.

/// Reserved table id of the root tablet's pseudo table.
pub const ROOT_TABLE_ID: &str = "+root";
/// Reserved table id of the metadata table.
pub const METADATA_TABLE_ID: &str = "+meta";

/// Separator between a table id and an end row in an encoded metadata row.
/// Sorts before [`META_ROW_TERMINATOR`] so every bounded tablet's metadata
/// row sorts before the table's terminator row.
pub const META_ROW_SEPARATOR: u8 = b';';
/// Terminator encoding the unbounded end row. `T<` is the greatest metadata
/// row any tablet of table `T` can occupy.
pub const META_ROW_TERMINATOR: u8 = b'<';

pub type Row = Vec<u8>;

/// Returns the immediate successor of `row`: the smallest row sorting
/// strictly after it.
pub fn successor(row: &[u8]) -> Row {
    let mut next = Vec::with_capacity(row.len() + 1);
    next.extend_from_slice(row);
    next.push(0);
    next
}

/// Encodes the metadata row under which the tablet of `table` with the given
/// end row is registered: `table;end_row`, or `table<` for the last tablet.
pub fn meta_row(table: &str, end_row: Option<&[u8]>) -> Row {
    let mut row = Vec::with_capacity(table.len() + 1 + end_row.map_or(0, <[u8]>::len));
    row.extend_from_slice(table.as_bytes());
    match end_row {
        Some(end) => {
            row.push(META_ROW_SEPARATOR);
            row.extend_from_slice(end);
        },
        None => row.push(META_ROW_TERMINATOR),
    }
    row
}

/// The greatest metadata row of `table`, bounding metadata scans for it.
pub fn last_meta_row(table: &str) -> Row {
    meta_row(table, None)
}
