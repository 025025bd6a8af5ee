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

//! Client side routing for a distributed, range partitioned tabular store.
//!
//! Tables are partitioned into tablets, contiguous half open row ranges each
//! hosted by one server. This crate resolves which server hosts the tablet
//! owning a row, caches those routings per table, and bins ranges and
//! mutations by destination server, surviving splits, merges, migrations and
//! server failures without handing out stale routings.

pub mod cluster;
pub mod data;
pub mod extent;
pub mod keys;
pub mod locator;
pub mod metadata;
