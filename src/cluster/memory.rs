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
use std::sync::Mutex;

use super::LivenessRegistry;

/// An in-process registry holding its nodes authoritatively. Suits embedded
/// single-process deployments and tests; since nothing is cached, nothing can
/// go stale and `invalidate` has nothing to drop.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    nodes: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, value: Vec<u8>) {
        self.nodes.lock().unwrap().insert(path.to_string(), value);
    }

    pub fn remove(&self, path: &str) {
        self.nodes.lock().unwrap().remove(path);
    }
}

impl LivenessRegistry for MemoryRegistry {
    fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.nodes.lock().unwrap().get(path).cloned()
    }

    fn invalidate(&self, _path: &str) {}
}
