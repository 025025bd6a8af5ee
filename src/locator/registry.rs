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
use std::sync::{Arc, Mutex};

use super::{LocationObtainer, RootTabletLocator, TabletCache, TabletLocator, TabletLockChecker};
use crate::cluster::{LivenessRegistry, ServerId};
use crate::extent::TableId;

/// Client scoped registry of the locator tree. Table locators are created
/// lazily and share the metadata locator, which resolves through the root
/// locator; the tree is exactly three levels deep. Locators reach each other
/// only downward through `Arc` parents, dependents are reached through this
/// registry, so the graph stays acyclic.
pub struct LocatorRegistry {
    obtainer: Arc<dyn LocationObtainer>,
    lock_checker: Arc<dyn TabletLockChecker>,
    root: Arc<RootTabletLocator>,
    metadata: Arc<TabletCache>,
    locators: Mutex<HashMap<TableId, Arc<TabletCache>>>,
}

impl LocatorRegistry {
    pub fn new(
        registry: Arc<dyn LivenessRegistry>,
        obtainer: Arc<dyn LocationObtainer>,
        lock_checker: Arc<dyn TabletLockChecker>,
    ) -> Self {
        let root = Arc::new(RootTabletLocator::new(registry, lock_checker.clone()));
        let metadata =
            Arc::new(TabletCache::new(TableId::metadata(), root.clone(), obtainer.clone(), lock_checker.clone()));
        Self { obtainer, lock_checker, root, metadata, locators: Mutex::new(HashMap::new()) }
    }

    /// The locator responsible for `table`, created on first use.
    pub fn locator(&self, table: &TableId) -> Arc<dyn TabletLocator> {
        if table.is_root() {
            return self.root.clone();
        }
        if table.is_metadata() {
            return self.metadata.clone();
        }
        let mut locators = self.locators.lock().unwrap();
        locators
            .entry(table.clone())
            .or_insert_with(|| {
                Arc::new(TabletCache::new(
                    table.clone(),
                    self.metadata.clone(),
                    self.obtainer.clone(),
                    self.lock_checker.clone(),
                ))
            })
            .clone()
    }

    /// Evicts `server` from every locator in the tree. Invalidating a
    /// metadata server would strand dependent tables' caches, so the fan out
    /// covers all of them.
    pub async fn invalidate_server(&self, server: &ServerId) {
        let locators: Vec<Arc<TabletCache>> = self.locators.lock().unwrap().values().cloned().collect();
        for locator in locators {
            locator.invalidate_server(server).await;
        }
        self.metadata.invalidate_server(server).await;
        self.root.invalidate_server(server).await;
    }

    /// Drops one table's cache wholesale.
    pub async fn invalidate_table(&self, table: &TableId) {
        if table.is_metadata() {
            self.metadata.invalidate_all().await;
            return;
        }
        let locator = self.locators.lock().unwrap().get(table).cloned();
        if let Some(locator) = locator {
            locator.invalidate_all().await;
        }
    }
}
