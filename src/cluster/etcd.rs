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

use anyhow::{anyhow, Result};
use etcd_client::{Client, EventType, GetOptions, WatchOptions, WatchResponse, WatchStream, Watcher};
use ignore_result::Ignore;
use scopeguard::defer;
use tokio::select;
use tokio::sync::mpsc;
use tracing::debug;

use super::LivenessRegistry;

/// An etcd backed registry view. A prefix watch keeps the local map current;
/// when the watch dies the map is emptied so every read degrades to "not
/// present" instead of going stale.
pub struct EtcdRegistry {
    state: Arc<State>,
    refresher: mpsc::UnboundedSender<String>,
}

struct State {
    root: String,
    nodes: Mutex<HashMap<String, Vec<u8>>>,
}

impl State {
    fn apply_update(&self, message: WatchResponse) -> Result<()> {
        for event in message.events() {
            let Some(kv) = event.kv() else {
                continue;
            };
            let key = kv.key_str()?;
            let path = key
                .strip_prefix(&self.root)
                .ok_or_else(|| anyhow!("BUG: expect child of {}, got {}", self.root, key))?;
            match event.event_type() {
                EventType::Put => {
                    self.nodes.lock().unwrap().insert(path.to_string(), kv.value().to_vec());
                },
                EventType::Delete => {
                    self.nodes.lock().unwrap().remove(path);
                },
            }
        }
        Ok(())
    }

    fn replace_prefix(&self, path: &str, entries: Vec<(String, Vec<u8>)>) {
        let mut nodes = self.nodes.lock().unwrap();
        nodes.retain(|node, _| !node.starts_with(path));
        nodes.extend(entries);
    }
}

impl EtcdRegistry {
    /// Connects to etcd and populates the view rooted at `root`.
    pub async fn connect(endpoints: impl Into<Vec<String>>, root: impl Into<String>) -> Result<Arc<EtcdRegistry>> {
        let endpoints = endpoints.into();
        let root = root.into();
        let mut client = Client::connect(&endpoints, None).await?;
        let (nodes, revision) = Self::get_nodes(&mut client, &root).await?;
        let (watcher, stream) = Self::watch_nodes(&mut client, &root, revision + 1).await?;
        let state = Arc::new(State { root, nodes: Mutex::new(nodes) });
        let (refresher, refresh_requests) = mpsc::unbounded_channel();
        {
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(err) = Self::update_nodes(state, client, watcher, stream, refresh_requests).await {
                    debug!("liveness registry watch terminated: {}", err);
                }
            });
        }
        Ok(Arc::new(EtcdRegistry { state, refresher }))
    }

    async fn get_nodes(client: &mut Client, root: &str) -> Result<(HashMap<String, Vec<u8>>, i64)> {
        let options = GetOptions::new().with_prefix();
        let response = client.get(root, Some(options)).await?;
        let mut nodes = HashMap::new();
        for kv in response.kvs() {
            let key = kv.key_str()?;
            let Some(path) = key.strip_prefix(root) else {
                continue;
            };
            nodes.insert(path.to_string(), kv.value().to_vec());
        }
        let revision = response.header().map(|header| header.revision()).unwrap_or(0);
        Ok((nodes, revision))
    }

    async fn watch_nodes(client: &mut Client, root: &str, start_revision: i64) -> Result<(Watcher, WatchStream)> {
        let options = WatchOptions::new().with_prefix().with_start_revision(start_revision);
        Ok(client.watch(root, Some(options)).await?)
    }

    async fn refresh_prefix(state: &State, client: &mut Client, path: String) -> Result<()> {
        let prefix = format!("{}{}", state.root, path);
        let response = client.get(prefix, Some(GetOptions::new().with_prefix())).await?;
        let mut entries = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            let key = kv.key_str()?;
            let Some(node) = key.strip_prefix(&state.root) else {
                continue;
            };
            entries.push((node.to_string(), kv.value().to_vec()));
        }
        state.replace_prefix(&path, entries);
        Ok(())
    }

    async fn update_nodes(
        state: Arc<State>,
        mut client: Client,
        watcher: Watcher,
        mut stream: WatchStream,
        mut refresh_requests: mpsc::UnboundedReceiver<String>,
    ) -> Result<()> {
        defer! {
            state.nodes.lock().unwrap().clear();
        }
        let _watcher = watcher;
        loop {
            select! {
                request = refresh_requests.recv() => match request {
                    // all registry handles are gone
                    None => break,
                    Some(path) => Self::refresh_prefix(&state, &mut client, path).await?,
                },
                message = stream.message() => match message? {
                    None => break,
                    Some(message) => {
                        if message.canceled() {
                            break;
                        }
                        state.apply_update(message)?;
                    },
                },
            }
        }
        Ok(())
    }
}

impl LivenessRegistry for EtcdRegistry {
    fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.state.nodes.lock().unwrap().get(path).cloned()
    }

    fn invalidate(&self, path: &str) {
        self.state.nodes.lock().unwrap().retain(|node, _| !node.starts_with(path));
        self.refresher.send(path.to_string()).ignore();
    }
}
