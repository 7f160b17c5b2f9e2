// Copyright 2025 RisingWave Labs
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

use changeflow_common::{Epoch, NodeChange, NodeId, NodeInfo};

/// The maintainer's current belief about the alive-node set, fed by the
/// external membership watcher. A node whose epoch changed restarted and is
/// reported as left + joined so its old state is torn down.
#[derive(Default)]
pub struct NodeView {
    nodes: HashMap<NodeId, NodeInfo>,
}

impl NodeView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one membership event. Returns the normalized change actually
    /// applied: restarts show up in both `left` and `joined`.
    pub fn apply(&mut self, change: NodeChange) -> NodeChange {
        let mut applied = NodeChange::default();
        for id in change.left {
            if self.nodes.remove(&id).is_some() {
                tracing::info!(node = %id, "node left");
                applied.left.push(id);
            }
        }
        for info in change.joined {
            match self.nodes.get(&info.id) {
                Some(known) if known.epoch == info.epoch => {
                    // Duplicate announcement.
                }
                Some(known) => {
                    tracing::info!(
                        node = %info.id,
                        old_epoch = %known.epoch,
                        new_epoch = %info.epoch,
                        "node restarted"
                    );
                    applied.left.push(info.id.clone());
                    self.nodes.insert(info.id.clone(), info.clone());
                    applied.joined.push(info);
                }
                None => {
                    tracing::info!(node = %info.id, epoch = %info.epoch, "node joined");
                    self.nodes.insert(info.id.clone(), info.clone());
                    applied.joined.push(info);
                }
            }
        }
        applied
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn epoch_of(&self, id: &NodeId) -> Option<Epoch> {
        self.nodes.get(id).map(|info| info.epoch)
    }

    pub fn alive_nodes(&self) -> impl Iterator<Item = &NodeId> + Clone {
        self.nodes.keys()
    }

    pub fn alive_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
