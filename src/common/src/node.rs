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

use serde::{Deserialize, Serialize};

use crate::id::{Epoch, NodeId};

/// A worker node as reported by the external membership watcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    pub epoch: Epoch,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>, address: impl Into<String>, epoch: u64) -> Self {
        Self {
            id: NodeId::new(id),
            address: address.into(),
            epoch: Epoch(epoch),
        }
    }
}

/// One membership event from the watcher. A restarted node (same id, higher
/// epoch) is delivered as both left and joined.
#[derive(Clone, Debug, Default)]
pub struct NodeChange {
    pub joined: Vec<NodeInfo>,
    pub left: Vec<NodeId>,
}

impl NodeChange {
    pub fn joined(nodes: impl IntoIterator<Item = NodeInfo>) -> Self {
        Self {
            joined: nodes.into_iter().collect(),
            left: vec![],
        }
    }

    pub fn left(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            joined: vec![],
            left: nodes.into_iter().collect(),
        }
    }
}
