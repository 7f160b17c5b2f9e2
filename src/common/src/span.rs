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

//! Table spans: half-open `[start_key, end_key)` ranges over the
//! memcomparable record keyspace of one table, the unit of scheduling.
//!
//! An empty `start_key` means negative infinity and an empty `end_key` means
//! positive infinity, so the two comparators below are not interchangeable.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::id::TableId;

const RECORD_SEP: u8 = b'_';
const RECORD_MARKER: u8 = b'r';

#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpan {
    pub table_id: TableId,
    pub start_key: Bytes,
    pub end_key: Bytes,
}

/// Compare two start keys, where empty means negative infinity.
pub fn start_key_cmp(lhs: &[u8], rhs: &[u8]) -> Ordering {
    match (lhs.is_empty(), rhs.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => lhs.cmp(rhs),
    }
}

/// Compare two end keys, where empty means positive infinity.
pub fn end_key_cmp(lhs: &[u8], rhs: &[u8]) -> Ordering {
    match (lhs.is_empty(), rhs.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => lhs.cmp(rhs),
    }
}

/// The record-range prefix of a table: `t{table_id}_r`.
fn record_prefix(table_id: TableId) -> Vec<u8> {
    let mut key = Vec::with_capacity(11);
    key.push(b't');
    key.extend_from_slice(&table_id.0.to_be_bytes());
    key.push(RECORD_SEP);
    key.push(RECORD_MARKER);
    key
}

impl TableSpan {
    pub fn new(table_id: TableId, start_key: impl Into<Bytes>, end_key: impl Into<Bytes>) -> Self {
        Self {
            table_id,
            start_key: start_key.into(),
            end_key: end_key.into(),
        }
    }

    /// The complete span covering the whole record range of a table. Index
    /// keys are outside this range and never replicated.
    pub fn table_record_range(table_id: TableId) -> Self {
        let start = record_prefix(table_id);
        let mut end = start.clone();
        *end.last_mut().unwrap() = RECORD_MARKER + 1;
        Self {
            table_id,
            start_key: start.into(),
            end_key: end.into(),
        }
    }

    /// Whether this span covers the whole record range of its table, i.e. it
    /// is not a sub-split.
    pub fn is_complete(&self) -> bool {
        *self == Self::table_record_range(self.table_id)
    }

    pub fn is_empty(&self) -> bool {
        !self.start_key.is_empty()
            && !self.end_key.is_empty()
            && self.start_key >= self.end_key
    }

    pub fn contains(&self, other: &TableSpan) -> bool {
        start_key_cmp(&self.start_key, &other.start_key) != Ordering::Greater
            && end_key_cmp(&other.end_key, &self.end_key) != Ordering::Greater
    }

    /// The overlapping part of two spans, if any.
    pub fn intersect(&self, other: &TableSpan) -> Option<TableSpan> {
        if self.table_id != other.table_id {
            return None;
        }
        let start = match start_key_cmp(&self.start_key, &other.start_key) {
            Ordering::Less => other.start_key.clone(),
            _ => self.start_key.clone(),
        };
        let end = match end_key_cmp(&self.end_key, &other.end_key) {
            Ordering::Greater => other.end_key.clone(),
            _ => self.end_key.clone(),
        };
        let span = TableSpan::new(self.table_id, start, end);
        if !span.start_key.is_empty() && !span.end_key.is_empty() && span.start_key >= span.end_key
        {
            return None;
        }
        Some(span)
    }

    /// Whether `other` directly continues this span (`self.end == other.start`).
    pub fn is_adjacent_to(&self, other: &TableSpan) -> bool {
        self.table_id == other.table_id
            && !self.end_key.is_empty()
            && self.end_key == other.start_key
    }

    /// Cut this span into children at the given interior boundary keys. The
    /// boundaries must be strictly increasing and strictly inside the span;
    /// invalid boundaries are skipped. Children jointly cover `self`.
    pub fn split_at(&self, boundaries: impl IntoIterator<Item = Bytes>) -> Vec<TableSpan> {
        let mut children = Vec::new();
        let mut start = self.start_key.clone();
        for boundary in boundaries {
            if start_key_cmp(&boundary, &start) != Ordering::Greater
                || end_key_cmp(&boundary, &self.end_key) != Ordering::Less
            {
                continue;
            }
            children.push(TableSpan::new(self.table_id, start, boundary.clone()));
            start = boundary;
        }
        children.push(TableSpan::new(
            self.table_id,
            start,
            self.end_key.clone(),
        ));
        children
    }

    /// Merge adjacent spans of one table into the covering span. Returns
    /// `None` unless the inputs are non-empty, same-table and contiguous.
    pub fn merge_adjacent(spans: &[TableSpan]) -> Option<TableSpan> {
        let (first, rest) = spans.split_first()?;
        let mut prev = first;
        for span in rest {
            if !prev.is_adjacent_to(span) {
                return None;
            }
            prev = span;
        }
        Some(TableSpan::new(
            first.table_id,
            first.start_key.clone(),
            prev.end_key.clone(),
        ))
    }
}

impl fmt::Display for TableSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "table {} [{}, {})",
            self.table_id,
            hex(&self.start_key),
            hex(&self.end_key)
        )
    }
}

fn hex(key: &[u8]) -> String {
    if key.is_empty() {
        return "inf".to_owned();
    }
    key.iter().map(|b| format!("{b:02x}")).collect()
}
