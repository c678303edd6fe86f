// Copyright ⓒ 2024-2025 Peter Morgan <peter.james.morgan@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{OffsetResetStrategy, StreamPartition};

/// Cursor
///
/// An opaque continuation token issued by a backend for one partition.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Cursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a new cursor should start reading a partition
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum CursorPosition {
    AtOffset(i64),
    Earliest,
    Latest,
}

impl From<OffsetResetStrategy> for CursorPosition {
    fn from(value: OffsetResetStrategy) -> Self {
        match value {
            OffsetResetStrategy::Earliest => Self::Earliest,
            OffsetResetStrategy::Latest => Self::Latest,
        }
    }
}

/// The cursors currently held for each partition
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CursorCache {
    cursors: BTreeMap<StreamPartition, Cursor>,
}

impl CursorCache {
    pub fn get(&self, partition: &StreamPartition) -> Option<&Cursor> {
        self.cursors.get(partition)
    }

    pub fn insert(&mut self, partition: StreamPartition, cursor: Cursor) {
        _ = self.cursors.insert(partition, cursor);
    }

    pub fn invalidate(&mut self, partition: &StreamPartition) {
        if let Some(cursor) = self.cursors.remove(partition) {
            debug!(%partition, %cursor);
        }
    }

    pub fn invalidate_all<'a>(&mut self, partitions: impl IntoIterator<Item = &'a StreamPartition>) {
        for partition in partitions {
            self.invalidate(partition)
        }
    }

    /// drop the cursors of any partition not retained by the predicate
    pub fn retain(&mut self, mut f: impl FnMut(&StreamPartition) -> bool) {
        self.cursors.retain(|partition, _| f(partition))
    }

    pub fn clear(&mut self) {
        self.cursors.clear()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
