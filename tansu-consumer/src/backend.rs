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

//! Backend abstraction
//!
//! The remote stream service the consumer reads from. Only the request and
//! response shapes matter here, transport and authentication belong to the
//! implementation. Failures reported by the service are [`Error::Api`] with an
//! [`ErrorCode`].
//!
//! [`Error::Api`]: crate::Error::Api
//! [`ErrorCode`]: crate::ErrorCode

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    OffsetAndMetadata, Record, Result, StreamPartition,
    cursor::{Cursor, CursorPosition},
};

/// Partition Description
///
/// The offsets currently available in a partition.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct PartitionDescription {
    pub partition: i32,

    /// the oldest offset still available
    pub earliest: i64,

    /// the offset of the next record to be written
    pub end: i64,
}

/// Stream Description
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct StreamDescription {
    pub name: String,
    pub partitions: Vec<PartitionDescription>,
}

impl StreamDescription {
    pub fn stream_partitions(&self) -> impl Iterator<Item = StreamPartition> + '_ {
        self.partitions
            .iter()
            .map(|partition| StreamPartition::new(self.name.as_str(), partition.partition))
    }

    pub fn partition(&self, partition: i32) -> Option<&PartitionDescription> {
        self.partitions
            .iter()
            .find(|description| description.partition == partition)
    }
}

/// A page of stream names
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct StreamListing {
    pub names: Vec<String>,
    pub has_more: bool,
}

/// The records read from a cursor, with the cursor to continue from
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ReadResponse {
    pub records: Vec<Record>,
    pub next: Cursor,
}

/// Generation
///
/// The membership token of a member within a group.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Generation {
    pub generation_id: i32,
    pub member_id: String,
}

/// A member of a group and the streams it subscribes to
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct GroupMember {
    pub member_id: String,
    pub streams: BTreeSet<String>,
}

impl GroupMember {
    pub fn new(
        member_id: impl Into<String>,
        streams: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            member_id: member_id.into(),
            streams: streams.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct JoinGroupRequest {
    pub group_id: String,
    pub client_id: String,

    /// empty when joining for the first time
    pub member_id: String,
    pub streams: BTreeSet<String>,
    pub session_timeout: Duration,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct JoinGroupResponse {
    pub generation: Generation,
    pub members: Vec<GroupMember>,
}

/// Backend
///
/// The stream service consumed by [`crate::Consumer`]. Cloning must be cheap,
/// a clone is moved into each in-flight read.
#[async_trait]
pub trait Backend: Clone + Debug + Send + Sync + 'static {
    /// describe the partitions of a stream
    async fn describe_stream(&self, stream: &str) -> Result<StreamDescription>;

    /// list stream names after `exclusive_start`, at most `limit` per page
    async fn list_streams(
        &self,
        limit: usize,
        exclusive_start: Option<&str>,
    ) -> Result<StreamListing>;

    /// create a cursor reading a partition from the given position
    async fn partition_cursor(
        &self,
        partition: &StreamPartition,
        position: CursorPosition,
    ) -> Result<Cursor>;

    /// read up to `limit` records from a cursor
    async fn read(&self, cursor: &Cursor, limit: usize) -> Result<ReadResponse>;

    /// persist offsets for a group, checked against the generation when given
    async fn commit_offsets(
        &self,
        group_id: &str,
        generation: Option<&Generation>,
        offsets: &BTreeMap<StreamPartition, OffsetAndMetadata>,
    ) -> Result<()>;

    /// the committed offsets of a group, partitions without one are absent
    async fn committed_offsets(
        &self,
        group_id: &str,
        partitions: &BTreeSet<StreamPartition>,
    ) -> Result<BTreeMap<StreamPartition, OffsetAndMetadata>>;

    async fn join_group(&self, request: JoinGroupRequest) -> Result<JoinGroupResponse>;

    async fn heartbeat(&self, group_id: &str, generation: &Generation) -> Result<()>;

    async fn leave_group(&self, group_id: &str, member_id: &str) -> Result<()>;
}
