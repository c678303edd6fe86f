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

//! In memory backend
//!
//! A [`Backend`] held entirely in process. Streams can be created, produced
//! to and trimmed directly, failures can be injected per [`Operation`] and the
//! requests made of each operation are counted.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{Arc, Mutex},
    time::SystemTime,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    Error, ErrorCode, OffsetAndMetadata, Record, Result, StreamPartition,
    backend::{
        Backend, Generation, GroupMember, JoinGroupRequest, JoinGroupResponse,
        PartitionDescription, ReadResponse, StreamDescription, StreamListing,
    },
    cursor::{Cursor, CursorPosition},
};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    DescribeStream,
    ListStreams,
    PartitionCursor,
    Read,
    CommitOffsets,
    CommittedOffsets,
    JoinGroup,
    Heartbeat,
    LeaveGroup,
}

#[derive(Clone, Debug, Default)]
struct PartitionLog {
    earliest: i64,
    records: VecDeque<Record>,
}

impl PartitionLog {
    fn end(&self) -> i64 {
        self.earliest + self.records.len() as i64
    }
}

#[derive(Clone, Debug)]
struct Member {
    streams: BTreeSet<String>,
    session_timeout: Duration,
    last_contact: Instant,
}

#[derive(Clone, Debug, Default)]
struct Group {
    generation_id: i32,
    members: BTreeMap<String, Member>,
}

impl Group {
    fn expire(&mut self, now: Instant) {
        let before = self.members.len();

        self.members.retain(|member_id, member| {
            let alive = now.duration_since(member.last_contact) <= member.session_timeout;
            if !alive {
                debug!(%member_id, "session expired");
            }
            alive
        });

        if self.members.len() != before {
            self.generation_id += 1;
        }
    }

    fn members(&self) -> Vec<GroupMember> {
        self.members
            .iter()
            .map(|(member_id, member)| GroupMember {
                member_id: member_id.clone(),
                streams: member.streams.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct Inner {
    streams: BTreeMap<String, Vec<PartitionLog>>,
    cursors: BTreeMap<Uuid, (StreamPartition, i64)>,
    offsets: BTreeMap<String, BTreeMap<StreamPartition, OffsetAndMetadata>>,
    groups: BTreeMap<String, Group>,
    faults: BTreeMap<Operation, VecDeque<ErrorCode>>,
    requests: BTreeMap<Operation, usize>,
    read_delay: Option<Duration>,
}

impl Inner {
    fn log(&self, partition: &StreamPartition) -> Result<&PartitionLog> {
        self.streams
            .get(partition.stream())
            .ok_or(Error::Api(ErrorCode::UnknownStream))
            .and_then(|partitions| {
                usize::try_from(partition.partition())
                    .ok()
                    .and_then(|index| partitions.get(index))
                    .ok_or(Error::Api(ErrorCode::UnknownPartition))
            })
    }

    fn log_mut(&mut self, partition: &StreamPartition) -> Result<&mut PartitionLog> {
        self.streams
            .get_mut(partition.stream())
            .ok_or(Error::Api(ErrorCode::UnknownStream))
            .and_then(|partitions| {
                usize::try_from(partition.partition())
                    .ok()
                    .and_then(|index| partitions.get_mut(index))
                    .ok_or(Error::Api(ErrorCode::UnknownPartition))
            })
    }

    fn cursor(&mut self, partition: &StreamPartition, offset: i64) -> Cursor {
        let id = Uuid::new_v4();
        _ = self.cursors.insert(id, (partition.clone(), offset));
        Cursor::new(id.to_string())
    }

    /// count the request, failing it when a fault has been injected
    fn request(&mut self, operation: Operation) -> Result<()> {
        *self.requests.entry(operation).or_default() += 1;

        if let Some(error_code) = self
            .faults
            .get_mut(&operation)
            .and_then(|faults| faults.pop_front())
        {
            debug!(?operation, ?error_code, "injected");
            Err(Error::Api(error_code))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Memory {
    inner: Arc<Mutex<Inner>>,
}

impl Memory {
    pub fn create_stream(&self, name: impl Into<String>, partitions: i32) -> Result<()> {
        let name = name.into();
        let mut inner = self.inner.lock()?;

        if inner.streams.contains_key(&name) {
            return Err(Error::Message(format!("stream {name} already exists")));
        }

        _ = inner.streams.insert(
            name,
            (0..partitions).map(|_| PartitionLog::default()).collect(),
        );

        Ok(())
    }

    /// append a record, returning its offset
    pub fn produce(
        &self,
        partition: &StreamPartition,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Result<i64> {
        let mut inner = self.inner.lock()?;
        let log = inner.log_mut(partition)?;

        let offset = log.end();
        log.records.push_back(Record {
            partition: partition.clone(),
            offset,
            timestamp: Some(SystemTime::now()),
            key,
            value: Some(value),
        });

        Ok(offset)
    }

    /// discard every record before `offset`
    pub fn trim(&self, partition: &StreamPartition, offset: i64) -> Result<()> {
        let mut inner = self.inner.lock()?;
        let log = inner.log_mut(partition)?;

        while log.earliest < offset.min(log.end()) {
            _ = log.records.pop_front();
            log.earliest += 1;
        }

        Ok(())
    }

    /// fail the next request of an operation with an error code
    pub fn inject(&self, operation: Operation, error_code: ErrorCode) -> Result<()> {
        self.inner
            .lock()
            .map(|mut inner| {
                inner
                    .faults
                    .entry(operation)
                    .or_default()
                    .push_back(error_code)
            })
            .map_err(Into::into)
    }

    /// delay every read, holding the request in flight
    pub fn read_delay(&self, read_delay: Option<Duration>) -> Result<()> {
        self.inner
            .lock()
            .map(|mut inner| inner.read_delay = read_delay)
            .map_err(Into::into)
    }

    /// cursors issued and not yet read from
    pub fn live_cursors(&self) -> Result<usize> {
        self.inner
            .lock()
            .map(|inner| inner.cursors.len())
            .map_err(Into::into)
    }

    /// the number of requests made of an operation
    pub fn requests(&self, operation: Operation) -> Result<usize> {
        self.inner
            .lock()
            .map(|inner| inner.requests.get(&operation).copied().unwrap_or_default())
            .map_err(Into::into)
    }

    pub fn committed(
        &self,
        group_id: &str,
        partition: &StreamPartition,
    ) -> Result<Option<OffsetAndMetadata>> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .offsets
                    .get(group_id)
                    .and_then(|offsets| offsets.get(partition))
                    .cloned()
            })
            .map_err(Into::into)
    }

    pub fn generation_id(&self, group_id: &str) -> Result<Option<i32>> {
        self.inner
            .lock()
            .map(|inner| inner.groups.get(group_id).map(|group| group.generation_id))
            .map_err(Into::into)
    }

    pub fn members(&self, group_id: &str) -> Result<Vec<GroupMember>> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .groups
                    .get(group_id)
                    .map(Group::members)
                    .unwrap_or_default()
            })
            .map_err(Into::into)
    }
}

#[async_trait]
impl Backend for Memory {
    #[instrument(skip_all)]
    async fn describe_stream(&self, stream: &str) -> Result<StreamDescription> {
        let mut inner = self.inner.lock()?;
        inner.request(Operation::DescribeStream)?;

        inner
            .streams
            .get(stream)
            .map(|partitions| StreamDescription {
                name: stream.into(),
                partitions: partitions
                    .iter()
                    .zip(0..)
                    .map(|(log, partition)| PartitionDescription {
                        partition,
                        earliest: log.earliest,
                        end: log.end(),
                    })
                    .collect(),
            })
            .ok_or(Error::Api(ErrorCode::UnknownStream))
    }

    #[instrument(skip_all)]
    async fn list_streams(
        &self,
        limit: usize,
        exclusive_start: Option<&str>,
    ) -> Result<StreamListing> {
        let mut inner = self.inner.lock()?;
        inner.request(Operation::ListStreams)?;

        let mut names = inner
            .streams
            .keys()
            .filter(|name| exclusive_start.is_none_or(|start| name.as_str() > start))
            .cloned();

        let page = names.by_ref().take(limit).collect::<Vec<_>>();
        let has_more = names.next().is_some();

        Ok(StreamListing {
            names: page,
            has_more,
        })
    }

    #[instrument(skip_all)]
    async fn partition_cursor(
        &self,
        partition: &StreamPartition,
        position: CursorPosition,
    ) -> Result<Cursor> {
        let mut inner = self.inner.lock()?;
        inner.request(Operation::PartitionCursor)?;

        let log = inner.log(partition)?;

        let offset = match position {
            CursorPosition::Earliest => log.earliest,
            CursorPosition::Latest => log.end(),
            CursorPosition::AtOffset(offset) if (log.earliest..=log.end()).contains(&offset) => {
                offset
            }
            CursorPosition::AtOffset(offset) => {
                debug!(%partition, offset, earliest = log.earliest, end = log.end());
                return Err(Error::Api(ErrorCode::OffsetOutOfRange));
            }
        };

        Ok(inner.cursor(partition, offset))
    }

    #[instrument(skip_all)]
    async fn read(&self, cursor: &Cursor, limit: usize) -> Result<ReadResponse> {
        let read_delay = {
            let mut inner = self.inner.lock()?;
            inner.request(Operation::Read)?;
            inner.read_delay
        };

        if let Some(read_delay) = read_delay {
            sleep(read_delay).await;
        }

        let mut inner = self.inner.lock()?;

        let (partition, offset) = Uuid::parse_str(cursor.as_str())
            .ok()
            .and_then(|id| inner.cursors.remove(&id))
            .ok_or(Error::Api(ErrorCode::ExpiredCursor))?;

        let log = inner.log(&partition)?;

        if offset < log.earliest {
            debug!(%partition, offset, earliest = log.earliest);
            return Err(Error::Api(ErrorCode::OffsetOutOfRange));
        }

        let skip = usize::try_from(offset - log.earliest).unwrap_or_default();

        let records = log
            .records
            .iter()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect::<Vec<_>>();

        let next = inner.cursor(&partition, offset + records.len() as i64);

        Ok(ReadResponse { records, next })
    }

    #[instrument(skip_all)]
    async fn commit_offsets(
        &self,
        group_id: &str,
        generation: Option<&Generation>,
        offsets: &BTreeMap<StreamPartition, OffsetAndMetadata>,
    ) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.request(Operation::CommitOffsets)?;

        if let Some(generation) = generation {
            let group = inner
                .groups
                .get(group_id)
                .ok_or(Error::Api(ErrorCode::UnknownMemberId))?;

            if !group.members.contains_key(&generation.member_id) {
                return Err(Error::Api(ErrorCode::UnknownMemberId));
            }

            if group.generation_id != generation.generation_id {
                return Err(Error::Api(ErrorCode::IllegalGeneration));
            }
        }

        inner
            .offsets
            .entry(group_id.to_owned())
            .or_default()
            .extend(
                offsets
                    .iter()
                    .map(|(partition, offset)| (partition.clone(), offset.clone())),
            );

        Ok(())
    }

    #[instrument(skip_all)]
    async fn committed_offsets(
        &self,
        group_id: &str,
        partitions: &BTreeSet<StreamPartition>,
    ) -> Result<BTreeMap<StreamPartition, OffsetAndMetadata>> {
        let mut inner = self.inner.lock()?;
        inner.request(Operation::CommittedOffsets)?;

        Ok(inner
            .offsets
            .get(group_id)
            .map(|offsets| {
                offsets
                    .iter()
                    .filter(|(partition, _)| partitions.contains(partition))
                    .map(|(partition, offset)| (partition.clone(), offset.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    #[instrument(skip_all)]
    async fn join_group(&self, request: JoinGroupRequest) -> Result<JoinGroupResponse> {
        let mut inner = self.inner.lock()?;
        inner.request(Operation::JoinGroup)?;

        let now = Instant::now();

        let group = inner.groups.entry(request.group_id.clone()).or_default();
        group.expire(now);

        let member_id = if request.member_id.is_empty() {
            format!("{}-{}", request.client_id, Uuid::new_v4())
        } else if group.members.contains_key(&request.member_id) {
            request.member_id.clone()
        } else {
            return Err(Error::Api(ErrorCode::UnknownMemberId));
        };

        let changed = group
            .members
            .get(&member_id)
            .is_none_or(|member| member.streams != request.streams);

        _ = group.members.insert(
            member_id.clone(),
            Member {
                streams: request.streams,
                session_timeout: request.session_timeout,
                last_contact: now,
            },
        );

        if changed {
            group.generation_id += 1;
        }

        debug!(group_id = %request.group_id, %member_id, generation_id = group.generation_id);

        Ok(JoinGroupResponse {
            generation: Generation {
                generation_id: group.generation_id,
                member_id,
            },
            members: group.members(),
        })
    }

    #[instrument(skip_all)]
    async fn heartbeat(&self, group_id: &str, generation: &Generation) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.request(Operation::Heartbeat)?;

        let now = Instant::now();

        let group = inner
            .groups
            .get_mut(group_id)
            .ok_or(Error::Api(ErrorCode::UnknownMemberId))?;
        group.expire(now);

        let generation_id = group.generation_id;

        let member = group
            .members
            .get_mut(&generation.member_id)
            .ok_or(Error::Api(ErrorCode::UnknownMemberId))?;
        member.last_contact = now;

        if generation_id == generation.generation_id {
            Ok(())
        } else {
            Err(Error::Api(ErrorCode::RebalanceInProgress))
        }
    }

    #[instrument(skip_all)]
    async fn leave_group(&self, group_id: &str, member_id: &str) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.request(Operation::LeaveGroup)?;

        let group = inner
            .groups
            .get_mut(group_id)
            .ok_or(Error::Api(ErrorCode::UnknownMemberId))?;

        group
            .members
            .remove(member_id)
            .ok_or(Error::Api(ErrorCode::UnknownMemberId))
            .map(|_| group.generation_id += 1)
    }
}
