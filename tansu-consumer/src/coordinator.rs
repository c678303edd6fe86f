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

//! Coordinator
//!
//! Group membership, offset commit and offset resolution against a
//! [`Backend`]. Membership only applies when partitions are assigned by
//! subscription, a user assignment never joins a group.
//!
//! With an empty group id the consumer acts as the only member of a local
//! group, owning every partition of its subscription. Commits and committed
//! offset lookups need a named group.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt::{self, Debug, Formatter},
    sync::LazyLock,
};

use opentelemetry::{KeyValue, metrics::Counter};
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    Error, ErrorCode, METER, OffsetAndMetadata, OffsetResetStrategy, Result, StreamPartition,
    assignor::PartitionAssignor,
    backend::{Backend, Generation, GroupMember, JoinGroupRequest, StreamDescription},
    config::Config,
    consumer::OffsetCommitCallback,
    cursor::CursorCache,
    subscription::SubscriptionState,
    task::{DelayedTaskQueue, Task},
};

/// page size used when listing every stream
pub(crate) const LIST_STREAMS_LIMIT: usize = 100;

static COMMIT_REQUESTS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("consumer_commit_requests")
        .with_description("Offset commit requests")
        .build()
});

static REBALANCES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("consumer_rebalances")
        .with_description("Completed rebalances")
        .build()
});

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) enum MemberState {
    #[default]
    Unjoined,
    Joining,
    Stable,
}

struct PendingCommit {
    offsets: BTreeMap<StreamPartition, OffsetAndMetadata>,
    callback: Option<OffsetCommitCallback>,
}

impl Debug for PendingCommit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(PendingCommit))
            .field("offsets", &self.offsets)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct Coordinator<B> {
    backend: B,
    config: Config,
    generation: Option<Generation>,
    state: MemberState,
    tasks: DelayedTaskQueue,
    pending_commits: VecDeque<PendingCommit>,
}

impl<B> Coordinator<B>
where
    B: Backend,
{
    pub(crate) fn new(backend: B, config: Config) -> Self {
        Self {
            backend,
            config,
            generation: None,
            state: MemberState::default(),
            tasks: DelayedTaskQueue::default(),
            pending_commits: VecDeque::new(),
        }
    }

    pub(crate) fn state(&self) -> MemberState {
        self.state
    }

    pub(crate) fn generation(&self) -> Option<&Generation> {
        self.generation.as_ref()
    }

    /// when the next delayed task falls due
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.tasks.next_deadline()
    }

    fn group_id(&self) -> Option<String> {
        Some(self.config.group_id())
            .filter(|group_id| !group_id.is_empty())
            .map(ToOwned::to_owned)
    }

    fn named_group(&self) -> Result<String> {
        self.group_id().ok_or(Error::InvalidGroupId)
    }

    fn auto_commit(&self) -> bool {
        self.config.enable_auto_commit() && self.group_id().is_some()
    }

    /// join or rejoin the group when membership is no longer valid
    #[instrument(skip_all)]
    pub(crate) async fn ensure_group_stable(
        &mut self,
        subscriptions: &mut SubscriptionState,
        cursors: &mut CursorCache,
    ) -> Result<()> {
        if !subscriptions.partitions_auto_assigned()
            || (self.state == MemberState::Stable && !subscriptions.needs_rejoin())
        {
            return Ok(());
        }

        self.state = MemberState::Joining;

        let mut attempt = 0;

        loop {
            match self.join(subscriptions, cursors).await {
                Ok(()) => {
                    self.state = MemberState::Stable;
                    subscriptions.rejoined();
                    REBALANCES.add(1, &[]);
                    return Ok(());
                }

                Err(error) => {
                    attempt += 1;

                    match error.error_code() {
                        Some(ErrorCode::UnknownMemberId) => {
                            debug!(generation = ?self.generation, "unknown member");
                            self.generation = None;
                        }

                        Some(
                            ErrorCode::RebalanceInProgress | ErrorCode::IllegalGeneration,
                        ) => (),

                        Some(error_code) if error_code.is_retriable() => (),

                        _otherwise => {
                            self.state = MemberState::Unjoined;
                            return Err(Error::GroupCoordination(Box::new(error)));
                        }
                    }

                    if attempt > self.config.join_retries() {
                        warn!(?error, attempt, "join retries exhausted");
                        self.state = MemberState::Unjoined;
                        return Err(Error::GroupCoordination(Box::new(error)));
                    }

                    warn!(?error, attempt);
                    sleep(self.config.retry_backoff()).await;
                }
            }
        }
    }

    async fn join(
        &mut self,
        subscriptions: &mut SubscriptionState,
        cursors: &mut CursorCache,
    ) -> Result<()> {
        let streams = self.resolve_subscription(subscriptions).await?;

        if self.auto_commit() && self.generation.is_some() {
            let consumed = subscriptions.all_consumed();

            if !consumed.is_empty() {
                if let Err(error) = self.commit_sync(subscriptions, consumed).await {
                    warn!(?error, "commit before rebalance");
                }
            }
        }

        let (members, member_id) = if let Some(group_id) = self.group_id() {
            let response = self
                .backend
                .join_group(JoinGroupRequest {
                    group_id: group_id.clone(),
                    client_id: self.config.client_id().to_owned(),
                    member_id: self
                        .generation
                        .as_ref()
                        .map(|generation| generation.member_id.clone())
                        .unwrap_or_default(),
                    streams: streams.clone(),
                    session_timeout: self.config.session_timeout(),
                })
                .await?;

            info!(
                %group_id,
                generation_id = response.generation.generation_id,
                member_id = %response.generation.member_id,
                members = response.members.len()
            );

            let member_id = response.generation.member_id.clone();
            self.generation = Some(response.generation);
            (response.members, member_id)
        } else {
            let member_id = self.config.client_id().to_owned();
            (vec![GroupMember::new(member_id.as_str(), streams)], member_id)
        };

        let partitions = self.describe_partitions(&members).await?;

        let assignment = self
            .config
            .assignor()
            .assign(&members, &partitions)
            .remove(&member_id)
            .unwrap_or_default();

        let previous = subscriptions.assignment();

        let revoked = previous
            .difference(&assignment)
            .cloned()
            .collect::<BTreeSet<_>>();

        let assigned = assignment
            .difference(&previous)
            .cloned()
            .collect::<BTreeSet<_>>();

        debug!(?revoked, ?assigned, ?assignment);

        if let Some(listener) = subscriptions.listener() {
            listener.on_partitions_revoked(&revoked);
        }

        subscriptions.assign_from_subscribed(assignment)?;
        cursors.invalidate_all(&revoked);

        if let Some(listener) = subscriptions.listener() {
            listener.on_partitions_assigned(&assigned);
        }

        if self.generation.is_some() {
            self.tasks
                .schedule_after(Task::Heartbeat, self.config.heartbeat_interval());
        }

        if subscriptions.pattern().is_some() {
            self.tasks
                .schedule_after(Task::MetadataRefresh, self.config.metadata_max_age());
        }

        Ok(())
    }

    /// the partitions of every stream any member subscribes to
    async fn describe_partitions(
        &self,
        members: &[GroupMember],
    ) -> Result<BTreeSet<StreamPartition>> {
        let streams = members
            .iter()
            .flat_map(|member| member.streams.iter().cloned())
            .collect::<BTreeSet<_>>();

        let mut partitions = BTreeSet::new();

        for stream in streams {
            match self.backend.describe_stream(&stream).await {
                Ok(description) => partitions.extend(description.stream_partitions()),

                Err(error) if error.error_code() == Some(ErrorCode::UnknownStream) => {
                    warn!(%stream, "unknown stream");
                }

                Err(error) => return Err(error),
            }
        }

        Ok(partitions)
    }

    /// the streams the subscription resolves to, listing streams for a pattern
    async fn resolve_subscription(
        &self,
        subscriptions: &mut SubscriptionState,
    ) -> Result<BTreeSet<String>> {
        if let Some(pattern) = subscriptions.pattern().cloned() {
            let matched = self
                .list_all_streams()
                .await?
                .into_iter()
                .filter(|name| pattern.is_match(name))
                .collect::<BTreeSet<_>>();

            _ = subscriptions.set_group_subscription(matched.clone());
            Ok(matched)
        } else {
            Ok(subscriptions.group_subscription().clone())
        }
    }

    /// every stream name, following pages until the listing is complete
    pub(crate) async fn list_all_streams(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = vec![];

        loop {
            let listing = self
                .backend
                .list_streams(LIST_STREAMS_LIMIT, names.last().map(String::as_str))
                .await?;

            debug!(page = listing.names.len(), has_more = listing.has_more);

            let exhausted = !listing.has_more || listing.names.is_empty();
            names.extend(listing.names);

            if exhausted {
                return Ok(names);
            }
        }
    }

    pub(crate) async fn describe_stream(&self, stream: &str) -> Result<StreamDescription> {
        self.backend.describe_stream(stream).await
    }

    /// resolve the position of any given partition that has none
    #[instrument(skip_all)]
    pub(crate) async fn update_fetch_positions(
        &mut self,
        partitions: &BTreeSet<StreamPartition>,
        subscriptions: &mut SubscriptionState,
        cursors: &mut CursorCache,
    ) -> Result<()> {
        let missing = partitions
            .iter()
            .filter(|partition| {
                subscriptions.is_assigned(partition) && subscriptions.position(partition).is_none()
            })
            .cloned()
            .collect::<BTreeSet<_>>();

        if missing.is_empty() {
            return Ok(());
        }

        if let Some(group_id) = self.group_id() {
            let uncommitted = missing
                .iter()
                .filter(|partition| {
                    !subscriptions.is_offset_reset_needed(partition)
                        && subscriptions.committed(partition).is_none()
                })
                .cloned()
                .collect::<BTreeSet<_>>();

            if !uncommitted.is_empty() {
                for (partition, committed) in self
                    .backend
                    .committed_offsets(&group_id, &uncommitted)
                    .await?
                {
                    subscriptions.set_committed(&partition, committed);
                }
            }
        }

        let mut descriptions: BTreeMap<String, Result<StreamDescription>> = BTreeMap::new();
        let mut failures = vec![];

        for partition in &missing {
            let committed = if subscriptions.is_offset_reset_needed(partition) {
                None
            } else {
                subscriptions
                    .committed(partition)
                    .map(OffsetAndMetadata::offset)
            };

            let offset = if let Some(offset) = committed {
                offset
            } else {
                let strategy = subscriptions.reset_strategy(partition);

                if !descriptions.contains_key(partition.stream()) {
                    let description = self.backend.describe_stream(partition.stream()).await;
                    _ = descriptions.insert(partition.stream().to_owned(), description);
                }

                let description = match descriptions.get(partition.stream()) {
                    Some(Ok(description)) => description
                        .partition(partition.partition())
                        .ok_or(ErrorCode::UnknownPartition),

                    Some(Err(error)) => match error.error_code() {
                        Some(error_code) => Err(error_code),
                        None => return Err(error.clone()),
                    },

                    None => Err(ErrorCode::UnknownStream),
                };

                match description {
                    Ok(description) => {
                        debug!(%partition, ?strategy, ?description);

                        match strategy {
                            OffsetResetStrategy::Earliest => description.earliest,
                            OffsetResetStrategy::Latest => description.end,
                        }
                    }

                    Err(error_code) => {
                        warn!(%partition, ?strategy, ?error_code, "unable to reset position");
                        failures.push(error_code);
                        continue;
                    }
                }
            };

            debug!(%partition, offset);
            subscriptions.set_position(partition, offset)?;
            cursors.invalidate(partition);
        }

        if failures.len() < missing.len() {
            return Ok(());
        }

        if let Some(error_code) = failures.iter().copied().find(ErrorCode::is_fatal) {
            error!(?error_code, "every partition failed");
            Err(Error::Fatal(error_code))
        } else {
            Err(failures
                .first()
                .copied()
                .map_or(Error::Api(ErrorCode::UnknownPartition), Error::Api))
        }
    }

    /// fetch committed offsets for assigned partitions without a cached value
    pub(crate) async fn refresh_committed_offsets_if_needed(
        &mut self,
        subscriptions: &mut SubscriptionState,
    ) -> Result<()> {
        let missing = subscriptions.missing_committed();

        if missing.is_empty() {
            return Ok(());
        }

        let group_id = self.named_group()?;

        for (partition, committed) in self.backend.committed_offsets(&group_id, &missing).await? {
            subscriptions.set_committed(&partition, committed);
        }

        Ok(())
    }

    /// committed offsets of partitions, leaving the subscription untouched
    pub(crate) async fn fetch_committed_offsets(
        &self,
        partitions: &BTreeSet<StreamPartition>,
    ) -> Result<BTreeMap<StreamPartition, OffsetAndMetadata>> {
        let group_id = self.named_group()?;
        self.backend.committed_offsets(&group_id, partitions).await
    }

    async fn send_commit(
        &mut self,
        subscriptions: &mut SubscriptionState,
        offsets: &BTreeMap<StreamPartition, OffsetAndMetadata>,
    ) -> Result<()> {
        let group_id = self.named_group()?;

        let generation = self
            .generation
            .as_ref()
            .filter(|_| subscriptions.partitions_auto_assigned());

        COMMIT_REQUESTS.add(1, &[KeyValue::new("group_id", group_id.clone())]);

        match self
            .backend
            .commit_offsets(&group_id, generation, offsets)
            .await
        {
            Ok(()) => {
                for (partition, committed) in offsets {
                    subscriptions.set_committed(partition, committed.clone());
                }

                Ok(())
            }

            Err(error) => {
                match error.error_code() {
                    Some(ErrorCode::IllegalGeneration) => {
                        self.state = MemberState::Joining;
                        subscriptions.request_rejoin();
                    }

                    Some(ErrorCode::UnknownMemberId) => {
                        self.state = MemberState::Unjoined;
                        self.generation = None;
                        subscriptions.request_rejoin();
                    }

                    _otherwise => (),
                }

                Err(error)
            }
        }
    }

    /// commit offsets, retrying transient failures
    #[instrument(skip_all)]
    pub(crate) async fn commit_sync(
        &mut self,
        subscriptions: &mut SubscriptionState,
        offsets: BTreeMap<StreamPartition, OffsetAndMetadata>,
    ) -> Result<()> {
        _ = self.named_group()?;

        self.flush_async_commits(subscriptions).await;

        if offsets.is_empty() {
            return Ok(());
        }

        let mut attempt = 0;

        loop {
            match self.send_commit(subscriptions, &offsets).await {
                Ok(()) => {
                    debug!(?offsets);
                    return Ok(());
                }

                Err(error)
                    if error
                        .error_code()
                        .is_some_and(|error_code| error_code.is_retriable())
                        && attempt < self.config.commit_retries() =>
                {
                    attempt += 1;
                    warn!(?error, attempt);
                    sleep(self.config.retry_backoff()).await;
                }

                Err(error) => {
                    warn!(?error, attempt, ?offsets);
                    return Err(Error::CommitFailed(Box::new(error)));
                }
            }
        }
    }

    /// queue a commit, completed by a later call in submission order
    pub(crate) fn commit_async(
        &mut self,
        offsets: BTreeMap<StreamPartition, OffsetAndMetadata>,
        callback: Option<OffsetCommitCallback>,
    ) {
        debug!(?offsets, callback = callback.is_some());

        self.pending_commits
            .push_back(PendingCommit { offsets, callback });
    }

    pub(crate) async fn flush_async_commits(&mut self, subscriptions: &mut SubscriptionState) {
        while let Some(PendingCommit { offsets, callback }) = self.pending_commits.pop_front() {
            let result = self.send_commit(subscriptions, &offsets).await;

            match callback {
                Some(callback) => callback(&offsets, result),
                None => {
                    if let Err(error) = result {
                        debug!(?error, ?offsets, "async commit");
                    }
                }
            }
        }
    }

    /// run the delayed tasks that are due, then complete queued commits
    #[instrument(skip_all)]
    pub(crate) async fn execute_delayed_task(
        &mut self,
        subscriptions: &mut SubscriptionState,
    ) -> Result<()> {
        if self.auto_commit()
            && !subscriptions.assignment().is_empty()
            && !self.tasks.is_scheduled(Task::AutoCommit)
        {
            self.tasks
                .schedule_after(Task::AutoCommit, self.config.auto_commit_interval());
        }

        for task in self.tasks.due(Instant::now()) {
            debug!(?task);

            match task {
                Task::AutoCommit => {
                    let consumed = subscriptions.all_consumed();

                    if !consumed.is_empty() {
                        self.commit_async(consumed, None);
                    }

                    self.tasks
                        .schedule_after(Task::AutoCommit, self.config.auto_commit_interval());
                }

                Task::Heartbeat => self.heartbeat(subscriptions).await,

                Task::MetadataRefresh => self.refresh_metadata(subscriptions).await?,
            }
        }

        self.flush_async_commits(subscriptions).await;

        Ok(())
    }

    async fn heartbeat(&mut self, subscriptions: &mut SubscriptionState) {
        let (Some(group_id), Some(generation)) = (self.group_id(), self.generation.clone()) else {
            return;
        };

        if self.state != MemberState::Stable {
            return;
        }

        match self.backend.heartbeat(&group_id, &generation).await {
            Ok(()) => debug!(%group_id, generation_id = generation.generation_id),

            Err(error) => match error.error_code() {
                Some(ErrorCode::RebalanceInProgress | ErrorCode::IllegalGeneration) => {
                    info!(%group_id, ?error, "rejoining");
                    self.state = MemberState::Joining;
                    subscriptions.request_rejoin();
                }

                Some(ErrorCode::UnknownMemberId) => {
                    info!(%group_id, ?error, "membership lost");
                    self.state = MemberState::Unjoined;
                    self.generation = None;
                    subscriptions.request_rejoin();
                    return;
                }

                _otherwise => warn!(%group_id, ?error),
            },
        }

        self.tasks
            .schedule_after(Task::Heartbeat, self.config.heartbeat_interval());
    }

    async fn refresh_metadata(&mut self, subscriptions: &mut SubscriptionState) -> Result<()> {
        let Some(pattern) = subscriptions.pattern().cloned() else {
            return Ok(());
        };

        match self.list_all_streams().await {
            Ok(names) => {
                let matched = names
                    .into_iter()
                    .filter(|name| pattern.is_match(name))
                    .collect::<BTreeSet<_>>();

                if subscriptions.set_group_subscription(matched) {
                    subscriptions.request_rejoin();
                }
            }

            Err(error) if error.error_code().is_some() => warn!(?error),
            Err(error) => return Err(error),
        }

        self.tasks
            .schedule_after(Task::MetadataRefresh, self.config.metadata_max_age());

        Ok(())
    }

    /// relinquish membership, ignoring backend errors
    #[instrument(skip_all)]
    pub(crate) async fn maybe_leave_group(&mut self) {
        self.tasks.cancel(Task::Heartbeat);
        self.tasks.cancel(Task::MetadataRefresh);
        self.state = MemberState::Unjoined;

        let (Some(group_id), Some(generation)) = (self.group_id(), self.generation.take()) else {
            return;
        };

        match self
            .backend
            .leave_group(&group_id, &generation.member_id)
            .await
        {
            Ok(()) => info!(%group_id, member_id = %generation.member_id, "left group"),
            Err(error) => warn!(%group_id, ?error, "leave group"),
        }
    }

    /// complete queued commits, commit consumed offsets and leave the group
    #[instrument(skip_all)]
    pub(crate) async fn close(&mut self, subscriptions: &mut SubscriptionState) {
        self.flush_async_commits(subscriptions).await;

        if self.auto_commit() {
            let consumed = subscriptions.all_consumed();

            if !consumed.is_empty() {
                if let Err(error) = self.commit_sync(subscriptions, consumed).await {
                    warn!(?error, "commit on close");
                }
            }
        }

        self.maybe_leave_group().await;
        self.tasks = DelayedTaskQueue::default();
    }
}
