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

//! Consumer
//!
//! The public entry point. Every operation takes the single owner guard, so a
//! consumer used from a second thread fails with [`Error::ConcurrentAccess`]
//! rather than waiting. Group coordination, delayed tasks and async commit
//! callbacks all run on the caller's task during [`Consumer::poll`] and the
//! other calls into the consumer.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use tokio::{
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant, sleep},
};
use tracing::{debug, instrument, warn};

use crate::{
    Error, OffsetAndMetadata, OffsetResetStrategy, Record, Result, StreamPartition,
    backend::{Backend, Generation, StreamDescription},
    config::Config,
    coordinator::Coordinator,
    cursor::CursorCache,
    fetcher::Fetcher,
    guard::{AccessGuard, Wakeup},
    subscription::{RebalanceListener, Subscription, SubscriptionState},
};

/// records by partition, in offset order within each partition
pub type ConsumerRecords = BTreeMap<StreamPartition, Vec<Record>>;

/// called with the offsets of an async commit and its outcome
pub type OffsetCommitCallback =
    Box<dyn FnOnce(&BTreeMap<StreamPartition, OffsetAndMetadata>, Result<()>) + Send + Sync>;

#[derive(Debug)]
struct Inner<B> {
    subscriptions: SubscriptionState,
    cursors: CursorCache,
    coordinator: Coordinator<B>,
    fetcher: Fetcher<B>,
}

#[derive(Debug)]
pub struct Consumer<B> {
    config: Config,
    guard: AccessGuard,
    wakeup: Wakeup,
    inner: Mutex<Inner<B>>,
}

impl<B> Consumer<B>
where
    B: Backend,
{
    pub fn new(config: Config, backend: B) -> Self {
        debug!(?config);

        let inner = Inner {
            subscriptions: SubscriptionState::new(config.auto_offset_reset()),
            cursors: CursorCache::default(),
            coordinator: Coordinator::new(backend.clone(), config.clone()),
            fetcher: Fetcher::new(backend, config.max_poll_records()),
        };

        Self {
            config,
            guard: AccessGuard::default(),
            wakeup: Wakeup::default(),
            inner: Mutex::new(inner),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// the consumer state, already borrowed by the owner re-entering from a callback
    fn inner(&self) -> Result<MutexGuard<'_, Inner<B>>> {
        self.inner.try_lock().map_err(|_| Error::ConcurrentAccess)
    }

    pub fn assignment(&self) -> Result<BTreeSet<StreamPartition>> {
        let _access = self.guard.acquire()?;
        self.inner().map(|inner| inner.subscriptions.assignment())
    }

    pub fn subscription(&self) -> Result<BTreeSet<String>> {
        let _access = self.guard.acquire()?;
        self.inner().map(|inner| inner.subscriptions.subscription())
    }

    /// subscribe to streams, an empty list unsubscribes
    pub async fn subscribe(
        &self,
        streams: impl IntoIterator<Item = impl Into<String>>,
        listener: Option<Box<dyn RebalanceListener>>,
    ) -> Result<()> {
        let _access = self.guard.acquire()?;

        let streams = streams.into_iter().map(Into::into).collect::<BTreeSet<String>>();

        if streams.iter().any(|stream| stream.trim().is_empty()) {
            return Err(Error::InvalidArgument(
                "stream name must not be empty".into(),
            ));
        }

        if streams.is_empty() {
            return self.unsubscribe().await;
        }

        let mut inner = self.inner()?;
        let Inner {
            subscriptions,
            cursors,
            coordinator,
            ..
        } = &mut *inner;

        if matches!(subscriptions.subscription_mode(), Subscription::UserAssigned) {
            coordinator.maybe_leave_group().await;
        }

        subscriptions.subscribe(streams, listener);
        cursors.retain(|partition| subscriptions.is_assigned(partition));

        Ok(())
    }

    /// subscribe to every stream matching a pattern
    pub async fn subscribe_pattern(
        &self,
        pattern: Regex,
        listener: Option<Box<dyn RebalanceListener>>,
    ) -> Result<()> {
        let _access = self.guard.acquire()?;

        let mut inner = self.inner()?;
        let Inner {
            subscriptions,
            cursors,
            coordinator,
            ..
        } = &mut *inner;

        if matches!(subscriptions.subscription_mode(), Subscription::UserAssigned) {
            coordinator.maybe_leave_group().await;
        }

        subscriptions.subscribe_pattern(pattern, listener);
        cursors.retain(|partition| subscriptions.is_assigned(partition));

        Ok(())
    }

    /// manually assign partitions, an empty list unsubscribes
    pub async fn assign(&self, partitions: impl IntoIterator<Item = StreamPartition>) -> Result<()> {
        let _access = self.guard.acquire()?;

        let partitions = partitions.into_iter().collect::<BTreeSet<_>>();

        if partitions.is_empty() {
            return self.unsubscribe().await;
        }

        let mut inner = self.inner()?;
        let Inner {
            subscriptions,
            cursors,
            coordinator,
            ..
        } = &mut *inner;

        if subscriptions.partitions_auto_assigned() {
            coordinator.maybe_leave_group().await;
        }

        subscriptions.assign_from_user(partitions);
        cursors.retain(|partition| subscriptions.is_assigned(partition));

        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn unsubscribe(&self) -> Result<()> {
        let _access = self.guard.acquire()?;

        let mut inner = self.inner()?;
        let Inner {
            subscriptions,
            cursors,
            coordinator,
            ..
        } = &mut *inner;

        if subscriptions.partitions_auto_assigned() {
            let revoked = subscriptions.assignment();

            if let Some(listener) = subscriptions.listener() {
                listener.on_partitions_revoked(&revoked);
            }

            coordinator.maybe_leave_group().await;
        }

        subscriptions.unsubscribe();
        cursors.clear();

        Ok(())
    }

    /// fetch records, waiting up to the timeout when none are available
    #[instrument(skip_all)]
    pub async fn poll(&self, timeout: Duration) -> Result<ConsumerRecords> {
        let _access = self.guard.acquire()?;

        if self.wakeup.take() {
            return Err(Error::Wakeup);
        }

        let mut inner = self.inner()?;
        let Inner {
            subscriptions,
            cursors,
            coordinator,
            fetcher,
        } = &mut *inner;

        if matches!(subscriptions.subscription_mode(), Subscription::Unsubscribed) {
            return Err(Error::IllegalState(
                "not subscribed to any streams or assigned any partitions".into(),
            ));
        }

        let deadline = Instant::now() + timeout;

        loop {
            coordinator
                .ensure_group_stable(subscriptions, cursors)
                .await?;

            let missing = subscriptions.missing_positions();

            match coordinator
                .update_fetch_positions(&missing, subscriptions, cursors)
                .await
            {
                Err(error @ Error::Fatal(_)) => return Err(error),
                Err(error) if error.error_code().is_some() => warn!(?error, ?missing),
                Err(error) => return Err(error),
                Ok(()) => (),
            }

            let sent = fetcher.send_fetch_requests(subscriptions, cursors);

            let records = fetcher
                .fetch_records(
                    deadline.saturating_duration_since(Instant::now()),
                    subscriptions,
                    cursors,
                    &self.wakeup,
                )
                .await?;

            coordinator.execute_delayed_task(subscriptions).await?;

            debug!(
                sent,
                in_flight = fetcher.pending().len(),
                partitions = records.len(),
                records = records.values().map(Vec::len).sum::<usize>(),
                state = ?coordinator.state()
            );

            let remaining = deadline.saturating_duration_since(Instant::now());

            if remaining.is_zero() || records.values().any(|records| !records.is_empty()) {
                return Ok(records);
            }

            let backoff = coordinator.next_deadline().map_or(
                self.config.retry_backoff().min(remaining),
                |deadline| {
                    self.config
                        .retry_backoff()
                        .min(remaining)
                        .min(deadline.saturating_duration_since(Instant::now()))
                },
            );

            tokio::select! {
                _backoff = sleep(backoff) => (),
                _woken = self.wakeup.raised() => return Err(Error::Wakeup),
            }
        }
    }

    /// poll with a timeout in milliseconds, which must not be negative
    pub async fn poll_ms(&self, timeout_ms: i64) -> Result<ConsumerRecords> {
        let timeout_ms = u64::try_from(timeout_ms).map_err(|_| {
            Error::InvalidArgument(format!("timeout must not be negative: {timeout_ms}"))
        })?;

        self.poll(Duration::from_millis(timeout_ms)).await
    }

    /// synchronously commit the consumed position of every assigned partition
    pub async fn commit_sync(&self) -> Result<()> {
        let _access = self.guard.acquire()?;

        let consumed = self
            .inner()
            .map(|inner| inner.subscriptions.all_consumed())?;

        self.commit_sync_offsets(consumed).await
    }

    pub async fn commit_sync_offsets(
        &self,
        offsets: BTreeMap<StreamPartition, OffsetAndMetadata>,
    ) -> Result<()> {
        let _access = self.guard.acquire()?;

        let mut inner = self.inner()?;
        let Inner {
            subscriptions,
            coordinator,
            ..
        } = &mut *inner;

        coordinator.commit_sync(subscriptions, offsets).await
    }

    /// queue a commit of the consumed position of every assigned partition
    pub fn commit_async(&self, callback: Option<OffsetCommitCallback>) -> Result<()> {
        let _access = self.guard.acquire()?;

        let consumed = self
            .inner()
            .map(|inner| inner.subscriptions.all_consumed())?;

        self.commit_async_offsets(consumed, callback)
    }

    /// queue a commit, completed in submission order during a later call
    pub fn commit_async_offsets(
        &self,
        offsets: BTreeMap<StreamPartition, OffsetAndMetadata>,
        callback: Option<OffsetCommitCallback>,
    ) -> Result<()> {
        let _access = self.guard.acquire()?;

        self.inner()
            .map(|mut inner| inner.coordinator.commit_async(offsets, callback))
    }

    /// the next offset fetched for an assigned partition
    pub fn seek(&self, partition: &StreamPartition, offset: i64) -> Result<()> {
        let _access = self.guard.acquire()?;

        let mut inner = self.inner()?;
        inner.subscriptions.seek(partition, offset)?;
        inner.cursors.invalidate(partition);

        Ok(())
    }

    /// seek to the earliest offset, every assigned partition when empty
    pub fn seek_to_beginning(
        &self,
        partitions: impl IntoIterator<Item = StreamPartition>,
    ) -> Result<()> {
        self.reset_offsets(partitions, OffsetResetStrategy::Earliest)
    }

    /// seek to the end offset, every assigned partition when empty
    pub fn seek_to_end(&self, partitions: impl IntoIterator<Item = StreamPartition>) -> Result<()> {
        self.reset_offsets(partitions, OffsetResetStrategy::Latest)
    }

    fn reset_offsets(
        &self,
        partitions: impl IntoIterator<Item = StreamPartition>,
        strategy: OffsetResetStrategy,
    ) -> Result<()> {
        let _access = self.guard.acquire()?;

        let mut inner = self.inner()?;
        let Inner {
            subscriptions,
            cursors,
            ..
        } = &mut *inner;

        let partitions = Some(partitions.into_iter().collect::<BTreeSet<_>>())
            .filter(|partitions| !partitions.is_empty())
            .unwrap_or_else(|| subscriptions.assignment());

        validate_assigned(subscriptions, &partitions)?;

        for partition in &partitions {
            debug!(%partition, ?strategy);
            subscriptions.need_offset_reset(partition, strategy)?;
            cursors.invalidate(partition);
        }

        Ok(())
    }

    /// the position of an assigned partition, resolving it when unknown
    pub async fn position(&self, partition: &StreamPartition) -> Result<i64> {
        let _access = self.guard.acquire()?;

        let mut inner = self.inner()?;
        let Inner {
            subscriptions,
            cursors,
            coordinator,
            ..
        } = &mut *inner;

        if !subscriptions.is_assigned(partition) {
            return Err(Error::InvalidArgument(format!(
                "no current assignment for partition {partition}"
            )));
        }

        if let Some(position) = subscriptions.position(partition) {
            return Ok(position);
        }

        coordinator
            .update_fetch_positions(&BTreeSet::from([partition.clone()]), subscriptions, cursors)
            .await?;

        subscriptions.position(partition).ok_or_else(|| {
            Error::IllegalState(format!("unable to resolve position of {partition}"))
        })
    }

    /// the last committed offset of a partition, assigned or not
    pub async fn committed(&self, partition: &StreamPartition) -> Result<Option<OffsetAndMetadata>> {
        let _access = self.guard.acquire()?;

        let mut inner = self.inner()?;
        let Inner {
            subscriptions,
            coordinator,
            ..
        } = &mut *inner;

        if subscriptions.is_assigned(partition) {
            if subscriptions.committed(partition).is_none() {
                coordinator
                    .refresh_committed_offsets_if_needed(subscriptions)
                    .await?;
            }

            Ok(subscriptions.committed(partition).cloned())
        } else {
            coordinator
                .fetch_committed_offsets(&BTreeSet::from([partition.clone()]))
                .await
                .map(|mut committed| committed.remove(partition))
        }
    }

    pub fn pause(&self, partitions: impl IntoIterator<Item = StreamPartition>) -> Result<()> {
        let _access = self.guard.acquire()?;

        let mut inner = self.inner()?;
        let Inner {
            subscriptions,
            cursors,
            fetcher,
            ..
        } = &mut *inner;

        let partitions = partitions.into_iter().collect::<BTreeSet<_>>();
        validate_assigned(subscriptions, &partitions)?;

        for partition in &partitions {
            subscriptions.pause(partition)?;
            fetcher.pause(partition, cursors);
        }

        Ok(())
    }

    pub fn resume(&self, partitions: impl IntoIterator<Item = StreamPartition>) -> Result<()> {
        let _access = self.guard.acquire()?;

        let mut inner = self.inner()?;

        let partitions = partitions.into_iter().collect::<BTreeSet<_>>();
        validate_assigned(&inner.subscriptions, &partitions)?;

        for partition in &partitions {
            inner.subscriptions.resume(partition)?;
        }

        Ok(())
    }

    pub fn paused(&self) -> Result<BTreeSet<StreamPartition>> {
        let _access = self.guard.acquire()?;
        self.inner()
            .map(|inner| inner.subscriptions.paused_partitions())
    }

    pub async fn describe_stream(&self, stream: &str) -> Result<StreamDescription> {
        let _access = self.guard.acquire()?;

        let inner = self.inner()?;
        inner.coordinator.describe_stream(stream).await
    }

    /// every stream name known to the backend
    pub async fn list_streams(&self) -> Result<Vec<String>> {
        let _access = self.guard.acquire()?;

        let inner = self.inner()?;
        inner.coordinator.list_all_streams().await
    }

    /// the current group membership, if joined
    pub fn generation(&self) -> Result<Option<Generation>> {
        let _access = self.guard.acquire()?;
        self.inner()
            .map(|inner| inner.coordinator.generation().cloned())
    }

    /// interrupt a poll in progress, or the next poll, from any thread
    pub fn wakeup(&self) {
        debug!("wakeup");
        self.wakeup.raise()
    }

    /// complete queued commits, commit consumed offsets and leave the group
    #[instrument(skip_all)]
    pub async fn close(&self) -> Result<()> {
        if self.guard.is_closed() {
            return Ok(());
        }

        let _access = self.guard.acquire()?;

        let mut inner = self.inner()?;
        let Inner {
            subscriptions,
            cursors,
            coordinator,
            ..
        } = &mut *inner;

        coordinator.close(subscriptions).await;
        cursors.clear();

        self.guard.close();

        Ok(())
    }
}

fn validate_assigned(
    subscriptions: &SubscriptionState,
    partitions: &BTreeSet<StreamPartition>,
) -> Result<()> {
    partitions
        .iter()
        .find(|partition| !subscriptions.is_assigned(partition))
        .map_or(Ok(()), |partition| {
            Err(Error::InvalidArgument(format!(
                "no current assignment for partition {partition}"
            )))
        })
}
