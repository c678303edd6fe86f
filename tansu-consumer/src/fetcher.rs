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

//! Fetcher
//!
//! Turns partition cursor reads into ordered per partition batches. Reads are
//! issued without waiting and keep progressing across polls, a response is
//! only applied when its partition is still assigned, unpaused and positioned
//! where the read started.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Debug, Formatter},
    sync::LazyLock,
};

use futures::{StreamExt, future::BoxFuture, stream::FuturesUnordered};
use opentelemetry::{KeyValue, metrics::Counter};
use tokio::time::{Duration, sleep};
use tracing::{debug, error, instrument, warn};

use crate::{
    Error, ErrorCode, METER, Result, StreamPartition,
    backend::{Backend, ReadResponse},
    consumer::ConsumerRecords,
    cursor::{Cursor, CursorCache, CursorPosition},
    guard::Wakeup,
    subscription::SubscriptionState,
};

static RECORDS_FETCHED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("consumer_records_fetched")
        .with_description("Records fetched")
        .build()
});

static FETCH_ERRORS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("consumer_fetch_errors")
        .with_description("Partition fetch errors")
        .build()
});

#[derive(Debug)]
struct FetchResponse {
    partition: StreamPartition,

    /// the position the read was issued from
    position: i64,
    result: Result<ReadResponse>,
}

pub(crate) struct Fetcher<B> {
    backend: B,
    max_poll_records: usize,
    in_flight: FuturesUnordered<BoxFuture<'static, FetchResponse>>,
    pending: BTreeMap<StreamPartition, i64>,
}

impl<B> Debug for Fetcher<B>
where
    B: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(Fetcher))
            .field("backend", &self.backend)
            .field("max_poll_records", &self.max_poll_records)
            .field("pending", &self.pending)
            .finish()
    }
}

impl<B> Fetcher<B>
where
    B: Backend,
{
    pub(crate) fn new(backend: B, max_poll_records: usize) -> Self {
        Self {
            backend,
            max_poll_records: max_poll_records.max(1),
            in_flight: FuturesUnordered::new(),
            pending: BTreeMap::new(),
        }
    }

    /// partitions with a read in flight
    pub(crate) fn pending(&self) -> BTreeSet<StreamPartition> {
        self.pending.keys().cloned().collect()
    }

    /// issue a read for every fetchable partition without one in flight
    pub(crate) fn send_fetch_requests(
        &mut self,
        subscriptions: &SubscriptionState,
        cursors: &CursorCache,
    ) -> usize {
        let mut sent = 0;

        for (partition, position) in subscriptions.fetchable_partitions() {
            if self.pending.contains_key(&partition) {
                continue;
            }

            debug!(%partition, position, cursor = ?cursors.get(&partition));

            let request = read(
                self.backend.clone(),
                partition.clone(),
                position,
                cursors.get(&partition).cloned(),
                self.max_poll_records,
            );

            self.in_flight.push(Box::pin(request));
            _ = self.pending.insert(partition, position);
            sent += 1;
        }

        sent
    }

    /// wait for in flight reads, applying their responses
    #[instrument(skip_all)]
    pub(crate) async fn fetch_records(
        &mut self,
        timeout: Duration,
        subscriptions: &mut SubscriptionState,
        cursors: &mut CursorCache,
        wakeup: &Wakeup,
    ) -> Result<ConsumerRecords> {
        let mut responses = vec![];

        let patience = sleep(timeout);
        tokio::pin!(patience);

        while !self.in_flight.is_empty() {
            tokio::select! {
                response = self.in_flight.next() => {
                    if let Some(response) = response {
                        responses.push(response)
                    }
                }

                expired = &mut patience => {
                    debug!(?expired, pending = ?self.pending.keys().collect::<Vec<_>>());
                    break
                }

                _woken = wakeup.raised() => {
                    debug!(discarding = responses.len());

                    for response in responses {
                        _ = self.pending.remove(&response.partition);
                        cursors.invalidate(&response.partition);
                    }

                    return Err(Error::Wakeup)
                }
            }
        }

        self.apply(responses, subscriptions, cursors)
    }

    fn apply(
        &mut self,
        responses: Vec<FetchResponse>,
        subscriptions: &mut SubscriptionState,
        cursors: &mut CursorCache,
    ) -> Result<ConsumerRecords> {
        let mut fetched = ConsumerRecords::new();
        let mut failures = vec![];
        let responded = responses.len();

        for FetchResponse {
            partition,
            position,
            result,
        } in responses
        {
            _ = self.pending.remove(&partition);

            if !subscriptions.is_assigned(&partition)
                || subscriptions.is_paused(&partition)
                || subscriptions.position(&partition) != Some(position)
            {
                debug!(%partition, position, current = ?subscriptions.position(&partition), "discarding");
                cursors.invalidate(&partition);
                continue;
            }

            match result {
                Ok(ReadResponse { records, next }) => {
                    let records = records
                        .into_iter()
                        .filter(|record| record.offset >= position)
                        .collect::<Vec<_>>();

                    if let Some(last) = records.last() {
                        subscriptions.set_position(&partition, last.offset + 1)?;
                    }

                    debug!(%partition, position, records = records.len(), %next);

                    RECORDS_FETCHED.add(
                        records.len() as u64,
                        &[KeyValue::new("stream", partition.stream().to_owned())],
                    );

                    cursors.insert(partition.clone(), next);
                    fetched.entry(partition).or_default().extend(records);
                }

                Err(error) => {
                    FETCH_ERRORS.add(
                        1,
                        &[KeyValue::new("stream", partition.stream().to_owned())],
                    );

                    self.recover(&partition, &error, subscriptions, cursors)?;
                    failures.push(error);
                }
            }
        }

        if responded > 0 && fetched.is_empty() && failures.len() == responded {
            if let Some(error_code) = failures
                .iter()
                .filter_map(Error::error_code)
                .find(ErrorCode::is_fatal)
            {
                error!(?error_code, "every partition failed");
                return Err(Error::Fatal(error_code));
            }
        }

        Ok(fetched)
    }

    fn recover(
        &mut self,
        partition: &StreamPartition,
        error: &Error,
        subscriptions: &mut SubscriptionState,
        cursors: &mut CursorCache,
    ) -> Result<()> {
        match error.error_code() {
            Some(ErrorCode::OffsetOutOfRange) => {
                let strategy = subscriptions.default_reset();
                warn!(%partition, ?strategy, "offset out of range");

                cursors.invalidate(partition);
                subscriptions.need_offset_reset(partition, strategy)
            }

            Some(ErrorCode::ExpiredCursor) => {
                debug!(%partition, "expired cursor");
                cursors.invalidate(partition);
                Ok(())
            }

            Some(error_code) if error_code.is_retriable() => {
                warn!(%partition, ?error_code, "retrying");
                Ok(())
            }

            Some(error_code) if error_code.is_fatal() => {
                error!(%partition, ?error_code);
                Ok(())
            }

            _otherwise => {
                warn!(%partition, ?error);
                cursors.invalidate(partition);
                Ok(())
            }
        }
    }

    /// a read in flight for a paused partition stays pending until it completes
    pub(crate) fn pause(&mut self, partition: &StreamPartition, cursors: &mut CursorCache) {
        if let Some(position) = self.pending.get(partition) {
            debug!(%partition, position, "read in flight while paused");
        }

        cursors.invalidate(partition);
    }
}

async fn read<B>(
    backend: B,
    partition: StreamPartition,
    position: i64,
    cursor: Option<Cursor>,
    limit: usize,
) -> FetchResponse
where
    B: Backend,
{
    let result: Result<ReadResponse> = async {
        let cursor = match cursor {
            Some(cursor) => cursor,
            None => {
                backend
                    .partition_cursor(&partition, CursorPosition::AtOffset(position))
                    .await?
            }
        };

        backend.read(&cursor, limit).await
    }
    .await;

    FetchResponse {
        partition,
        position,
        result,
    }
}
