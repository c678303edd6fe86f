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
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use pretty_assertions::assert_eq;
use tansu_consumer::{
    Config, Consumer, ErrorCode, OffsetAndMetadata, OffsetResetStrategy, StreamPartition,
    memory::{Memory, Operation},
};
use tokio::time::sleep;
use tracing::debug;

use crate::common::{Error, init_tracing, produce};

mod common;

const ORDERS: &str = "orders";
const GROUP: &str = "billing";

#[tokio::test]
async fn committed_after_commit_sync() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let backend = Memory::default();
    backend.create_stream(ORDERS, 1)?;

    let p0 = StreamPartition::new(ORDERS, 0);
    _ = produce(&backend, &p0, 5)?;

    let consumer = Consumer::new(
        Config::builder()
            .group_id(GROUP)
            .auto_offset_reset(OffsetResetStrategy::Earliest)
            .enable_auto_commit(false)
            .build(),
        backend.clone(),
    );
    consumer.assign([p0.clone()]).await?;

    let records = consumer.poll(Duration::from_secs(1)).await?;
    assert_eq!(5, records[&p0].len());

    consumer.commit_sync().await?;
    assert_eq!(Some(OffsetAndMetadata::new(5)?), backend.committed(GROUP, &p0)?);

    let before = backend.requests(Operation::CommittedOffsets)?;
    assert_eq!(Some(OffsetAndMetadata::new(5)?), consumer.committed(&p0).await?);
    assert_eq!(before, backend.requests(Operation::CommittedOffsets)?);

    Ok(())
}

#[tokio::test]
async fn committed_of_unassigned_partition() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let backend = Memory::default();
    backend.create_stream(ORDERS, 2)?;

    let p0 = StreamPartition::new(ORDERS, 0);
    let p1 = StreamPartition::new(ORDERS, 1);

    let config = Config::builder()
        .group_id(GROUP)
        .enable_auto_commit(false)
        .build();

    let other = Consumer::new(config.clone(), backend.clone());
    other.assign([p1.clone()]).await?;
    other
        .commit_sync_offsets(BTreeMap::from([(
            p1.clone(),
            OffsetAndMetadata::new(32)?.metadata(Some("checkpoint".into())),
        )]))
        .await?;

    let consumer = Consumer::new(config, backend.clone());
    consumer.assign([p0.clone()]).await?;

    let committed = consumer.committed(&p1).await?;
    assert_eq!(Some(32), committed.as_ref().map(OffsetAndMetadata::offset));
    assert_eq!(
        Some("checkpoint"),
        committed.as_ref().and_then(OffsetAndMetadata::metadata_str)
    );

    assert_eq!(None, consumer.committed(&p0).await?);
    assert_eq!(BTreeSet::from([p0]), consumer.assignment()?);

    Ok(())
}

#[tokio::test]
async fn commit_without_group() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let backend = Memory::default();
    backend.create_stream(ORDERS, 1)?;

    let p0 = StreamPartition::new(ORDERS, 0);

    let consumer = Consumer::new(Config::default(), backend.clone());
    consumer.assign([p0.clone()]).await?;
    consumer.seek(&p0, 0)?;

    assert!(matches!(
        consumer.commit_sync().await,
        Err(tansu_consumer::Error::InvalidGroupId)
    ));

    assert!(matches!(
        consumer.committed(&p0).await,
        Err(tansu_consumer::Error::InvalidGroupId)
    ));

    assert_eq!(0, backend.requests(Operation::CommitOffsets)?);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn auto_commit_on_interval() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let backend = Memory::default();
    backend.create_stream(ORDERS, 1)?;

    let p0 = StreamPartition::new(ORDERS, 0);
    _ = produce(&backend, &p0, 10)?;

    let consumer = Consumer::new(
        Config::builder()
            .group_id(GROUP)
            .auto_offset_reset(OffsetResetStrategy::Earliest)
            .auto_commit_interval(Duration::from_millis(5_000))
            .build(),
        backend.clone(),
    );
    consumer.subscribe([ORDERS], None).await?;

    let mut first_commit = None;

    for iteration in 0..10 {
        let records = consumer.poll(Duration::from_millis(1_000)).await?;
        debug!(iteration, records = records.values().map(Vec::len).sum::<usize>());

        if first_commit.is_none() {
            if let Some(committed) = backend.committed(GROUP, &p0)? {
                assert_eq!(consumer.position(&p0).await?, committed.offset());
                first_commit = Some(iteration);
            }
        }

        sleep(Duration::from_millis(600)).await;
    }

    assert!(first_commit.is_some_and(|iteration| iteration <= 8));
    assert_eq!(Some(OffsetAndMetadata::new(10)?), backend.committed(GROUP, &p0)?);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn async_commit_callbacks_in_order() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let backend = Memory::default();
    backend.create_stream(ORDERS, 1)?;

    let p0 = StreamPartition::new(ORDERS, 0);
    _ = produce(&backend, &p0, 3)?;

    let consumer = Consumer::new(
        Config::builder()
            .group_id(GROUP)
            .enable_auto_commit(false)
            .build(),
        backend.clone(),
    );
    consumer.assign([p0.clone()]).await?;

    let completed = Arc::new(Mutex::new(Vec::new()));

    backend.inject(Operation::CommitOffsets, ErrorCode::Unavailable)?;

    for offset in 1..=3 {
        let completed = completed.clone();

        consumer.commit_async_offsets(
            BTreeMap::from([(p0.clone(), OffsetAndMetadata::new(offset)?)]),
            Some(Box::new(
                move |offsets: &BTreeMap<StreamPartition, OffsetAndMetadata>,
                      result: tansu_consumer::Result<()>| {
                    if let Ok(mut completed) = completed.lock() {
                        completed.push((
                            offsets.values().map(OffsetAndMetadata::offset).sum::<i64>(),
                            result.is_ok(),
                        ))
                    }
                },
            )),
        )?;
    }

    assert!(completed.lock().is_ok_and(|completed| completed.is_empty()));

    consumer.seek(&p0, 0)?;
    _ = consumer.poll(Duration::from_millis(100)).await?;

    assert_eq!(
        vec![(1, false), (2, true), (3, true)],
        completed
            .lock()
            .map(|completed| completed.clone())
            .map_err(|error| Error::Message(error.to_string()))?
    );
    assert_eq!(Some(OffsetAndMetadata::new(3)?), backend.committed(GROUP, &p0)?);

    Ok(())
}
