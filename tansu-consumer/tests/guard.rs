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

use std::{sync::Arc, thread, time::Duration};

use pretty_assertions::assert_eq;
use tansu_consumer::{
    Config, Consumer, ConsumerRecords, OffsetResetStrategy, StreamPartition, memory::Memory,
};
use tokio::runtime::Builder;

use crate::common::{Error, init_tracing, produce};

mod common;

const ORDERS: &str = "orders";

fn config() -> Config {
    Config::builder()
        .group_id("billing")
        .auto_offset_reset(OffsetResetStrategy::Earliest)
        .enable_auto_commit(false)
        .build()
}

fn block_on<F>(future: F) -> Result<F::Output, Error>
where
    F: Future,
{
    Builder::new_current_thread()
        .enable_time()
        .build()
        .map(|runtime| runtime.block_on(future))
        .map_err(|error| Error::Message(error.to_string()))
}

#[tokio::test]
async fn closed_consumer_refuses_calls() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let backend = Memory::default();
    backend.create_stream(ORDERS, 1)?;

    let p0 = StreamPartition::new(ORDERS, 0);

    let consumer = Consumer::new(config(), backend);
    consumer.assign([p0.clone()]).await?;
    consumer.close().await?;

    assert!(matches!(
        consumer.poll(Duration::from_millis(10)).await,
        Err(tansu_consumer::Error::Closed)
    ));
    assert!(matches!(
        consumer.seek(&p0, 0),
        Err(tansu_consumer::Error::Closed)
    ));
    assert!(matches!(
        consumer.commit_sync().await,
        Err(tansu_consumer::Error::Closed)
    ));
    assert!(matches!(
        consumer.subscribe([ORDERS], None).await,
        Err(tansu_consumer::Error::Closed)
    ));
    assert!(matches!(
        consumer.position(&p0).await,
        Err(tansu_consumer::Error::Closed)
    ));

    consumer.close().await?;

    Ok(())
}

#[test]
fn second_thread_refused() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let backend = Memory::default();
    backend.create_stream(ORDERS, 1)?;
    backend.read_delay(Some(Duration::from_millis(500)))?;

    let p0 = StreamPartition::new(ORDERS, 0);
    _ = produce(&backend, &p0, 3)?;

    let consumer = Arc::new(Consumer::new(config(), backend));

    block_on({
        let consumer = consumer.clone();
        let p0 = p0.clone();
        async move {
            consumer.assign([p0.clone()]).await?;
            consumer.seek(&p0, 0)
        }
    })??;

    let owner = {
        let consumer = consumer.clone();
        thread::spawn(move || {
            block_on(async move { consumer.poll(Duration::from_secs(5)).await })
        })
    };

    thread::sleep(Duration::from_millis(100));

    let intruder = {
        let consumer = consumer.clone();
        thread::spawn(move || {
            block_on(async move { consumer.poll(Duration::from_secs(5)).await })
        })
    };

    let intruded = intruder
        .join()
        .map_err(|_| Error::Message("intruder panicked".into()))??;

    assert!(matches!(
        intruded,
        Err(tansu_consumer::Error::ConcurrentAccess)
    ));

    let records: ConsumerRecords = owner
        .join()
        .map_err(|_| Error::Message("owner panicked".into()))???;

    assert_eq!(3, records[&p0].len());

    let position = block_on(async move { consumer.position(&p0).await })??;
    assert_eq!(3, position);

    Ok(())
}
