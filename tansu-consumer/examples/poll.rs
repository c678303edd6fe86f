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

use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use dotenv::dotenv;
use tansu_consumer::{
    Config, Consumer, Error, OffsetResetStrategy, StreamPartition, memory::Memory,
};
use tracing::info;
use tracing_subscriber::{
    EnvFilter, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt,
};

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Parser)]
#[command(
    version,
    about = "Poll",
    long_about = None,
)]
struct Arg {
    /// The stream to consume from
    #[arg(long, default_value = "orders")]
    stream: String,

    /// The number of partitions in the stream
    #[arg(long, default_value = "3")]
    partitions: i32,

    /// The number of records produced to each partition
    #[arg(long, default_value = "25")]
    records: usize,

    /// The consumer group
    #[arg(long, default_value = "example")]
    group_id: String,

    /// The maximum number of records returned per partition by each poll
    #[arg(long, default_value = "10")]
    max_poll_records: usize,

    /// The time in milliseconds that each poll waits for records
    #[arg(long, default_value = "250")]
    poll_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    _ = dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_line_number(true)
                .with_thread_ids(false)
                .with_span_events(FmtSpan::NONE),
        )
        .init();

    let arg = Arg::parse();

    let backend = Memory::default();
    backend.create_stream(arg.stream.as_str(), arg.partitions)?;

    for partition in 0..arg.partitions {
        let partition = StreamPartition::new(arg.stream.as_str(), partition);

        for value in 0..arg.records {
            _ = backend.produce(
                &partition,
                None,
                Bytes::from(format!("{partition}: {value}")),
            )?;
        }
    }

    let consumer = Consumer::new(
        Config::builder()
            .client_id(env!("CARGO_PKG_NAME"))
            .group_id(arg.group_id)
            .auto_offset_reset(OffsetResetStrategy::Earliest)
            .max_poll_records(arg.max_poll_records)
            .build(),
        backend,
    );

    consumer.subscribe([arg.stream], None).await?;

    let expected = arg.records * usize::try_from(arg.partitions).unwrap_or_default();
    let mut consumed = 0;

    while consumed < expected {
        let records = consumer
            .poll(Duration::from_millis(arg.poll_timeout_ms))
            .await?;

        for record in records.values().flatten() {
            info!(
                partition = %record.partition(),
                offset = record.offset(),
                value = ?record.value()
            );
        }

        consumed += records.values().map(Vec::len).sum::<usize>();
        consumer.commit_sync().await?;
    }

    info!(consumed, assignment = ?consumer.assignment()?);

    consumer.close().await
}
