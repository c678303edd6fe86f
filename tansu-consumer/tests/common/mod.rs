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

#![allow(dead_code)]

use std::{fmt, sync::Arc};

use bytes::Bytes;
use tansu_consumer::{StreamPartition, memory::Memory};
use tokio::task::JoinError;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::{EnvFilter, filter::ParseError};

#[derive(Clone, Debug, thiserror::Error)]
pub(crate) enum Error {
    Consumer(#[from] tansu_consumer::Error),
    Join(Arc<JoinError>),
    Message(String),
    ParseFilter(Arc<ParseError>),
    Regex(#[from] regex::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Self::Join(Arc::new(value))
    }
}

impl From<ParseError> for Error {
    fn from(value: ParseError) -> Self {
        Self::ParseFilter(Arc::new(value))
    }
}

pub(crate) fn init_tracing() -> Result<DefaultGuard, Error> {
    Ok(tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_level(true)
            .with_line_number(true)
            .with_thread_names(false)
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(format!("{}=debug", env!("CARGO_CRATE_NAME")).parse()?)
                    .add_directive("tansu_consumer=debug".parse()?),
            )
            .with_test_writer()
            .finish(),
    ))
}

/// produce `count` records to a partition, with values "0", "1", ...
pub(crate) fn produce(
    backend: &Memory,
    partition: &StreamPartition,
    count: usize,
) -> Result<Vec<i64>, Error> {
    (0..count)
        .map(|value| {
            backend
                .produce(
                    partition,
                    Some(Bytes::from(format!("k{value}"))),
                    Bytes::from(value.to_string()),
                )
                .map_err(Into::into)
        })
        .collect()
}
