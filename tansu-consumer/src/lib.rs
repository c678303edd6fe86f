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

//! Tansu Consumer
//!
//! A subscribe/poll consumer runtime over a partition cursor [`Backend`].
//!
//! The [`Consumer`] provides consumer group semantics (membership, rebalance,
//! position and offset commit bookkeeping, pause/resume, sync and async
//! commit) on top of a backend whose native model is reading a partition
//! from a cursor.
//!
//! ```
//! # use tansu_consumer::{Config, Consumer, Error, OffsetResetStrategy, memory::Memory};
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Error> {
//! let backend = Memory::default();
//! backend.create_stream("orders", 3)?;
//!
//! let consumer = Consumer::new(
//!     Config::builder()
//!         .group_id("billing")
//!         .auto_offset_reset(OffsetResetStrategy::Earliest)
//!         .build(),
//!     backend,
//! );
//!
//! consumer.subscribe(["orders"], None).await?;
//! let records = consumer.poll(Duration::from_millis(100)).await?;
//! assert!(records.values().all(|records| records.is_empty()));
//! # Ok(())
//! # }
//! ```

use std::{
    fmt::{self, Display, Formatter},
    num::ParseIntError,
    result,
    str::{FromStr, ParseBoolError},
    sync::{LazyLock, PoisonError},
    time::SystemTime,
};

use bytes::Bytes;
use opentelemetry::{InstrumentationScope, global, metrics::Meter};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use serde::{Deserialize, Serialize};

pub mod assignor;
pub mod backend;
pub mod config;
pub mod consumer;
pub mod cursor;
pub mod memory;
pub mod subscription;

mod coordinator;
mod fetcher;
mod guard;
mod task;

pub use assignor::Assignor;
pub use backend::Backend;
pub use config::Config;
pub use consumer::{Consumer, ConsumerRecords, OffsetCommitCallback};
pub use subscription::{NoOpRebalanceListener, RebalanceListener};

pub(crate) static METER: LazyLock<Meter> = LazyLock::new(|| {
    global::meter_with_scope(
        InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
});

/// Backend error codes
///
/// Returned by a [`Backend`] inside [`Error::Api`].
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum ErrorCode {
    #[default]
    None,
    CoordinatorNotAvailable,
    ExpiredCursor,
    IllegalGeneration,
    NotAuthorized,
    OffsetOutOfRange,
    RebalanceInProgress,
    RequestTimedOut,
    Unavailable,
    UnknownMemberId,
    UnknownPartition,
    UnknownStream,
}

impl ErrorCode {
    /// transient conditions that are worth another attempt
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::CoordinatorNotAvailable | Self::RequestTimedOut | Self::Unavailable
        )
    }

    /// the backend will never serve this request
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NotAuthorized | Self::UnknownStream)
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Consumer Errors
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    Api(ErrorCode),
    Closed,
    CommitFailed(Box<Error>),
    ConcurrentAccess,
    Fatal(ErrorCode),
    GroupCoordination(Box<Error>),
    IllegalState(String),
    InvalidArgument(String),
    InvalidGroupId,
    Message(String),
    ParseBool(#[from] ParseBoolError),
    ParseInt(#[from] ParseIntError),
    Poison,
    Regex(#[from] regex::Error),
    UnknownAssignor(String),
    UnknownOffsetReset(String),
    Wakeup,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(msg) => write!(f, "{msg}"),
            error => write!(f, "{error:?}"),
        }
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_value: PoisonError<T>) -> Self {
        Self::Poison
    }
}

impl From<ErrorCode> for Error {
    fn from(value: ErrorCode) -> Self {
        Self::Api(value)
    }
}

impl Error {
    /// the backend error code carried by this error, if any
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Api(error_code) | Self::Fatal(error_code) => Some(*error_code),
            Self::CommitFailed(cause) | Self::GroupCoordination(cause) => cause.error_code(),
            _otherwise => None,
        }
    }
}

pub type Result<T, E = Error> = result::Result<T, E>;

/// Stream Partition
///
/// A stream and partition pair, identifying one ordered partition.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct StreamPartition {
    stream: String,
    partition: i32,
}

impl StreamPartition {
    pub fn new(stream: impl Into<String>, partition: i32) -> Self {
        let stream = stream.into();
        Self { stream, partition }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl Display for StreamPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.stream, self.partition)
    }
}

impl<S> From<(S, i32)> for StreamPartition
where
    S: Into<String>,
{
    fn from((stream, partition): (S, i32)) -> Self {
        Self::new(stream, partition)
    }
}

/// Offset And Metadata
///
/// A committed offset with optional metadata.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct OffsetAndMetadata {
    offset: i64,
    metadata: Option<String>,
}

impl OffsetAndMetadata {
    pub fn new(offset: i64) -> Result<Self> {
        if offset < 0 {
            Err(Error::InvalidArgument(format!(
                "invalid negative offset: {offset}"
            )))
        } else {
            Ok(Self {
                offset,
                metadata: None,
            })
        }
    }

    pub fn metadata(self, metadata: Option<String>) -> Self {
        Self { metadata, ..self }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn metadata_str(&self) -> Option<&str> {
        self.metadata.as_deref()
    }
}

/// Offset Reset Strategy
///
/// Where to position a partition that has no committed offset.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum OffsetResetStrategy {
    Earliest,
    #[default]
    Latest,
}

impl OffsetResetStrategy {
    const EARLIEST: &str = "earliest";
    const LATEST: &str = "latest";
}

impl AsRef<str> for OffsetResetStrategy {
    fn as_ref(&self) -> &str {
        match self {
            Self::Earliest => Self::EARLIEST,
            Self::Latest => Self::LATEST,
        }
    }
}

impl FromStr for OffsetResetStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            Self::EARLIEST => Ok(Self::Earliest),
            Self::LATEST => Ok(Self::Latest),
            _otherwise => Err(Error::UnknownOffsetReset(s.to_owned())),
        }
    }
}

/// Record
///
/// A record read from a partition.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Record {
    pub partition: StreamPartition,
    pub offset: i64,
    pub timestamp: Option<SystemTime>,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

impl Record {
    pub fn partition(&self) -> &StreamPartition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_reset_strategy_from_str() -> Result<()> {
        assert_eq!(
            OffsetResetStrategy::Earliest,
            OffsetResetStrategy::from_str("EARLIEST")?
        );
        assert_eq!(
            OffsetResetStrategy::Latest,
            OffsetResetStrategy::from_str("latest")?
        );
        assert!(matches!(
            OffsetResetStrategy::from_str("none"),
            Err(Error::UnknownOffsetReset(_))
        ));

        Ok(())
    }

    #[test]
    fn negative_offset() {
        assert!(matches!(
            OffsetAndMetadata::new(-1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn error_code_through_commit_failed() {
        let error = Error::CommitFailed(Box::new(Error::Api(ErrorCode::Unavailable)));
        assert_eq!(Some(ErrorCode::Unavailable), error.error_code());
    }
}
