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

//! Consumer configuration
//!
//! A [`Config`] is either built with [`Config::builder`] or parsed from the
//! string properties recognised by the consumer:
//!
//! | property | default |
//! |----------|---------|
//! | `client.id` | `consumer-<uuid>` |
//! | `group.id` | empty, disabling group commits |
//! | `auto.offset.reset` | `latest` |
//! | `enable.auto.commit` | `true` |
//! | `auto.commit.interval.ms` | `5000` |
//! | `heartbeat.interval.ms` | `3000` |
//! | `session.timeout.ms` | `30000` |
//! | `partition.assignment.strategy` | `range` |
//! | `max.poll.records` | `500` |
//! | `commit.retries` | `3` |
//! | `join.retries` | `3` |
//! | `retry.backoff.ms` | `100` |
//! | `metadata.max.age.ms` | `300000` |

use std::{collections::BTreeMap, str::FromStr, time::Duration};

use tracing::debug;
use uuid::Uuid;

use crate::{Assignor, Error, OffsetResetStrategy, Result};

pub const CLIENT_ID: &str = "client.id";
pub const GROUP_ID: &str = "group.id";
pub const AUTO_OFFSET_RESET: &str = "auto.offset.reset";
pub const ENABLE_AUTO_COMMIT: &str = "enable.auto.commit";
pub const AUTO_COMMIT_INTERVAL_MS: &str = "auto.commit.interval.ms";
pub const HEARTBEAT_INTERVAL_MS: &str = "heartbeat.interval.ms";
pub const SESSION_TIMEOUT_MS: &str = "session.timeout.ms";
pub const PARTITION_ASSIGNMENT_STRATEGY: &str = "partition.assignment.strategy";
pub const MAX_POLL_RECORDS: &str = "max.poll.records";
pub const COMMIT_RETRIES: &str = "commit.retries";
pub const JOIN_RETRIES: &str = "join.retries";
pub const RETRY_BACKOFF_MS: &str = "retry.backoff.ms";
pub const METADATA_MAX_AGE_MS: &str = "metadata.max.age.ms";

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Config {
    client_id: String,
    group_id: String,
    auto_offset_reset: OffsetResetStrategy,
    enable_auto_commit: bool,
    auto_commit_interval: Duration,
    heartbeat_interval: Duration,
    session_timeout: Duration,
    assignor: Assignor,
    max_poll_records: usize,
    commit_retries: u32,
    join_retries: u32,
    retry_backoff: Duration,
    metadata_max_age: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: format!("consumer-{}", Uuid::new_v4()),
            group_id: String::new(),
            auto_offset_reset: OffsetResetStrategy::default(),
            enable_auto_commit: true,
            auto_commit_interval: Duration::from_millis(5_000),
            heartbeat_interval: Duration::from_millis(3_000),
            session_timeout: Duration::from_millis(30_000),
            assignor: Assignor::default(),
            max_poll_records: 500,
            commit_retries: 3,
            join_retries: 3,
            retry_backoff: Duration::from_millis(100),
            metadata_max_age: Duration::from_millis(300_000),
        }
    }
}

impl Config {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn auto_offset_reset(&self) -> OffsetResetStrategy {
        self.auto_offset_reset
    }

    pub fn enable_auto_commit(&self) -> bool {
        self.enable_auto_commit
    }

    pub fn auto_commit_interval(&self) -> Duration {
        self.auto_commit_interval
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub fn assignor(&self) -> Assignor {
        self.assignor
    }

    pub fn max_poll_records(&self) -> usize {
        self.max_poll_records
    }

    pub fn commit_retries(&self) -> u32 {
        self.commit_retries
    }

    pub fn join_retries(&self) -> u32 {
        self.join_retries
    }

    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    pub fn metadata_max_age(&self) -> Duration {
        self.metadata_max_age
    }
}

fn millis(value: &str) -> Result<Duration> {
    u64::from_str(value.trim())
        .map(Duration::from_millis)
        .map_err(Into::into)
}

impl TryFrom<&BTreeMap<String, String>> for Config {
    type Error = Error;

    fn try_from(properties: &BTreeMap<String, String>) -> Result<Self, Self::Error> {
        properties
            .iter()
            .try_fold(Builder::default(), |builder, (key, value)| -> Result<Builder> {
                Ok(match key.as_str() {
                    CLIENT_ID => builder.client_id(value.as_str()),
                    GROUP_ID => builder.group_id(value.as_str()),
                    AUTO_OFFSET_RESET => {
                        builder.auto_offset_reset(OffsetResetStrategy::from_str(value)?)
                    }
                    ENABLE_AUTO_COMMIT => {
                        builder.enable_auto_commit(bool::from_str(value.trim())?)
                    }
                    AUTO_COMMIT_INTERVAL_MS => builder.auto_commit_interval(millis(value)?),
                    HEARTBEAT_INTERVAL_MS => builder.heartbeat_interval(millis(value)?),
                    SESSION_TIMEOUT_MS => builder.session_timeout(millis(value)?),
                    PARTITION_ASSIGNMENT_STRATEGY => builder.assignor(Assignor::from_str(value)?),
                    MAX_POLL_RECORDS => builder.max_poll_records(usize::from_str(value.trim())?),
                    COMMIT_RETRIES => builder.commit_retries(u32::from_str(value.trim())?),
                    JOIN_RETRIES => builder.join_retries(u32::from_str(value.trim())?),
                    RETRY_BACKOFF_MS => builder.retry_backoff(millis(value)?),
                    METADATA_MAX_AGE_MS => builder.metadata_max_age(millis(value)?),

                    unknown => {
                        debug!(unknown, %value);
                        builder
                    }
                })
            })
            .and_then(Builder::try_build)
    }
}

impl<K, V> FromIterator<(K, V)> for Builder
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            properties: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Builder {
    config: Config,
    properties: BTreeMap<String, String>,
}

impl Builder {
    pub fn client_id(self, client_id: impl Into<String>) -> Self {
        Self {
            config: Config {
                client_id: client_id.into(),
                ..self.config
            },
            ..self
        }
    }

    pub fn group_id(self, group_id: impl Into<String>) -> Self {
        Self {
            config: Config {
                group_id: group_id.into(),
                ..self.config
            },
            ..self
        }
    }

    pub fn auto_offset_reset(self, auto_offset_reset: OffsetResetStrategy) -> Self {
        Self {
            config: Config {
                auto_offset_reset,
                ..self.config
            },
            ..self
        }
    }

    pub fn enable_auto_commit(self, enable_auto_commit: bool) -> Self {
        Self {
            config: Config {
                enable_auto_commit,
                ..self.config
            },
            ..self
        }
    }

    pub fn auto_commit_interval(self, auto_commit_interval: Duration) -> Self {
        Self {
            config: Config {
                auto_commit_interval,
                ..self.config
            },
            ..self
        }
    }

    pub fn heartbeat_interval(self, heartbeat_interval: Duration) -> Self {
        Self {
            config: Config {
                heartbeat_interval,
                ..self.config
            },
            ..self
        }
    }

    pub fn session_timeout(self, session_timeout: Duration) -> Self {
        Self {
            config: Config {
                session_timeout,
                ..self.config
            },
            ..self
        }
    }

    pub fn assignor(self, assignor: Assignor) -> Self {
        Self {
            config: Config {
                assignor,
                ..self.config
            },
            ..self
        }
    }

    pub fn max_poll_records(self, max_poll_records: usize) -> Self {
        Self {
            config: Config {
                max_poll_records,
                ..self.config
            },
            ..self
        }
    }

    pub fn commit_retries(self, commit_retries: u32) -> Self {
        Self {
            config: Config {
                commit_retries,
                ..self.config
            },
            ..self
        }
    }

    pub fn join_retries(self, join_retries: u32) -> Self {
        Self {
            config: Config {
                join_retries,
                ..self.config
            },
            ..self
        }
    }

    pub fn retry_backoff(self, retry_backoff: Duration) -> Self {
        Self {
            config: Config {
                retry_backoff,
                ..self.config
            },
            ..self
        }
    }

    pub fn metadata_max_age(self, metadata_max_age: Duration) -> Self {
        Self {
            config: Config {
                metadata_max_age,
                ..self.config
            },
            ..self
        }
    }

    /// parse any properties collected into this builder
    pub fn try_build(self) -> Result<Config> {
        if !self.properties.is_empty() {
            return Config::try_from(&self.properties);
        }

        if self.config.max_poll_records == 0 {
            return Err(Error::InvalidArgument(format!(
                "{MAX_POLL_RECORDS} must be at least 1"
            )));
        }

        Ok(self.config)
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();

        assert!(config.client_id().starts_with("consumer-"));
        assert_eq!("", config.group_id());
        assert_eq!(OffsetResetStrategy::Latest, config.auto_offset_reset());
        assert!(config.enable_auto_commit());
        assert_eq!(Duration::from_millis(5_000), config.auto_commit_interval());
        assert_eq!(Assignor::Range, config.assignor());
    }

    #[test]
    fn generated_client_ids_differ() {
        assert_ne!(
            Config::default().client_id(),
            Config::default().client_id()
        );
    }

    #[test]
    fn from_properties() -> Result<()> {
        let config = [
            (CLIENT_ID, "abc"),
            (GROUP_ID, "pqr"),
            (AUTO_OFFSET_RESET, "EARLIEST"),
            (ENABLE_AUTO_COMMIT, "false"),
            (AUTO_COMMIT_INTERVAL_MS, "1000"),
            (PARTITION_ASSIGNMENT_STRATEGY, "roundrobin"),
            ("fetch.min.bytes", "1"),
        ]
        .into_iter()
        .collect::<Builder>()
        .try_build()?;

        assert_eq!("abc", config.client_id());
        assert_eq!("pqr", config.group_id());
        assert_eq!(OffsetResetStrategy::Earliest, config.auto_offset_reset());
        assert!(!config.enable_auto_commit());
        assert_eq!(Duration::from_millis(1_000), config.auto_commit_interval());
        assert_eq!(Assignor::RoundRobin, config.assignor());

        Ok(())
    }

    #[test]
    fn malformed_property() {
        let properties = BTreeMap::from([(
            AUTO_COMMIT_INTERVAL_MS.to_owned(),
            "five seconds".to_owned(),
        )]);

        assert!(matches!(
            Config::try_from(&properties),
            Err(Error::ParseInt(_))
        ));
    }

    #[test]
    fn zero_max_poll_records() {
        assert!(matches!(
            [(MAX_POLL_RECORDS, "0")]
                .into_iter()
                .collect::<Builder>()
                .try_build(),
            Err(Error::InvalidArgument(_))
        ));

        assert!(matches!(
            Config::builder().max_poll_records(0).try_build(),
            Err(Error::InvalidArgument(_))
        ));

        assert!(
            Config::builder()
                .max_poll_records(1)
                .try_build()
                .is_ok_and(|config| config.max_poll_records() == 1)
        );
    }
}
