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

//! Partition assignment strategies
//!
//! Every member of a group runs the same strategy over the same members and
//! partitions, so each can take its own share without a separate sync.

use std::{
    collections::{BTreeMap, BTreeSet},
    str::FromStr,
};

use crate::{Error, StreamPartition, backend::GroupMember};

mod range;
mod round_robin;

pub use range::RangeAssignor;
pub use round_robin::RoundRobinAssignor;

pub type Assignment = BTreeMap<String, BTreeSet<StreamPartition>>;

pub trait PartitionAssignor {
    fn assign(&self, members: &[GroupMember], partitions: &BTreeSet<StreamPartition>)
    -> Assignment;
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Assignor {
    #[default]
    Range,
    RoundRobin,
}

impl Assignor {
    const RANGE: &str = "range";
    const ROUND_ROBIN: &str = "roundrobin";
}

impl AsRef<str> for Assignor {
    fn as_ref(&self) -> &str {
        match self {
            Self::Range => Self::RANGE,
            Self::RoundRobin => Self::ROUND_ROBIN,
        }
    }
}

impl FromStr for Assignor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            Self::RANGE => Ok(Self::Range),
            Self::ROUND_ROBIN => Ok(Self::RoundRobin),
            otherwise => Err(Error::UnknownAssignor(otherwise.into())),
        }
    }
}

impl PartitionAssignor for Assignor {
    fn assign(
        &self,
        members: &[GroupMember],
        partitions: &BTreeSet<StreamPartition>,
    ) -> Assignment {
        match self {
            Self::Range => RangeAssignor.assign(members, partitions),
            Self::RoundRobin => RoundRobinAssignor.assign(members, partitions),
        }
    }
}

/// every member starts with an empty assignment, ordered by member id
fn empty_assignment(members: &[GroupMember]) -> Assignment {
    members
        .iter()
        .map(|member| (member.member_id.clone(), BTreeSet::new()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_str() -> Result<(), Error> {
        assert_eq!(Assignor::Range, Assignor::from_str("range")?);
        assert_eq!(Assignor::RoundRobin, Assignor::from_str("roundrobin")?);
        assert!(matches!(
            Assignor::from_str("sticky"),
            Err(Error::UnknownAssignor(_))
        ));
        Ok(())
    }

    #[test]
    fn as_ref_round_trips() -> Result<(), Error> {
        for assignor in [Assignor::Range, Assignor::RoundRobin] {
            assert_eq!(assignor, Assignor::from_str(assignor.as_ref())?);
        }
        Ok(())
    }
}
