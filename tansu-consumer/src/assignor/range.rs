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

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    StreamPartition,
    assignor::{Assignment, PartitionAssignor, empty_assignment},
    backend::GroupMember,
};

/// Contiguous ranges of each stream's partitions, earlier members taking
/// one extra partition until the remainder is used up.
#[derive(Clone, Copy, Default, Eq, Hash, Debug, Ord, PartialEq, PartialOrd)]
pub struct RangeAssignor;

impl PartitionAssignor for RangeAssignor {
    fn assign(
        &self,
        members: &[GroupMember],
        partitions: &BTreeSet<StreamPartition>,
    ) -> Assignment {
        let mut assignment = empty_assignment(members);

        let mut by_stream: BTreeMap<&str, Vec<&StreamPartition>> = BTreeMap::new();
        for partition in partitions {
            by_stream
                .entry(partition.stream())
                .or_default()
                .push(partition);
        }

        for (stream, partitions) in by_stream {
            let subscribers = assignment
                .keys()
                .filter(|member_id| {
                    members
                        .iter()
                        .any(|member| &member.member_id == *member_id && member.streams.contains(stream))
                })
                .cloned()
                .collect::<Vec<_>>();

            if subscribers.is_empty() {
                continue;
            }

            let allocation = partitions.len() / subscribers.len();
            let mut remainder = 0..(partitions.len() % subscribers.len());
            let mut partition = partitions.into_iter();

            for member_id in subscribers {
                let take = if remainder.next().is_some() {
                    allocation + 1
                } else {
                    allocation
                };

                if let Some(owned) = assignment.get_mut(&member_id) {
                    owned.extend(partition.by_ref().take(take).cloned());
                }
            }
        }

        assignment
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const C0: &str = "C0";
    const C1: &str = "C1";
    const C2: &str = "C2";

    const T0: &str = "t0";
    const T1: &str = "t1";

    fn member(member_id: &str, streams: &[&str]) -> GroupMember {
        GroupMember::new(member_id, streams.iter().copied())
    }

    fn partitions(stream: &str, partitions: &[i32]) -> BTreeSet<StreamPartition> {
        partitions
            .iter()
            .map(|partition| StreamPartition::new(stream, *partition))
            .collect()
    }

    #[test]
    fn evenly_divided() {
        let members = [
            member(C0, &[T0, T1]),
            member(C1, &[T0, T1]),
            member(C2, &[T0, T1]),
        ];

        let all = partitions(T0, &[0, 1, 2])
            .into_iter()
            .chain(partitions(T1, &[0, 1, 2]))
            .collect();

        let assignment = RangeAssignor.assign(&members[..], &all);
        assert_eq!(3, assignment.len());

        for (index, member_id) in [C0, C1, C2].into_iter().enumerate() {
            assert_eq!(
                partitions(T0, &[index as i32])
                    .into_iter()
                    .chain(partitions(T1, &[index as i32]))
                    .collect::<BTreeSet<_>>(),
                assignment[member_id]
            );
        }
    }

    #[test]
    fn remainder() {
        let members = [member(C0, &[T0, T1]), member(C1, &[T0, T1])];

        let all = partitions(T0, &[0, 1, 2])
            .into_iter()
            .chain(partitions(T1, &[0, 1, 2]))
            .collect();

        let assignment = RangeAssignor.assign(&members[..], &all);

        assert_eq!(
            partitions(T0, &[0, 1])
                .into_iter()
                .chain(partitions(T1, &[0, 1]))
                .collect::<BTreeSet<_>>(),
            assignment[C0]
        );
        assert_eq!(
            partitions(T0, &[2])
                .into_iter()
                .chain(partitions(T1, &[2]))
                .collect::<BTreeSet<_>>(),
            assignment[C1]
        );
    }

    #[test]
    fn only_subscribers() {
        let members = [member(C0, &[T0]), member(C1, &[T1])];

        let all = partitions(T0, &[0, 1])
            .into_iter()
            .chain(partitions(T1, &[0]))
            .collect();

        let assignment = RangeAssignor.assign(&members[..], &all);
        assert_eq!(partitions(T0, &[0, 1]), assignment[C0]);
        assert_eq!(partitions(T1, &[0]), assignment[C1]);
    }

    #[test]
    fn more_members_than_partitions() {
        let members = [member(C0, &[T0]), member(C1, &[T0]), member(C2, &[T0])];

        let assignment = RangeAssignor.assign(&members[..], &partitions(T0, &[0]));
        assert_eq!(partitions(T0, &[0]), assignment[C0]);
        assert!(assignment[C1].is_empty());
        assert!(assignment[C2].is_empty());
    }
}
