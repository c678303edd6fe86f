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

use std::collections::BTreeSet;

use crate::{
    StreamPartition,
    assignor::{Assignment, PartitionAssignor, empty_assignment},
    backend::GroupMember,
};

/// Partitions of every subscribed stream dealt out to members in turn,
/// skipping a member not subscribed to the partition's stream.
#[derive(Clone, Copy, Default, Eq, Hash, Debug, Ord, PartialEq, PartialOrd)]
pub struct RoundRobinAssignor;

impl PartitionAssignor for RoundRobinAssignor {
    fn assign(
        &self,
        members: &[GroupMember],
        partitions: &BTreeSet<StreamPartition>,
    ) -> Assignment {
        let mut assignment = empty_assignment(members);

        let mut ordered = members.iter().collect::<Vec<_>>();
        ordered.sort_by(|a, b| a.member_id.cmp(&b.member_id));

        if ordered.is_empty() {
            return assignment;
        }

        let mut next = 0;

        for partition in partitions {
            let Some(member) = (0..ordered.len())
                .map(|i| ordered[(next + i) % ordered.len()])
                .find(|member| member.streams.contains(partition.stream()))
            else {
                continue;
            };

            if let Some(index) = ordered
                .iter()
                .position(|candidate| candidate.member_id == member.member_id)
            {
                next = index + 1;
            }

            if let Some(owned) = assignment.get_mut(&member.member_id) {
                _ = owned.insert(partition.clone());
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

    const T0: &str = "t0";
    const T1: &str = "t1";

    fn partitions(stream: &str, partitions: &[i32]) -> BTreeSet<StreamPartition> {
        partitions
            .iter()
            .map(|partition| StreamPartition::new(stream, *partition))
            .collect()
    }

    #[test]
    fn interleaved() {
        let members = [
            GroupMember::new(C1, [T0]),
            GroupMember::new(C0, [T0]),
        ];

        let assignment = RoundRobinAssignor.assign(&members[..], &partitions(T0, &[0, 1, 2, 3]));

        assert_eq!(partitions(T0, &[0, 2]), assignment[C0]);
        assert_eq!(partitions(T0, &[1, 3]), assignment[C1]);
    }

    #[test]
    fn skips_unsubscribed() {
        let members = [GroupMember::new(C0, [T0, T1]), GroupMember::new(C1, [T1])];

        let all = partitions(T0, &[0, 1])
            .into_iter()
            .chain(partitions(T1, &[0, 1]))
            .collect();

        let assignment = RoundRobinAssignor.assign(&members[..], &all);

        assert_eq!(
            partitions(T0, &[0, 1])
                .into_iter()
                .chain(partitions(T1, &[1]))
                .collect::<BTreeSet<_>>(),
            assignment[C0]
        );
        assert_eq!(partitions(T1, &[0]), assignment[C1]);
    }

    #[test]
    fn no_members() {
        assert!(RoundRobinAssignor.assign(&[], &partitions(T0, &[0])).is_empty());
    }
}
