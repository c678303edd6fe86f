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

//! Subscription State
//!
//! What the consumer is subscribed to, the partitions assigned to it and,
//! for each of those partitions, the fetch position, last committed offset,
//! pause flag and any pending offset reset. Pure state, no I/O.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Debug, Formatter},
};

use regex::Regex;
use tracing::debug;

use crate::{Error, OffsetAndMetadata, OffsetResetStrategy, Result, StreamPartition};

/// Rebalance Listener
///
/// Invoked on the owning task during a rebalance, always with the revoked
/// partitions first and then the newly assigned partitions.
pub trait RebalanceListener: Send + Sync {
    fn on_partitions_revoked(&mut self, partitions: &BTreeSet<StreamPartition>);

    fn on_partitions_assigned(&mut self, partitions: &BTreeSet<StreamPartition>);
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NoOpRebalanceListener;

impl RebalanceListener for NoOpRebalanceListener {
    fn on_partitions_revoked(&mut self, _partitions: &BTreeSet<StreamPartition>) {}

    fn on_partitions_assigned(&mut self, _partitions: &BTreeSet<StreamPartition>) {}
}

/// Subscription
///
/// A consumer is in exactly one of these modes.
#[derive(Clone, Debug, Default)]
pub enum Subscription {
    #[default]
    Unsubscribed,
    Streams(BTreeSet<String>),
    Pattern(Regex),
    UserAssigned,
}

impl Subscription {
    fn is_same_mode(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::Unsubscribed, _)
                | (Self::Streams(_), Self::Streams(_))
                | (Self::Pattern(_), Self::Pattern(_))
                | (Self::UserAssigned, Self::UserAssigned)
        )
    }
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct PartitionState {
    position: Option<i64>,
    committed: Option<OffsetAndMetadata>,
    paused: bool,
    reset: Option<OffsetResetStrategy>,
}

pub struct SubscriptionState {
    subscription: Subscription,
    group_subscription: BTreeSet<String>,
    assignment: BTreeMap<StreamPartition, PartitionState>,
    default_reset: OffsetResetStrategy,
    listener: Option<Box<dyn RebalanceListener>>,
    needs_rejoin: bool,
}

impl Debug for SubscriptionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(SubscriptionState))
            .field("subscription", &self.subscription)
            .field("group_subscription", &self.group_subscription)
            .field("assignment", &self.assignment)
            .field("default_reset", &self.default_reset)
            .field("needs_rejoin", &self.needs_rejoin)
            .finish_non_exhaustive()
    }
}

impl SubscriptionState {
    pub fn new(default_reset: OffsetResetStrategy) -> Self {
        Self {
            subscription: Subscription::default(),
            group_subscription: BTreeSet::new(),
            assignment: BTreeMap::new(),
            default_reset,
            listener: None,
            needs_rejoin: false,
        }
    }

    fn change_subscription(&mut self, subscription: Subscription) {
        if !self.subscription.is_same_mode(&subscription) {
            debug!(from = ?self.subscription, to = ?subscription, "clearing assignment");

            if self.partitions_auto_assigned() && !self.assignment.is_empty() {
                let revoked = self.assignment();

                if let Some(listener) = self.listener.as_mut() {
                    listener.on_partitions_revoked(&revoked);
                }
            }

            self.assignment.clear();
            self.group_subscription.clear();
        }

        self.subscription = subscription;
    }

    pub fn subscribe(
        &mut self,
        streams: BTreeSet<String>,
        listener: Option<Box<dyn RebalanceListener>>,
    ) {
        debug!(?streams);
        self.change_subscription(Subscription::Streams(streams.clone()));
        self.group_subscription = streams;
        self.listener = listener;
        self.needs_rejoin = true;
    }

    pub fn subscribe_pattern(
        &mut self,
        pattern: Regex,
        listener: Option<Box<dyn RebalanceListener>>,
    ) {
        debug!(%pattern);
        self.change_subscription(Subscription::Pattern(pattern));
        self.listener = listener;
        self.needs_rejoin = true;
    }

    /// manual assignment, bypassing group coordination
    pub fn assign_from_user(&mut self, partitions: BTreeSet<StreamPartition>) {
        debug!(?partitions);
        self.change_subscription(Subscription::UserAssigned);
        self.retain_assignment(partitions);
        self.listener = None;
        self.needs_rejoin = false;
    }

    /// the assignment resulting from a rebalance
    pub fn assign_from_subscribed(&mut self, partitions: BTreeSet<StreamPartition>) -> Result<()> {
        if !self.partitions_auto_assigned() {
            return Err(Error::IllegalState(
                "assignment from a rebalance without a subscription".into(),
            ));
        }

        if let Some(unexpected) = partitions
            .iter()
            .find(|partition| !self.matches(partition.stream()))
        {
            return Err(Error::IllegalState(format!(
                "assigned partition {unexpected} is not subscribed"
            )));
        }

        self.retain_assignment(partitions);
        Ok(())
    }

    fn retain_assignment(&mut self, partitions: BTreeSet<StreamPartition>) {
        let mut previous = std::mem::take(&mut self.assignment);

        self.assignment = partitions
            .into_iter()
            .map(|partition| {
                let state = previous.remove(&partition).unwrap_or_default();
                (partition, state)
            })
            .collect();
    }

    pub fn unsubscribe(&mut self) {
        self.subscription = Subscription::Unsubscribed;
        self.group_subscription.clear();
        self.assignment.clear();
        self.listener = None;
        self.needs_rejoin = false;
    }

    pub fn subscription_mode(&self) -> &Subscription {
        &self.subscription
    }

    /// the streams subscribed to, for a pattern those currently matching
    pub fn subscription(&self) -> BTreeSet<String> {
        match self.subscription {
            Subscription::Streams(_) | Subscription::Pattern(_) => self.group_subscription.clone(),
            Subscription::Unsubscribed | Subscription::UserAssigned => BTreeSet::new(),
        }
    }

    pub fn group_subscription(&self) -> &BTreeSet<String> {
        &self.group_subscription
    }

    /// the streams a pattern currently matches, returning whether they changed
    pub fn set_group_subscription(&mut self, streams: BTreeSet<String>) -> bool {
        if self.group_subscription == streams {
            false
        } else {
            debug!(from = ?self.group_subscription, to = ?streams);
            self.group_subscription = streams;
            true
        }
    }

    pub fn matches(&self, stream: &str) -> bool {
        match self.subscription {
            Subscription::Streams(ref streams) => streams.contains(stream),
            Subscription::Pattern(ref pattern) => pattern.is_match(stream),
            Subscription::Unsubscribed | Subscription::UserAssigned => false,
        }
    }

    pub fn pattern(&self) -> Option<&Regex> {
        if let Subscription::Pattern(ref pattern) = self.subscription {
            Some(pattern)
        } else {
            None
        }
    }

    pub fn partitions_auto_assigned(&self) -> bool {
        matches!(
            self.subscription,
            Subscription::Streams(_) | Subscription::Pattern(_)
        )
    }

    pub fn needs_rejoin(&self) -> bool {
        self.needs_rejoin
    }

    pub fn request_rejoin(&mut self) {
        self.needs_rejoin = self.partitions_auto_assigned();
    }

    pub fn rejoined(&mut self) {
        self.needs_rejoin = false;
    }

    pub fn listener(&mut self) -> Option<&mut Box<dyn RebalanceListener>> {
        self.listener.as_mut()
    }

    pub fn assignment(&self) -> BTreeSet<StreamPartition> {
        self.assignment.keys().cloned().collect()
    }

    pub fn is_assigned(&self, partition: &StreamPartition) -> bool {
        self.assignment.contains_key(partition)
    }

    fn assigned_state(&mut self, partition: &StreamPartition) -> Result<&mut PartitionState> {
        self.assignment.get_mut(partition).ok_or_else(|| {
            Error::InvalidArgument(format!("no current assignment for partition {partition}"))
        })
    }

    pub fn seek(&mut self, partition: &StreamPartition, offset: i64) -> Result<()> {
        if offset < 0 {
            return Err(Error::InvalidArgument(format!(
                "seek offset must not be negative: {offset}"
            )));
        }

        self.assigned_state(partition).map(|state| {
            state.position = Some(offset);
            state.reset = None;
        })
    }

    pub fn need_offset_reset(
        &mut self,
        partition: &StreamPartition,
        strategy: OffsetResetStrategy,
    ) -> Result<()> {
        self.assigned_state(partition).map(|state| {
            state.position = None;
            state.reset = Some(strategy);
        })
    }

    /// the pending reset for a partition, otherwise the default strategy
    pub fn reset_strategy(&self, partition: &StreamPartition) -> OffsetResetStrategy {
        self.assignment
            .get(partition)
            .and_then(|state| state.reset)
            .unwrap_or(self.default_reset)
    }

    pub fn is_offset_reset_needed(&self, partition: &StreamPartition) -> bool {
        self.assignment
            .get(partition)
            .is_some_and(|state| state.reset.is_some())
    }

    pub fn default_reset(&self) -> OffsetResetStrategy {
        self.default_reset
    }

    pub fn pause(&mut self, partition: &StreamPartition) -> Result<()> {
        self.assigned_state(partition)
            .map(|state| state.paused = true)
    }

    pub fn resume(&mut self, partition: &StreamPartition) -> Result<()> {
        self.assigned_state(partition)
            .map(|state| state.paused = false)
    }

    pub fn is_paused(&self, partition: &StreamPartition) -> bool {
        self.assignment
            .get(partition)
            .is_some_and(|state| state.paused)
    }

    pub fn paused_partitions(&self) -> BTreeSet<StreamPartition> {
        self.assignment
            .iter()
            .filter(|(_, state)| state.paused)
            .map(|(partition, _)| partition.clone())
            .collect()
    }

    pub fn position(&self, partition: &StreamPartition) -> Option<i64> {
        self.assignment
            .get(partition)
            .and_then(|state| state.position)
    }

    pub fn set_position(&mut self, partition: &StreamPartition, offset: i64) -> Result<()> {
        self.assigned_state(partition).map(|state| {
            state.position = Some(offset);
            state.reset = None;
        })
    }

    pub fn committed(&self, partition: &StreamPartition) -> Option<&OffsetAndMetadata> {
        self.assignment
            .get(partition)
            .and_then(|state| state.committed.as_ref())
    }

    /// records a committed offset, ignored for partitions no longer assigned
    pub fn set_committed(&mut self, partition: &StreamPartition, committed: OffsetAndMetadata) {
        if let Some(state) = self.assignment.get_mut(partition) {
            state.committed = Some(committed)
        }
    }

    /// assigned partitions that need a position before they can be fetched
    pub fn missing_positions(&self) -> BTreeSet<StreamPartition> {
        self.assignment
            .iter()
            .filter(|(_, state)| state.position.is_none())
            .map(|(partition, _)| partition.clone())
            .collect()
    }

    pub fn missing_committed(&self) -> BTreeSet<StreamPartition> {
        self.assignment
            .iter()
            .filter(|(_, state)| state.committed.is_none())
            .map(|(partition, _)| partition.clone())
            .collect()
    }

    /// assigned, unpaused partitions with a known position
    pub fn fetchable_partitions(&self) -> BTreeMap<StreamPartition, i64> {
        self.assignment
            .iter()
            .filter(|(_, state)| !state.paused)
            .filter_map(|(partition, state)| {
                state
                    .position
                    .map(|position| (partition.clone(), position))
            })
            .collect()
    }

    /// the current position of every assigned partition that has one
    pub fn all_consumed(&self) -> BTreeMap<StreamPartition, OffsetAndMetadata> {
        self.assignment
            .iter()
            .filter_map(|(partition, state)| {
                state.position.map(|offset| {
                    (
                        partition.clone(),
                        OffsetAndMetadata {
                            offset,
                            metadata: None,
                        },
                    )
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use super::*;

    const ORDERS: &str = "orders";

    fn partitions(stream: &str, range: std::ops::Range<i32>) -> BTreeSet<StreamPartition> {
        range
            .map(|partition| StreamPartition::new(stream, partition))
            .collect()
    }

    #[test]
    fn seek_then_position() -> Result<()> {
        let mut state = SubscriptionState::new(OffsetResetStrategy::Latest);
        state.assign_from_user(partitions(ORDERS, 0..2));

        let p0 = StreamPartition::new(ORDERS, 0);
        assert_eq!(None, state.position(&p0));

        state.seek(&p0, 42)?;
        assert_eq!(Some(42), state.position(&p0));
        assert_eq!(BTreeSet::from([StreamPartition::new(ORDERS, 1)]), state.missing_positions());

        Ok(())
    }

    #[test]
    fn negative_seek_leaves_state_untouched() -> Result<()> {
        let mut state = SubscriptionState::new(OffsetResetStrategy::Latest);
        state.assign_from_user(partitions(ORDERS, 0..1));

        let p0 = StreamPartition::new(ORDERS, 0);
        state.seek(&p0, 7)?;

        assert!(matches!(state.seek(&p0, -1), Err(Error::InvalidArgument(_))));
        assert_eq!(Some(7), state.position(&p0));

        Ok(())
    }

    #[test]
    fn unassigned_partition() {
        let mut state = SubscriptionState::new(OffsetResetStrategy::Latest);
        state.assign_from_user(partitions(ORDERS, 0..1));

        let p9 = StreamPartition::new(ORDERS, 9);
        assert!(matches!(state.pause(&p9), Err(Error::InvalidArgument(_))));
        assert!(matches!(state.resume(&p9), Err(Error::InvalidArgument(_))));
        assert!(matches!(state.seek(&p9, 0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn switching_modes_clears_state() -> Result<()> {
        let mut state = SubscriptionState::new(OffsetResetStrategy::Latest);
        state.assign_from_user(partitions(ORDERS, 0..2));
        state.seek(&StreamPartition::new(ORDERS, 0), 3)?;

        state.subscribe(BTreeSet::from([ORDERS.to_owned()]), None);
        assert!(state.assignment().is_empty());
        assert!(state.partitions_auto_assigned());
        assert!(state.needs_rejoin());
        assert_eq!(BTreeSet::from([ORDERS.to_owned()]), state.subscription());

        state.assign_from_user(partitions(ORDERS, 0..1));
        assert_eq!(None, state.position(&StreamPartition::new(ORDERS, 0)));
        assert!(state.subscription().is_empty());

        Ok(())
    }

    #[test]
    fn rebalance_keeps_retained_positions() -> Result<()> {
        let mut state = SubscriptionState::new(OffsetResetStrategy::Latest);
        state.subscribe(BTreeSet::from([ORDERS.to_owned()]), None);
        state.assign_from_subscribed(partitions(ORDERS, 0..2))?;

        let p1 = StreamPartition::new(ORDERS, 1);
        state.seek(&p1, 12)?;

        state.assign_from_subscribed(partitions(ORDERS, 1..3))?;
        assert_eq!(Some(12), state.position(&p1));
        assert_eq!(partitions(ORDERS, 1..3), state.assignment());

        assert!(matches!(
            state.assign_from_subscribed(partitions("payments", 0..1)),
            Err(Error::IllegalState(_))
        ));

        Ok(())
    }

    #[test]
    fn pause_excludes_from_fetchable() -> Result<()> {
        let mut state = SubscriptionState::new(OffsetResetStrategy::Latest);
        state.assign_from_user(partitions(ORDERS, 0..2));

        let p0 = StreamPartition::new(ORDERS, 0);
        let p1 = StreamPartition::new(ORDERS, 1);
        state.seek(&p0, 5)?;
        state.seek(&p1, 6)?;

        state.pause(&p0)?;
        assert_eq!(BTreeMap::from([(p1.clone(), 6)]), state.fetchable_partitions());
        assert_eq!(BTreeSet::from([p0.clone()]), state.paused_partitions());
        assert_eq!(Some(5), state.position(&p0));

        state.resume(&p0)?;
        assert_eq!(2, state.fetchable_partitions().len());

        Ok(())
    }

    #[test]
    fn offset_reset() -> Result<()> {
        let mut state = SubscriptionState::new(OffsetResetStrategy::Latest);
        state.assign_from_user(partitions(ORDERS, 0..1));

        let p0 = StreamPartition::new(ORDERS, 0);
        state.seek(&p0, 100)?;
        state.need_offset_reset(&p0, OffsetResetStrategy::Earliest)?;

        assert_eq!(None, state.position(&p0));
        assert!(state.is_offset_reset_needed(&p0));
        assert_eq!(OffsetResetStrategy::Earliest, state.reset_strategy(&p0));

        state.set_position(&p0, 0)?;
        assert!(!state.is_offset_reset_needed(&p0));
        assert_eq!(OffsetResetStrategy::Latest, state.reset_strategy(&p0));

        Ok(())
    }

    #[test]
    fn all_consumed() -> Result<()> {
        let mut state = SubscriptionState::new(OffsetResetStrategy::Latest);
        state.assign_from_user(partitions(ORDERS, 0..3));
        state.seek(&StreamPartition::new(ORDERS, 0), 10)?;
        state.seek(&StreamPartition::new(ORDERS, 2), 20)?;

        assert_eq!(
            BTreeMap::from([
                (StreamPartition::new(ORDERS, 0), OffsetAndMetadata::new(10)?),
                (StreamPartition::new(ORDERS, 2), OffsetAndMetadata::new(20)?),
            ]),
            state.all_consumed()
        );

        Ok(())
    }

    #[test]
    fn pattern_matches() -> Result<()> {
        let mut state = SubscriptionState::new(OffsetResetStrategy::Latest);
        state.subscribe_pattern(Regex::new("^ord.*")?, None);

        assert!(state.matches(ORDERS));
        assert!(!state.matches("payments"));
        assert!(state.set_group_subscription(BTreeSet::from([ORDERS.to_owned()])));
        assert!(!state.set_group_subscription(BTreeSet::from([ORDERS.to_owned()])));
        assert_eq!(BTreeSet::from([ORDERS.to_owned()]), state.subscription());

        Ok(())
    }

    #[derive(Clone, Debug, Default)]
    struct Recording(Arc<Mutex<Vec<&'static str>>>);

    impl RebalanceListener for Recording {
        fn on_partitions_revoked(&mut self, _partitions: &BTreeSet<StreamPartition>) {
            self.0.lock().expect("poison").push("revoked")
        }

        fn on_partitions_assigned(&mut self, _partitions: &BTreeSet<StreamPartition>) {
            self.0.lock().expect("poison").push("assigned")
        }
    }

    #[test]
    fn mode_switch_revokes_assignment() -> Result<()> {
        let recording = Recording::default();

        let mut state = SubscriptionState::new(OffsetResetStrategy::Latest);
        state.subscribe(
            BTreeSet::from([ORDERS.to_owned()]),
            Some(Box::new(recording.clone())),
        );
        state.assign_from_subscribed(BTreeSet::from([
            StreamPartition::new(ORDERS, 0),
            StreamPartition::new(ORDERS, 1),
        ]))?;

        state.subscribe(BTreeSet::from(["payments".to_owned()]), None);
        assert!(recording.0.lock().expect("poison").is_empty());
        assert_eq!(2, state.assignment().len());

        let recording = Recording::default();
        state.subscribe(
            BTreeSet::from([ORDERS.to_owned()]),
            Some(Box::new(recording.clone())),
        );
        state.subscribe_pattern(Regex::new("^ord.*")?, None);

        assert_eq!(vec!["revoked"], *recording.0.lock().expect("poison"));
        assert!(state.assignment().is_empty());

        Ok(())
    }

    #[test]
    fn unsubscribe_drops_listener() {
        let recording = Recording::default();

        let mut state = SubscriptionState::new(OffsetResetStrategy::Latest);
        state.subscribe(
            BTreeSet::from([ORDERS.to_owned()]),
            Some(Box::new(recording.clone())),
        );
        assert!(state.listener().is_some());

        state.unsubscribe();
        assert!(state.listener().is_none());
        assert!(!state.partitions_auto_assigned());
    }
}
