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

//! Delayed tasks
//!
//! Periodic work is run on the caller's task when it polls, there is no
//! background timer.

use std::{cmp::Reverse, collections::BinaryHeap};

use tokio::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) enum Task {
    AutoCommit,
    Heartbeat,
    MetadataRefresh,
}

#[derive(Debug, Default)]
pub(crate) struct DelayedTaskQueue {
    sequence: u64,
    tasks: BinaryHeap<Reverse<(Instant, u64, Task)>>,
}

impl DelayedTaskQueue {
    /// schedule a task, replacing any existing schedule of the same task
    pub(crate) fn schedule(&mut self, task: Task, at: Instant) {
        self.cancel(task);

        self.sequence += 1;
        self.tasks.push(Reverse((at, self.sequence, task)));
    }

    pub(crate) fn schedule_after(&mut self, task: Task, delay: Duration) {
        self.schedule(task, Instant::now() + delay)
    }

    pub(crate) fn cancel(&mut self, task: Task) {
        self.tasks.retain(|Reverse((_, _, scheduled))| *scheduled != task)
    }

    pub(crate) fn is_scheduled(&self, task: Task) -> bool {
        self.tasks
            .iter()
            .any(|Reverse((_, _, scheduled))| *scheduled == task)
    }

    /// remove and return the tasks due at `now`, earliest first
    pub(crate) fn due(&mut self, now: Instant) -> Vec<Task> {
        let mut due = vec![];

        while let Some(Reverse((at, _, _))) = self.tasks.peek() {
            if *at > now {
                break;
            }

            if let Some(Reverse((_, _, task))) = self.tasks.pop() {
                due.push(task)
            }
        }

        due
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.tasks.peek().map(|Reverse((at, _, _))| *at)
    }
}
