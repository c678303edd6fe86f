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

//! Single owner access guard
//!
//! Detects and rejects use of a consumer by more than one owner at a time,
//! while allowing the owner to re-enter. A second owner is refused
//! immediately with [`Error::ConcurrentAccess`], it never waits.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::Notify;
use tracing::debug;

use crate::{Error, Result};

const NO_CURRENT_OWNER: u64 = 0;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(NO_CURRENT_OWNER + 1);

thread_local! {
    static OWNER: u64 = NEXT_OWNER.fetch_add(1, Ordering::Relaxed);
}

fn current_owner() -> u64 {
    OWNER.with(|owner| *owner)
}

#[derive(Debug, Default)]
pub(crate) struct AccessGuard {
    closed: AtomicBool,
    owner: AtomicU64,
    refcount: AtomicUsize,
}

impl AccessGuard {
    pub(crate) fn acquire(&self) -> Result<Access<'_>> {
        self.ensure_not_closed()?;

        let owner = current_owner();

        if owner != self.owner.load(Ordering::Acquire)
            && self
                .owner
                .compare_exchange(
                    NO_CURRENT_OWNER,
                    owner,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
        {
            debug!(owner, current = self.owner.load(Ordering::Acquire));
            return Err(Error::ConcurrentAccess);
        }

        _ = self.refcount.fetch_add(1, Ordering::AcqRel);
        Ok(Access { guard: self })
    }

    pub(crate) fn ensure_not_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn release(&self) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.owner.store(NO_CURRENT_OWNER, Ordering::Release)
        }
    }
}

/// releases the guard when dropped
#[derive(Debug)]
pub(crate) struct Access<'a> {
    guard: &'a AccessGuard,
}

impl Drop for Access<'_> {
    fn drop(&mut self) {
        self.guard.release()
    }
}

/// Wakeup
///
/// Raised from any thread without taking the guard, interrupting a wait in
/// progress or, failing that, the next one.
#[derive(Debug, Default)]
pub(crate) struct Wakeup {
    raised: AtomicBool,
    notify: Notify,
}

impl Wakeup {
    pub(crate) fn raise(&self) {
        self.raised.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// clears a raised wakeup, returning whether it was raised
    pub(crate) fn take(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }

    /// completes once a wakeup has been raised, clearing it
    pub(crate) async fn raised(&self) {
        while !self.take() {
            self.notify.notified().await
        }
    }
}
