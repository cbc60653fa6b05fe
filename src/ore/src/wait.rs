// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cancelable polling.
//!
//! Controllers spend most of their time waiting: for a pod to become ready,
//! for a job to finish, for a deleted object to disappear. Every such wait is
//! bound to the controller's [`CancellationToken`] so that shutdown resolves
//! it with [`WaitError::Cancelled`] rather than a false success.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The ways a wait can end other than with the awaited value.
#[derive(Debug, thiserror::Error)]
pub enum WaitError<E> {
    /// The condition did not hold before the timeout elapsed.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    /// The cancellation token fired.
    #[error("wait cancelled by shutdown")]
    Cancelled,
    /// Checking the condition failed.
    #[error(transparent)]
    Failed(E),
}

/// A polling schedule: check every `interval` until `timeout` elapses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Poll {
    /// Time between checks.
    pub interval: Duration,
    /// Total time budget, measured from the first check.
    pub timeout: Duration,
}

impl Poll {
    /// Constructs a new polling schedule.
    pub const fn new(interval: Duration, timeout: Duration) -> Poll {
        Poll { interval, timeout }
    }

    /// Calls `check` until it returns `Ok(Some(_))`.
    ///
    /// `Ok(None)` means "not yet"; an `Err` aborts the wait immediately.
    pub async fn until<F, U, T, E>(
        &self,
        cancel: &CancellationToken,
        mut check: F,
    ) -> Result<T, WaitError<E>>
    where
        F: FnMut() -> U,
        U: Future<Output = Result<Option<T>, E>>,
    {
        let deadline = Instant::now() + self.timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }
            if let Some(t) = check().await.map_err(WaitError::Failed)? {
                return Ok(t);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::TimedOut(self.timeout));
            }
            let sleep = std::cmp::min(self.interval, deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }
}

/// Sleeps for `duration`, returning early with [`WaitError::Cancelled`] if
/// `cancel` fires first.
pub async fn sleep<E>(duration: Duration, cancel: &CancellationToken) -> Result<(), WaitError<E>> {
    tokio::select! {
        _ = cancel.cancelled() => Err(WaitError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const POLL: Poll = Poll::new(Duration::from_secs(1), Duration::from_secs(10));

    #[tokio::test(start_paused = true)]
    async fn resolves_when_condition_holds() {
        let checks = AtomicUsize::new(0);
        let res: Result<&str, WaitError<()>> = POLL
            .until(&CancellationToken::new(), || {
                let n = checks.fetch_add(1, Ordering::SeqCst);
                async move { Ok((n == 2).then_some("ready")) }
            })
            .await;
        assert_eq!(res.unwrap(), "ready");
        assert_eq!(checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let res: Result<(), WaitError<()>> = POLL
            .until(&CancellationToken::new(), || async { Ok(None) })
            .await;
        assert!(matches!(res, Err(WaitError::TimedOut(d)) if d == Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn check_errors_abort_the_wait() {
        let res: Result<(), WaitError<&str>> = POLL
            .until(&CancellationToken::new(), || async { Err("boom") })
            .await;
        assert!(matches!(res, Err(WaitError::Failed("boom"))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_not_success() {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let waiter = tokio::spawn(async move {
            POLL.until(&child, || async { Ok::<Option<()>, ()>(None) })
                .await
        });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(WaitError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: Result<(), WaitError<()>> = sleep(Duration::from_secs(60), &cancel).await;
        assert!(matches!(res, Err(WaitError::Cancelled)));
    }
}
