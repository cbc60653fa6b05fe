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

//! Retry utilities.
//!
//! [`Retry`] runs a fallible async operation until it succeeds, backing off
//! exponentially between attempts. The defaults suit talking to a freshly
//! started database process: a short initial backoff, doubling, clamped at a
//! few seconds, giving up after half a minute.
//!
//! ```
//! # use std::time::Duration;
//! # use citus_ore::retry::Retry;
//! # async fn connect() -> Result<(), std::io::Error> { Ok(()) }
//! # async fn example() -> Result<(), std::io::Error> {
//! Retry::default()
//!     .max_duration(Duration::from_secs(10))
//!     .retry_async(|_state| connect())
//!     .await
//! # }
//! ```

use std::cmp;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The state of a retry operation, passed to each attempt.
#[derive(Clone, Copy, Debug)]
pub struct RetryState {
    /// The zero-based number of the current attempt.
    pub i: usize,
    /// How long the retry loop will sleep if this attempt fails, or `None` if
    /// this is the final attempt.
    pub next_backoff: Option<Duration>,
}

/// Configures a retry operation.
#[derive(Clone, Debug)]
pub struct Retry {
    initial_backoff: Duration,
    factor: f64,
    clamp_backoff: Duration,
    max_duration: Duration,
    max_tries: usize,
    cancel: Option<CancellationToken>,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            factor: 2.0,
            clamp_backoff: Duration::from_secs(4),
            max_duration: Duration::from_secs(30),
            max_tries: usize::MAX,
            cancel: None,
        }
    }
}

impl Retry {
    /// Sets the backoff before the second attempt.
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Sets the multiplier applied to the backoff after each failed attempt.
    ///
    /// Panics if `factor` is less than one.
    pub fn factor(mut self, factor: f64) -> Self {
        assert!(factor >= 1.0, "retry factor must be at least 1.0");
        self.factor = factor;
        self
    }

    /// Clamps every backoff to at most `clamp_backoff`.
    pub fn clamp_backoff(mut self, clamp_backoff: Duration) -> Self {
        self.clamp_backoff = clamp_backoff;
        self
    }

    /// Gives up once the next backoff would end after `max_duration` has
    /// elapsed since the first attempt.
    pub fn max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    /// Gives up after `max_tries` attempts.
    ///
    /// Panics if `max_tries` is zero.
    pub fn max_tries(mut self, max_tries: usize) -> Self {
        assert!(max_tries > 0, "max_tries must be greater than zero");
        self.max_tries = max_tries;
        self
    }

    /// Stops retrying as soon as `cancel` fires. The error of the attempt in
    /// flight at that point is returned.
    pub fn cancel_on(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Retries the asynchronous operation `f` until it returns `Ok`, or until
    /// the retry budget is exhausted, in which case the last error is
    /// returned.
    pub async fn retry_async<F, U, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut(RetryState) -> U,
        U: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let mut backoff = self.initial_backoff;
        let mut i = 0;
        loop {
            let next_backoff = if i + 1 >= self.max_tries
                || start.elapsed() + backoff > self.max_duration
            {
                None
            } else {
                Some(backoff)
            };
            match f(RetryState { i, next_backoff }).await {
                Ok(t) => return Ok(t),
                Err(e) => {
                    let Some(sleep) = next_backoff else {
                        return Err(e);
                    };
                    match &self.cancel {
                        Some(cancel) => {
                            tokio::select! {
                                _ = cancel.cancelled() => return Err(e),
                                _ = tokio::time::sleep(sleep) => {}
                            }
                        }
                        None => tokio::time::sleep(sleep).await,
                    }
                }
            }
            i += 1;
            backoff = cmp::min(backoff.mul_f64(self.factor), self.clamp_backoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicUsize::new(0);
        let res: Result<usize, &str> = Retry::default()
            .retry_async(|state| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if state.i < 3 {
                        Err("connection refused")
                    } else {
                        Ok(state.i)
                    }
                }
            })
            .await;
        assert_eq!(res, Ok(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_tries() {
        let attempts = AtomicUsize::new(0);
        let res: Result<(), String> = Retry::default()
            .max_tries(3)
            .retry_async(|state| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("attempt {}", state.i)) }
            })
            .await;
        assert_eq!(res, Err("attempt 2".to_string()));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn respects_max_duration() {
        let start = Instant::now();
        let res: Result<(), ()> = Retry::default()
            .initial_backoff(Duration::from_secs(1))
            .clamp_backoff(Duration::from_secs(1))
            .max_duration(Duration::from_secs(5))
            .retry_async(|_| async { Err(()) })
            .await;
        assert!(res.is_err());
        assert!(start.elapsed() <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let attempts = AtomicUsize::new(0);
        let res: Result<(), ()> = Retry::default()
            .cancel_on(cancel)
            .retry_async(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(()) }
            })
            .await;
        assert!(res.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
