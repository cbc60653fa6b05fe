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

//! Tokio task utilities.
//!
//! Every task spawned by the operator carries a name, attached as a
//! `tracing` span, so that log lines emitted by background work (connection
//! drivers, reflectors, job cleanup watchers) can be attributed.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Instrument;

/// Spawns a new asynchronous task with a name.
///
/// The name is computed lazily by `name`, so callers can format it without
/// paying for the allocation when tracing is disabled at that level.
#[allow(clippy::disallowed_methods)]
pub fn spawn<Fut, Name, NameClosure>(name: NameClosure, future: Fut) -> JoinHandle<Fut::Output>
where
    Name: AsRef<str>,
    NameClosure: FnOnce() -> Name,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let name = name();
    let span = tracing::info_span!("task", name = %name.as_ref());
    tokio::spawn(future.instrument(span))
}

/// Extension methods for [`JoinHandle`].
pub trait JoinHandleExt<T> {
    /// Aborts the task when the returned guard is dropped.
    fn abort_on_drop(self) -> AbortOnDropHandle<T>;
}

impl<T> JoinHandleExt<T> for JoinHandle<T> {
    fn abort_on_drop(self) -> AbortOnDropHandle<T> {
        AbortOnDropHandle(self)
    }
}

/// A [`JoinHandle`] that aborts its task when dropped.
#[derive(Debug)]
pub struct AbortOnDropHandle<T>(JoinHandle<T>);

impl<T> AbortOnDropHandle<T> {
    /// Reports whether the task has finished.
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl<T> Drop for AbortOnDropHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn spawned_task_runs() {
        let handle = spawn(|| "adder", async { 1 + 1 });
        assert_eq!(handle.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn abort_on_drop_cancels_task() {
        let (tx, rx) = oneshot::channel::<()>();
        let handle = spawn(|| "sleeper", async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            let _ = tx.send(());
        })
        .abort_on_drop();
        drop(handle);
        // The sender is dropped with the aborted task, never sent on.
        assert!(rx.await.is_err());
    }
}
