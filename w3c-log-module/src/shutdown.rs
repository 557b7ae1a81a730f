// Copyright 2024 Wladimir Palant
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

//! Outstanding work counter gating graceful shutdown

use log::error;
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct CounterState {
    outstanding: AtomicUsize,
    underflows: AtomicUsize,
    drained: Notify,
}

/// Counts units of outstanding logging work: in-flight requests, armed provisional timers and
/// open hijacked connections.
///
/// Clones share the same count. Shutdown logic calls [`ShutdownCounter::wait`] to make sure that
/// every started request has produced its terminal log record before the process exits.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCounter {
    state: Arc<CounterState>,
}

impl ShutdownCounter {
    /// Creates a counter without any outstanding work.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a unit of work, dropping the returned guard releases it.
    pub fn register(&self) -> WorkUnit {
        self.state.outstanding.fetch_add(1, Ordering::SeqCst);
        WorkUnit {
            state: self.state.clone(),
        }
    }

    /// Number of units currently registered
    pub fn outstanding(&self) -> usize {
        self.state.outstanding.load(Ordering::SeqCst)
    }

    /// Number of releases that found no outstanding unit, zero unless units were miscounted
    pub fn underflows(&self) -> usize {
        self.state.underflows.load(Ordering::SeqCst)
    }

    /// Waits until all registered units of work have been released.
    ///
    /// Completes immediately if there is no outstanding work. Units registered while waiting
    /// extend the wait.
    pub async fn wait(&self) {
        loop {
            let mut notified = pin!(self.state.drained.notified());
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// A registered unit of outstanding work
///
/// Each unit is released exactly once, when the guard is dropped or [`WorkUnit::release`] is
/// called.
#[must_use = "dropping the unit releases it immediately"]
#[derive(Debug)]
pub struct WorkUnit {
    state: Arc<CounterState>,
}

impl WorkUnit {
    /// Releases the unit of work.
    pub fn release(self) {}
}

impl Drop for WorkUnit {
    fn drop(&mut self) {
        match self
            .state
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            }) {
            Ok(1) => self.state.drained.notify_waiters(),
            Ok(_) => {}
            Err(_) => {
                self.state.underflows.fetch_add(1, Ordering::SeqCst);
                error!("Shutdown counter released more often than registered");
            }
        }
    }
}
