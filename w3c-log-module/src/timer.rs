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

//! Deferred provisional logging for requests still in progress

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::shutdown::WorkUnit;

const ARMED: u8 = 0;
const CANCELED: u8 = 1;
const FIRED: u8 = 2;

/// Result of disarming a provisional timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disarm {
    /// The timer never fired and won’t fire any more
    Canceled,
    /// The timer fired before it could be disarmed
    AlreadyFired,
}

/// The armed → canceled / armed → fired transition, whichever side gets there first wins.
#[derive(Debug)]
pub(crate) struct ProvisionalState {
    state: AtomicU8,
}

impl ProvisionalState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(ARMED),
        }
    }

    /// Returns `true` if the caller is now responsible for the provisional record.
    pub(crate) fn try_fire(&self) -> bool {
        self.state
            .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn disarm(&self) -> Disarm {
        match self
            .state
            .compare_exchange(ARMED, CANCELED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) | Err(CANCELED) => Disarm::Canceled,
            Err(_) => Disarm::AlreadyFired,
        }
    }
}

#[derive(Debug)]
struct TimerShared {
    state: ProvisionalState,
    // Held while the provisional record is being written, so that disarming never returns
    // before the record is out.
    unit: Mutex<Option<WorkUnit>>,
}

/// Fires a callback once after a delay unless disarmed first.
///
/// The timer holds its own unit of shutdown work which is released either when the callback
/// completes or when the timer is canceled.
#[derive(Debug)]
pub(crate) struct ProvisionalTimer {
    shared: Arc<TimerShared>,
    task: JoinHandle<()>,
}

impl ProvisionalTimer {
    /// Arms the timer, must be called within a Tokio runtime.
    pub(crate) fn arm<F>(delay: Duration, unit: WorkUnit, fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            state: ProvisionalState::new(),
            unit: Mutex::new(Some(unit)),
        });

        let task = tokio::spawn({
            let shared = shared.clone();
            async move {
                tokio::time::sleep(delay).await;

                let mut unit = shared.unit.lock().unwrap_or_else(PoisonError::into_inner);
                if shared.state.try_fire() {
                    fire();
                    drop(unit.take());
                }
            }
        });

        Self { shared, task }
    }

    pub(crate) fn disarm(self) -> Disarm {
        let mut unit = self
            .shared
            .unit
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let outcome = self.shared.state.disarm();
        if outcome == Disarm::Canceled {
            self.task.abort();
            drop(unit.take());
        }
        outcome
    }
}
