use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::media::FileRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnumerationState {
    Enumerating,
    Complete,
    Cancelling,
    Cancelled,
}

impl EnumerationState {
    pub fn is_settled(self) -> bool {
        matches!(self, EnumerationState::Complete | EnumerationState::Cancelled)
    }
}

/// Handle to a running enumeration of the model.
#[derive(Debug, Clone)]
pub struct EnumerationHandle {
    state: Arc<watch::Sender<EnumerationState>>,
}

impl EnumerationHandle {
    pub(crate) fn spawn<F>(records: Vec<FileRecord>, mut callback: F) -> Self
    where
        F: FnMut(FileRecord) + Send + 'static,
    {
        let (tx, _) = watch::channel(EnumerationState::Enumerating);
        let state = Arc::new(tx);
        let task_state = state.clone();
        tokio::spawn(async move {
            for record in records {
                if *task_state.borrow() == EnumerationState::Cancelling {
                    task_state.send_replace(EnumerationState::Cancelled);
                    return;
                }
                callback(record);
                tokio::task::yield_now().await;
            }
            task_state.send_modify(|state| {
                *state = match *state {
                    EnumerationState::Cancelling => EnumerationState::Cancelled,
                    _ => EnumerationState::Complete,
                };
            });
        });
        Self { state }
    }

    pub fn state(&self) -> EnumerationState {
        *self.state.borrow()
    }

    /// Requests cancellation. No callback runs after the enumeration
    /// observes it. Has no effect once the enumeration has settled.
    pub fn cancel(&self) {
        self.state.send_if_modified(|state| {
            if *state == EnumerationState::Enumerating {
                *state = EnumerationState::Cancelling;
                true
            } else {
                false
            }
        });
    }

    /// Waits until the enumeration is complete or cancelled.
    pub async fn settled(&self) -> EnumerationState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| state.is_settled()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }
}
