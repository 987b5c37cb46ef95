//! Cooperative pause / resume / stop for long-running sync and probe runs.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Requested run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Stopping,
}

/// What a worker should do at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Shared control handle. Clones observe and drive the same run.
#[derive(Debug, Clone)]
pub struct SyncControl {
    state: Arc<watch::Sender<RunState>>,
}

impl Default for SyncControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunState::Running);
        Self { state: Arc::new(tx) }
    }

    pub fn pause(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Paused;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Sync paused");
        }
    }

    pub fn resume(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == RunState::Paused {
                *state = RunState::Running;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Sync resumed");
        }
    }

    /// Request a stop. Work in flight finishes; no new window starts.
    pub fn stop(&self) {
        if self.state.send_replace(RunState::Stopping) != RunState::Stopping {
            info!("Stop requested");
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn is_stopping(&self) -> bool {
        self.state() == RunState::Stopping
    }

    /// Block while paused; report whether the caller should keep going.
    pub async fn checkpoint(&self) -> Flow {
        let mut rx = self.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                RunState::Running => return Flow::Continue,
                RunState::Stopping => return Flow::Stop,
                RunState::Paused => {
                    if rx.changed().await.is_err() {
                        return Flow::Stop;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_running_checkpoint_passes() {
        let control = SyncControl::new();
        assert_eq!(control.checkpoint().await, Flow::Continue);
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resume() {
        let control = SyncControl::new();
        control.pause();
        assert_eq!(control.state(), RunState::Paused);

        let worker = {
            let control = control.clone();
            tokio::spawn(async move { control.checkpoint().await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!worker.is_finished());

        control.resume();
        let flow = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(flow, Flow::Continue);
    }

    #[tokio::test]
    async fn test_stop_releases_paused_worker() {
        let control = SyncControl::new();
        control.pause();

        let worker = {
            let control = control.clone();
            tokio::spawn(async move { control.checkpoint().await })
        };
        control.stop();

        let flow = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(flow, Flow::Stop);
        assert!(control.is_stopping());
    }

    #[test]
    fn test_resume_after_stop_stays_stopped() {
        let control = SyncControl::new();
        control.stop();
        control.resume();
        control.pause();
        assert_eq!(control.state(), RunState::Stopping);
    }
}
