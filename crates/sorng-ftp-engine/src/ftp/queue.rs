//! Transfer queue: runs a batch of uploads/downloads concurrently, each
//! over its own cloned connection, bounded by a semaphore.

use crate::ftp::client::FtpClient;
use crate::ftp::error::FtpResult;
use crate::ftp::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

/// One queued transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub id: String,
    pub direction: TransferDirection,
    pub local_path: String,
    pub remote_path: String,
}

/// What became of a queued transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    pub id: String,
    pub direction: TransferDirection,
    pub local_path: String,
    pub remote_path: String,
    pub state: TransferState,
    pub status: FtpStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

pub struct TransferQueue {
    config: TransferQueueConfig,
    pending: VecDeque<TransferRequest>,
    progress: Option<ProgressCallback>,
}

impl TransferQueue {
    pub fn new(config: TransferQueueConfig) -> Self {
        Self {
            config,
            pending: VecDeque::new(),
            progress: None,
        }
    }

    /// Report progress of every transfer through `cb`.
    pub fn with_progress(mut self, cb: ProgressCallback) -> Self {
        self.progress = Some(cb);
        self
    }

    /// Enqueue a transfer and return its id.
    pub fn enqueue(
        &mut self,
        direction: TransferDirection,
        local_path: &str,
        remote_path: &str,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.pending.push_back(TransferRequest {
            id: id.clone(),
            direction,
            local_path: local_path.to_string(),
            remote_path: remote_path.to_string(),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn config(&self) -> &TransferQueueConfig {
        &self.config
    }

    /// Run everything queued, at most `max_concurrent` at a time. Outcomes
    /// are returned in enqueue order. Cancelling the client's token stops
    /// running transfers and marks the rest `Cancelled`.
    pub async fn run(&mut self, client: &FtpClient) -> FtpResult<Vec<TransferOutcome>> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks: JoinSet<(usize, TransferOutcome)> = JoinSet::new();
        let mut outcomes: Vec<Option<TransferOutcome>> = Vec::new();
        let cancel = client.cancel_token().clone();

        let requests: Vec<TransferRequest> = self.pending.drain(..).collect();
        log::info!(
            "Running {} queued transfers, {} at a time",
            requests.len(),
            self.config.max_concurrent
        );

        for (index, request) in requests.into_iter().enumerate() {
            outcomes.push(None);
            let started_at = Utc::now();

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                outcomes[index] = Some(finished(&request, started_at, TransferState::Cancelled, None));
                continue;
            };

            let mut worker = match client.clone_connection().await {
                Ok(worker) => worker,
                Err(e) => {
                    let state = if e.is_cancelled() {
                        TransferState::Cancelled
                    } else {
                        log::error!("No connection for {}: {}", request.remote_path, e);
                        TransferState::Failed
                    };
                    outcomes[index] = Some(finished(&request, started_at, state, Some(e.message)));
                    continue;
                }
            };

            let config = self.config.clone();
            let progress = self.progress.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = match request.direction {
                    TransferDirection::Download => {
                        worker
                            .download_file(
                                &request.local_path,
                                &request.remote_path,
                                config.local_exists,
                                config.verify,
                                progress,
                            )
                            .await
                    }
                    TransferDirection::Upload => {
                        worker
                            .upload_file(
                                &request.local_path,
                                &request.remote_path,
                                config.remote_exists,
                                config.create_remote_dirs,
                                config.verify,
                                progress,
                            )
                            .await
                    }
                };
                if let Err(e) = worker.quit().await {
                    log::debug!("QUIT after queued transfer failed: {}", e);
                }

                let outcome = match result {
                    Ok(FtpStatus::Success) => {
                        finished(&request, started_at, TransferState::Completed, None)
                    }
                    Ok(FtpStatus::Skipped) => {
                        finished(&request, started_at, TransferState::Skipped, None)
                    }
                    Ok(FtpStatus::Failed) => finished(&request, started_at, TransferState::Failed, None),
                    Err(e) if e.is_cancelled() => {
                        finished(&request, started_at, TransferState::Cancelled, Some(e.message))
                    }
                    Err(e) => finished(&request, started_at, TransferState::Failed, Some(e.message)),
                };
                (index, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => log::error!("Queued transfer task failed: {}", e),
            }
        }

        Ok(outcomes.into_iter().flatten().collect())
    }
}

fn finished(
    request: &TransferRequest,
    started_at: DateTime<Utc>,
    state: TransferState,
    error: Option<String>,
) -> TransferOutcome {
    let status = match state {
        TransferState::Completed => FtpStatus::Success,
        TransferState::Skipped => FtpStatus::Skipped,
        _ => FtpStatus::Failed,
    };
    TransferOutcome {
        id: request.id.clone(),
        direction: request.direction,
        local_path: request.local_path.clone(),
        remote_path: request.remote_path.clone(),
        state,
        status,
        error,
        started_at,
        completed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_assigns_ids_in_order() {
        let mut queue = TransferQueue::new(TransferQueueConfig::default());
        assert!(queue.is_empty());
        let a = queue.enqueue(TransferDirection::Download, "/tmp/a", "/a");
        let b = queue.enqueue(TransferDirection::Upload, "/tmp/b", "/b");
        assert_ne!(a, b);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pending[0].id, a);
        assert_eq!(queue.pending[1].direction, TransferDirection::Upload);
    }

    #[test]
    fn outcome_status_follows_state() {
        let request = TransferRequest {
            id: "1".into(),
            direction: TransferDirection::Download,
            local_path: "/tmp/a".into(),
            remote_path: "/a".into(),
        };
        let now = Utc::now();
        assert_eq!(
            finished(&request, now, TransferState::Completed, None).status,
            FtpStatus::Success
        );
        assert_eq!(
            finished(&request, now, TransferState::Skipped, None).status,
            FtpStatus::Skipped
        );
        assert_eq!(
            finished(&request, now, TransferState::Cancelled, None).status,
            FtpStatus::Failed
        );
    }
}
