//! Task enqueueing.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use tallybank_common::{BankError, Context, Result};

use crate::task::{PayloadSendVerifyEmail, Task, TaskOptions, QUEUE_CRITICAL, QUEUE_DEFAULT, TASK_SEND_VERIFY_EMAIL};

/// Hands tasks to the background processor.
#[async_trait]
pub trait TaskDistributor: Send + Sync {
    async fn distribute_task(&self, ctx: &Context, task: Task) -> Result<()>;

    /// Enqueue the verification e-mail of a new user.
    async fn distribute_task_send_verify_email(
        &self,
        ctx: &Context,
        payload: &PayloadSendVerifyEmail,
        options: TaskOptions,
    ) -> Result<()> {
        let task = Task::new(TASK_SEND_VERIFY_EMAIL, payload, options)?;
        self.distribute_task(ctx, task).await
    }
}

/// Create a bounded in-process queue with one lane per queue name.
pub fn task_queue(capacity: usize) -> (ChannelDistributor, TaskReceiver) {
    let (critical_tx, critical_rx) = mpsc::channel(capacity);
    let (default_tx, default_rx) = mpsc::channel(capacity);
    (
        ChannelDistributor {
            critical: critical_tx,
            default: default_tx,
        },
        TaskReceiver {
            critical: critical_rx,
            default: default_rx,
        },
    )
}

/// Distributor feeding a [`TaskReceiver`] in the same process.
#[derive(Debug, Clone)]
pub struct ChannelDistributor {
    critical: mpsc::Sender<Task>,
    default: mpsc::Sender<Task>,
}

#[async_trait]
impl TaskDistributor for ChannelDistributor {
    async fn distribute_task(&self, ctx: &Context, task: Task) -> Result<()> {
        let sender = match task.options.queue.as_str() {
            QUEUE_CRITICAL => &self.critical,
            QUEUE_DEFAULT => &self.default,
            other => {
                return Err(BankError::invalid_argument(
                    "queue",
                    format!("unknown queue {other}"),
                ))
            }
        };

        let task_id = task.id;
        let type_name = task.type_name.clone();
        let queue = task.options.queue.clone();
        let max_retry = task.options.max_retry;

        ctx.run(async {
            sender
                .send(task)
                .await
                .map_err(|_| BankError::TaskDistribution("task processor is not running".to_string()))
        })
        .await?;

        info!(
            task_id = %task_id,
            task_type = %type_name,
            queue = %queue,
            max_retry,
            "Enqueued task"
        );
        Ok(())
    }
}

/// Receiving end of [`task_queue`]; critical tasks are served first.
#[derive(Debug)]
pub struct TaskReceiver {
    critical: mpsc::Receiver<Task>,
    default: mpsc::Receiver<Task>,
}

impl TaskReceiver {
    /// Wait for the next task; `None` once every distributor is gone and
    /// both lanes are drained.
    pub async fn recv(&mut self) -> Option<Task> {
        tokio::select! {
            biased;
            Some(task) = self.critical.recv() => Some(task),
            Some(task) = self.default.recv() => Some(task),
            else => None,
        }
    }
}
