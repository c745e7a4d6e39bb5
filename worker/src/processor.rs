//! Background task execution with delay and retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use tallybank_common::{BankError, Context, Result};

use crate::distributor::TaskReceiver;
use crate::task::Task;

/// Executes tasks of one type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn process_task(&self, ctx: &Context, task: &Task) -> Result<()>;
}

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Pause between a failed attempt and the next one.
    pub retry_delay: Duration,
    /// Upper bound on one attempt.
    pub task_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            task_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters shared between the processor and its observers.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    processed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub retried: u64,
    pub failed: u64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Consumes a [`TaskReceiver`] and dispatches each task to its handler.
pub struct TaskProcessor {
    receiver: TaskReceiver,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    config: ProcessorConfig,
    stats: Arc<ProcessorStats>,
}

impl TaskProcessor {
    pub fn new(receiver: TaskReceiver, config: ProcessorConfig) -> Self {
        Self {
            receiver,
            handlers: HashMap::new(),
            config,
            stats: Arc::new(ProcessorStats::default()),
        }
    }

    /// Route tasks named `type_name` to `handler`.
    pub fn register(mut self, type_name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(type_name.into(), handler);
        self
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        self.stats.clone()
    }

    /// Process tasks until `ctx` is done or every distributor is dropped,
    /// then wait for the tasks already started.
    pub async fn run(mut self, ctx: Context) {
        info!(handlers = self.handlers.len(), "Task processor started");
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = ctx.done() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Task worker panicked");
                    }
                }
                task = self.receiver.recv() => match task {
                    Some(task) => {
                        let handler = self.handlers.get(&task.type_name).cloned();
                        in_flight.spawn(execute(
                            handler,
                            ctx.clone(),
                            task,
                            self.config.clone(),
                            self.stats.clone(),
                        ));
                    }
                    None => break,
                },
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Task worker panicked");
            }
        }
        info!(stats = ?self.stats.snapshot(), "Task processor stopped");
    }
}

/// Errors that no retry can fix.
fn skip_retry(err: &BankError) -> bool {
    matches!(err, BankError::InvalidArgument { .. })
}

async fn pause(ctx: &Context, delay: Duration) -> Result<()> {
    ctx.run(async {
        tokio::time::sleep(delay).await;
        Ok(())
    })
    .await
}

async fn execute(
    handler: Option<Arc<dyn TaskHandler>>,
    ctx: Context,
    task: Task,
    config: ProcessorConfig,
    stats: Arc<ProcessorStats>,
) {
    let Some(handler) = handler else {
        error!(task_id = %task.id, task_type = %task.type_name, "No handler for task type");
        stats.failed.fetch_add(1, Ordering::Relaxed);
        return;
    };

    if !task.options.process_in.is_zero() && pause(&ctx, task.options.process_in).await.is_err() {
        return;
    }

    let mut attempt: u32 = 0;
    loop {
        let attempt_ctx = ctx.with_timeout(config.task_timeout);
        let err = match attempt_ctx.run(handler.process_task(&attempt_ctx, &task)).await {
            Ok(()) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
                debug!(task_id = %task.id, task_type = %task.type_name, attempt, "Task done");
                return;
            }
            Err(err) => err,
        };

        if ctx.err().is_some() {
            warn!(task_id = %task.id, error = %err, "Task interrupted by shutdown");
            return;
        }

        if skip_retry(&err) || attempt >= task.options.max_retry {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                task_id = %task.id,
                task_type = %task.type_name,
                attempts = attempt + 1,
                error = %err,
                "Task failed"
            );
            return;
        }

        attempt += 1;
        stats.retried.fetch_add(1, Ordering::Relaxed);
        warn!(
            task_id = %task.id,
            task_type = %task.type_name,
            attempt,
            error = %err,
            "Task failed, retrying"
        );
        if pause(&ctx, config.retry_delay).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::distributor::{task_queue, TaskDistributor};
    use crate::task::{TaskOptions, TASK_SEND_VERIFY_EMAIL};
    use tokio_test::assert_ok;

    /// Fails its first `failures` calls.
    struct FlakyHandler {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TaskHandler for FlakyHandler {
        async fn process_task(&self, _ctx: &Context, _task: &Task) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(BankError::DatabaseError("temporarily unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig {
            retry_delay: Duration::from_millis(5),
            task_timeout: Duration::from_secs(1),
        }
    }

    async fn run_one(handler: Arc<FlakyHandler>, task: Task) -> StatsSnapshot {
        let (distributor, receiver) = task_queue(4);
        let processor = TaskProcessor::new(receiver, fast_config()).register(TASK_SEND_VERIFY_EMAIL, handler);
        let stats = processor.stats();
        let running = tokio::spawn(processor.run(Context::background()));

        assert_ok!(distributor.distribute_task(&Context::background(), task).await);
        drop(distributor);
        assert_ok!(running.await);
        stats.snapshot()
    }

    fn task(options: TaskOptions) -> Task {
        Task::new(TASK_SEND_VERIFY_EMAIL, &serde_json::json!({}), options).expect("task")
    }

    #[tokio::test]
    async fn test_task_retried_until_success() {
        let handler = Arc::new(FlakyHandler {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let stats = run_one(handler.clone(), task(TaskOptions::default().max_retry(3))).await;

        assert_eq!(
            stats,
            StatsSnapshot {
                processed: 1,
                retried: 2,
                failed: 0
            }
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_task_dropped_after_max_retry() {
        let handler = Arc::new(FlakyHandler {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let stats = run_one(handler.clone(), task(TaskOptions::default().max_retry(2))).await;

        assert_eq!(stats.processed, 0);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_process_in_delays_first_attempt() {
        let handler = Arc::new(FlakyHandler {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let started = tokio::time::Instant::now();
        let stats = run_one(
            handler,
            task(TaskOptions::default().process_in(Duration::from_millis(50))),
        )
        .await;

        assert_eq!(stats.processed, 1);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_unknown_task_type_fails() {
        let (distributor, receiver) = task_queue(4);
        let processor = TaskProcessor::new(receiver, fast_config());
        let stats = processor.stats();
        let running = tokio::spawn(processor.run(Context::background()));

        let task = Task::new("task:unknown", &serde_json::json!({}), TaskOptions::default()).expect("task");
        assert_ok!(distributor.distribute_task(&Context::background(), task).await);
        drop(distributor);
        assert_ok!(running.await);

        assert_eq!(stats.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_processor() {
        let (distributor, receiver) = task_queue(4);
        let handler = Arc::new(FlakyHandler {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let processor = TaskProcessor::new(receiver, fast_config()).register(TASK_SEND_VERIFY_EMAIL, handler.clone());
        let ctx = Context::background().with_cancel();
        let running = tokio::spawn(processor.run(ctx.clone()));

        assert_ok!(
            distributor
                .distribute_task(
                    &Context::background(),
                    task(TaskOptions::default().process_in(Duration::from_secs(60))),
                )
                .await
        );
        ctx.cancel();

        assert_ok!(assert_ok!(
            tokio::time::timeout(Duration::from_secs(1), running).await
        ));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }
}
