//! Verification e-mail for newly created users.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use tallybank_common::{Context, Result};
use tallybank_ledger::{CreateUserParams, CreateUserTxParams, Ledger};

use crate::distributor::TaskDistributor;
use crate::processor::TaskHandler;
use crate::task::{PayloadSendVerifyEmail, Task, TaskOptions, QUEUE_CRITICAL};

/// Options used when a new user's verification e-mail is enqueued.
pub fn verify_email_options() -> TaskOptions {
    TaskOptions::default()
        .max_retry(10)
        .process_in(Duration::from_secs(10))
        .queue(QUEUE_CRITICAL)
}

/// Build a user creation whose commit depends on enqueueing the
/// verification e-mail.
pub fn create_user_with_verify_email(
    params: CreateUserParams,
    distributor: Arc<dyn TaskDistributor>,
    ctx: Context,
    options: TaskOptions,
) -> CreateUserTxParams {
    CreateUserTxParams::new(params, move |user| async move {
        let payload = PayloadSendVerifyEmail {
            username: user.username,
        };
        distributor
            .distribute_task_send_verify_email(&ctx, &payload, options)
            .await
    })
}

/// Handles `task:send_verify_email`.
pub struct SendVerifyEmailHandler {
    ledger: Arc<dyn Ledger>,
}

impl SendVerifyEmailHandler {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl TaskHandler for SendVerifyEmailHandler {
    async fn process_task(&self, ctx: &Context, task: &Task) -> Result<()> {
        let payload: PayloadSendVerifyEmail = task.payload_as()?;
        // Not found until the creating transaction commits; the retry covers it.
        let user = self.ledger.get_user(ctx, &payload.username).await?;

        info!(
            task_id = %task.id,
            username = %user.username,
            email = %user.email,
            "Sent verification e-mail"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributor::task_queue;
    use crate::processor::{ProcessorConfig, TaskProcessor};
    use crate::task::TASK_SEND_VERIFY_EMAIL;
    use tallybank_common::BankError;
    use tallybank_ledger::{MemoryStore, User};
    use tokio_test::{assert_err, assert_ok};

    fn user_params(username: &str) -> CreateUserParams {
        CreateUserParams {
            username: username.to_string(),
            hashed_password: "secret-hash".to_string(),
            full_name: "Verify Me".to_string(),
            email: format!("{username}@example.com"),
        }
    }

    fn processor_config() -> ProcessorConfig {
        ProcessorConfig {
            retry_delay: Duration::from_millis(5),
            task_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_created_user_gets_verify_email() {
        let ledger: Arc<dyn Ledger> = Arc::new(MemoryStore::in_memory());
        let (distributor, receiver) = task_queue(8);
        let processor = TaskProcessor::new(receiver, processor_config())
            .register(TASK_SEND_VERIFY_EMAIL, Arc::new(SendVerifyEmailHandler::new(ledger.clone())));
        let stats = processor.stats();
        let running = tokio::spawn(processor.run(Context::background()));

        let ctx = Context::background();
        let distributor: Arc<dyn TaskDistributor> = Arc::new(distributor);
        let arg = create_user_with_verify_email(
            user_params("verified"),
            distributor.clone(),
            ctx.clone(),
            TaskOptions::default().queue(QUEUE_CRITICAL).max_retry(3),
        );
        assert_ok!(ledger.create_user_tx(&ctx, arg).await);
        drop(distributor);

        assert_ok!(running.await);
        let stats = stats.snapshot();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_uncommitted_user_is_retried_then_dropped() {
        let ledger: Arc<dyn Ledger> = Arc::new(MemoryStore::in_memory());
        let (distributor, receiver) = task_queue(8);
        let processor = TaskProcessor::new(receiver, processor_config())
            .register(TASK_SEND_VERIFY_EMAIL, Arc::new(SendVerifyEmailHandler::new(ledger.clone())));
        let stats = processor.stats();
        let running = tokio::spawn(processor.run(Context::background()));

        let ctx = Context::background();
        let distributor: Arc<dyn TaskDistributor> = Arc::new(distributor);
        let enqueue = distributor.clone();
        let task_ctx = ctx.clone();
        // The task is enqueued but the user insert is rolled back afterwards.
        let arg = CreateUserTxParams::new(user_params("ghost"), move |user: User| async move {
            enqueue
                .distribute_task_send_verify_email(
                    &task_ctx,
                    &PayloadSendVerifyEmail {
                        username: user.username,
                    },
                    TaskOptions::default().max_retry(2),
                )
                .await?;
            Err(BankError::InternalError("abort after enqueue".to_string()))
        });
        assert_err!(ledger.create_user_tx(&ctx, arg).await);
        drop(distributor);

        assert_ok!(running.await);
        let stats = stats.snapshot();
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_options_for_new_users() {
        let options = verify_email_options();
        assert_eq!(options.max_retry, 10);
        assert_eq!(options.process_in, Duration::from_secs(10));
        assert_eq!(options.queue, QUEUE_CRITICAL);
    }
}
