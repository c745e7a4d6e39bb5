//! Tallybank Worker
//!
//! Background tasks enqueued by the ledger (verification e-mails after user
//! creation) and the processor that runs them with delay and retry.

pub mod distributor;
pub mod processor;
pub mod task;
pub mod verify_email;

pub use distributor::{task_queue, ChannelDistributor, TaskDistributor, TaskReceiver};
pub use processor::{ProcessorConfig, ProcessorStats, StatsSnapshot, TaskHandler, TaskProcessor};
pub use task::{
    PayloadSendVerifyEmail, Task, TaskOptions, QUEUE_CRITICAL, QUEUE_DEFAULT,
    TASK_SEND_VERIFY_EMAIL,
};
pub use verify_email::{create_user_with_verify_email, verify_email_options, SendVerifyEmailHandler};
