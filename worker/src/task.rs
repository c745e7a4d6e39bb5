//! Task envelope and enqueue options.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tallybank_common::{BankError, Result};

/// Queue for tasks that must run before anything else.
pub const QUEUE_CRITICAL: &str = "critical";
pub const QUEUE_DEFAULT: &str = "default";

pub const TASK_SEND_VERIFY_EMAIL: &str = "task:send_verify_email";

/// Delivery options of an enqueued task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    /// Attempts after the first failure before the task is dropped.
    pub max_retry: u32,
    /// Delay before the first attempt.
    pub process_in: Duration,
    pub queue: String,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_retry: 25,
            process_in: Duration::ZERO,
            queue: QUEUE_DEFAULT.to_string(),
        }
    }
}

impl TaskOptions {
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_in = delay;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }
}

/// A unit of background work.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub type_name: String,
    pub payload: serde_json::Value,
    pub options: TaskOptions,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    /// Build a task, serializing `payload` to JSON.
    pub fn new<P: Serialize>(
        type_name: impl Into<String>,
        payload: &P,
        options: TaskOptions,
    ) -> Result<Self> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| BankError::TaskDistribution(format!("failed to marshal task payload: {e}")))?;
        Ok(Self {
            id: Uuid::new_v4(),
            type_name: type_name.into(),
            payload,
            options,
            enqueued_at: Utc::now(),
        })
    }

    /// Decode the payload.
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            BankError::InvalidArgument {
                message: format!("failed to unmarshal payload of {}: {e}", self.type_name),
                field: Some("payload".to_string()),
            }
        })
    }
}

/// Payload of [`TASK_SEND_VERIFY_EMAIL`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub username: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_options_builder() {
        let opts = TaskOptions::default()
            .max_retry(10)
            .process_in(Duration::from_secs(10))
            .queue(QUEUE_CRITICAL);
        assert_eq!(opts.max_retry, 10);
        assert_eq!(opts.process_in, Duration::from_secs(10));
        assert_eq!(opts.queue, "critical");
    }

    #[test]
    fn test_payload_decodes() {
        let payload = PayloadSendVerifyEmail {
            username: "alice".to_string(),
        };
        let task = assert_ok!(Task::new(TASK_SEND_VERIFY_EMAIL, &payload, TaskOptions::default()));
        assert_eq!(task.payload, serde_json::json!({ "username": "alice" }));
        assert_eq!(assert_ok!(task.payload_as::<PayloadSendVerifyEmail>()), payload);
    }

    #[test]
    fn test_malformed_payload_is_invalid_argument() {
        let task = assert_ok!(Task::new(TASK_SEND_VERIFY_EMAIL, &42, TaskOptions::default()));
        let err = assert_err!(task.payload_as::<PayloadSendVerifyEmail>());
        assert!(matches!(err, BankError::InvalidArgument { .. }));
    }
}
