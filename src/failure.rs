// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Failure Routing
//!
//! One-way messages whose processing failed are forwarded — original payload
//! plus error metadata — to the configured invalid-letter queue (validation
//! failures) or dead-letter queue (everything else) on the shared primary
//! channel. Routing is terminal: it logs and swallows its own failures so a
//! broken failure path can never take down the consumer loop or lose the
//! error silently. When a failure queue cannot be reached, the wrapped
//! message is spooled to the failed-job store if one is configured.

use crate::{
    envelope::RequestContext,
    errors::{AmqpError, FieldErrors},
    publisher::Publisher,
    serializer,
};
use chrono::Utc;
use opentelemetry::Context;
use serde_json::{json, Value};
use std::{path::PathBuf, sync::Arc};
use tracing::{error, warn};
use uuid::Uuid;

/// Routes failed one-way messages to the configured failure queues.
pub struct FailureRouter {
    publisher: Arc<Publisher>,
    dead_letter_queue: Option<String>,
    invalid_letter_queue: Option<String>,
    store: Option<FailedJobStore>,
}

impl FailureRouter {
    pub fn new(
        publisher: Arc<Publisher>,
        dead_letter_queue: Option<String>,
        invalid_letter_queue: Option<String>,
        store: Option<FailedJobStore>,
    ) -> Arc<FailureRouter> {
        Arc::new(FailureRouter {
            publisher,
            dead_letter_queue,
            invalid_letter_queue,
            store,
        })
    }

    /// Forwards a message that failed DTO validation, with the field errors
    /// and its source queue attached. A no-op (after logging) when no
    /// invalid-letter queue is configured.
    pub async fn route_invalid(
        &self,
        ctx: &Context,
        source_queue: &str,
        original: &Value,
        errors: &FieldErrors,
    ) {
        let Some(queue) = &self.invalid_letter_queue else {
            warn!(
                queue = source_queue,
                "invalid letter queue not configured, dropping message"
            );
            return;
        };

        let wrapped = invalid_payload(original, errors, source_queue);
        self.deliver(ctx, queue, source_queue, wrapped).await;
    }

    /// Forwards a message whose handler failed unexpectedly, with the error
    /// metadata attached. A no-op (after logging) when no dead-letter queue
    /// is configured.
    #[track_caller]
    pub fn route_dead<'f>(
        &'f self,
        ctx: &'f Context,
        source_queue: &'f str,
        original: &'f Value,
        message: &'f str,
    ) -> impl std::future::Future<Output = ()> + 'f {
        let location = std::panic::Location::caller();
        let wrapped = dead_payload(original, message, location.file(), location.line());

        async move {
            let Some(queue) = &self.dead_letter_queue else {
                warn!(
                    queue = source_queue,
                    "dead letter queue not configured, dropping message"
                );
                return;
            };

            self.deliver(ctx, queue, source_queue, wrapped).await;
        }
    }

    async fn deliver(&self, ctx: &Context, queue: &str, source_queue: &str, wrapped: Value) {
        let builder = self.publisher.envelope_builder();
        let envelope = match builder.build(&wrapped, &RequestContext::default()) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(error = err.to_string(), "failure payload not serializable");
                return;
            }
        };

        if let Err(err) = self.publisher.publish_envelope(ctx, queue, &envelope).await {
            error!(
                error = err.to_string(),
                queue, "failed to route message to failure queue"
            );
            if let Some(store) = &self.store {
                store.write(source_queue, &wrapped).await;
            }
        }
    }
}

/// Original payload wrapped with its validation errors and source queue.
pub(crate) fn invalid_payload(original: &Value, errors: &FieldErrors, queue: &str) -> Value {
    let mut wrapped = ensure_object(original);
    wrapped["validation"] = json!(errors);
    wrapped["queue"] = json!(queue);
    wrapped
}

/// Original payload wrapped with error metadata.
pub(crate) fn dead_payload(original: &Value, message: &str, file: &str, line: u32) -> Value {
    let mut wrapped = ensure_object(original);
    wrapped["error"] = json!({
        "file": file,
        "line": line,
        "message": message,
        "time": Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    });
    wrapped
}

fn ensure_object(original: &Value) -> Value {
    if original.is_object() {
        original.clone()
    } else {
        json!({ "body": original })
    }
}

/// Spool for messages that could not be failure-routed.
///
/// Each entry is one JSON file `{queue, message}`; `replay` publishes every
/// spooled entry back to its original queue and removes the file.
pub struct FailedJobStore {
    dir: PathBuf,
}

impl FailedJobStore {
    pub fn new(dir: PathBuf) -> FailedJobStore {
        FailedJobStore { dir }
    }

    /// Writes one failed message to the spool. Logs and swallows I/O errors,
    /// like the rest of the failure path.
    pub async fn write(&self, queue: &str, message: &Value) {
        let entry = json!({ "queue": queue, "message": message });

        let bytes = match serializer::encode(&entry) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = err.to_string(), "failed job not serializable");
                return;
            }
        };

        if let Err(err) = tokio::fs::create_dir_all(&self.dir).await {
            error!(error = err.to_string(), "cannot create failed job dir");
            return;
        }

        let path = self.dir.join(format!("{}.json", Uuid::new_v4()));
        if let Err(err) = tokio::fs::write(&path, bytes).await {
            error!(error = err.to_string(), "cannot write failed job");
        }
    }

    /// Republishes every spooled message to its original queue.
    pub async fn replay(&self, ctx: &Context, publisher: &Publisher) -> Result<(), AmqpError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(_) => return Ok(()),
        };

        while let Ok(Some(file)) = dir.next_entry().await {
            let Ok(bytes) = tokio::fs::read(file.path()).await else {
                continue;
            };

            let Ok(entry) = serde_json::from_slice::<Value>(&bytes) else {
                warn!(path = %file.path().display(), "skipping unreadable failed job");
                continue;
            };

            let (Some(queue), Some(message)) = (
                entry.get("queue").and_then(Value::as_str),
                entry.get("message"),
            ) else {
                warn!(path = %file.path().display(), "skipping malformed failed job");
                continue;
            };

            publisher
                .publish(ctx, Some(queue), message, &RequestContext::default())
                .await?;

            if let Err(err) = tokio::fs::remove_file(file.path()).await {
                error!(error = err.to_string(), "cannot remove replayed failed job");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_payload_attaches_validation_errors_and_source_queue() {
        let original = json!({"method": "createProduct", "params": {"name": "A"}});
        let mut errors = FieldErrors::new();
        errors.insert("id".to_owned(), vec!["the id field is required".to_owned()]);

        let wrapped = invalid_payload(&original, &errors, "product.create");

        assert_eq!(wrapped["method"], "createProduct");
        assert_eq!(
            wrapped["validation"],
            json!({"id": ["the id field is required"]})
        );
        assert_eq!(wrapped["queue"], "product.create");
    }

    #[test]
    fn dead_payload_attaches_error_metadata() {
        let original = json!({"method": "save"});

        let wrapped = dead_payload(&original, "db unavailable", "src/consumer.rs", 42);

        assert_eq!(wrapped["method"], "save");
        assert_eq!(wrapped["error"]["message"], "db unavailable");
        assert_eq!(wrapped["error"]["file"], "src/consumer.rs");
        assert_eq!(wrapped["error"]["line"], 42);
        assert!(wrapped["error"]["time"].is_string());
    }

    #[test]
    fn non_object_originals_are_wrapped_not_lost() {
        let wrapped = dead_payload(&json!("raw text"), "boom", "f.rs", 1);

        assert_eq!(wrapped["body"], "raw text");
        assert_eq!(wrapped["error"]["message"], "boom");
    }

    #[tokio::test]
    async fn failed_jobs_are_spooled_as_queue_message_entries() {
        let dir = std::env::temp_dir().join(format!("failed-jobs-{}", Uuid::new_v4()));
        let store = FailedJobStore::new(dir.clone());

        store
            .write("product.create", &json!({"method": "createProduct"}))
            .await;

        let mut entries = std::fs::read_dir(&dir).unwrap();
        let path = entries.next().unwrap().unwrap().path();
        let entry: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();

        assert_eq!(entry["queue"], "product.create");
        assert_eq!(entry["message"]["method"], "createProduct");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
