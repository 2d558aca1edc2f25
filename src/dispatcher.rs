// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Method Dispatch
//!
//! Inbound messages name a logical method; the [`DispatchTable`] maps that
//! name to a handler and an optional DTO schema. The table is built once at
//! startup and read-only afterwards. [`Dispatcher`] is the consuming side:
//! it registers consumers on every configured queue (all ten physical queues
//! of a sharded one) and pushes each delivery through the dispatch pipeline.
//!
//! Every failure inside dispatch is converted into a [`DispatchOutcome`] —
//! nothing thrown by a handler ever reaches the consumer loop.

use crate::{
    auth::Authenticator,
    config::AmqpConfig,
    consumer::consume,
    dto::Schema,
    envelope::RequestContext,
    errors::{AmqpError, FieldErrors},
    failure::FailureRouter,
    publisher::Publisher,
    shard,
};
use async_trait::async_trait;
use futures_util::{future::join_all, StreamExt};
use lapin::{options::BasicConsumeOptions, types::FieldTable, Channel};
use opentelemetry::global;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};
use tracing::error;
use uuid::Uuid;

/// Method dispatched when an inbound message names none.
pub const DEFAULT_METHOD: &str = "default";

/// A business-logic handler bound to one method name.
///
/// `params` is the validated DTO projection when the entry declares a schema,
/// or the raw parameter mapping otherwise. The returned value becomes the
/// dispatch result (and the RPC reply body, for reply-expecting messages).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Handler: Send + Sync {
    async fn exec(&self, ctx: &RequestContext, params: &Value) -> Result<Value, AmqpError>;
}

struct DispatchEntry {
    handler: Arc<dyn Handler>,
    schema: Option<Schema>,
}

/// Immutable method-name → handler mapping, loaded once at process start.
#[derive(Default)]
pub struct DispatchTable {
    entries: HashMap<String, DispatchEntry>,
}

/// Result of routing one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Handler ran, its return value passed through unchanged
    Ok(Value),
    /// DTO validation rejected the params, handler never ran
    InvalidParams(FieldErrors),
    /// No entry for the method name, handler never ran
    MethodNotFound(String),
    /// Handler (or dispatch itself) failed
    Failed(String),
}

impl DispatchOutcome {
    /// The body published back to an RPC caller: the result on success, a
    /// `{success: false, message}` shape on any failure. Reply-expecting
    /// callers always receive one of the two.
    pub fn reply_payload(&self) -> Value {
        match self {
            DispatchOutcome::Ok(value) => value.clone(),
            DispatchOutcome::InvalidParams(errors) => json!({
                "success": false,
                "message": errors,
            }),
            DispatchOutcome::MethodNotFound(name) => json!({
                "success": false,
                "message": format!("method `{name}` not found"),
            }),
            DispatchOutcome::Failed(message) => json!({
                "success": false,
                "message": message,
            }),
        }
    }
}

impl DispatchTable {
    pub fn new() -> DispatchTable {
        DispatchTable::default()
    }

    /// Registers a handler taking the raw parameter mapping.
    pub fn register(self, method: &str, handler: Arc<dyn Handler>) -> Self {
        self.insert(method, handler, None)
    }

    /// Registers a handler whose params are validated against `schema` first.
    pub fn register_with_schema(
        self,
        method: &str,
        handler: Arc<dyn Handler>,
        schema: Schema,
    ) -> Self {
        self.insert(method, handler, Some(schema))
    }

    fn insert(mut self, method: &str, handler: Arc<dyn Handler>, schema: Option<Schema>) -> Self {
        self.entries
            .insert(method.to_owned(), DispatchEntry { handler, schema });
        self
    }

    /// Routes one message: exact-name lookup, fail-fast validation, handler
    /// invocation. Handler errors are captured here, never propagated.
    pub async fn dispatch(
        &self,
        method: Option<&str>,
        params: &Value,
        ctx: &RequestContext,
    ) -> DispatchOutcome {
        let name = method.unwrap_or(DEFAULT_METHOD);

        let Some(entry) = self.entries.get(name) else {
            error!(method = name, "method not found");
            return DispatchOutcome::MethodNotFound(name.to_owned());
        };

        let params = match &entry.schema {
            Some(schema) => match schema.validate(params) {
                Ok(dto) => dto.only(),
                Err(errors) => return DispatchOutcome::InvalidParams(errors),
            },
            None => params.clone(),
        };

        match entry.handler.exec(ctx, &params).await {
            Ok(result) => DispatchOutcome::Ok(result),
            // Handlers doing their own deeper validation get the same routing
            // as a schema rejection.
            Err(AmqpError::ValidationError(errors)) => DispatchOutcome::InvalidParams(errors),
            Err(err) => {
                error!(method = name, error = err.to_string(), "handler failed");
                DispatchOutcome::Failed(err.to_string())
            }
        }
    }
}

/// The consuming side of the client.
///
/// Owns the shared primary channel and the collaborators every delivery
/// needs: the dispatch table, the reply publisher, the failure router and the
/// authenticator.
pub struct Dispatcher {
    channel: Arc<Channel>,
    table: Arc<DispatchTable>,
    publisher: Arc<Publisher>,
    failure: Arc<FailureRouter>,
    authenticator: Arc<Authenticator>,
    queues: Vec<(String, bool)>,
}

impl Dispatcher {
    pub fn new(
        channel: Arc<Channel>,
        cfg: &AmqpConfig,
        table: Arc<DispatchTable>,
        publisher: Arc<Publisher>,
        failure: Arc<FailureRouter>,
        authenticator: Arc<Authenticator>,
    ) -> Dispatcher {
        Dispatcher {
            channel,
            table,
            publisher,
            failure,
            authenticator,
            queues: cfg
                .queues
                .iter()
                .map(|q| (q.name.clone(), q.sharded))
                .collect(),
        }
    }

    /// Consumes from every configured queue until the broker goes away.
    ///
    /// A sharded logical queue gets one consumer per physical shard so any
    /// shard can be drained. Handlers run inline on the consumer task; an
    /// RPC call made from inside one uses its own dedicated connection and
    /// therefore cannot deadlock this loop.
    pub async fn consume_blocking(&self) -> Result<(), AmqpError> {
        let mut spawns = vec![];

        for (logical, sharded) in &self.queues {
            let physical_names = if *sharded {
                shard::shard_names(logical)
            } else {
                vec![logical.clone()]
            };

            for queue in physical_names {
                spawns.push(self.consume_queue(logical.clone(), queue).await?);
            }
        }

        let spawned = join_all(spawns).await;
        for res in spawned {
            if res.is_err() {
                error!("tokio process error");
                return Err(AmqpError::InternalError);
            }
        }

        Ok(())
    }

    async fn consume_queue(
        &self,
        logical: String,
        queue: String,
    ) -> Result<tokio::task::JoinHandle<()>, AmqpError> {
        let tag = format!("consumer_{}", Uuid::new_v4());

        let mut consumer = match self
            .channel
            .basic_consume(
                &queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(AmqpError::BindingConsumerError(tag))
            }
            Ok(c) => Ok(c),
        }?;

        let table = self.table.clone();
        let publisher = self.publisher.clone();
        let failure = self.failure.clone();
        let authenticator = self.authenticator.clone();

        Ok(tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        if let Err(err) = consume(
                            &global::tracer("amqp consumer"),
                            &delivery,
                            &logical,
                            &table,
                            &publisher,
                            &failure,
                            &authenticator,
                        )
                        .await
                        {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    }

                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::Rule;
    use mockall::predicate::eq;

    fn ctx() -> RequestContext {
        RequestContext::default()
    }

    #[tokio::test]
    async fn dispatch_passes_the_handler_result_through_unchanged() {
        let mut handler = MockHandler::new();
        handler
            .expect_exec()
            .returning(|_, params| Ok(params.clone()));

        let table = DispatchTable::new().register("echo", Arc::new(handler));
        let params = json!({"id": 7});

        let outcome = table.dispatch(Some("echo"), &params, &ctx()).await;

        assert_eq!(outcome, DispatchOutcome::Ok(params));
    }

    #[tokio::test]
    async fn unknown_method_never_invokes_any_handler() {
        let mut handler = MockHandler::new();
        handler.expect_exec().never();

        let table = DispatchTable::new().register("known", Arc::new(handler));

        let outcome = table.dispatch(Some("unknown"), &json!({}), &ctx()).await;

        assert_eq!(
            outcome,
            DispatchOutcome::MethodNotFound("unknown".to_owned())
        );
    }

    #[tokio::test]
    async fn missing_method_name_falls_back_to_the_default_entry() {
        let mut handler = MockHandler::new();
        handler.expect_exec().returning(|_, _| Ok(json!("handled")));

        let table = DispatchTable::new().register(DEFAULT_METHOD, Arc::new(handler));

        let outcome = table.dispatch(None, &json!({}), &ctx()).await;

        assert_eq!(outcome, DispatchOutcome::Ok(json!("handled")));
    }

    #[tokio::test]
    async fn validation_failure_is_fail_fast_and_skips_the_handler() {
        let mut handler = MockHandler::new();
        handler.expect_exec().never();

        let table = DispatchTable::new().register_with_schema(
            "createProduct",
            Arc::new(handler),
            Schema::new(vec![Rule::required("id").integer()]),
        );

        let outcome = table
            .dispatch(Some("createProduct"), &json!({"name": "A"}), &ctx())
            .await;

        let DispatchOutcome::InvalidParams(errors) = outcome else {
            panic!("expected InvalidParams, got {outcome:?}");
        };
        assert_eq!(errors["id"], vec!["the id field is required"]);
    }

    #[tokio::test]
    async fn handler_receives_the_validated_projection_not_the_raw_params() {
        let mut handler = MockHandler::new();
        handler
            .expect_exec()
            .with(mockall::predicate::always(), eq(json!({"id": 1, "name": "A"})))
            .returning(|_, _| Ok(json!(["created"])));

        let table = DispatchTable::new().register_with_schema(
            "createProduct",
            Arc::new(handler),
            Schema::new(vec![
                Rule::required("id").integer(),
                Rule::required("name").string(),
            ]),
        );

        let outcome = table
            .dispatch(
                Some("createProduct"),
                &json!({"id": 1, "name": "A", "extra": true}),
                &ctx(),
            )
            .await;

        assert_eq!(outcome, DispatchOutcome::Ok(json!(["created"])));
    }

    #[tokio::test]
    async fn handler_raised_validation_errors_route_like_schema_rejections() {
        let mut errors = FieldErrors::new();
        errors.insert("id".to_owned(), vec!["the id must exist".to_owned()]);

        let mut handler = MockHandler::new();
        let raised = errors.clone();
        handler
            .expect_exec()
            .returning(move |_, _| Err(AmqpError::ValidationError(raised.clone())));

        let table = DispatchTable::new().register("save", Arc::new(handler));

        let outcome = table.dispatch(Some("save"), &json!({}), &ctx()).await;

        assert_eq!(outcome, DispatchOutcome::InvalidParams(errors));
    }

    #[tokio::test]
    async fn handler_errors_are_captured_not_propagated() {
        let mut handler = MockHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Err(AmqpError::HandlerError("db unavailable".to_owned())));

        let table = DispatchTable::new().register("save", Arc::new(handler));

        let outcome = table.dispatch(Some("save"), &json!({}), &ctx()).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Failed("handler error: db unavailable".to_owned())
        );
    }

    #[test]
    fn reply_payload_shapes_follow_the_reply_policy() {
        let ok = DispatchOutcome::Ok(json!(["created"]));
        assert_eq!(ok.reply_payload(), json!(["created"]));

        let mut errors = FieldErrors::new();
        errors.insert("id".to_owned(), vec!["the id field is required".to_owned()]);
        let invalid = DispatchOutcome::InvalidParams(errors.clone());
        assert_eq!(
            invalid.reply_payload(),
            json!({"success": false, "message": {"id": ["the id field is required"]}})
        );

        let failed = DispatchOutcome::Failed("boom".to_owned());
        assert_eq!(
            failed.reply_payload(),
            json!({"success": false, "message": "boom"})
        );
    }
}
