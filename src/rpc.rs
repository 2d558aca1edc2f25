// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Correlator
//!
//! Synchronous-looking request/reply over the broker. Each call runs on its
//! own [`PendingCall`]: a dedicated connection+channel pair, an exclusive
//! server-named reply queue and a fresh correlation id, all created when the
//! call starts and torn down unconditionally when it ends. Waiting for the
//! reply therefore cannot deadlock against the primary consumer, and two
//! concurrent calls share no mutable state.
//!
//! A call moves through `IDLE → PUBLISHED → WAITING → (MATCHED | TIMED_OUT)
//! → CLOSED`. Only a reply echoing this call's correlation id completes it;
//! anything else on the reply queue is ignored and dies with the queue.

use crate::{
    channel::RpcChannel,
    config::AmqpConfig,
    envelope::{EnvelopeBuilder, Headers, ReplyRoute, RequestContext},
    errors::AmqpError,
    publisher::publish_raw,
    serializer, shard,
};
use futures_util::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicRecoverOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use opentelemetry::Context;
use serde::Serialize;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// One in-flight RPC call: the dedicated pair plus its reply route.
///
/// The route is generated exactly once, when the call opens; every envelope
/// built for this call reuses the same correlation id and reply queue.
pub struct PendingCall {
    channel: RpcChannel,
    route: ReplyRoute,
}

impl PendingCall {
    /// Opens the dedicated pair and declares the exclusive anonymous reply
    /// queue on it. The broker names the queue; it disappears when the
    /// dedicated connection closes.
    pub(crate) async fn open(cfg: &AmqpConfig) -> Result<PendingCall, AmqpError> {
        let channel = RpcChannel::open(cfg).await?;

        let queue = match channel
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    passive: false,
                    durable: false,
                    exclusive: true,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(queue) => queue,
            Err(err) => {
                error!(error = err.to_string(), "failure to declare reply queue");
                channel.close().await;
                return Err(AmqpError::DeclareQueueError("reply queue".to_owned()));
            }
        };

        Ok(PendingCall {
            channel,
            route: ReplyRoute {
                reply_to: queue.name().as_str().to_owned(),
                correlation_id: format!("corr_{}", Uuid::new_v4()),
            },
        })
    }

    pub fn route(&self) -> &ReplyRoute {
        &self.route
    }

    async fn close(self) {
        self.channel.close().await;
    }
}

/// Whether an inbound reply completes the call with this route.
fn matches(route: &ReplyRoute, headers: &Headers) -> bool {
    headers.correlation_id.as_deref() == Some(route.correlation_id.as_str())
}

/// RPC caller: publishes a request and blocks until the correlated reply
/// arrives or the deadline expires.
pub struct RpcClient {
    cfg: AmqpConfig,
    builder: EnvelopeBuilder,
    sharded: HashMap<String, bool>,
    /// Recovered defensively after a timeout; absent for pure callers that
    /// consume nothing.
    primary: Option<Arc<Channel>>,
}

impl RpcClient {
    pub fn new(cfg: &AmqpConfig) -> RpcClient {
        RpcClient {
            cfg: cfg.clone(),
            builder: EnvelopeBuilder::new(cfg),
            sharded: cfg
                .queues
                .iter()
                .map(|q| (q.name.clone(), q.sharded))
                .collect(),
            primary: None,
        }
    }

    /// Attaches the shared primary channel so a timed-out call can requeue
    /// its unacked deliveries.
    pub fn with_primary_channel(mut self, channel: Arc<Channel>) -> Self {
        self.primary = Some(channel);
        self
    }

    /// Performs one RPC round trip against `queue` (or the configured
    /// default). Returns the decoded reply body, or `RpcTimeout` when no
    /// correlated reply arrives within the configured deadline. The dedicated
    /// connection and channel are closed on every exit path.
    pub async fn request<T: Serialize>(
        &self,
        ctx: &Context,
        queue: Option<&str>,
        payload: &T,
        request: &RequestContext,
    ) -> Result<Value, AmqpError> {
        let logical = shard::resolve(queue, self.cfg.default_queue.as_deref())?;
        let physical = shard::physical_name(
            &logical,
            self.sharded.get(&logical).copied().unwrap_or(false),
        );

        let call = PendingCall::open(&self.cfg).await?;
        debug!(
            queue = physical,
            correlation_id = call.route.correlation_id,
            "rpc call opened"
        );

        let result = self.run(ctx, &physical, payload, request, &call).await;

        // CLOSED: torn down whether the call matched or timed out.
        call.close().await;

        if matches!(result, Err(AmqpError::RpcTimeout)) {
            self.recover_primary().await;
        }

        result
    }

    async fn run<T: Serialize>(
        &self,
        ctx: &Context,
        physical_queue: &str,
        payload: &T,
        request: &RequestContext,
        call: &PendingCall,
    ) -> Result<Value, AmqpError> {
        // IDLE -> PUBLISHED
        let envelope = self.builder.build_rpc(payload, request, &call.route)?;
        publish_raw(&call.channel.channel, ctx, physical_queue, &envelope).await?;

        // PUBLISHED -> WAITING
        let tag = format!("consumer_{}", Uuid::new_v4());
        let mut consumer = match call
            .channel
            .channel
            .basic_consume(
                &call.route.reply_to,
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
            Ok(consumer) => consumer,
            Err(err) => {
                error!(error = err.to_string(), "failure to consume reply queue");
                return Err(AmqpError::BindingConsumerError(tag));
            }
        };

        let deadline = Instant::now() + self.cfg.rpc_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::ZERO {
                // WAITING -> TIMED_OUT
                warn!(
                    correlation_id = call.route.correlation_id,
                    "no correlated reply before deadline"
                );
                return Err(AmqpError::RpcTimeout);
            }

            match timeout(remaining, consumer.next()).await {
                Ok(Some(Ok(delivery))) => {
                    let headers = Headers::from_properties(&delivery.properties);
                    if !matches(&call.route, &headers) {
                        // Stray reply: leave it unacked, the exclusive queue
                        // dies with the connection anyway.
                        debug!(
                            correlation_id = headers.correlation_id.as_deref().unwrap_or_default(),
                            "ignoring reply with foreign correlation id"
                        );
                        continue;
                    }

                    // WAITING -> MATCHED
                    let result = serializer::decode(&delivery.data).into_value();
                    if let Err(err) = delivery.ack(BasicAckOptions { multiple: false }).await {
                        error!(error = err.to_string(), "error whiling ack reply");
                        return Err(AmqpError::AckMessageError);
                    }
                    return Ok(result);
                }
                Ok(Some(Err(err))) => {
                    error!(error = err.to_string(), "errors consume reply");
                    return Err(AmqpError::ConsumerError(err.to_string()));
                }
                Ok(None) => {
                    return Err(AmqpError::ConsumerError(
                        "reply stream closed".to_owned(),
                    ));
                }
                // WAITING -> TIMED_OUT
                Err(_) => {
                    warn!(
                        correlation_id = call.route.correlation_id,
                        "no correlated reply before deadline"
                    );
                    return Err(AmqpError::RpcTimeout);
                }
            }
        }
    }

    /// A stuck peer may have left unacked deliveries on the primary channel;
    /// requeue them so the consumer starts from a clean state.
    async fn recover_primary(&self) {
        let Some(primary) = &self.primary else {
            return;
        };

        if let Err(err) = primary
            .basic_recover(BasicRecoverOptions { requeue: true })
            .await
        {
            error!(error = err.to_string(), "failure to recover primary channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> ReplyRoute {
        ReplyRoute {
            reply_to: "amq.gen-reply".to_owned(),
            correlation_id: "corr_abc".to_owned(),
        }
    }

    #[test]
    fn reply_with_matching_correlation_id_completes_the_call() {
        let headers = Headers {
            correlation_id: Some("corr_abc".to_owned()),
            ..Headers::default()
        };

        assert!(matches(&route(), &headers));
    }

    #[test]
    fn foreign_or_missing_correlation_id_is_ignored() {
        let foreign = Headers {
            correlation_id: Some("corr_xyz".to_owned()),
            ..Headers::default()
        };
        assert!(!matches(&route(), &foreign));

        assert!(!matches(&route(), &Headers::default()));
    }

    #[tokio::test]
    async fn request_without_any_queue_fails_before_opening_a_connection() {
        let client = RpcClient::new(&AmqpConfig::default());

        let err = client
            .request(
                &Context::new(),
                None,
                &serde_json::json!({"method": "ping"}),
                &RequestContext::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }

    #[test]
    fn each_call_route_is_unique() {
        // Correlation ids are uuid-backed; the prefix is fixed, the token is not.
        let a = format!("corr_{}", Uuid::new_v4());
        let b = format!("corr_{}", Uuid::new_v4());

        assert_ne!(a, b);
        assert!(a.starts_with("corr_"));
    }
}
