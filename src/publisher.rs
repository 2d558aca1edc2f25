// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Fire-and-forget publishing on the shared primary channel. Every publish
//! goes through the envelope builder, so identity/locale/device headers and
//! the OpenTelemetry trace context are stamped uniformly; the queue naming
//! strategy picks the physical (possibly sharded) target queue.

use crate::{
    config::AmqpConfig,
    envelope::{Envelope, EnvelopeBuilder, RequestContext},
    errors::AmqpError,
    otel, shard,
};
use lapin::{
    options::BasicPublishOptions,
    types::{FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::error;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Publisher over the shared primary channel.
///
/// One instance is reused for all non-RPC publishes — application messages,
/// RPC replies and failure routing — to keep the process on a single
/// connection/channel pair.
pub struct Publisher {
    channel: Arc<Channel>,
    builder: EnvelopeBuilder,
    default_queue: Option<String>,
    sharded: HashMap<String, bool>,
}

impl Publisher {
    pub fn new(channel: Arc<Channel>, cfg: &AmqpConfig) -> Arc<Publisher> {
        let sharded = cfg
            .queues
            .iter()
            .map(|q| (q.name.clone(), q.sharded))
            .collect();

        Arc::new(Publisher {
            channel,
            builder: EnvelopeBuilder::new(cfg),
            default_queue: cfg.default_queue.clone(),
            sharded,
        })
    }

    /// Publishes a one-way message to a logical queue.
    ///
    /// Falls back to the configured default queue when `queue` is `None` and
    /// fails with a `ConfigurationError` when neither exists. Sharded queues
    /// are resolved to their current physical shard.
    pub async fn publish<T: Serialize>(
        &self,
        ctx: &Context,
        queue: Option<&str>,
        payload: &T,
        request: &RequestContext,
    ) -> Result<(), AmqpError> {
        let logical = shard::resolve(queue, self.default_queue.as_deref())?;
        let physical = shard::physical_name(
            &logical,
            self.sharded.get(&logical).copied().unwrap_or(false),
        );

        let envelope = self.builder.build(payload, request)?;
        self.publish_envelope(ctx, &physical, &envelope).await
    }

    /// Publishes a prebuilt envelope to a physical queue on the default
    /// exchange. Used directly by the reply path and the failure router.
    pub(crate) async fn publish_envelope(
        &self,
        ctx: &Context,
        physical_queue: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        publish_raw(&self.channel, ctx, physical_queue, envelope).await
    }

    pub(crate) fn envelope_builder(&self) -> &EnvelopeBuilder {
        &self.builder
    }
}

/// Publishes an envelope to a physical queue on the default exchange of the
/// given channel. Shared by the primary publisher and the RPC correlator's
/// dedicated channel.
pub(crate) async fn publish_raw(
    channel: &Channel,
    ctx: &Context,
    physical_queue: &str,
    envelope: &Envelope,
) -> Result<(), AmqpError> {
    let mut table = BTreeMap::default();
    otel::inject(ctx, &mut table);
    envelope.headers.fill(&mut table);

    match channel
        .basic_publish(
            "",
            physical_queue,
            BasicPublishOptions {
                immediate: false,
                mandatory: false,
            },
            &envelope.body,
            BasicProperties::default()
                .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
                .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                .with_headers(FieldTable::from(table)),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = physical_queue,
                "error publishing message"
            );
            Err(AmqpError::PublishingError)
        }
        _ => Ok(()),
    }
}
