// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ RPC Client
//!
//! This module provides the error taxonomy for the crate. The `AmqpError` enum
//! covers broker-facing failures (connection, channel, declaration, publish,
//! ack) as well as the dispatch-side failures (unknown method, DTO validation,
//! handler errors) and the RPC timeout surfaced to callers.

use std::collections::BTreeMap;
use thiserror::Error;

/// Per-field validation messages produced when a DTO rejects its parameters.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants split into three groups: transport failures raised while talking
/// to the broker, configuration failures raised before any frame is sent, and
/// dispatch failures raised while routing an inbound message. Dispatch
/// failures are recoverable: the router converts them into failure-queue
/// publishes or RPC error replies instead of letting them escape the consumer
/// loop.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// No queue name could be resolved before a publish, or some other
    /// required configuration value is missing
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Validation rejected the inbound parameters
    #[error("validation failed")]
    ValidationError(FieldErrors),

    /// The business-logic handler returned an error
    #[error("handler error: {0}")]
    HandlerError(String),

    /// No correlated reply arrived within the configured deadline
    #[error("rpc call timed out")]
    RpcTimeout,
}
