// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Typed transport headers and the builder that stamps them onto outgoing
//! payloads. The recognized headers are fixed named fields; caller-supplied
//! business parameters never travel in the header table, only in the body.
//!
//! A message expects a response only when `reply_to` and `correlation_id` are
//! both present; [`Headers::reply_route`] enforces that pairing. A reply
//! echoes `correlation_id` alone.

use crate::{config::AmqpConfig, errors::AmqpError, serializer};
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
};
use serde::Serialize;
use std::collections::BTreeMap;

/// Header carrying the caller identity
pub const AMQP_HEADER_USER_NAME: &str = "user_name";
/// Header carrying the caller's preferred locale
pub const AMQP_HEADER_LANG: &str = "lang";
/// Header carrying the client device tag
pub const AMQP_HEADER_DEVICE: &str = "device";
/// Header naming the queue a reply must be published to
pub const AMQP_HEADER_REPLY_TO: &str = "reply_to";
/// Header carrying the token a reply must echo
pub const AMQP_HEADER_CORRELATION_ID: &str = "correlation_id";

/// The reply address of an RPC request: where to answer and which token to
/// echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRoute {
    pub reply_to: String,
    pub correlation_id: String,
}

/// The transport headers recognized on every message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    pub user_name: Option<String>,
    pub lang: Option<String>,
    pub device: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
}

impl Headers {
    /// The reply address, present only when `reply_to` and `correlation_id`
    /// arrived together. A message carrying one without the other is treated
    /// as one-way.
    pub fn reply_route(&self) -> Option<ReplyRoute> {
        match (&self.reply_to, &self.correlation_id) {
            (Some(reply_to), Some(correlation_id)) => Some(ReplyRoute {
                reply_to: reply_to.clone(),
                correlation_id: correlation_id.clone(),
            }),
            _ => None,
        }
    }

    /// Whether the sender expects a response on a reply queue.
    pub fn expects_reply(&self) -> bool {
        self.reply_route().is_some()
    }

    /// Renders the headers into the table published with the message.
    pub(crate) fn fill(&self, table: &mut BTreeMap<ShortString, AMQPValue>) {
        let mut put = |key: &str, value: &Option<String>| {
            if let Some(value) = value {
                table.insert(
                    ShortString::from(key),
                    AMQPValue::LongString(value.as_str().into()),
                );
            }
        };

        put(AMQP_HEADER_USER_NAME, &self.user_name);
        put(AMQP_HEADER_LANG, &self.lang);
        put(AMQP_HEADER_DEVICE, &self.device);
        put(AMQP_HEADER_REPLY_TO, &self.reply_to);
        put(AMQP_HEADER_CORRELATION_ID, &self.correlation_id);
    }

    /// Reads the recognized headers from inbound message properties. Unknown
    /// headers are ignored.
    pub fn from_properties(props: &AMQPProperties) -> Headers {
        let table = match props.headers() {
            Some(val) => val.to_owned(),
            None => FieldTable::default(),
        };

        Headers {
            user_name: header_string(&table, AMQP_HEADER_USER_NAME),
            lang: header_string(&table, AMQP_HEADER_LANG),
            device: header_string(&table, AMQP_HEADER_DEVICE),
            reply_to: header_string(&table, AMQP_HEADER_REPLY_TO),
            correlation_id: header_string(&table, AMQP_HEADER_CORRELATION_ID),
        }
    }
}

fn header_string(table: &FieldTable, key: &str) -> Option<String> {
    match table.inner().get(key) {
        Some(AMQPValue::LongString(v)) => {
            Some(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        Some(AMQPValue::ShortString(v)) => Some(v.to_string()),
        _ => None,
    }
}

/// Explicit per-message context: who is calling, from where. Passed into the
/// envelope builder and the dispatch path instead of any ambient state.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user_name: String,
    pub lang: Option<String>,
    pub device: Option<String>,
}

impl RequestContext {
    /// Context reconstructed from inbound headers, for use while handling
    /// that message.
    pub fn from_headers(headers: &Headers) -> RequestContext {
        RequestContext {
            user_name: headers.user_name.clone().unwrap_or_default(),
            lang: headers.lang.clone(),
            device: headers.device.clone(),
        }
    }
}

/// An outgoing message: encoded body plus stamped transport headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub headers: Headers,
}

/// Builds envelopes, stamping identity, locale and device on every message.
///
/// The identity may be empty; locale and device fall back to the configured
/// process defaults when the request context carries none. RPC requests
/// additionally get the pending call's [`ReplyRoute`] — generating that route
/// (correlation id + exclusive reply queue) happens once per call in the
/// correlator, so repeated builds within one call reuse the same route.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    user_name: String,
    default_lang: String,
    default_device: String,
}

impl EnvelopeBuilder {
    pub fn new(cfg: &AmqpConfig) -> EnvelopeBuilder {
        EnvelopeBuilder {
            user_name: cfg.user_name.clone(),
            default_lang: cfg.default_lang.clone(),
            default_device: cfg.default_device.clone(),
        }
    }

    /// Builds a one-way envelope.
    pub fn build<T: Serialize>(
        &self,
        payload: &T,
        ctx: &RequestContext,
    ) -> Result<Envelope, AmqpError> {
        self.assemble(payload, ctx, None, None)
    }

    /// Builds an RPC request envelope carrying the pending call's reply route.
    pub fn build_rpc<T: Serialize>(
        &self,
        payload: &T,
        ctx: &RequestContext,
        reply: &ReplyRoute,
    ) -> Result<Envelope, AmqpError> {
        self.assemble(
            payload,
            ctx,
            Some(reply.reply_to.clone()),
            Some(reply.correlation_id.clone()),
        )
    }

    /// Builds a reply envelope echoing the request's correlation id.
    pub fn build_reply<T: Serialize>(
        &self,
        payload: &T,
        ctx: &RequestContext,
        correlation_id: &str,
    ) -> Result<Envelope, AmqpError> {
        self.assemble(payload, ctx, None, Some(correlation_id.to_owned()))
    }

    fn assemble<T: Serialize>(
        &self,
        payload: &T,
        ctx: &RequestContext,
        reply_to: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<Envelope, AmqpError> {
        let body = serializer::encode(payload)?;

        Ok(Envelope {
            body,
            headers: Headers {
                user_name: Some(self.identity(ctx)),
                lang: Some(
                    ctx.lang
                        .clone()
                        .unwrap_or_else(|| self.default_lang.clone()),
                ),
                device: Some(
                    ctx.device
                        .clone()
                        .unwrap_or_else(|| self.default_device.clone()),
                ),
                reply_to,
                correlation_id,
            },
        })
    }

    fn identity(&self, ctx: &RequestContext) -> String {
        if ctx.user_name.is_empty() {
            self.user_name.clone()
        } else {
            ctx.user_name.clone()
        }
    }
}
