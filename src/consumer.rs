// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Per-delivery pipeline: decode the body, read the typed headers, establish
//! the caller identity, dispatch by method name, then apply the reply policy.
//! A message that carried a reply route always gets an answer — result or
//! failure shape; a one-way message that failed is handed to the failure
//! router. Nothing in here breaks the consumer loop.

use crate::{
    auth::Authenticator,
    dispatcher::{DispatchOutcome, DispatchTable, DEFAULT_METHOD},
    envelope::{Headers, ReplyRoute, RequestContext},
    errors::{AmqpError, FieldErrors},
    failure::FailureRouter,
    otel,
    publisher::Publisher,
    serializer,
};
use lapin::{message::Delivery, options::BasicAckOptions};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use serde_json::{json, Value};
use std::borrow::Cow;
use tracing::{debug, error};

/// Consumes and processes one delivery.
///
/// The trace span is opened from the propagated upstream context and named
/// after the dispatched method. The delivery is acked on every path once the
/// outcome has been routed; failures during routing are already absorbed by
/// the failure router.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    logical_queue: &str,
    table: &DispatchTable,
    publisher: &Publisher,
    failure: &FailureRouter,
    authenticator: &Authenticator,
) -> Result<(), AmqpError> {
    let (method, params, original) = decode_envelope(&delivery.data);

    let (ctx, mut span) = otel::new_span(
        &delivery.properties,
        tracer,
        method.as_deref().unwrap_or(DEFAULT_METHOD),
    );

    let headers = Headers::from_properties(&delivery.properties);
    debug!(
        method = method.as_deref().unwrap_or_default(),
        queue = logical_queue,
        "received message"
    );

    let mut request = RequestContext::from_headers(&headers);
    if let Some(identity) = authenticator.authenticate(&request.user_name).await {
        request.user_name = identity.name;
    }

    let outcome = table.dispatch(method.as_deref(), &params, &request).await;

    match route_outcome(&headers, &outcome) {
        // RPC caller: always answer, success or failure. A reply that cannot
        // be built or published is logged and recorded on the span; the
        // delivery is still acked below rather than left in limbo.
        Routing::Reply(route) => {
            let built = publisher.envelope_builder().build_reply(
                &outcome.reply_payload(),
                &RequestContext::default(),
                &route.correlation_id,
            );

            match built {
                Ok(reply) => {
                    if let Err(err) = publisher
                        .publish_envelope(&ctx, &route.reply_to, &reply)
                        .await
                    {
                        error!(error = err.to_string(), "error publishing rpc reply");
                        span.record_error(&err);
                        span.set_status(Status::Error {
                            description: Cow::from("error publishing rpc reply"),
                        });
                    }
                }
                Err(err) => {
                    error!(error = err.to_string(), "reply payload not serializable");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("reply payload not serializable"),
                    });
                }
            }
        }

        // One-way caller: failures are observable only on the failure queues.
        Routing::Ack => {}
        Routing::Invalid(errors) => {
            failure
                .route_invalid(&ctx, logical_queue, &original, &errors)
                .await;
        }
        Routing::Dead(message) => {
            failure
                .route_dead(&ctx, logical_queue, &original, &message)
                .await;
        }
    }

    match delivery.ack(BasicAckOptions { multiple: false }).await {
        Err(e) => {
            error!("error whiling ack msg");
            span.record_error(&e);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(AmqpError::AckMessageError)
        }
        _ => {
            span.set_status(Status::Ok);
            Ok(())
        }
    }
}

/// Where one processed delivery goes next.
#[derive(Debug, PartialEq)]
enum Routing {
    /// Answer the caller on its reply queue, success or failure
    Reply(ReplyRoute),
    /// One-way success, nothing to forward
    Ack,
    /// One-way validation failure, forward to the invalid-letter queue
    Invalid(FieldErrors),
    /// One-way handler/dispatch failure, forward to the dead-letter queue
    Dead(String),
}

/// The reply policy. A delivery carrying the full reply route is always
/// answered, whatever the outcome; without it, failures split between the
/// two failure queues and successes are simply acked.
fn route_outcome(headers: &Headers, outcome: &DispatchOutcome) -> Routing {
    if let Some(route) = headers.reply_route() {
        return Routing::Reply(route);
    }

    match outcome {
        DispatchOutcome::Ok(_) => Routing::Ack,
        DispatchOutcome::InvalidParams(errors) => Routing::Invalid(errors.clone()),
        DispatchOutcome::MethodNotFound(name) => {
            Routing::Dead(format!("method `{name}` not found"))
        }
        DispatchOutcome::Failed(message) => Routing::Dead(message.clone()),
    }
}

/// Splits an inbound body into its method name, params and original payload.
///
/// Bodies that are not a JSON object dispatch to the default method with
/// empty params, mirroring how absent keys behave. A `method` key that is
/// present but not a string is kept as its JSON rendering, so the table
/// lookup misses it instead of falling back to the default handler.
fn decode_envelope(body: &[u8]) -> (Option<String>, Value, Value) {
    let original = serializer::decode(body).into_value();

    let method = match original.get("method") {
        None | Some(Value::Null) => None,
        Some(Value::String(name)) => Some(name.clone()),
        Some(other) => Some(other.to_string()),
    };

    let params = match original.get("params") {
        Some(params) if !params.is_null() => params.clone(),
        _ => json!({}),
    };

    (method, params, original)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::Payload;

    #[test]
    fn envelope_with_method_and_params_is_split() {
        let body = br#"{"method":"createProduct","params":{"id":1,"name":"A"}}"#;

        let (method, params, original) = decode_envelope(body);

        assert_eq!(method.as_deref(), Some("createProduct"));
        assert_eq!(params, json!({"id": 1, "name": "A"}));
        assert_eq!(original["method"], "createProduct");
    }

    #[test]
    fn missing_keys_fall_back_to_default_method_and_empty_params() {
        let (method, params, _) = decode_envelope(br#"{"something":"else"}"#);

        assert!(method.is_none());
        assert_eq!(params, json!({}));
    }

    #[test]
    fn raw_bodies_keep_their_text_as_the_original_payload() {
        let (method, params, original) = decode_envelope(b"plain ping");

        assert!(method.is_none());
        assert_eq!(params, json!({}));
        assert_eq!(original, json!("plain ping"));
    }

    #[test]
    fn null_params_count_as_empty() {
        let (_, params, _) = decode_envelope(br#"{"method":"x","params":null}"#);

        assert_eq!(params, json!({}));
    }

    #[test]
    fn payload_decode_reaches_the_consumer_unaltered() {
        let value = json!({"method": "m", "params": {"k": [1, 2, 3]}});
        let body = serde_json::to_vec(&value).unwrap();

        assert_eq!(serializer::decode(&body), Payload::Json(value));
    }

    #[test]
    fn non_string_method_misses_the_table_instead_of_falling_back() {
        let (method, params, _) = decode_envelope(br#"{"method":123,"params":{}}"#);

        assert_eq!(method.as_deref(), Some("123"));
        assert_eq!(params, json!({}));
    }

    fn reply_headers() -> Headers {
        Headers {
            reply_to: Some("amq.gen-reply".to_owned()),
            correlation_id: Some("corr_1".to_owned()),
            ..Headers::default()
        }
    }

    fn field_errors() -> FieldErrors {
        let mut errors = FieldErrors::new();
        errors.insert("id".to_owned(), vec!["the id field is required".to_owned()]);
        errors
    }

    #[test]
    fn reply_expecting_deliveries_are_always_answered() {
        let headers = reply_headers();
        let route = headers.reply_route().unwrap();

        let outcomes = [
            DispatchOutcome::Ok(json!(["created"])),
            DispatchOutcome::InvalidParams(field_errors()),
            DispatchOutcome::MethodNotFound("ghost".to_owned()),
            DispatchOutcome::Failed("boom".to_owned()),
        ];

        for outcome in &outcomes {
            assert_eq!(route_outcome(&headers, outcome), Routing::Reply(route.clone()));
        }
    }

    #[test]
    fn one_way_outcomes_split_between_ack_and_the_failure_queues() {
        let headers = Headers::default();

        assert_eq!(
            route_outcome(&headers, &DispatchOutcome::Ok(json!(["created"]))),
            Routing::Ack
        );
        assert_eq!(
            route_outcome(&headers, &DispatchOutcome::InvalidParams(field_errors())),
            Routing::Invalid(field_errors())
        );
        assert_eq!(
            route_outcome(&headers, &DispatchOutcome::MethodNotFound("ghost".to_owned())),
            Routing::Dead("method `ghost` not found".to_owned())
        );
        assert_eq!(
            route_outcome(&headers, &DispatchOutcome::Failed("boom".to_owned())),
            Routing::Dead("boom".to_owned())
        );
    }

    #[test]
    fn unpaired_reply_headers_route_like_one_way_deliveries() {
        let headers = Headers {
            reply_to: Some("amq.gen-reply".to_owned()),
            ..Headers::default()
        };

        assert_eq!(
            route_outcome(&headers, &DispatchOutcome::Failed("boom".to_owned())),
            Routing::Dead("boom".to_owned())
        );
    }
}
