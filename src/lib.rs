// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod auth;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod dto;
pub mod envelope;
pub mod errors;
pub mod failure;
pub mod publisher;
pub mod rpc;
pub mod serializer;
pub mod shard;
pub mod topology;
