// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Naming Strategy
//!
//! Maps a logical queue name to the physical queue targeted by a publish.
//! Sharded queues fan one logical name out over ten physical queues; the
//! shard is picked from the current time, not from message content, as a
//! cheap approximation of round-robin. Calls inside the same millisecond
//! bucket land on the same shard.

use crate::errors::AmqpError;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of physical queues backing one sharded logical queue.
pub const SHARD_COUNT: u64 = 10;

/// Computes the physical queue name for a logical queue.
///
/// Unsharded queues map to themselves. Sharded queues get a `_d` suffix where
/// `d` is the last decimal digit of the current Unix time in milliseconds.
pub fn physical_name(logical: &str, sharded: bool) -> String {
    if !sharded {
        return logical.to_owned();
    }

    format!("{}_{}", logical, shard_digit(now_millis()))
}

/// All physical names a sharded logical queue expands to, for declaration.
pub fn shard_names(logical: &str) -> Vec<String> {
    (0..SHARD_COUNT).map(|d| format!("{logical}_{d}")).collect()
}

/// Resolves the target queue of a publish: the explicit name when given,
/// otherwise the configured default.
pub fn resolve(queue: Option<&str>, default: Option<&str>) -> Result<String, AmqpError> {
    match queue.filter(|q| !q.is_empty()).or(default) {
        Some(name) if !name.is_empty() => Ok(name.to_owned()),
        _ => Err(AmqpError::ConfigurationError(
            "default queue or queue is not defined".to_owned(),
        )),
    }
}

fn shard_digit(now_millis: u128) -> u64 {
    (now_millis % SHARD_COUNT as u128) as u64
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
