// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation and management of AMQP connections and
//! channels. The primary connection+channel pair lives for the whole process
//! and is shared by every consumer-side publish; a [`RpcChannel`] is a
//! second, fully independent pair opened for the duration of a single RPC
//! round trip so that waiting for a reply can never deadlock against the
//! primary consumer's own wait loop.

use crate::{config::AmqpConfig, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Creates the primary AMQP connection and channel.
///
/// The connection is established from the parts in `cfg` and advertised to
/// the broker under the configured application name. Both the connection and
/// channel are wrapped in `Arc` for sharing across tasks; callers must reuse
/// them rather than reopening per publish.
pub async fn new_amqp_channel(
    cfg: &AmqpConfig,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    let (conn, channel) = connect(cfg).await?;
    Ok((Arc::new(conn), Arc::new(channel)))
}

/// A dedicated connection+channel pair for one RPC round trip.
///
/// Opened at the start of a `request` and closed unconditionally when the
/// matching reply arrives or the wait times out. Closing the connection also
/// deletes the exclusive reply queue declared on it.
pub struct RpcChannel {
    connection: Connection,
    pub(crate) channel: Channel,
}

impl RpcChannel {
    /// Opens the dedicated pair.
    pub async fn open(cfg: &AmqpConfig) -> Result<RpcChannel, AmqpError> {
        let (connection, channel) = connect(cfg).await?;
        Ok(RpcChannel {
            connection,
            channel,
        })
    }

    /// Closes channel and connection, ignoring failures on an already-dead
    /// pair. Must be called on every exit path of a pending call.
    pub async fn close(self) {
        if let Err(err) = self.channel.close(200, "rpc call finished").await {
            debug!(error = err.to_string(), "rpc channel already closed");
        }
        if let Err(err) = self.connection.close(200, "rpc call finished").await {
            debug!(error = err.to_string(), "rpc connection already closed");
        }
    }
}

async fn connect(cfg: &AmqpConfig) -> Result<(Connection, Channel), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match Connection::connect(&cfg.amqp_uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((conn, c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}
