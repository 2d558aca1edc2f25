// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares everything the process consumes from or fails into, once, at
//! startup on the primary channel: the registered application queues (all
//! ten physical queues of a sharded one), the dead-letter and invalid-letter
//! queues when configured, and the channel QoS. Publishing later targets only
//! queues declared here — sharding would otherwise leave nine of ten shards
//! undeclared until their first unlucky publish.

use crate::{
    config::{AmqpConfig, QueueConfig},
    errors::AmqpError,
    shard,
};
use lapin::{
    options::{BasicQosOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Installs the queue topology and QoS for one process.
pub struct AmqpTopology {
    channel: Arc<Channel>,
    queues: Vec<QueueConfig>,
    failure_queues: Vec<String>,
    qos: crate::config::QosConfig,
}

impl AmqpTopology {
    pub fn new(channel: Arc<Channel>, cfg: &AmqpConfig) -> AmqpTopology {
        let failure_queues = [&cfg.dead_letter_queue, &cfg.invalid_letter_queue]
            .into_iter()
            .flatten()
            .cloned()
            .collect();

        AmqpTopology {
            channel,
            queues: cfg.queues.clone(),
            failure_queues,
            qos: cfg.qos.clone(),
        }
    }

    /// Declares all queues and applies QoS.
    pub async fn install(&self) -> Result<(), AmqpError> {
        self.install_queues().await?;
        self.install_failure_queues().await?;
        self.install_qos().await
    }

    async fn install_queues(&self) -> Result<(), AmqpError> {
        for queue in &self.queues {
            let physical_names = if queue.sharded {
                shard::shard_names(&queue.name)
            } else {
                vec![queue.name.clone()]
            };

            for name in physical_names {
                self.declare(&name).await?;
            }
        }

        Ok(())
    }

    async fn install_failure_queues(&self) -> Result<(), AmqpError> {
        for name in &self.failure_queues {
            self.declare(name).await?;
        }

        Ok(())
    }

    async fn declare(&self, name: &str) -> Result<(), AmqpError> {
        debug!("creating queue: {}", name);

        match self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => {
                debug!("queue: {} was created", name);
                Ok(())
            }
        }
    }

    async fn install_qos(&self) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_qos(
                self.qos.prefetch_count,
                BasicQosOptions {
                    global: self.qos.global,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}
