//! Outbound side: where finished snapshots go.

pub mod mqtt;

pub use mqtt::MqttPublisher;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// QoS 0, fire and forget.
    AtMostOnce,
    /// QoS 0, kept by the broker as the topic's last value.
    Retained,
}

impl DeliveryMode {
    pub fn retain(self) -> bool {
        matches!(self, DeliveryMode::Retained)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("publish not accepted within {0:?}")]
    Timeout(Duration),

    #[error("client error: {0}")]
    Client(String),
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        mode: DeliveryMode,
    ) -> Result<(), PublishError>;
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        mode: DeliveryMode,
    ) -> Result<(), PublishError> {
        (**self).publish(topic, payload, mode).await
    }
}
