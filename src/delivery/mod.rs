pub mod broker;
pub mod pipeline;

pub use broker::{BrokerEvent, BrokerTransport, MessageId, MqttBroker};
pub use pipeline::{DeliveryConfig, DeliveryPipeline};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("not connected to the broker")]
    NotConnected,
    #[error("broker client rejected the request: {0}")]
    Rejected(String),
    #[error("invalid broker url: {0}")]
    InvalidUrl(String),
}
