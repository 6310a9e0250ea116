pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod negotiator;
pub mod transport;

pub use client::GatewayClient;
pub use config::{BackoffPolicy, ClientConfig};
pub use error::ClientError;
pub use identity::{derive_device_id, load_or_create_identity, DeviceIdentity};
pub use transport::{ConnectionStatus, SequenceGap};
