//! Durable subscriptions and high-availability failover for a data-grid
//! cache client.

pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod interest;
pub mod pool;
pub mod revival;
pub mod session;
pub mod transport;
pub mod types;

pub use client::{ClientStatus, DurableClient, SessionOutcome};
pub use config::{ClientConfig, PoolConfig};
pub use delivery::{EventRecorder, SubscriptionListener};
pub use error::{DurableError, TransportError};
pub use revival::{DisconnectCause, ReviveMode, SessionPhase};
pub use session::SessionIdentity;
pub use transport::{InMemoryGrid, Transport};
