mod endpoint;
mod event;
mod interest;
mod protocol;

pub use endpoint::{EndpointRole, EndpointStatus};
pub use event::{DeliveredEvent, DeliveryKind, EventOperation, RawEvent};
pub use interest::{InterestEntry, InterestPattern};
pub use protocol::{ClientMessage, ServerMessage};
