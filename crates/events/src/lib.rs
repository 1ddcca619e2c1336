//! Process-wide typed pub/sub.
//!
//! The bus decouples event producers (agent runtime, channel manager) from
//! consumers (gateway broadcast, file auto-send). Listeners are normalized
//! to async at registration time and invoked inside a fault boundary, so a
//! misbehaving listener never blocks delivery to the others.

mod bus;
mod event;

pub use bus::{BusStats, EventBus, SubscriptionId};
pub use event::{Event, EventKind};
