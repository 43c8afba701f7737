// Integration events
//
// Cross-module facts are published once and delivered at least once to every
// module that subscribed to their event type.

pub mod bus;
pub mod postgres;
pub mod store;

pub use bus::{backoff_delay, ConsumeError, EventBus, EventBusBuilder, EventConsumer};
pub use postgres::PgDeliveryStore;
pub use store::{Delivery, DeliveryStatus, DeliveryStore, InMemoryDeliveryStore, Module, Subscription};
