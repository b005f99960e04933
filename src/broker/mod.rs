pub mod management;
pub mod memory;
pub mod traits;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use management::{ManagementClient, ManagementConfig};
pub use memory::InMemoryBroker;
pub use traits::{
    BrokerConnection, BrokerConnector, Confirmation, Delivery, FlowEvent, Publisher,
    QueueDepthSource, QueueInfo, Subscription,
};

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
