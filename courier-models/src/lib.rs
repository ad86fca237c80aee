pub mod errors;
pub mod message;
pub mod naming;
pub mod outcome;
pub mod units;

pub use message::{Message, MessageBody, MessageError, MessageParts, MAX_PRIORITY};
pub use naming::{EventType, NamingConvention, NotificationPriority};
pub use outcome::{
    AckDecision, BatchReport, BrokerMetadata, ConnectionReport, ConnectionStatus,
    DeliveryOutcome, MalformedMessage, ReceivedMessage,
};
pub use units::{AddressableUnit, ExchangeKind, QueueBinding, TopicSpec};
