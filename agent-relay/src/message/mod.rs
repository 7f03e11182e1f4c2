//! Message envelope: the durable record of a single exchange.

mod envelope;

pub use envelope::{
    Envelope, InvalidRecipient, MessageKind, MessageStatus, Recipient,
};
