//! Inter-broker fan-out bus.
//!
//! A broker may attach a [`PubSubProvider`] to mirror publishes, metrics
//! queries and forced disconnects across a fleet. The provider owns two
//! logical legs (a publisher and a subscriber) so one node can both send
//! and receive; messages published while disconnected are queued and
//! flushed in order on reconnect, and subscriptions survive reconnects.
//!
//! The concrete transport (a Redis-style service, typically) lives behind
//! the trait; [`memory::MemoryProvider`] is the in-process implementation
//! used for single-node setups and tests.

mod envelope;
mod error;
pub mod memory;
mod provider;

pub use {
    envelope::{Envelope, EnvelopeKind},
    error::{Error, Result},
    provider::{EnvelopeHandler, HandlerRegistry, PubSubProvider},
};
