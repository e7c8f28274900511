//! The channel family: named multicast groups scoped to one application.
//!
//! A channel's behavior is selected by its name prefix (see [`ChannelKind`]):
//! private-family channels gate subscription behind an HMAC signature,
//! presence-family channels track distinct users and gossip join/leave
//! events, and cache-family channels replay the last externally broadcast
//! payload to new subscribers.

pub mod auth;
mod channel;
mod connection;
mod error;
mod kind;

pub use {
    channel::{Channel, Origin},
    connection::ChannelConnection,
    error::{Error, Result},
    kind::ChannelKind,
};
