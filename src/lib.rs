//! kubeterm - persistent terminal sessions and log tails for a Kubernetes dashboard.
//!
//! Remote exec shells live in a [`registry::SessionRegistry`] independently of
//! whatever view shows them; the [`portal::Portal`] moves their rendering
//! surfaces between containers without touching the connection. Log tails are
//! [`logstream::LogSubscription`]s that reconnect on their own with bounded
//! linear backoff.

pub mod config;
pub mod error;
pub mod logstream;
pub mod portal;
pub mod protocol;
pub mod registry;
pub mod scrollback;
pub mod session;
pub mod terminal;
pub mod transport;

pub use error::MuxError;
