//! Client side of the sync protocol.
//!
//! - [`reconciler`]: local replica with optimistic edits and rollback
//! - [`connection`]: reconnecting WebSocket client driving a replica

pub mod connection;
pub mod reconciler;

pub use connection::{
    ClientCommand, ClientOptions, ClientUpdate, ConnectionState, SyncClient, calculate_backoff,
};
pub use reconciler::{Reconcile, Replica};
