//! avlink - operator node library
//!
//! Drives a session from the operator side:
//! - `resolver` - `AddressResolver`, a TTL cache with single-flight lookups
//! - `directory` - `TailscaleDirectory`, the overlay-network peer directory
//! - `client` - `TransportClient` over a shared `ConnectionPool`
//! - `link` - `PeerLink`, the session channel kept after the join target
//! - `controller` - `SessionController`, the operator state machine
//!
//! The `avlink` binary wires these to the command-line collaborator
//! adapters; tests wire them to in-process fakes.

pub mod client;
pub mod controller;
pub mod directory;
pub mod error;
pub mod link;
pub mod resolver;

pub use client::{ConnectPath, ConnectionPool, PooledConnection, TransportClient};
pub use controller::{
    Collaborators, ControllerHandle, ControllerOptions, SessionController, SessionEvent,
    SessionOutcome,
};
pub use directory::TailscaleDirectory;
pub use error::{OperatorError, Result};
pub use link::{LinkEvent, LinkTiming, PeerLink};
pub use resolver::{AddressResolver, Resolved, ResolvedAddress};
