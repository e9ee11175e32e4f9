//! Tether: a command relay between managed endpoints and operator
//! controllers.
//!
//! Endpoints and controllers hold long-lived TCP connections to a
//! [`Router`]. Controllers submit [`Command`]s naming an endpoint by uuid;
//! the router hands them to that endpoint and relays the results back.
//!
//! ## Architecture
//!
//! - **FramedChannel**: length-prefixed frames over a byte stream
//! - **wire**: versioned, tagged payload encoding for identities and commands
//! - **IdentityRegistry**: persisted endpoint identities, with drift detection
//! - **Router**: accepts connections and runs the endpoint/controller protocols
//! - **RelayClient** / **EndpointAgent**: the remote side of the protocol
//! - **UnitRegistry**: runnable units an endpoint starts on request

pub mod activity;
pub mod agent;
pub mod channel;
pub mod client;
pub mod config;
pub mod module_store;
pub mod registry;
pub mod router;
pub mod types;
pub mod unit;
pub mod wire;

pub use activity::ActivityLog;
pub use agent::{BatchReport, EndpointAgent};
pub use channel::{ChannelError, FramedChannel};
pub use client::{ClientError, RelayClient};
pub use config::Config;
pub use module_store::ModuleStore;
pub use registry::{IdentityRegistry, RegistryError};
pub use router::{Router, RouterError};
pub use types::{Command, CommandKind, Identity, Role};
pub use unit::{RunnableUnit, Startup, UnitRegistry};
pub use wire::{Message, WireError};
