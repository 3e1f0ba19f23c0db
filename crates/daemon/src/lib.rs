//! meshagent daemon
//!
//! Runtime pieces of the agent: configuration, on-disk state, the control
//! server client, reconciliation, polling, DNS listeners and supervision.

pub mod config;
pub mod control;
pub mod dns;
pub mod poller;
pub mod reconciler;
pub mod store;
pub mod supervisor;
pub mod tunnel;
pub mod upnp;

pub use config::{AgentConfig, AgentIdentity, ConfigContext, IdentityOverrides};
pub use control::{ControlPlane, FetchOutcome, HttpControlPlane};
pub use poller::{PollOutcome, Poller};
pub use reconciler::{MeshOutcome, ReconcileReport, Reconciler};
pub use store::StateStore;
pub use supervisor::{Supervisor, TaskHealth};
pub use tunnel::{TunnelController, WgQuick};
pub use upnp::{DisabledPortMapper, PortMapper};
