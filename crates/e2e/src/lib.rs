//! meshagent end-to-end harness
//!
//! Runs the real reconciler and poller against an in-process fake control
//! server, with tunnel start/stop calls recorded instead of executed.
//!
//! ```text
//!  Poller ──HTTP──▶ FakeControlServer (axum, ephemeral port)
//!    │
//!    ▼
//!  Reconciler ──▶ RecordingTunnels    (start/stop/is_up log)
//!    │        ──▶ TempDir             (desired state, keys, tunnel files)
//!    ▼
//!  DnsHandle ──▶ DnsServer            (UDP on 127.0.0.1)
//! ```

pub mod control_server;
pub mod error;
pub mod fixtures;
pub mod harness;
pub mod tunnel;

pub use control_server::FakeControlServer;
pub use error::{E2eError, E2eResult};
pub use harness::Harness;
pub use tunnel::{RecordingTunnels, TunnelCall};
