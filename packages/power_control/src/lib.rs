//! Power Control - machine reachability and power lifecycle primitives
//!
//! This crate provides the leaf collaborators used to manage a single
//! remote machine: a bounded-timeout TCP reachability probe, a Wake-on-LAN
//! signaler and a remote power-off executor that runs over an SSH session.
//! It has no HTTP dependencies and keeps no state of its own.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use power_control::{Prober, TcpProber, UdpWakeSignaler, WakeSignaler};
//!
//! #[tokio::main]
//! async fn main() {
//!     let prober = TcpProber;
//!     let result = prober.probe("192.168.1.50", 22, Duration::from_secs(2)).await;
//!
//!     if !result.reachable {
//!         let mac = "AA:BB:CC:DD:EE:FF".parse().unwrap();
//!         UdpWakeSignaler
//!             .wake(&mac, "255.255.255.255", 9)
//!             .await
//!             .unwrap();
//!     }
//! }
//! ```

mod error;
pub mod power_off;
pub mod probe;
pub mod ssh;
pub mod wake;

pub use error::ControlError;
pub use power_off::{
    CommandOutput, PowerOffExecutor, PowerOffMethod, PowerOffOutcome, RemoteSession, RemoteShell,
    ShellPowerOff,
};
pub use probe::{ConnectivityResult, Prober, TcpProber};
pub use ssh::{SshCredentials, SshShell};
pub use wake::{HardwareAddress, MagicPacket, UdpWakeSignaler, WakeOutcome, WakeSignaler};
