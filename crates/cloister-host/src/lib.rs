//! Outside supervisor: launches the enclave with a fixed resource budget,
//! multiplexes ingress into it, bridges its egress, and supervises its
//! lifetime through the vendor CLI.

pub mod cli;
pub mod controller;
pub mod forwarder;

pub use cli::{EnclaveDescription, LaunchSpec, LaunchSpecError, VendorCli, VendorCliError};
pub use controller::{Controller, ControllerError, ControllerState, ExitReason, POLL_INTERVAL};
pub use forwarder::{
    spawn_egress, spawn_ingress, spawn_log_drain, spawn_status_listener, HostWiringError,
};

use rand::Rng;

/// Draw an enclave CID uniformly from `[4, 2^32)`; CIDs 0–2 are reserved and
/// 3 is the parent.
pub fn random_cid() -> u32 {
    rand::thread_rng().gen_range(4..=u32::MAX)
}
