//! Multi-network CNI meta-plugin for Kubernetes
//!
//! This implementation provides a pure Rust meta-plugin that:
//! - Reads a list of delegate plugin configurations
//! - Persists the list so the matching DEL can find it
//! - Runs the master delegate first and reports only its result
//! - Names the remaining interfaces net0, net1, ... in list order

pub mod commands;
pub mod config;
pub mod error;
pub mod invoke;
pub mod plugin;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_del, run_cni};
pub use config::{load_net_conf, Delegate, NetConf};
pub use error::{MultusError, Result};
pub use invoke::{DelegateInvoker, ExecInvoker, InvokeRequest};
pub use plugin::{InterfaceNamer, MultusPlugin};
pub use store::DelegateStore;
