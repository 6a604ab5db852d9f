#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use gatekeeper_policy_controller_core as core;
pub use gatekeeper_policy_controller_k8s_api as k8s;
pub use gatekeeper_policy_controller_k8s_sync as sync;

mod args;
mod client;
mod controllers;
mod watch;

pub use self::{args::Args, client::ClusterClient, watch::WatchManager};
