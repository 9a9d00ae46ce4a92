//! Takeover kernel: adopts VMs running on external virtualization platforms
//! into the compute platform and keeps both sides in step.

pub mod adapters;
pub mod compute;
pub mod config;
pub mod error;
pub mod flavors;
pub mod guard;
pub mod health;
pub mod http;
pub mod metrics;
pub mod models;
pub mod pusher;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod store;

pub use error::{Result, TakeoverError};
