#[path = "core/alerts.rs"]
pub mod alerts;

#[path = "core/connection.rs"]
pub mod connection;

#[path = "core/control.rs"]
pub mod control;

#[path = "core/reconcile.rs"]
pub mod reconcile;

#[path = "core/safety.rs"]
pub mod safety;

pub mod config;
pub mod console;
pub mod error;
pub mod observer;
pub mod paths;
pub mod protocol;
pub mod recorder;
pub mod session;

#[cfg(feature = "net")]
pub mod transport;
