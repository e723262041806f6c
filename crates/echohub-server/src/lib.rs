pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod protocol;
pub mod ratelimit;
pub mod registry;
pub mod server;
pub mod shutdown;

pub use config::{ConfigError, HubConfig};
pub use server::{start, Hub, ServerHandle};
