//! Connection-handling core of a forward HTTP proxy.
//!
//! This library terminates client connections speaking the HTTP proxy
//! protocol, authenticates them, and either forwards ordinary requests to
//! their destination or hands CONNECT tunnels over to the relay.

pub mod auth;
pub mod config;
pub mod proxy;
pub mod relay;
