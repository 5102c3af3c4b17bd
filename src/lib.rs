//! Library surface for the `revtun` reverse-tunnel binary, split out so
//! integration tests (and, eventually, other front-ends) can drive the
//! control plane and client dialer without shelling out to the CLI.

pub mod auth;
pub mod broker;
pub mod client;
pub mod config;
pub mod funnel;
pub mod pipe;
pub mod port_pool;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;
