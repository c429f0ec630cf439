//! Reverse tunnel engine, modeled after frp.
//!
//! A client keeps one authenticated control session to the server. Public
//! traffic arriving at the server is carried to the client over work
//! connections requested on demand through that session. Secret proxies are
//! reached by visitors, either relayed through the server or over a direct
//! hole-punched QUIC path.

pub mod auth;
pub mod client;
pub mod datagram;
pub mod error;
pub mod kind;
pub mod msg;
pub mod nat;
pub mod server;
pub mod transport;

#[cfg(test)]
mod e2e_tests;
