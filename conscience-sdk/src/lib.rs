#![forbid(unsafe_code)]

//! Client SDK for the conscience registry daemon.
//!
//! Speaks the daemon's newline-delimited JSON RPC over TCP. Each call opens
//! a connection, sends one request envelope, and reads one response line;
//! [`ConscienceClient::subscribe_events`] keeps the connection open and
//! forwards the event stream through a broadcast channel.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod models;

pub use client::ConscienceClient;
pub use config::SdkConfig;
pub use error::{Error, Result};
pub use events::Event;
pub use models::{ConfigResponse, Registration, ServiceView};
