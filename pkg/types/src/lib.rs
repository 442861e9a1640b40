//! Data types shared by the store, the coordination client and the CLI.

pub mod config;
pub mod connection;
pub mod lease;
pub mod lock;
pub mod service;
pub mod validate;
