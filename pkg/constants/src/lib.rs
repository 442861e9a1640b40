//! Centralized constants for the coordination workspace.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod coord;
pub mod network;
pub mod paths;
pub mod state;
