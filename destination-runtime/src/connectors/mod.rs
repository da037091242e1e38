//! Built-in destinations.

pub mod webhook;
