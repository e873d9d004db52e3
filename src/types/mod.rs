//! Shared type definitions
//!
//! Request and configuration types used by the invoker, the streaming bridge
//! and the control surface.

pub mod config;
pub mod request;
