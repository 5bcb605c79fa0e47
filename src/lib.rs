//! playout library - RTP receive-side playout buffer and test sender
//!
//! This module exports internal components for integration testing.

pub mod cli;
pub mod config;
pub mod metrics;
pub mod resource;
pub mod rtp;
