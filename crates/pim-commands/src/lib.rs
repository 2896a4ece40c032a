//! # Pim-Commands
//!
//! Small command-level helpers shared by everything that records synchronization into pim's command buffers:
//!
//! - [BarrierBuilder] collects image and buffer barriers and records them as a single `vkCmdPipelineBarrier2`.
//! - [access] classifies access masks into reads and writes and decides whether two accesses need a barrier.

pub mod access;
pub use access::{has_read, has_write, needs_barrier};

mod barrier_builder;
pub use barrier_builder::BarrierBuilder;
