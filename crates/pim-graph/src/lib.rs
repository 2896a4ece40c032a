//! # pim-graph
//!
//! Frame graph and resource state tracking on top of [pim].
//!
//! The crate is layered bottom-up:
//!
//! - [state] holds what is known about the last use of a buffer or image.
//! - [track] decides per requested use whether a barrier or an ownership transfer is needed and records it.
//! - [subresource] does the same per `(layer, mip)` for images whose parts are in different states.
//! - [graph] and [pass] build a frame out of [RenderPass]es that declare named resources. The graph maps them onto
//!   physical resources, runs every declared use through the tracker and submits the frame.
//!
//! Passes never emit barriers themselves. Everything a pass declares is legal by the time [RenderPass::execute] runs.

mod error;
pub use error::GraphError;

pub mod state;
pub use state::{ImageState, ResState, TrackedBuffer, TrackedImage, Transition, Usage};

pub mod track;
pub use track::{buffer_state, image_state};

pub mod subresource;
pub use subresource::{image_substate, merge_barriers, SubBarrier, SubRange};

pub mod graph;
pub use graph::{FrameGraph, FrameRecorder, FrameReport, FrameSync, GraphConfig, ResourceUsage};

pub mod pass;
pub use pass::{
    BufferHandle, BufferInfo, ImageHandle, ImageInfo, PassBuilder, PassContext, RenderPass, Scaling,
};
