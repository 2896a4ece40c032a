//! # pim
//!
//! Device context of the pim renderer. pim wraps the parts of Vulkan that decide *when* GPU work may run and *when*
//! resources may die:
//!
//! - the [queue registry](queue) with one logical queue each for graphics, compute, transfer and present,
//! - per-queue [command recording](command) rings with per-thread open buffers,
//! - [submission tracking](submit) that answers "has this submission finished?" without holding the command buffer,
//! - the [deferred reclamation queue](release) that destroys resources only once no in-flight work can use them.
//!
//! All native calls go through the [Backend](backend::Backend) trait.
//!
//! Resource state tracking and the frame graph live in `pim-graph`, barrier collection in `pim-commands`.

use std::sync::{Mutex, MutexGuard};

pub use ash;
#[cfg(feature = "default_allocator")]
pub use gpu_allocator;

///The native API seam and its implementations.
pub mod backend;

///Per-queue command buffer rings and per-thread recording.
pub mod command;

mod config;
pub use config::GfxConfig;

///The [Device](context::Device) and [Context](context::Context).
pub mod context;
pub use context::{Context, Device};

mod error;
pub use error::{AllocationError, GfxError};

pub mod queue;

///Deferred, gated destruction of native resources.
pub mod release;

///Allocatable resources. Mostly [Image](resources::Image) and [Buffer](resources::Buffer).
pub mod resources;

pub mod submit;

///Locks `mutex`, recovering the guard if another thread panicked while holding it. Every structure pim guards stays
/// consistent across panics.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
