//! # Resource state tracking
//!
//! Decides for every requested use of a buffer or image whether it can be merged into the recorded use window, needs
//! a barrier on the requesting queue, or needs a queue ownership transfer. The barrier (or release/acquire pair) is
//! recorded right away into the open command buffers of the recording thread.
//!
//! The rules, in order:
//! 1. A fresh resource (never used) has nothing to wait for. Buffers simply take the requested state, images get a
//!    barrier out of `UNDEFINED`. A fresh resource is never transferred.
//! 2. A different owning queue always transfers, regardless of the access masks.
//! 3. On the same queue a barrier is needed if the layout changes, or on RaW, WaW and WaR hazards. Otherwise masks are
//!    OR-ed into the recorded state.
//!
//! Barriers and transfers replace the recorded state with the requested one. Every call stores the submission id of
//! the requesting command buffer.

use pim::{
    ash::vk,
    command::CmdBuf,
    queue::QueueId,
    Context, GfxError,
};
use pim_commands::{needs_barrier, BarrierBuilder};

use crate::{
    state::{ImageState, ResState, TrackedBuffer, TrackedImage, Transition, Usage},
    subresource::{track_range, SubRange},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Decision {
    Merge,
    Barrier,
    ///Transfer from the recorded owner.
    Transfer(QueueId),
}

///Core decision for one recorded state. `has_layout` is false for buffers.
pub(crate) fn decide(prev: &ResState, usage: &Usage, has_layout: bool) -> Decision {
    if prev.is_fresh() {
        return if has_layout {
            Decision::Barrier
        } else {
            Decision::Merge
        };
    }
    let owner = prev.owner.unwrap_or(usage.queue);
    if owner != usage.queue {
        return Decision::Transfer(owner);
    }
    let layout_changed = has_layout && prev.layout != usage.layout;
    if needs_barrier(prev.access, usage.access, layout_changed) {
        Decision::Barrier
    } else {
        Decision::Merge
    }
}

///Asserts the usage contract. Violations are bugs in the declaring pass.
pub(crate) fn check_usage(ctx: &Context, usage: &Usage) {
    assert!(
        !usage.stage.is_empty(),
        "zero stage mask requested on {}",
        usage.queue
    );
    assert!(
        !usage.access.is_empty(),
        "zero access mask requested on {}",
        usage.queue
    );
    assert!(
        ctx.queue(usage.queue).caps.supports(usage.stage, usage.access),
        "{} can not execute {:?} with {:?}",
        usage.queue,
        usage.stage,
        usage.access
    );
}

///Family indices for a release/acquire pair. Queues of the same family order through semaphores only.
pub(crate) fn transfer_families(ctx: &Context, src: QueueId, dst: QueueId) -> (u32, u32) {
    let src_family = ctx.queue(src).family;
    let dst_family = ctx.queue(dst).family;
    if src_family == dst_family {
        (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
    } else {
        (src_family, dst_family)
    }
}

///Open command buffers on both ends of an ownership transfer from `src` to `dst`, marked as such.
///
/// A buffer is never source and destination at once. If `src` already acquires something or `dst` already releases
/// something, all pending transfers of the thread are submitted first.
pub(crate) fn transfer_cmds(
    ctx: &Context,
    tid: usize,
    src: QueueId,
    dst: QueueId,
) -> Result<(CmdBuf, CmdBuf), GfxError> {
    let mut src_cmd = ctx.cmd_get(src, tid)?;
    let mut dst_cmd = ctx.cmd_get(dst, tid)?;
    if src_cmd.xfer_dst || dst_cmd.xfer_src {
        #[cfg(feature = "logging")]
        log::trace!("Transfer {src} -> {dst} would cycle, flushing pending transfers");
        ctx.cmd_flush_transfers(tid)?;
        src_cmd = ctx.cmd_get(src, tid)?;
        dst_cmd = ctx.cmd_get(dst, tid)?;
    }
    ctx.cmd_mark_transfer(src, dst, tid);
    Ok((src_cmd, dst_cmd))
}

///Tracks a use of a whole buffer, recording whatever barrier is needed.
pub fn buffer_state(
    ctx: &Context,
    tid: usize,
    buf: &mut TrackedBuffer,
    usage: Usage,
) -> Result<Transition, GfxError> {
    #[cfg(feature = "profiling")]
    puffin::profile_function!();

    check_usage(ctx, &usage);
    let prev = buf.state;
    let handle = buf.buffer.inner;

    let barrier = |builder: &mut BarrierBuilder, src_family: u32, dst_family: u32| {
        builder.buffer_barrier(
            handle,
            0,
            vk::WHOLE_SIZE,
            prev.access,
            prev.src_stage(),
            src_family,
            usage.access,
            usage.stage,
            dst_family,
        );
    };

    match decide(&prev, &usage, false) {
        Decision::Merge => {
            let cmd = ctx.cmd_get(usage.queue, tid)?;
            #[cfg(feature = "logging")]
            log::trace!("Buffer {handle:?}: merged {:?} on {}", usage.access, usage.queue);
            buf.state.widen(&usage, cmd.submit_id());
            Ok(Transition::Merged)
        }
        Decision::Barrier => {
            let cmd = ctx.cmd_get(usage.queue, tid)?;
            #[cfg(feature = "logging")]
            log::trace!(
                "Buffer {handle:?}: barrier {:?} -> {:?} on {}",
                prev.access,
                usage.access,
                usage.queue
            );
            let mut builder = BarrierBuilder::new();
            barrier(&mut builder, vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED);
            builder.record(ctx, &cmd);
            buf.state = ResState::from_usage(&usage, cmd.submit_id());
            Ok(Transition::Barrier)
        }
        Decision::Transfer(src) => {
            let (src_cmd, dst_cmd) = transfer_cmds(ctx, tid, src, usage.queue)?;
            #[cfg(feature = "logging")]
            log::trace!("Buffer {handle:?}: transfer {src} -> {}", usage.queue);
            let (src_family, dst_family) = transfer_families(ctx, src, usage.queue);
            let mut builder = BarrierBuilder::new();
            barrier(&mut builder, src_family, dst_family);
            builder.record(ctx, &src_cmd);
            builder.record(ctx, &dst_cmd);
            buf.state = ResState::from_usage(&usage, dst_cmd.submit_id());
            Ok(Transition::Transfer {
                src,
                dst: usage.queue,
            })
        }
    }
}

///Tracks a use of a whole image, recording whatever barrier is needed.
///
/// Images that are tracked per subresource go through
/// [image_substate](crate::subresource::image_substate) over their full range. They report [Transition::Transfer]
/// if any range changed owner, otherwise [Transition::Barrier] if anything was recorded. The exact barrier count of
/// such a request may differ from [Transition::barrier_count].
pub fn image_state(
    ctx: &Context,
    tid: usize,
    img: &mut TrackedImage,
    usage: Usage,
) -> Result<Transition, GfxError> {
    #[cfg(feature = "profiling")]
    puffin::profile_function!();

    check_usage(ctx, &usage);
    let prev = match img.state {
        ImageState::Uniform(state) => state,
        ImageState::PerSubresource(_) => {
            let range = SubRange::all(img);
            let outcome = track_range(ctx, tid, img, usage, range)?;
            return Ok(match outcome.transfer_from {
                Some(src) => Transition::Transfer {
                    src,
                    dst: usage.queue,
                },
                None if outcome.barriers == 0 => Transition::Merged,
                None => Transition::Barrier,
            });
        }
    };
    let handle = img.image.inner;
    let range = img.image.subresource_all();

    let barrier = |builder: &mut BarrierBuilder, src_family: u32, dst_family: u32| {
        builder.image_barrier(
            handle,
            range,
            prev.access,
            prev.src_stage(),
            prev.layout,
            src_family,
            usage.access,
            usage.stage,
            usage.layout,
            dst_family,
        );
    };

    match decide(&prev, &usage, true) {
        Decision::Merge => {
            let cmd = ctx.cmd_get(usage.queue, tid)?;
            #[cfg(feature = "logging")]
            log::trace!("Image {handle:?}: merged {:?} on {}", usage.access, usage.queue);
            let mut state = prev;
            state.widen(&usage, cmd.submit_id());
            img.state = ImageState::Uniform(state);
            Ok(Transition::Merged)
        }
        Decision::Barrier => {
            let cmd = ctx.cmd_get(usage.queue, tid)?;
            #[cfg(feature = "logging")]
            log::trace!(
                "Image {handle:?}: barrier {:?} -> {:?} on {}",
                prev.layout,
                usage.layout,
                usage.queue
            );
            let mut builder = BarrierBuilder::new();
            barrier(&mut builder, vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED);
            builder.record(ctx, &cmd);
            img.state = ImageState::Uniform(ResState::from_usage(&usage, cmd.submit_id()));
            Ok(Transition::Barrier)
        }
        Decision::Transfer(src) => {
            let (src_cmd, dst_cmd) = transfer_cmds(ctx, tid, src, usage.queue)?;
            #[cfg(feature = "logging")]
            log::trace!("Image {handle:?}: transfer {src} -> {}", usage.queue);
            let (src_family, dst_family) = transfer_families(ctx, src, usage.queue);
            let mut builder = BarrierBuilder::new();
            barrier(&mut builder, src_family, dst_family);
            builder.record(ctx, &src_cmd);
            builder.record(ctx, &dst_cmd);
            img.state = ImageState::Uniform(ResState::from_usage(&usage, dst_cmd.submit_id()));
            Ok(Transition::Transfer {
                src,
                dst: usage.queue,
            })
        }
    }
}
