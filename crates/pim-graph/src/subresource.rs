//! # Subresource tracking
//!
//! Tracks an image per `(layer, mip)` pair while parts of it are in different states, for instance while a mip chain
//! is generated level by level. The first partial access splits the uniform state into one state per subresource.
//! Every subresource of the requested range goes through the same decision as whole-resource tracking. Once all
//! subresources agree on layout and owner again, the image collapses back to a single uniform state.
//!
//! Barriers of neighbouring subresources are merged greedily before recording: first along the mips of a layer, then
//! along layers with equal mip ranges. This keeps the barrier count near the number of distinct state groups, but is
//! not guaranteed to be minimal.

use pim::{
    ash::vk,
    queue::QueueId,
    submit::SubmitId,
    Context, GfxError,
};
use pim_commands::BarrierBuilder;
use smallvec::SmallVec;

use crate::{
    state::{ImageState, ResState, TrackedImage, Usage},
    track::{check_usage, decide, transfer_cmds, transfer_families, Decision},
};

///Rectangle of array layers and mip levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubRange {
    pub base_layer: u32,
    pub layer_count: u32,
    pub base_mip: u32,
    pub mip_count: u32,
}

impl SubRange {
    pub fn new(base_layer: u32, layer_count: u32, base_mip: u32, mip_count: u32) -> Self {
        SubRange {
            base_layer,
            layer_count,
            base_mip,
            mip_count,
        }
    }

    pub fn single(layer: u32, mip: u32) -> Self {
        SubRange::new(layer, 1, mip, 1)
    }

    ///Every subresource of `img`.
    pub fn all(img: &TrackedImage) -> Self {
        SubRange::new(0, img.array_layers(), 0, img.mip_levels())
    }

    pub fn to_vk(&self, aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: self.base_mip,
            level_count: self.mip_count,
            base_array_layer: self.base_layer,
            layer_count: self.layer_count,
        }
    }
}

///Source half of a subresource barrier. Barriers only merge if their sources are equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarrierSrc {
    pub owner: Option<QueueId>,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

impl From<&ResState> for BarrierSrc {
    fn from(state: &ResState) -> Self {
        BarrierSrc {
            owner: state.owner,
            stage: state.src_stage(),
            access: state.access,
            layout: state.layout,
        }
    }
}

///Barrier over a `layer × mip` rectangle. The destination is the same for all barriers of one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubBarrier {
    pub layer: u32,
    pub layer_count: u32,
    pub mip: u32,
    pub mip_count: u32,
    pub src: BarrierSrc,
}

impl SubBarrier {
    fn range(&self) -> SubRange {
        SubRange::new(self.layer, self.layer_count, self.mip, self.mip_count)
    }
}

///Greedy single pass merge. Mip ranges of a layer are merged first, then layer ranges with identical mip ranges.
pub fn merge_barriers(barriers: &[SubBarrier]) -> Vec<SubBarrier> {
    let mut by_mip: Vec<SubBarrier> = Vec::with_capacity(barriers.len());
    for barrier in barriers {
        match by_mip.last_mut() {
            Some(last)
                if last.layer == barrier.layer
                    && last.layer_count == barrier.layer_count
                    && last.src == barrier.src
                    && last.mip + last.mip_count == barrier.mip =>
            {
                last.mip_count += barrier.mip_count;
            }
            _ => by_mip.push(*barrier),
        }
    }

    let mut merged: Vec<SubBarrier> = Vec::with_capacity(by_mip.len());
    for barrier in by_mip {
        let neighbour = merged.iter_mut().find(|m| {
            m.mip == barrier.mip
                && m.mip_count == barrier.mip_count
                && m.src == barrier.src
                && m.layer + m.layer_count == barrier.layer
        });
        match neighbour {
            Some(m) => m.layer_count += barrier.layer_count,
            None => merged.push(barrier),
        }
    }

    #[cfg(feature = "logging")]
    log::trace!("Merged {} subresource barriers into {}", barriers.len(), merged.len());

    merged
}

///Tracks a use of `range` of `img`. Returns the number of recorded barriers, where a transfer records one on each
/// queue. The tracked state is left untouched if recording fails.
pub fn image_substate(
    ctx: &Context,
    tid: usize,
    img: &mut TrackedImage,
    usage: Usage,
    range: SubRange,
) -> Result<usize, GfxError> {
    track_range(ctx, tid, img, usage, range).map(|outcome| outcome.barriers)
}

///What a subresource request recorded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SubOutcome {
    pub barriers: usize,
    ///First queue ownership was transferred from, if any.
    pub transfer_from: Option<QueueId>,
}

pub(crate) fn track_range(
    ctx: &Context,
    tid: usize,
    img: &mut TrackedImage,
    usage: Usage,
    range: SubRange,
) -> Result<SubOutcome, GfxError> {
    #[cfg(feature = "profiling")]
    puffin::profile_function!();

    check_usage(ctx, &usage);
    let mips = img.mip_levels();
    let layers = img.array_layers();
    assert!(
        range.layer_count > 0 && range.mip_count > 0,
        "empty subresource range"
    );
    assert!(
        range.base_layer + range.layer_count <= layers && range.base_mip + range.mip_count <= mips,
        "subresource range {range:?} exceeds image of {layers} layers and {mips} mips"
    );

    let mut states = match &img.state {
        ImageState::Uniform(state) => {
            #[cfg(feature = "logging")]
            log::trace!("Image {:?}: tracking per subresource", img.image.inner);
            vec![*state; (layers * mips) as usize]
        }
        ImageState::PerSubresource(states) => states.clone(),
    };

    let mut pending: SmallVec<[SubBarrier; 16]> = SmallVec::new();
    for layer in range.base_layer..(range.base_layer + range.layer_count) {
        for mip in range.base_mip..(range.base_mip + range.mip_count) {
            let state = &mut states[(layer * mips + mip) as usize];
            match decide(state, &usage, true) {
                Decision::Merge => state.widen(&usage, state.submit),
                Decision::Barrier | Decision::Transfer(_) => {
                    pending.push(SubBarrier {
                        layer,
                        layer_count: 1,
                        mip,
                        mip_count: 1,
                        src: BarrierSrc::from(&*state),
                    });
                    *state = ResState::from_usage(&usage, state.submit);
                }
            }
        }
    }

    let merged = merge_barriers(&pending);
    let (outcome, submit) = record(ctx, tid, img, &usage, &merged)?;

    //the requesting buffer may change while transfers are flushed, so ids are assigned last
    for layer in range.base_layer..(range.base_layer + range.layer_count) {
        for mip in range.base_mip..(range.base_mip + range.mip_count) {
            states[(layer * mips + mip) as usize].submit = submit;
        }
    }
    img.state = collapse(states);
    Ok(outcome)
}

///Records `barriers` towards `usage`. Transfers are grouped per source queue. Returns what was recorded and the id of
/// the requesting command buffer.
fn record(
    ctx: &Context,
    tid: usize,
    img: &TrackedImage,
    usage: &Usage,
    barriers: &[SubBarrier],
) -> Result<(SubOutcome, SubmitId), GfxError> {
    let aspect = img.image.desc.aspect();
    let push = |builder: &mut BarrierBuilder, barrier: &SubBarrier, src_family: u32, dst_family: u32| {
        builder.image_barrier(
            img.image.inner,
            barrier.range().to_vk(aspect),
            barrier.src.access,
            barrier.src.stage,
            barrier.src.layout,
            src_family,
            usage.access,
            usage.stage,
            usage.layout,
            dst_family,
        );
    };

    let mut outcome = SubOutcome::default();
    for src in QueueId::ALL {
        if src == usage.queue {
            continue;
        }
        let (src_family, dst_family) = transfer_families(ctx, src, usage.queue);
        let mut builder = BarrierBuilder::new();
        for barrier in barriers.iter().filter(|b| b.src.owner == Some(src)) {
            push(&mut builder, barrier, src_family, dst_family);
        }
        if builder.has_barrier() {
            #[cfg(feature = "logging")]
            log::trace!(
                "Image {:?}: transfer of {} ranges {src} -> {}",
                img.image.inner,
                builder.len(),
                usage.queue
            );
            let (src_cmd, dst_cmd) = transfer_cmds(ctx, tid, src, usage.queue)?;
            builder.record(ctx, &src_cmd);
            builder.record(ctx, &dst_cmd);
            outcome.barriers += 2 * builder.len();
            outcome.transfer_from.get_or_insert(src);
        }
    }

    let mut local = BarrierBuilder::new();
    for barrier in barriers
        .iter()
        .filter(|b| b.src.owner.is_none_or(|owner| owner == usage.queue))
    {
        push(
            &mut local,
            barrier,
            vk::QUEUE_FAMILY_IGNORED,
            vk::QUEUE_FAMILY_IGNORED,
        );
    }
    let cmd = ctx.cmd_get(usage.queue, tid)?;
    local.record(ctx, &cmd);
    outcome.barriers += local.len();

    Ok((outcome, cmd.submit_id()))
}

///Collapses to a uniform state if all subresources share layout and owner.
fn collapse(states: Vec<ResState>) -> ImageState {
    let Some(first) = states.first().copied() else {
        return ImageState::PerSubresource(states);
    };
    if !states
        .iter()
        .all(|s| s.layout == first.layout && s.owner == first.owner)
    {
        return ImageState::PerSubresource(states);
    }

    let mut merged = first;
    for state in &states[1..] {
        merged.stage |= state.stage;
        merged.access |= state.access;
        if !merged.submit.valid || merged.submit.is_before(&state.submit) {
            merged.submit = state.submit;
        }
    }
    ImageState::Uniform(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::image_state;
    use crate::state::Transition;
    use pim::{
        backend::headless::HeadlessBackend,
        resources::{ImgDesc, Image},
        GfxConfig,
    };
    use std::sync::Arc;

    fn context() -> (Arc<HeadlessBackend>, Context) {
        let backend = Arc::new(HeadlessBackend::new());
        let ctx = Context::headless(backend.clone(), GfxConfig::default()).unwrap();
        (backend, ctx)
    }

    fn image(ctx: &Context, layers: u32, mips: u32) -> TrackedImage {
        TrackedImage::new(
            Image::new(
                &ctx.device,
                ImgDesc::texture_2d(256, 256, vk::Format::R8G8B8A8_UNORM)
                    .with_layers(layers)
                    .with_mips(mips),
                "layered",
            )
            .unwrap(),
        )
    }

    fn src(layout: vk::ImageLayout) -> BarrierSrc {
        BarrierSrc {
            owner: Some(QueueId::Graphics),
            stage: vk::PipelineStageFlags2::COPY,
            access: vk::AccessFlags2::TRANSFER_WRITE,
            layout,
        }
    }

    fn grid(layers: u32, mips: u32, odd: Option<(u32, u32)>) -> Vec<SubBarrier> {
        let mut out = Vec::new();
        for layer in 0..layers {
            for mip in 0..mips {
                let layout = if odd == Some((layer, mip)) {
                    vk::ImageLayout::GENERAL
                } else {
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL
                };
                out.push(SubBarrier {
                    layer,
                    layer_count: 1,
                    mip,
                    mip_count: 1,
                    src: src(layout),
                });
            }
        }
        out
    }

    fn covered(barriers: &[SubBarrier]) -> usize {
        barriers.iter().map(|b| (b.layer_count * b.mip_count) as usize).sum()
    }

    fn sampled() -> Usage {
        Usage::image(
            QueueId::Graphics,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
    }

    fn copy_dst() -> Usage {
        Usage::image(
            QueueId::Graphics,
            vk::PipelineStageFlags2::COPY,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
    }

    #[test]
    fn uniform_grid_merges_into_one() {
        let merged = merge_barriers(&grid(3, 4, None));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].range(), SubRange::new(0, 3, 0, 4));
    }

    #[test]
    fn greedy_merge_keeps_coverage() {
        let merged = merge_barriers(&grid(3, 4, Some((1, 2))));
        //layer 0 and 2 can not join over the split layer 1
        assert_eq!(merged.len(), 5);
        assert_eq!(covered(&merged), 12);
    }

    #[test]
    fn gaps_are_not_bridged() {
        let mut barriers = grid(1, 4, None);
        barriers.remove(1);
        let merged = merge_barriers(&barriers);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].range(), SubRange::new(0, 1, 2, 2));
    }

    #[test]
    fn round_trip_collapses_to_uniform() {
        let (backend, ctx) = context();
        let mut img = image(&ctx, 2, 3);
        let mut stage = vk::PipelineStageFlags2::empty();
        let stages = [
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::PipelineStageFlags2::VERTEX_SHADER,
        ];

        for layer in 0..2 {
            for mip in 0..3 {
                assert!(layer + mip == 0 || !img.state.is_uniform());
                let usage = Usage {
                    stage: stages[((layer + mip) % 2) as usize],
                    ..sampled()
                };
                stage |= usage.stage;
                let count =
                    image_substate(&ctx, 0, &mut img, usage, SubRange::single(layer, mip)).unwrap();
                assert_eq!(count, 1);
            }
        }

        let state = img.state.uniform().copied().unwrap();
        assert_eq!(state.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(state.stage, stage);
        assert_eq!(state.access, vk::AccessFlags2::SHADER_SAMPLED_READ);
        assert_eq!(backend.image_barriers().len(), 6);
    }

    #[test]
    fn mip_chain_generation() {
        let (backend, ctx) = context();
        let mut img = image(&ctx, 1, 4);
        image_state(&ctx, 0, &mut img, copy_dst()).unwrap();
        backend.clear_log();

        //lower mips become readable, the top mip stays a copy destination
        let count = image_substate(&ctx, 0, &mut img, sampled(), SubRange::new(0, 1, 1, 3)).unwrap();
        assert_eq!(count, 1);
        let barriers = backend.image_barriers();
        assert_eq!(barriers[0].range.base_mip_level, 1);
        assert_eq!(barriers[0].range.level_count, 3);
        assert!(!img.state.is_uniform());
        assert_eq!(img.state_at(0, 0).layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(img.state_at(0, 3).layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        //whole image request only barriers the top mip and collapses again
        backend.clear_log();
        assert_eq!(
            image_state(&ctx, 0, &mut img, sampled()).unwrap(),
            Transition::Barrier
        );
        let barriers = backend.image_barriers();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].range.base_mip_level, 0);
        assert_eq!(barriers[0].range.level_count, 1);
        assert!(img.state.is_uniform());
    }

    #[test]
    fn partial_transfer_records_on_both_queues() {
        let (backend, ctx) = context();
        let mut img = image(&ctx, 2, 1);
        image_state(&ctx, 0, &mut img, sampled()).unwrap();
        backend.clear_log();

        let compute = Usage::image(
            QueueId::Compute,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        let count = image_substate(&ctx, 0, &mut img, compute, SubRange::single(1, 0)).unwrap();
        assert_eq!(count, 2);
        let log = backend.barriers();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].cmd, ctx.cmd_current(QueueId::Graphics, 0).unwrap().handle);
        assert_eq!(log[1].cmd, ctx.cmd_current(QueueId::Compute, 0).unwrap().handle);
        assert_eq!(log[0].images[0].range.base_array_layer, 1);
        //same layout, different owner
        assert!(!img.state.is_uniform());
        assert_eq!(img.state_at(1, 0).owner, Some(QueueId::Compute));
        assert_eq!(img.state_at(0, 0).owner, Some(QueueId::Graphics));
    }

    #[test]
    fn whole_request_reports_partial_transfer() {
        let (backend, ctx) = context();
        let mut img = image(&ctx, 2, 1);
        image_state(&ctx, 0, &mut img, sampled()).unwrap();
        let compute = Usage::image(
            QueueId::Compute,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        image_substate(&ctx, 0, &mut img, compute, SubRange::single(1, 0)).unwrap();
        backend.clear_log();

        //layer 0 merges, layer 1 comes back from compute
        assert_eq!(
            image_state(&ctx, 0, &mut img, sampled()).unwrap(),
            Transition::Transfer {
                src: QueueId::Compute,
                dst: QueueId::Graphics
            }
        );
        assert_eq!(backend.image_barriers().len(), 2);
        assert_eq!(img.state.uniform().unwrap().owner, Some(QueueId::Graphics));
    }

    #[test]
    fn failed_request_keeps_previous_state() {
        let (backend, ctx) = context();
        let mut img = image(&ctx, 1, 2);
        let compute = Usage::image(
            QueueId::Compute,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        image_substate(&ctx, 0, &mut img, compute, SubRange::single(0, 0)).unwrap();
        let before = img.state.clone();
        assert_eq!(img.state_at(0, 0).owner, Some(QueueId::Compute));

        //an open graphics -> compute transfer forces a flush, which fails on the lost device
        ctx.cmd_get(QueueId::Graphics, 0).unwrap();
        ctx.cmd_get(QueueId::Compute, 0).unwrap();
        ctx.cmd_mark_transfer(QueueId::Graphics, QueueId::Compute, 0);
        backend.lose_device();

        assert!(image_substate(&ctx, 0, &mut img, sampled(), SubRange::single(0, 0)).is_err());
        assert_eq!(img.state, before);
        assert_eq!(img.state_at(0, 0).owner, Some(QueueId::Compute));
    }

    #[test]
    fn transfer_source_is_reported() {
        let (_backend, ctx) = context();
        let mut img = image(&ctx, 2, 1);
        image_state(&ctx, 0, &mut img, sampled()).unwrap();
        let compute = Usage::image(
            QueueId::Compute,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        let outcome = track_range(&ctx, 0, &mut img, compute, SubRange::single(1, 0)).unwrap();
        assert_eq!(outcome.barriers, 2);
        assert_eq!(outcome.transfer_from, Some(QueueId::Graphics));

        //local layout change only
        let outcome = track_range(&ctx, 0, &mut img, copy_dst(), SubRange::single(0, 0)).unwrap();
        assert_eq!(outcome.barriers, 1);
        assert_eq!(outcome.transfer_from, None);
    }

    #[test]
    #[should_panic]
    fn range_out_of_image_panics() {
        let (_backend, ctx) = context();
        let mut img = image(&ctx, 1, 2);
        let _ = image_substate(&ctx, 0, &mut img, sampled(), SubRange::single(0, 2));
    }
}
