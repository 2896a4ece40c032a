//! Recorded state of tracked resources.
//!
//! A [ResState] is what the tracker knows about the last use of a resource (or one subresource of an image): the queue
//! that owns it, the stage and access mask of the last use window, the image layout and the submission that touched
//! it last. It is only ever mutated by the functions in [track](crate::track) and
//! [subresource](crate::subresource).

use pim::{
    ash::vk,
    queue::QueueId,
    resources::{Buffer, Image},
    submit::SubmitId,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResState {
    ///`None` until the first use.
    pub owner: Option<QueueId>,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    ///Always `UNDEFINED` for buffers.
    pub layout: vk::ImageLayout,
    ///Latest submission that may reference the resource.
    pub submit: SubmitId,
}

impl Default for ResState {
    fn default() -> Self {
        ResState::FRESH
    }
}

impl ResState {
    ///State of a resource that was never used.
    pub const FRESH: ResState = ResState {
        owner: None,
        stage: vk::PipelineStageFlags2::empty(),
        access: vk::AccessFlags2::empty(),
        layout: vk::ImageLayout::UNDEFINED,
        submit: SubmitId::INVALID,
    };

    pub fn is_fresh(&self) -> bool {
        self.stage.is_empty()
    }

    ///State right after `usage` was applied through a barrier.
    pub fn from_usage(usage: &Usage, submit: SubmitId) -> Self {
        ResState {
            owner: Some(usage.queue),
            stage: usage.stage,
            access: usage.access,
            layout: usage.layout,
            submit,
        }
    }

    ///Widens the use window by `usage`. Owner and layout stay.
    pub(crate) fn widen(&mut self, usage: &Usage, submit: SubmitId) {
        if self.is_fresh() {
            *self = ResState::from_usage(usage, submit);
        } else {
            self.stage |= usage.stage;
            self.access |= usage.access;
            self.submit = submit;
        }
    }

    ///Source half of a barrier leaving this state. Fresh resources leave from top of pipe.
    pub(crate) fn src_stage(&self) -> vk::PipelineStageFlags2 {
        if self.is_fresh() {
            vk::PipelineStageFlags2::TOP_OF_PIPE
        } else {
            self.stage
        }
    }
}

///A requested use of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Usage {
    pub queue: QueueId,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    ///Ignored for buffers.
    pub layout: vk::ImageLayout,
}

impl Usage {
    pub fn buffer(queue: QueueId, stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Usage {
            queue,
            stage,
            access,
            layout: vk::ImageLayout::UNDEFINED,
        }
    }

    pub fn image(
        queue: QueueId,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
    ) -> Self {
        Usage {
            queue,
            stage,
            access,
            layout,
        }
    }
}

///What the tracker had to do to make a usage legal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    ///Hazard free, the use window was widened.
    Merged,
    ///One barrier on the requesting queue.
    Barrier,
    ///Release on `src` and acquire on `dst`.
    Transfer { src: QueueId, dst: QueueId },
}

impl Transition {
    ///Number of barriers recorded. A transfer records one on each queue.
    ///
    /// Nominal for images tracked per subresource, which may record one barrier per merged range.
    pub fn barrier_count(&self) -> usize {
        match self {
            Transition::Merged => 0,
            Transition::Barrier => 1,
            Transition::Transfer { .. } => 2,
        }
    }
}

///Image state, either one state for the whole image, or one per `(layer, mip)` pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageState {
    Uniform(ResState),
    ///Indexed by `layer * mip_levels + mip`.
    PerSubresource(Vec<ResState>),
}

impl ImageState {
    pub fn is_uniform(&self) -> bool {
        matches!(self, ImageState::Uniform(_))
    }

    pub fn uniform(&self) -> Option<&ResState> {
        if let ImageState::Uniform(state) = self {
            Some(state)
        } else {
            None
        }
    }
}

///Buffer together with its tracked state.
pub struct TrackedBuffer {
    pub buffer: Buffer,
    pub state: ResState,
}

impl TrackedBuffer {
    pub fn new(buffer: Buffer) -> Self {
        TrackedBuffer {
            buffer,
            state: ResState::FRESH,
        }
    }
}

///Image together with its tracked state.
pub struct TrackedImage {
    pub image: Image,
    pub state: ImageState,
}

impl TrackedImage {
    pub fn new(image: Image) -> Self {
        TrackedImage {
            image,
            state: ImageState::Uniform(ResState::FRESH),
        }
    }

    pub fn mip_levels(&self) -> u32 {
        self.image.desc.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.image.desc.array_layers
    }

    ///State of a single subresource, regardless of the tracking mode.
    pub fn state_at(&self, layer: u32, mip: u32) -> ResState {
        assert!(
            layer < self.array_layers() && mip < self.mip_levels(),
            "subresource ({layer}, {mip}) out of range"
        );
        match &self.state {
            ImageState::Uniform(state) => *state,
            ImageState::PerSubresource(states) => {
                states[(layer * self.mip_levels() + mip) as usize]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(ResState: Send, Sync);
        assert_impl_all!(TrackedBuffer: Send, Sync);
        assert_impl_all!(TrackedImage: Send, Sync);
    }

    #[test]
    fn widen_ors_masks() {
        let read = Usage::image(
            QueueId::Graphics,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        let mut state = ResState::FRESH;
        assert!(state.is_fresh());
        state.widen(&read, SubmitId::INVALID);
        assert_eq!(state, ResState::from_usage(&read, SubmitId::INVALID));

        let compute = Usage {
            stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
            ..read
        };
        state.widen(&compute, SubmitId::INVALID);
        assert_eq!(
            state.stage,
            vk::PipelineStageFlags2::FRAGMENT_SHADER | vk::PipelineStageFlags2::COMPUTE_SHADER
        );
        assert_eq!(state.owner, Some(QueueId::Graphics));
    }

    #[test]
    fn transition_barrier_counts() {
        assert_eq!(Transition::Merged.barrier_count(), 0);
        assert_eq!(Transition::Barrier.barrier_count(), 1);
        assert_eq!(
            Transition::Transfer {
                src: QueueId::Graphics,
                dst: QueueId::Compute
            }
            .barrier_count(),
            2
        );
    }
}
