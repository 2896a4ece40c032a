//! # Queue registry
//!
//! pim works with four logical queues, see [QueueId]. Device bring-up decides which hardware family backs each of them
//! (usually through [QueueSupport::select]) and hands the result to the [Context](crate::Context) as [QueueDesc]s.
//! Several logical queues may share one family or even one native queue.

use std::sync::{Arc, Mutex};

use ash::vk;
use smallvec::SmallVec;

use crate::{
    backend::{Backend, SemaphoreWait},
    command::{CmdBuf, CmdRing},
    config::GfxConfig,
    error::GfxError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueId {
    Graphics,
    Compute,
    Transfer,
    Present,
}

impl QueueId {
    pub const COUNT: usize = 4;
    pub const ALL: [QueueId; Self::COUNT] = [
        QueueId::Graphics,
        QueueId::Compute,
        QueueId::Transfer,
        QueueId::Present,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    ///Single bit representing this queue in a [QueueMask].
    pub fn bit(&self) -> QueueMask {
        QueueMask(1 << self.index())
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueId::Graphics => write!(f, "Graphics"),
            QueueId::Compute => write!(f, "Compute"),
            QueueId::Transfer => write!(f, "Transfer"),
            QueueId::Present => write!(f, "Present"),
        }
    }
}

///Set of [QueueId]s.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct QueueMask(pub u8);

impl QueueMask {
    pub const EMPTY: QueueMask = QueueMask(0);

    pub fn insert(&mut self, id: QueueId) {
        self.0 |= id.bit().0;
    }

    pub fn contains(&self, id: QueueId) -> bool {
        self.0 & id.bit().0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = QueueId> + '_ {
        QueueId::ALL.into_iter().filter(|id| self.contains(*id))
    }
}

///Capabilities of the family backing a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueCaps {
    pub flags: vk::QueueFlags,
    pub present: bool,
}

impl QueueCaps {
    const GRAPHICS_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
        vk::PipelineStageFlags2::VERTEX_INPUT.as_raw()
            | vk::PipelineStageFlags2::VERTEX_SHADER.as_raw()
            | vk::PipelineStageFlags2::TESSELLATION_CONTROL_SHADER.as_raw()
            | vk::PipelineStageFlags2::TESSELLATION_EVALUATION_SHADER.as_raw()
            | vk::PipelineStageFlags2::GEOMETRY_SHADER.as_raw()
            | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
            | vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
            | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw()
            | vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT.as_raw()
            | vk::PipelineStageFlags2::ALL_GRAPHICS.as_raw()
            | vk::PipelineStageFlags2::INDEX_INPUT.as_raw()
            | vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT.as_raw()
            | vk::PipelineStageFlags2::PRE_RASTERIZATION_SHADERS.as_raw()
            | vk::PipelineStageFlags2::BLIT.as_raw()
            | vk::PipelineStageFlags2::RESOLVE.as_raw(),
    );
    const GRAPHICS_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
        vk::AccessFlags2::INDEX_READ.as_raw()
            | vk::AccessFlags2::VERTEX_ATTRIBUTE_READ.as_raw()
            | vk::AccessFlags2::INPUT_ATTACHMENT_READ.as_raw()
            | vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
            | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
    );
    const TRANSFER_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
        vk::PipelineStageFlags2::TRANSFER.as_raw()
            | vk::PipelineStageFlags2::COPY.as_raw()
            | vk::PipelineStageFlags2::CLEAR.as_raw(),
    );

    pub fn new(flags: vk::QueueFlags, present: bool) -> Self {
        QueueCaps { flags, present }
    }

    ///True if work at `stage` performing `access` can be recorded on a queue of this family.
    pub fn supports(&self, stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> bool {
        let graphics = self.flags.contains(vk::QueueFlags::GRAPHICS);
        let compute = self.flags.contains(vk::QueueFlags::COMPUTE);
        //graphics and compute queues implicitly support transfer
        let transfer = graphics || compute || self.flags.contains(vk::QueueFlags::TRANSFER);

        if stage.intersects(Self::GRAPHICS_STAGES) || access.intersects(Self::GRAPHICS_ACCESS) {
            if !graphics {
                return false;
            }
        }
        if stage.contains(vk::PipelineStageFlags2::COMPUTE_SHADER) && !compute {
            return false;
        }
        if stage.contains(vk::PipelineStageFlags2::DRAW_INDIRECT) && !(graphics || compute) {
            return false;
        }
        if stage.intersects(Self::TRANSFER_STAGES) && !transfer {
            return false;
        }
        true
    }
}

///Everything device bring-up knows about one logical queue.
#[derive(Clone, Copy, Debug)]
pub struct QueueDesc {
    pub id: QueueId,
    pub family: u32,
    ///Index of the queue within its family.
    pub index: u32,
    pub handle: vk::Queue,
    pub caps: QueueCaps,
}

///Family choice for each [QueueId].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueSupport {
    pub family: [u32; QueueId::COUNT],
    pub index: [u32; QueueId::COUNT],
    pub caps: [QueueCaps; QueueId::COUNT],
}

impl QueueSupport {
    ///Chooses a family for every queue. Graphics, compute and transfer each take the capable family that was chosen
    /// least often so far, which moves async compute and copies onto dedicated hardware where it exists. Present
    /// prefers the graphics family, since every other choice adds an ownership transfer per frame.
    ///
    /// `present_support[i]` tells whether family `i` can present to the target surface. Without any presenting
    /// family (headless rendering) the present queue aliases graphics.
    ///
    /// Returns `None` if there is no graphics family.
    pub fn select(
        families: &[vk::QueueFamilyProperties],
        present_support: &[bool],
    ) -> Option<Self> {
        let mut chosen = vec![0u32; families.len()];
        let can_present = |f: usize| present_support.get(f).copied().unwrap_or(false);

        let pick = |required: vk::QueueFlags, chosen: &mut Vec<u32>| -> Option<usize> {
            let family = families
                .iter()
                .enumerate()
                .filter(|(_, props)| props.queue_count > 0 && props.queue_flags.intersects(required))
                .min_by_key(|(i, _)| chosen[*i])
                .map(|(i, _)| i)?;
            chosen[family] += 1;
            Some(family)
        };

        let graphics = pick(vk::QueueFlags::GRAPHICS, &mut chosen)?;
        let compute = pick(vk::QueueFlags::COMPUTE, &mut chosen).unwrap_or(graphics);
        let transfer = pick(
            vk::QueueFlags::TRANSFER | vk::QueueFlags::COMPUTE | vk::QueueFlags::GRAPHICS,
            &mut chosen,
        )
        .unwrap_or(graphics);
        let present = if can_present(graphics) {
            graphics
        } else {
            (0..families.len())
                .filter(|f| can_present(*f))
                .min_by_key(|f| chosen[*f])
                .unwrap_or(graphics)
        };

        let picks = [graphics, compute, transfer, present];
        let mut support = QueueSupport {
            family: [0; QueueId::COUNT],
            index: [0; QueueId::COUNT],
            caps: [QueueCaps::new(vk::QueueFlags::empty(), false); QueueId::COUNT],
        };
        let mut used = vec![0u32; families.len()];
        for id in QueueId::ALL {
            let family = picks[id.index()];
            let props = &families[family];
            support.family[id.index()] = family as u32;
            //present shares the graphics queue itself, everything else gets its own queue while the family has one
            support.index[id.index()] = if id == QueueId::Present && family == graphics {
                support.index[QueueId::Graphics.index()]
            } else {
                let index = used[family].min(props.queue_count.saturating_sub(1));
                used[family] += 1;
                index
            };
            support.caps[id.index()] = QueueCaps::new(props.queue_flags, can_present(family));
        }

        #[cfg(feature = "logging")]
        log::info!(
            "Queue families: graphics={}, compute={}, transfer={}, present={}",
            graphics,
            compute,
            transfer,
            present
        );

        Some(support)
    }

    ///Builds the queue descriptions. `get_queue(family, index)` retrieves the native queue.
    pub fn descs(&self, mut get_queue: impl FnMut(u32, u32) -> vk::Queue) -> Vec<QueueDesc> {
        QueueId::ALL
            .iter()
            .map(|id| {
                let i = id.index();
                QueueDesc {
                    id: *id,
                    family: self.family[i],
                    index: self.index[i],
                    handle: get_queue(self.family[i], self.index[i]),
                    caps: self.caps[i],
                }
            })
            .collect()
    }
}

///One logical queue with its command ring and per-thread recording slots.
pub struct Queue {
    pub id: QueueId,
    pub family: u32,
    pub index: u32,
    pub handle: vk::Queue,
    pub caps: QueueCaps,
    pub(crate) ring: Mutex<CmdRing>,
    ///Currently open command buffer of each recording thread.
    pub(crate) current: Vec<Mutex<CmdBuf>>,
    ///Waits consumed by the next submission on this queue.
    pub(crate) waits: Mutex<SmallVec<[SemaphoreWait; 4]>>,
    ///Shared by all logical queues that submit to the same native queue.
    pub(crate) submit_lock: Arc<Mutex<()>>,
}

impl Queue {
    pub(crate) fn new(
        backend: &dyn Backend,
        desc: &QueueDesc,
        config: &GfxConfig,
        submit_lock: Arc<Mutex<()>>,
    ) -> Result<Self, GfxError> {
        let ring = CmdRing::new(backend, desc.family, config.cmd_ring_size)?;
        Ok(Queue {
            id: desc.id,
            family: desc.family,
            index: desc.index,
            handle: desc.handle,
            caps: desc.caps,
            ring: Mutex::new(ring),
            current: (0..config.thread_count)
                .map(|_| Mutex::new(CmdBuf::default()))
                .collect(),
            waits: Mutex::new(SmallVec::new()),
            submit_lock,
        })
    }

    ///Number of command buffers in this queue's ring.
    pub fn ring_size(&self) -> u32 {
        crate::lock(&self.ring).size()
    }
}
