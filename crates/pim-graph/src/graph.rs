//! # Frame graph
//!
//! Each frame the [FrameGraph] is rebuilt from scratch. Passes are added in submission order through a
//! [FrameRecorder]. While a pass is set up it declares named logical resources and how it uses them. Declarations of
//! the same name within a frame refer to the same resource.
//!
//! When the frame ends, logical resources are mapped onto physical ones. Physical resources live across frames, one
//! copy per frame in flight, and are reused as long as their descriptor still covers the request. A physical resource
//! that was not requested for more than `frames_in_flight` frames is dropped, which hands it to the device's release
//! queue.
//!
//! Then, for every pass in order, each declared use is run through the state tracker and the pass is executed. Passes
//! touching a resource that could not be allocated are skipped. Finally all open command buffers are submitted,
//! ownership transfers first.

use ahash::AHashMap;
use pim::{
    ash::vk,
    queue::{QueueId, QueueMask},
    resources::{BufDesc, Buffer, FrameSet, Image, ImgDesc},
    submit::SubmitId,
    Context, GfxError,
};
use slotmap::SlotMap;
use smallvec::SmallVec;

use crate::{
    error::GraphError,
    pass::{Access, BufferHandle, ImageHandle, PassBuilder, PassContext, RenderPass, Target},
    state::{TrackedBuffer, TrackedImage, Usage},
    subresource::{image_substate, SubRange},
    track::{buffer_state, image_state},
};

slotmap::new_key_type! {
    pub(crate) struct PhysicalBufferKey;
    pub(crate) struct PhysicalImageKey;
}

#[derive(Clone, Copy, Debug)]
pub struct GraphConfig {
    ///Extent display-relative images are resolved against. Usually the swapchain extent.
    pub display_size: vk::Extent2D,
    ///Recording thread the graph uses.
    pub thread: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        GraphConfig {
            display_size: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            thread: 0,
        }
    }
}

impl GraphConfig {
    pub fn with_display_size(mut self, display_size: vk::Extent2D) -> Self {
        self.display_size = display_size;
        self
    }

    pub fn with_thread(mut self, thread: usize) -> Self {
        self.thread = thread;
        self
    }
}

///Descriptors that can be merged within a frame and may be served by a larger physical resource.
pub(crate) trait GraphDesc: Copy {
    fn merge(&mut self, other: &Self, name: &str);
    ///True if a physical resource created from `self` can serve `request`.
    fn covers(&self, request: &Self) -> bool;
}

impl GraphDesc for BufDesc {
    fn merge(&mut self, other: &Self, name: &str) {
        assert!(
            self.memory == other.memory,
            "buffer {name} declared with memory {:?} and {:?}",
            self.memory,
            other.memory
        );
        self.size = self.size.max(other.size);
        self.usage |= other.usage;
    }

    fn covers(&self, request: &Self) -> bool {
        self.memory == request.memory && self.size >= request.size && self.usage.contains(request.usage)
    }
}

impl GraphDesc for ImgDesc {
    fn merge(&mut self, other: &Self, name: &str) {
        assert!(
            self.img_type == other.img_type
                && self.format == other.format
                && self.extent == other.extent
                && self.mip_levels == other.mip_levels
                && self.array_layers == other.array_layers
                && self.samples == other.samples,
            "image {name} declared twice with different shape: {self:?} vs. {other:?}"
        );
        self.usage |= other.usage;
    }

    fn covers(&self, request: &Self) -> bool {
        ImgDesc {
            usage: request.usage,
            ..*self
        } == *request
            && self.usage.contains(request.usage)
    }
}

///Logical resource of the current frame.
#[derive(Clone, Debug)]
pub(crate) struct Logical<D, K> {
    pub(crate) name: String,
    pub(crate) desc: D,
    pub(crate) readers: SmallVec<[usize; 4]>,
    pub(crate) writers: SmallVec<[usize; 4]>,
    pub(crate) queues: QueueMask,
    ///False if the physical resource could not be created.
    pub(crate) available: bool,
    pub(crate) physical: Option<K>,
}

impl<D: GraphDesc, K> Logical<D, K> {
    pub(crate) fn new(name: &str, desc: D) -> Self {
        Logical {
            name: name.to_owned(),
            desc,
            readers: SmallVec::new(),
            writers: SmallVec::new(),
            queues: QueueMask::EMPTY,
            available: true,
            physical: None,
        }
    }

    pub(crate) fn merge(&mut self, desc: &D) {
        self.desc.merge(desc, &self.name);
    }

    pub(crate) fn used_by(&mut self, pass: usize, queue: QueueId, write: bool) {
        let list = if write {
            &mut self.writers
        } else {
            &mut self.readers
        };
        if list.last() != Some(&pass) {
            list.push(pass);
        }
        self.queues.insert(queue);
    }

    fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            readers: self.readers.clone(),
            writers: self.writers.clone(),
            queues: self.queues,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct LogicalTables {
    pub(crate) buffers: Vec<Logical<BufDesc, PhysicalBufferKey>>,
    pub(crate) images: Vec<Logical<ImgDesc, PhysicalImageKey>>,
    pub(crate) buffer_names: AHashMap<String, u32>,
    pub(crate) image_names: AHashMap<String, u32>,
}

impl LogicalTables {
    fn is_available(&self, target: &Target) -> bool {
        match target {
            Target::Buffer(index) => self.buffers[*index as usize].available,
            Target::Image { index, .. } => self.images[*index as usize].available,
        }
    }
}

pub(crate) struct PhysicalBuffer {
    pub(crate) desc: BufDesc,
    pub(crate) set: FrameSet<TrackedBuffer>,
    pub(crate) last_used: u32,
}

pub(crate) struct PhysicalImage {
    pub(crate) desc: ImgDesc,
    pub(crate) set: FrameSet<TrackedImage>,
    pub(crate) last_used: u32,
}

///How the passes of one frame use a logical resource. Passes are identified by the order they were accepted in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceUsage {
    pub readers: SmallVec<[usize; 4]>,
    pub writers: SmallVec<[usize; 4]>,
    pub queues: QueueMask,
}

///Semaphores connecting the frame to the swapchain.
#[derive(Clone, Copy, Debug)]
pub struct FrameSync {
    ///Queue the final submission happens on.
    pub queue: QueueId,
    ///Waited on by the first submission on `queue`.
    pub wait: Option<vk::Semaphore>,
    pub wait_stage: vk::PipelineStageFlags2,
    ///Signaled by the final submission on `queue`.
    pub signal: Option<vk::Semaphore>,
}

impl Default for FrameSync {
    fn default() -> Self {
        FrameSync {
            queue: QueueId::Graphics,
            wait: None,
            wait_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            signal: None,
        }
    }
}

impl FrameSync {
    ///Waits for the swapchain image to be acquired and signals `render_finished` for presentation.
    pub fn present(acquired: vk::Semaphore, render_finished: vk::Semaphore) -> Self {
        FrameSync {
            wait: Some(acquired),
            signal: Some(render_finished),
            ..Default::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.wait.is_none() && self.signal.is_none()
    }
}

///Outcome of [FrameRecorder::end].
#[derive(Debug, Default)]
pub struct FrameReport {
    ///Every submission of the frame, in submission order.
    pub submissions: SmallVec<[SubmitId; QueueId::COUNT]>,
    pub executed: Vec<String>,
    ///Passes skipped because a resource they declared could not be allocated.
    pub skipped: Vec<String>,
    ///Barriers recorded by the state tracker. A transfer counts once per queue.
    pub barriers: usize,
    ///Physical resources that could not be allocated.
    pub failures: Vec<GraphError>,
}

pub struct FrameGraph {
    config: GraphConfig,
    buffers: SlotMap<PhysicalBufferKey, PhysicalBuffer>,
    images: SlotMap<PhysicalImageKey, PhysicalImage>,
    buffer_names: AHashMap<String, PhysicalBufferKey>,
    image_names: AHashMap<String, PhysicalImageKey>,
}

impl FrameGraph {
    pub fn new(config: GraphConfig) -> Self {
        FrameGraph {
            config,
            buffers: SlotMap::with_key(),
            images: SlotMap::with_key(),
            buffer_names: AHashMap::default(),
            image_names: AHashMap::default(),
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    ///Changes the extent display-relative images resolve against. Images of the old size are reallocated when next
    /// requested.
    pub fn set_display_size(&mut self, display_size: vk::Extent2D) {
        self.config.display_size = display_size;
    }

    pub fn physical_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn physical_images(&self) -> usize {
        self.images.len()
    }

    ///Starts a new frame on `ctx`. Advances the context's frame and drops stale physical resources.
    pub fn begin<'a>(&'a mut self, ctx: &'a Context) -> FrameRecorder<'a> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let frame = ctx.begin_frame();
        self.drop_stale(frame, ctx.frames_in_flight());
        //ids submitted outside a frame are not reported
        ctx.cmd_take_submitted(self.config.thread);
        FrameRecorder {
            graph: self,
            ctx,
            frame,
            tables: LogicalTables::default(),
            passes: Vec::new(),
        }
    }

    fn drop_stale(&mut self, frame: u32, frames_in_flight: u32) {
        let is_stale = |last_used: u32| frame.wrapping_sub(last_used) > frames_in_flight;
        self.buffers.retain(|_key, physical| !is_stale(physical.last_used));
        self.images.retain(|_key, physical| !is_stale(physical.last_used));
        self.buffer_names.retain(|_name, key| self.buffers.contains_key(*key));
        self.image_names.retain(|_name, key| self.images.contains_key(*key));
    }

    fn physical_buffer(
        &mut self,
        ctx: &Context,
        name: &str,
        desc: BufDesc,
        frame: u32,
    ) -> Result<PhysicalBufferKey, GraphError> {
        if let Some(key) = self.buffer_names.remove(name) {
            if let Some(physical) = self.buffers.get_mut(key) {
                if physical.desc.covers(&desc) {
                    physical.last_used = frame;
                    self.buffer_names.insert(name.to_owned(), key);
                    return Ok(key);
                }
                #[cfg(feature = "logging")]
                log::warn!(
                    "Buffer {name} changed from {:?} to {desc:?}, reallocating",
                    physical.desc
                );
            }
            self.buffers.remove(key);
        }

        let set = FrameSet::try_new(ctx.frames_in_flight(), |copy| {
            Buffer::new(&ctx.device, desc, &format!("{name}[{copy}]")).map(TrackedBuffer::new)
        })
        .map_err(|source| allocation_failure(name, source))?;
        let key = self.buffers.insert(PhysicalBuffer {
            desc,
            set,
            last_used: frame,
        });
        self.buffer_names.insert(name.to_owned(), key);
        Ok(key)
    }

    fn physical_image(
        &mut self,
        ctx: &Context,
        name: &str,
        desc: ImgDesc,
        frame: u32,
    ) -> Result<PhysicalImageKey, GraphError> {
        if let Some(key) = self.image_names.remove(name) {
            if let Some(physical) = self.images.get_mut(key) {
                if physical.desc.covers(&desc) {
                    physical.last_used = frame;
                    self.image_names.insert(name.to_owned(), key);
                    return Ok(key);
                }
                #[cfg(feature = "logging")]
                log::warn!(
                    "Image {name} changed from {:?} to {desc:?}, reallocating",
                    physical.desc
                );
            }
            self.images.remove(key);
        }

        let set = FrameSet::try_new(ctx.frames_in_flight(), |copy| {
            Image::new(&ctx.device, desc, &format!("{name}[{copy}]")).map(TrackedImage::new)
        })
        .map_err(|source| allocation_failure(name, source))?;
        let key = self.images.insert(PhysicalImage {
            desc,
            set,
            last_used: frame,
        });
        self.image_names.insert(name.to_owned(), key);
        Ok(key)
    }
}

fn allocation_failure(name: &str, source: GfxError) -> GraphError {
    #[cfg(feature = "logging")]
    log::error!("Could not allocate {name}: {source}");
    GraphError::Allocation {
        name: name.to_owned(),
        source,
    }
}

struct PassEntry<'a> {
    pass: &'a mut dyn RenderPass,
    queue: QueueId,
    accesses: SmallVec<[Access; 8]>,
}

///Collects the passes of one frame. Created by [FrameGraph::begin].
pub struct FrameRecorder<'a> {
    graph: &'a mut FrameGraph,
    ctx: &'a Context,
    frame: u32,
    tables: LogicalTables,
    passes: Vec<PassEntry<'a>>,
}

impl<'a> FrameRecorder<'a> {
    pub fn frame(&self) -> u32 {
        self.frame
    }

    ///Number of accepted passes.
    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    ///Runs the pass's setup. If setup returns false the pass and everything it declared is dropped for this frame.
    pub fn add_pass(&mut self, pass: &'a mut dyn RenderPass) -> bool {
        let snapshot = self.tables.clone();
        let queue = pass.queue();
        let mut accesses = SmallVec::new();
        let accepted = {
            let mut builder = PassBuilder {
                tables: &mut self.tables,
                accesses: &mut accesses,
                pass: self.passes.len(),
                queue,
                frame: self.frame,
                display_size: self.graph.config.display_size,
            };
            pass.setup(&mut builder)
        };

        if !accepted {
            #[cfg(feature = "logging")]
            log::trace!("Pass {} opted out of frame {}", pass.name(), self.frame);
            self.tables = snapshot;
            return false;
        }

        self.passes.push(PassEntry {
            pass,
            queue,
            accesses,
        });
        true
    }

    ///Handle of the logical buffer declared as `name` in this frame, if any pass declared it.
    pub fn buffer_handle(&self, name: &str) -> Option<BufferHandle> {
        self.tables.buffer_names.get(name).map(|index| BufferHandle {
            index: *index,
            frame: self.frame,
        })
    }

    pub fn image_handle(&self, name: &str) -> Option<ImageHandle> {
        self.tables.image_names.get(name).map(|index| ImageHandle {
            index: *index,
            frame: self.frame,
        })
    }

    pub fn buffer_usage(&self, handle: BufferHandle) -> ResourceUsage {
        assert!(handle.frame == self.frame, "buffer handle {handle:?} is from another frame");
        self.tables.buffers[handle.index as usize].usage()
    }

    pub fn image_usage(&self, handle: ImageHandle) -> ResourceUsage {
        assert!(handle.frame == self.frame, "image handle {handle:?} is from another frame");
        self.tables.images[handle.index as usize].usage()
    }

    ///Allocates, tracks, executes and submits the frame.
    pub fn end(self, sync: FrameSync) -> Result<FrameReport, GraphError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let FrameRecorder {
            graph,
            ctx,
            frame,
            mut tables,
            mut passes,
        } = self;
        let tid = graph.config.thread;
        let mut report = FrameReport::default();

        for logical in tables.buffers.iter_mut() {
            match graph.physical_buffer(ctx, &logical.name, logical.desc, frame) {
                Ok(key) => logical.physical = Some(key),
                Err(err) => {
                    logical.available = false;
                    report.failures.push(err);
                }
            }
        }
        for logical in tables.images.iter_mut() {
            match graph.physical_image(ctx, &logical.name, logical.desc, frame) {
                Ok(key) => logical.physical = Some(key),
                Err(err) => {
                    logical.available = false;
                    report.failures.push(err);
                }
            }
        }

        if let Some(semaphore) = sync.wait {
            ctx.queue_wait(sync.queue, semaphore, sync.wait_stage);
        }

        for entry in passes.iter_mut() {
            if !entry.accesses.iter().all(|access| tables.is_available(&access.target)) {
                #[cfg(feature = "logging")]
                log::warn!("Skipping pass {}, a resource is unavailable", entry.pass.name());
                report.skipped.push(entry.pass.name().to_owned());
                continue;
            }

            for access in entry.accesses.iter() {
                report.barriers += track_access(ctx, tid, graph, &tables, frame, entry.queue, access)?;
            }

            let cmd = ctx.cmd_get(entry.queue, tid)?;
            #[cfg(feature = "logging")]
            log::trace!("Executing {} on {}", entry.pass.name(), entry.queue);
            let mut pass_ctx = PassContext {
                ctx,
                cmd,
                frame,
                tables: &tables,
                buffers: &graph.buffers,
                images: &graph.images,
            };
            entry.pass.execute(&mut pass_ctx);
            report.executed.push(entry.pass.name().to_owned());
        }

        ctx.cmd_flush_transfers(tid)?;
        for id in QueueId::ALL {
            if id == sync.queue && !sync.is_empty() {
                continue;
            }
            ctx.cmd_flush(id, tid)?;
        }
        if !sync.is_empty() {
            let cmd = ctx.cmd_get(sync.queue, tid)?;
            ctx.cmd_submit(cmd, None, sync.signal)?;
        }
        report.submissions = ctx.cmd_take_submitted(tid).into_iter().collect();

        Ok(report)
    }
}

///Runs one declared use through the state tracker. Returns the number of recorded barriers.
fn track_access(
    ctx: &Context,
    tid: usize,
    graph: &mut FrameGraph,
    tables: &LogicalTables,
    frame: u32,
    queue: QueueId,
    access: &Access,
) -> Result<usize, GfxError> {
    let usage = Usage {
        queue,
        stage: access.stage,
        access: access.access,
        layout: access.layout,
    };
    match access.target {
        Target::Buffer(index) => {
            let logical = &tables.buffers[index as usize];
            let Some(physical) = logical.physical.and_then(|key| graph.buffers.get_mut(key)) else {
                panic!("buffer {} has no physical resource", logical.name);
            };
            Ok(buffer_state(ctx, tid, physical.set.current_mut(frame), usage)?.barrier_count())
        }
        Target::Image { index, range } => {
            let logical = &tables.images[index as usize];
            let Some(physical) = logical.physical.and_then(|key| graph.images.get_mut(key)) else {
                panic!("image {} has no physical resource", logical.name);
            };
            let tracked = physical.set.current_mut(frame);
            match range {
                Some(range) => image_substate(ctx, tid, tracked, usage, range),
                None if tracked.state.is_uniform() => {
                    Ok(image_state(ctx, tid, tracked, usage)?.barrier_count())
                }
                None => {
                    let range = SubRange::all(tracked);
                    image_substate(ctx, tid, tracked, usage, range)
                }
            }
        }
    }
}
