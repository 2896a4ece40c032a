///Static parameters of a [Context](crate::Context). Set once at device bring-up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GfxConfig {
    ///Number of frames whose GPU work may be unretired at the same time.
    pub frames_in_flight: u32,
    ///Command buffers per queue ring. Must be a power of two.
    pub cmd_ring_size: u32,
    ///Number of threads that may record in parallel. Thread ids passed to the
    /// recorder must be smaller than this.
    pub thread_count: usize,
    ///Once this many releases are pending the queue is force-finalized.
    pub max_pending_releases: usize,
}

impl Default for GfxConfig {
    fn default() -> Self {
        GfxConfig {
            frames_in_flight: 3,
            cmd_ring_size: 32,
            thread_count: 1,
            max_pending_releases: 1024,
        }
    }
}

impl GfxConfig {
    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_cmd_ring_size(mut self, size: u32) -> Self {
        self.cmd_ring_size = size;
        self
    }

    pub fn with_thread_count(mut self, count: usize) -> Self {
        self.thread_count = count;
        self
    }

    pub fn with_max_pending_releases(mut self, max: usize) -> Self {
        self.max_pending_releases = max;
        self
    }

    ///Panics if the configuration can not be used to create a context.
    pub fn validate(&self) {
        assert!(self.frames_in_flight > 0, "at least one frame must be in flight");
        assert!(
            self.cmd_ring_size.is_power_of_two(),
            "command ring size must be a power of two, was {}",
            self.cmd_ring_size
        );
        assert!(self.thread_count > 0, "at least one recording thread is needed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        GfxConfig::default().validate();
    }

    #[test]
    #[should_panic]
    fn ring_must_be_power_of_two() {
        GfxConfig::default().with_cmd_ring_size(12).validate();
    }
}
