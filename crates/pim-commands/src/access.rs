//! Read/write classification of [AccessFlags2](vk::AccessFlags2).
//!
//! Every access bit is either a read or a write. The generic `MEMORY_*` and `SHADER_*` bits are classified like their
//! specific counterparts.

use pim::ash::vk;

const fn flags(bits: &[vk::AccessFlags2]) -> vk::AccessFlags2 {
    let mut raw = 0;
    let mut i = 0;
    while i < bits.len() {
        raw |= bits[i].as_raw();
        i += 1;
    }
    vk::AccessFlags2::from_raw(raw)
}

///All access bits that only read memory.
pub const READ_ACCESS: vk::AccessFlags2 = flags(&[
    vk::AccessFlags2::INDIRECT_COMMAND_READ,
    vk::AccessFlags2::INDEX_READ,
    vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
    vk::AccessFlags2::UNIFORM_READ,
    vk::AccessFlags2::INPUT_ATTACHMENT_READ,
    vk::AccessFlags2::SHADER_READ,
    vk::AccessFlags2::SHADER_SAMPLED_READ,
    vk::AccessFlags2::SHADER_STORAGE_READ,
    vk::AccessFlags2::COLOR_ATTACHMENT_READ,
    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
    vk::AccessFlags2::TRANSFER_READ,
    vk::AccessFlags2::HOST_READ,
    vk::AccessFlags2::MEMORY_READ,
    vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
]);

///All access bits that write memory.
pub const WRITE_ACCESS: vk::AccessFlags2 = flags(&[
    vk::AccessFlags2::SHADER_WRITE,
    vk::AccessFlags2::SHADER_STORAGE_WRITE,
    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
    vk::AccessFlags2::TRANSFER_WRITE,
    vk::AccessFlags2::HOST_WRITE,
    vk::AccessFlags2::MEMORY_WRITE,
    vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
]);

pub fn has_read(access: vk::AccessFlags2) -> bool {
    access.intersects(READ_ACCESS)
}

pub fn has_write(access: vk::AccessFlags2) -> bool {
    access.intersects(WRITE_ACCESS)
}

///Hazard test between a recorded access `prev` and a requested access `req` on the same queue.
///
/// A barrier is needed if the layout changes, if anything follows a write (RaW, WaW), or if a write follows a read
/// (WaR). Two reads in the same layout never need one.
pub fn needs_barrier(prev: vk::AccessFlags2, req: vk::AccessFlags2, layout_changed: bool) -> bool {
    let prev_write = has_write(prev);
    let prev_read = has_read(prev);
    let req_write = has_write(req);
    let req_read = has_read(req);

    layout_changed || (prev_write && (req_read || req_write)) || (prev_read && req_write)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_and_write_are_disjoint() {
        assert!(!READ_ACCESS.intersects(WRITE_ACCESS));
    }

    #[test]
    fn classification() {
        assert!(has_read(vk::AccessFlags2::SHADER_SAMPLED_READ));
        assert!(!has_write(vk::AccessFlags2::SHADER_SAMPLED_READ));
        assert!(has_write(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE));
        let rw = vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE;
        assert!(has_read(rw) && has_write(rw));
        assert!(!has_read(vk::AccessFlags2::NONE) && !has_write(vk::AccessFlags2::NONE));
    }

    #[test]
    fn hazards() {
        let read = vk::AccessFlags2::SHADER_READ;
        let write = vk::AccessFlags2::SHADER_WRITE;

        //RaR
        assert!(!needs_barrier(read, read, false));
        //RaW, WaW, WaR
        assert!(needs_barrier(write, read, false));
        assert!(needs_barrier(write, write, false));
        assert!(needs_barrier(read, write, false));
        //layout always wins
        assert!(needs_barrier(read, read, true));
        //nothing recorded yet
        assert!(!needs_barrier(vk::AccessFlags2::NONE, write, false));
    }
}
