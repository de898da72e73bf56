//! Return buffers for host-to-guest data transfer.
//!
//! Strings and bytes handed to the guest are copied into buffers the guest
//! allocated with its own `malloc`. Buffers are never freed while the
//! instance lives; every invocation rewinds them to the start, and a reset
//! instance starts with a new list.
//!
//! [`ReturnBuffers`] only does the bookkeeping. When no buffer fits, the
//! caller asks guest `malloc` for [`ReturnBuffers::next_buffer_size`] bytes
//! and appends the result with [`ReturnBuffers::push`].

use ext_engine_common::AbiError;

/// A guest-allocated buffer and its fill level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedBuffer {
    /// Guest address of the buffer.
    pub addr: u32,
    /// Bytes handed out during the current invocation.
    pub offset: u32,
    /// Total size of the buffer.
    pub capacity: u32,
}

impl AllocatedBuffer {
    fn remaining(&self) -> u32 {
        self.capacity - self.offset
    }
}

/// Ordered list of return buffers owned by one module instance.
#[derive(Debug, Clone)]
pub struct ReturnBuffers {
    buffers: Vec<AllocatedBuffer>,
    growth_increment: u32,
}

impl ReturnBuffers {
    /// Create an empty buffer list.
    ///
    /// New buffers are requested with at least `growth_increment` bytes.
    pub fn new(growth_increment: u32) -> Self {
        Self {
            buffers: Vec::new(),
            growth_increment,
        }
    }

    /// Rewind every buffer; called at the start of each invocation.
    pub fn reset(&mut self) {
        for buffer in &mut self.buffers {
            buffer.offset = 0;
        }
    }

    /// Carve `size` bytes from the first buffer with enough room.
    ///
    /// Returns the guest address of the region, or `None` if a new buffer is
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`AbiError::MemoryOutOfRange`] if the region would end past
    /// the 32-bit address space.
    pub fn try_allocate(&mut self, size: u32) -> Result<Option<u32>, AbiError> {
        let Some(buffer) = self.buffers.iter_mut().find(|b| b.remaining() >= size) else {
            return Ok(None);
        };
        let addr = buffer
            .addr
            .checked_add(buffer.offset)
            .ok_or(AbiError::MemoryOutOfRange)?;
        addr.checked_add(size).ok_or(AbiError::MemoryOutOfRange)?;
        buffer.offset = buffer
            .offset
            .checked_add(size)
            .ok_or(AbiError::MemoryOutOfRange)?;
        Ok(Some(addr))
    }

    /// Size to request from guest `malloc` for a region of `size` bytes.
    pub fn next_buffer_size(&self, size: u32) -> u32 {
        size.max(self.growth_increment)
    }

    /// Append a buffer the guest just allocated.
    pub fn push(&mut self, addr: u32, capacity: u32) {
        self.buffers.push(AllocatedBuffer {
            addr,
            offset: 0,
            capacity,
        });
    }

    /// Number of buffers allocated so far.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Returns `true` if no buffer has been allocated.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// The buffers in allocation order.
    pub fn buffers(&self) -> &[AllocatedBuffer] {
        &self.buffers
    }
}

/// Pack a guest region into the 64-bit return value `(addr << 32) | len`.
pub fn pack_region(addr: u32, len: u32) -> u64 {
    (u64::from(addr) << 32) | u64::from(len)
}

/// Split a packed region into `(addr, len)`.
pub fn unpack_region(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_within_buffer() {
        let mut buffers = ReturnBuffers::new(1024);
        buffers.push(0x1000, 100);

        assert_eq!(buffers.try_allocate(10), Ok(Some(0x1000)));
        assert_eq!(buffers.try_allocate(20), Ok(Some(0x100a)));
        assert_eq!(buffers.buffers()[0].offset, 30);
    }

    #[test]
    fn test_first_fit_across_buffers() {
        let mut buffers = ReturnBuffers::new(16);
        buffers.push(0x1000, 16);
        buffers.push(0x2000, 64);

        assert_eq!(buffers.try_allocate(32), Ok(Some(0x2000)));
        assert_eq!(buffers.try_allocate(8), Ok(Some(0x1000)));
        assert_eq!(buffers.try_allocate(8), Ok(Some(0x1008)));
        assert_eq!(buffers.try_allocate(8), Ok(Some(0x2020)));
    }

    #[test]
    fn test_no_room_needs_growth() {
        let mut buffers = ReturnBuffers::new(1024);
        assert_eq!(buffers.try_allocate(0), Ok(None));

        buffers.push(0x1000, 16);
        assert_eq!(buffers.try_allocate(32), Ok(None));
        assert_eq!(buffers.next_buffer_size(32), 1024);
        assert_eq!(buffers.next_buffer_size(4096), 4096);

        buffers.push(0x8000, 1024);
        assert_eq!(buffers.try_allocate(32), Ok(Some(0x8000)));
        assert_eq!(buffers.len(), 2);
    }

    #[test]
    fn test_reset_reuses_buffers() {
        let mut buffers = ReturnBuffers::new(64);
        buffers.push(0x1000, 64);

        buffers.try_allocate(64).unwrap();
        assert_eq!(buffers.try_allocate(1), Ok(None));

        buffers.reset();
        assert_eq!(buffers.try_allocate(64), Ok(Some(0x1000)));
        assert_eq!(buffers.len(), 1);
    }

    #[test]
    fn test_region_past_address_space() {
        let mut buffers = ReturnBuffers::new(64);
        buffers.push(u32::MAX - 8, 64);

        assert_eq!(buffers.try_allocate(8), Ok(Some(u32::MAX - 8)));
        assert_eq!(buffers.try_allocate(16), Err(AbiError::MemoryOutOfRange));
        // A failed request leaves the fill level alone
        assert_eq!(buffers.buffers()[0].offset, 8);
    }

    #[test]
    fn test_pack_region() {
        let packed = pack_region(0x0001_0000, 5);
        assert_eq!(packed, 0x0001_0000_0000_0005);
        assert_eq!(unpack_region(packed), (0x0001_0000, 5));
    }
}
