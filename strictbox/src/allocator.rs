//! First-fit allocator over the fixed heap region.
//!
//! Every block starts with a [`Header`] and the headers form a doubly linked list sorted by address. Blocks are
//! never given back to the system: freeing a block flips its flag and merges it with free neighbours, allocating
//! splits the first block large enough. The heap only grows through [`Heap::extend`], so once the region is reserved
//! no operation of this module performs a syscall.

use core::ffi::c_void;
use core::mem::size_of;
use core::ptr::{self, NonNull};

use bitflags::bitflags;

use crate::error::AllocError;
use crate::heap::Heap;

/// Size of a block header. Block sizes are always a multiple of it, which keeps payloads aligned.
pub const HEADER_SIZE: usize = size_of::<Header>();

/// Minimum amount of memory requested from the heap when it must grow.
pub const MIN_EXTENSION: usize = 64 * 1024;

/// Link value of the first and last headers.
const NIL: usize = usize::MAX;

// ———————————————————————————————— Headers ————————————————————————————————— //

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct BlockFlags: usize {
        const ALLOCATED = 1;
    }
}

/// Header found at the beginning of each block. Links are heap offsets of the neighbouring headers.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Header {
    prev: usize,
    next: usize,
    /// Total size of the block, header included.
    size: usize,
    flags: BlockFlags,
}

impl Header {
    fn prev(&self) -> Option<Block> {
        (self.prev != NIL).then_some(Block(self.prev))
    }

    fn next(&self) -> Option<Block> {
        (self.next != NIL).then_some(Block(self.next))
    }

    fn is_allocated(&self) -> bool {
        self.flags.contains(BlockFlags::ALLOCATED)
    }
}

/// Handle to a block: the heap offset of its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block(usize);

impl Block {
    pub fn offset(self) -> usize {
        self.0
    }
}

fn link(block: Option<Block>) -> usize {
    block.map_or(NIL, Block::offset)
}

/// Snapshot of a block, as returned by [`Allocator::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub offset: usize,
    pub size: usize,
    pub allocated: bool,
}

// ——————————————————————————————— Allocator ——————————————————————————————— //

pub struct Allocator {
    heap: Heap,
    head: Option<Block>,
    tail: Option<Block>,
}

impl Allocator {
    pub fn new(heap: Heap) -> Self {
        Allocator {
            heap,
            head: None,
            tail: None,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Allocates a block with at least `size` usable bytes and returns the address of its payload.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let block = self.allocate_block(required_size(size)?)?;
        Ok(self.payload(block))
    }

    /// Allocates `count * size` zeroed bytes.
    ///
    /// The multiplication wraps on overflow, in which case the returned buffer is smaller than requested.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = count.wrapping_mul(size);
        let buffer = self.allocate(total)?;
        // SAFETY: the payload has at least `total` bytes.
        unsafe { ptr::write_bytes(buffer.as_ptr(), 0, total) };
        Ok(buffer)
    }

    /// Moves an allocation to a fresh block of `size` bytes.
    ///
    /// A null `ptr` allocates, a zero `size` frees `ptr` and returns `None`. Otherwise the contents are copied up to
    /// the smaller of both sizes and the old block is freed; blocks never grow in place.
    pub fn resize(
        &mut self,
        ptr: *mut c_void,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        if ptr.is_null() {
            return self.allocate(size).map(Some);
        }
        if size == 0 {
            self.free(ptr)?;
            return Ok(None);
        }

        let old = self.live_block(ptr)?;
        let usable = self.header(old).size - HEADER_SIZE;
        let new = self.allocate(size)?;

        // SAFETY: both payloads are live, distinct blocks of at least `usable.min(size)` bytes.
        unsafe { ptr::copy_nonoverlapping(ptr.cast::<u8>(), new.as_ptr(), usable.min(size)) };
        self.release(old);

        Ok(Some(new))
    }

    /// Frees the allocation at `ptr`. A null `ptr` is ignored.
    ///
    /// A pointer that is not a live allocation is rejected and leaves the heap untouched.
    pub fn free(&mut self, ptr: *mut c_void) -> Result<(), AllocError> {
        if ptr.is_null() {
            return Ok(());
        }

        let block = self.live_block(ptr)?;
        self.release(block);
        Ok(())
    }

    /// Allocates `size` bytes whose address is a multiple of `align`.
    pub fn allocate_aligned(&mut self, align: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(align));
        }
        if align <= HEADER_SIZE {
            return self.allocate(size);
        }

        let required = required_size(size)?;
        let padded = required_size(size.checked_add(align).ok_or(AllocError::OutOfMemory)?)?;
        let block = self.allocate_block(padded)?;

        let addr = self.payload(block).as_ptr() as usize;
        let gap = addr.next_multiple_of(align) - addr;
        if gap == 0 {
            self.split(block, required);
            return Ok(self.payload(block));
        }
        debug_assert!(gap % HEADER_SIZE == 0);

        // Carve the unaligned prefix off as a free block.
        let header = self.header(block);
        let aligned = Block(block.0 + gap);
        self.set_header(
            aligned,
            Header {
                prev: block.0,
                next: header.next,
                size: header.size - gap,
                flags: BlockFlags::ALLOCATED,
            },
        );
        match header.next() {
            Some(next) => self.update(next, |h| h.prev = aligned.0),
            None => self.tail = Some(aligned),
        }
        self.update(block, |h| {
            h.size = gap;
            h.next = aligned.0;
            h.flags.remove(BlockFlags::ALLOCATED);
        });
        if let Some(prev) = header.prev() {
            self.coalesce(prev);
        }

        self.split(aligned, required);
        Ok(self.payload(aligned))
    }

    /// Number of usable bytes of the allocation at `ptr`.
    pub fn usable_size(&self, ptr: *mut c_void) -> Result<usize, AllocError> {
        let block = self.live_block(ptr)?;
        Ok(self.header(block).size - HEADER_SIZE)
    }

    /// Moves the break on behalf of code other than the allocator and returns the previous break address.
    ///
    /// The break is never moved back into the allocator's blocks.
    pub fn sbrk(&mut self, increment: isize) -> Result<NonNull<u8>, AllocError> {
        let floor = self.tail.map_or(0, |tail| tail.0 + self.header(tail).size);
        if increment < 0 && self.heap.brk() - floor < increment.unsigned_abs() {
            return Err(AllocError::OutOfMemory);
        }

        let previous = self.heap.extend(increment)?;
        Ok(self.addr(previous))
    }

    /// Iterates over all blocks, in address order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.cursor().map(|(block, header)| BlockInfo {
            offset: block.0,
            size: header.size,
            allocated: header.is_allocated(),
        })
    }

    // ———————————————————————————— Block list ————————————————————————————— //

    fn allocate_block(&mut self, required: usize) -> Result<Block, AllocError> {
        let block = match self.find_free(required) {
            Some(block) => block,
            None => self.grow(required)?,
        };

        self.split(block, required);
        self.update(block, |h| h.flags.insert(BlockFlags::ALLOCATED));

        Ok(block)
    }

    fn find_free(&self, required: usize) -> Option<Block> {
        self.cursor()
            .find(|(_, header)| !header.is_allocated() && header.size >= required)
            .map(|(block, _)| block)
    }

    /// Appends a new free block of at least `required` bytes at the tail of the list.
    fn grow(&mut self, required: usize) -> Result<Block, AllocError> {
        // Someone else may have moved the break through `sbrk`; headers must stay aligned.
        let brk = self.heap.brk();
        let padding = brk.next_multiple_of(HEADER_SIZE) - brk;

        let size = required.max(MIN_EXTENSION);
        let (offset, size) = match self.extend(padding, size) {
            Ok(offset) => (offset, size),
            // The remaining capacity cannot hold a whole extension quantum anymore.
            Err(_) => (self.extend(padding, required)?, required),
        };

        let block = Block(offset);
        self.set_header(
            block,
            Header {
                prev: link(self.tail),
                next: NIL,
                size,
                flags: BlockFlags::empty(),
            },
        );
        match self.tail {
            Some(tail) => self.update(tail, |h| h.next = block.0),
            None => self.head = Some(block),
        }
        self.tail = Some(block);

        log::trace!("Heap extended by {size} bytes at offset {offset:#x}");
        Ok(block)
    }

    /// Advances the break by `padding + size` and returns the offset right after the padding.
    fn extend(&mut self, padding: usize, size: usize) -> Result<usize, AllocError> {
        let increment = padding
            .checked_add(size)
            .and_then(|n| isize::try_from(n).ok())
            .ok_or(AllocError::OutOfMemory)?;
        Ok(self.heap.extend(increment)? + padding)
    }

    /// Shrinks `block` to `required` bytes if what is left over can hold more than a header, and turns the left
    /// over into a free block.
    fn split(&mut self, block: Block, required: usize) {
        let header = self.header(block);
        let left_over = header.size - required;
        if left_over <= HEADER_SIZE {
            return;
        }

        let excess = Block(block.0 + required);
        self.set_header(
            excess,
            Header {
                prev: block.0,
                next: header.next,
                size: left_over,
                flags: BlockFlags::empty(),
            },
        );
        match header.next() {
            Some(next) => self.update(next, |h| h.prev = excess.0),
            None => self.tail = Some(excess),
        }
        self.update(block, |h| {
            h.size = required;
            h.next = excess.0;
        });

        self.coalesce(excess);
    }

    fn release(&mut self, block: Block) {
        self.update(block, |h| h.flags.remove(BlockFlags::ALLOCATED));

        self.coalesce(block);
        if let Some(prev) = self.header(block).prev() {
            self.coalesce(prev);
        }
    }

    /// Absorbs the successor of `block` if both are free and adjacent. No-op otherwise.
    fn coalesce(&mut self, block: Block) {
        let header = self.header(block);
        let Some(next) = header.next() else {
            return;
        };
        let successor = self.header(next);
        if header.is_allocated() || successor.is_allocated() || block.0 + header.size != next.0 {
            return;
        }

        match successor.next() {
            Some(after) => self.update(after, |h| h.prev = block.0),
            None => self.tail = Some(block),
        }
        self.update(block, |h| {
            h.size += successor.size;
            h.next = successor.next;
        });
    }

    /// Finds the allocated block whose payload starts at `ptr`.
    fn live_block(&self, ptr: *mut c_void) -> Result<Block, AllocError> {
        let invalid = AllocError::InvalidPointer(ptr as usize);

        let header_addr = ptr.cast::<u8>().wrapping_sub(HEADER_SIZE);
        let offset = self
            .heap
            .offset_of(header_addr)
            .filter(|offset| offset % HEADER_SIZE == 0)
            .ok_or(invalid)?;
        let header: Header = self.heap.read(offset).ok_or(invalid)?;

        let in_bounds = offset
            .checked_add(header.size)
            .is_some_and(|end| end <= self.heap.brk());
        // A word that merely looks like a header is not linked from its neighbour.
        let linked = match header.prev() {
            Some(prev) => self.heap.read::<Header>(prev.0).is_some_and(|prev| prev.next == offset),
            None => self.head == Some(Block(offset)),
        };
        if header.is_allocated() && header.size >= HEADER_SIZE && in_bounds && linked {
            Ok(Block(offset))
        } else {
            Err(invalid)
        }
    }

    // ——————————————————————————— Header access ——————————————————————————— //

    fn header(&self, block: Block) -> Header {
        match self.heap.read(block.0) {
            Some(header) => header,
            None => corrupted(block),
        }
    }

    fn set_header(&mut self, block: Block, header: Header) {
        if self.heap.write(block.0, header).is_none() {
            corrupted(block);
        }
    }

    fn update(&mut self, block: Block, f: impl FnOnce(&mut Header)) {
        let mut header = self.header(block);
        f(&mut header);
        self.set_header(block, header);
    }

    fn payload(&self, block: Block) -> NonNull<u8> {
        self.addr(block.0 + HEADER_SIZE)
    }

    fn addr(&self, offset: usize) -> NonNull<u8> {
        // SAFETY: the heap base is not null and offsets never exceed the capacity, so this does not wrap.
        unsafe { NonNull::new_unchecked(self.heap.addr(offset)) }
    }

    fn cursor(&self) -> Cursor<'_> {
        Cursor {
            allocator: self,
            next: self.head,
        }
    }
}

/// Size of the block needed to hold `size` bytes of payload.
fn required_size(size: usize) -> Result<usize, AllocError> {
    size.checked_add(HEADER_SIZE)
        .and_then(|size| size.checked_next_multiple_of(HEADER_SIZE))
        .ok_or(AllocError::OutOfMemory)
}

#[cold]
fn corrupted(block: Block) -> ! {
    panic!("Heap block header at offset {:#x} is out of bounds", block.0);
}

struct Cursor<'a> {
    allocator: &'a Allocator,
    next: Option<Block>,
}

impl Iterator for Cursor<'_> {
    type Item = (Block, Header);

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next?;
        let header = self.allocator.header(block);
        self.next = header.next();
        Some((block, header))
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
