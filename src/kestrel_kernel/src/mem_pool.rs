//! Fixed-block memory pools
//!
//! A memory pool carves its storage into equally-sized blocks. Freed blocks
//! are kept on a free list threaded through the block storage itself. An
//! empty pool blocks allocating tasks like an empty queue; `give` with a
//! blocked allocator hands the block over directly.
use core::{fmt, ptr::NonNull};

use crate::{
    error::{
        AbortReason, GetError, KillError, PollError, UpdateError, WaitError, WaitTimeoutError,
    },
    klock, state, task, timeout,
    utils::{Init, StorageCell},
    wait::{WaitPayload, WaitQueue},
    KernelTraits, PortThreading, UTicks,
};

/// Offset value terminating the free list.
const NIL: usize = usize::MAX;

/// *Memory pool control block* — a pool of fixed-size blocks.
pub struct MemPoolCb<Traits: PortThreading> {
    /// The distance between blocks: the block size rounded up so that a
    /// free-list link fits and blocks stay machine-word aligned relative to
    /// the storage base.
    stride: usize,

    /// The block storage. For the blocks to be usable for arbitrary data,
    /// the storage itself should be machine-word aligned.
    storage: &'static StorageCell<[u8]>,

    /// The byte offset of the first free block, or [`NIL`].
    free_head: klock::CpuLockCell<Traits, usize>,

    /// The byte offset of the first block never handed out. Blocks are
    /// carved from the storage on demand.
    next_uncarved: klock::CpuLockCell<Traits, usize>,

    pub(super) wait_queue: WaitQueue<Traits>,
}

// Safety: The contents are only mutated with CPU Lock active
unsafe impl<Traits: PortThreading> Sync for MemPoolCb<Traits> {}

impl<Traits: PortThreading> MemPoolCb<Traits> {
    /// Construct a `MemPoolCb` handing out blocks of at least `block_size`
    /// bytes from `storage`.
    pub const fn new(block_size: usize, storage: &'static StorageCell<[u8]>) -> Self {
        assert!(block_size >= 1);
        let align = core::mem::size_of::<usize>();
        let stride = (block_size + align - 1) / align * align;
        Self {
            stride,
            storage,
            free_head: klock::CpuLockCell::new(NIL),
            next_uncarved: klock::CpuLockCell::new(0),
            wait_queue: Init::INIT,
        }
    }

    /// Construct a `MemPoolCb` on the kernel heap with room for `count`
    /// blocks of `block_size` bytes.
    #[cfg(feature = "alloc")]
    pub fn create(block_size: usize, count: usize) -> &'static Self {
        let align = core::mem::size_of::<usize>();
        let stride = (block_size + align - 1) / align * align;
        let storage = crate::utils::leak_byte_storage(stride * count);
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new(block_size, storage)))
    }
}

impl<Traits: KernelTraits> fmt::Debug for MemPoolCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemPoolCb")
            .field("self", &(self as *const _))
            .field("stride", &self.stride)
            .field("free_head", &self.free_head)
            .field("next_uncarved", &self.next_uncarved)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> MemPoolCb<Traits> {
    /// Allocate a block, blocking indefinitely while the pool is empty.
    pub fn wait(&'static self) -> Result<NonNull<u8>, WaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if let Some(block) = self.take_core(lock.borrow_mut()) {
            return Ok(block);
        }

        let payload = self
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::PoolAlloc { slot: Init::INIT })?;

        if let WaitPayload::PoolAlloc { slot } = payload {
            Ok(slot.read(&*lock).get().unwrap())
        } else {
            unreachable!()
        }
    }

    /// Allocate a block, blocking for at most `delay` ticks.
    pub fn wait_for(&'static self, delay: UTicks) -> Result<NonNull<u8>, WaitTimeoutError> {
        if delay == timeout::INFINITE {
            return self.wait().map_err(Into::into);
        }
        let time32 = timeout::time32_from_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if let Some(block) = self.take_core(lock.borrow_mut()) {
            return Ok(block);
        }
        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        let payload = self.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::PoolAlloc { slot: Init::INIT },
            time32,
        )?;

        if let WaitPayload::PoolAlloc { slot } = payload {
            Ok(slot.read(&*lock).get().unwrap())
        } else {
            unreachable!()
        }
    }

    /// Allocate a block, blocking until the tick count reaches `at`.
    pub fn wait_until(&'static self, at: UTicks) -> Result<NonNull<u8>, WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if let Some(block) = self.take_core(lock.borrow_mut()) {
            return Ok(block);
        }

        let time32 = timeout::time32_until(lock.borrow_mut(), at);
        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        let payload = self.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::PoolAlloc { slot: Init::INIT },
            time32,
        )?;

        if let WaitPayload::PoolAlloc { slot } = payload {
            Ok(slot.read(&*lock).get().unwrap())
        } else {
            unreachable!()
        }
    }

    /// Allocate a block without blocking, failing with `Timeout` while the
    /// pool is empty. Usable from any context.
    pub fn take(&'static self) -> Result<NonNull<u8>, PollError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        self.take_core(lock.borrow_mut()).ok_or(PollError::Timeout)
    }

    /// Return a block to the pool, waking up the most urgent blocked
    /// allocator (if any) by handing it the block directly. Usable from any
    /// context.
    ///
    /// # Safety
    ///
    /// `block` must have been obtained from this pool and must not be used
    /// after this call.
    pub unsafe fn give(&'static self, block: NonNull<u8>) -> Result<(), UpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        // Hand the block directly to a waiting allocator
        let mut handed_over = false;
        self.wait_queue
            .wake_up_all_conditional(lock.borrow_mut(), |payload, token| {
                if handed_over {
                    return false;
                }
                match payload {
                    WaitPayload::PoolAlloc { slot } => {
                        slot.read(&*token).set(Some(block));
                        handed_over = true;
                        true
                    }
                    _ => unreachable!(),
                }
            });

        if handed_over {
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        // Thread the block back onto the free list
        // Safety: CPU Lock active; `block` belongs to our storage
        let storage = unsafe { &mut *self.storage.get() };
        let base = storage.as_mut_ptr() as usize;
        let offset = block.as_ptr() as usize - base;
        debug_assert!(offset % self.stride == 0 && offset < storage.len());

        let old_head = self.free_head.replace(&mut *lock, offset);
        // Safety: every block is at least `size_of::<usize>()` bytes
        unsafe { (block.as_ptr() as *mut usize).write_unaligned(old_head) };

        Ok(())
    }

    /// Get the number of blocks that could still be allocated without
    /// blocking.
    pub fn free_blocks(&self) -> Result<usize, GetError> {
        let lock = klock::lock_cpu::<Traits>()?;

        // Safety: CPU Lock active
        let storage = unsafe { &*self.storage.get() };

        let mut n = (storage.len() - self.next_uncarved.get(&*lock)) / self.stride;
        let mut offset = self.free_head.get(&*lock);
        let base = storage.as_ptr() as usize;
        while offset != NIL {
            n += 1;
            // Safety: `offset` designates a free block on the list
            offset = unsafe { ((base + offset) as *const usize).read_unaligned() };
        }
        Ok(n)
    }

    /// Reset the pool: every block becomes free again and every current
    /// waiter is woken up with `Stopped`.
    ///
    /// Blocks handed out before the kill must not be given back afterwards.
    pub fn kill(&'static self) -> Result<(), KillError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        self.free_head.replace(&mut *lock, NIL);
        self.next_uncarved.replace(&mut *lock, 0);
        self.wait_queue
            .interrupt_all(lock.borrow_mut(), AbortReason::Stopped);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Unlink a block from the free list, or carve a fresh one from the
    /// storage.
    fn take_core(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<NonNull<u8>> {
        // Safety: CPU Lock active
        let storage = unsafe { &mut *self.storage.get() };
        let base = storage.as_mut_ptr();

        let offset = self.free_head.get(&*lock);
        if offset != NIL {
            // Safety: `offset` designates a free block on the list
            let next = unsafe { (base.add(offset) as *const usize).read_unaligned() };
            self.free_head.replace(&mut *lock, next);
            // Safety: `base + offset` is within the storage, hence non-null
            return Some(unsafe { NonNull::new_unchecked(base.add(offset)) });
        }

        let next_uncarved = self.next_uncarved.get(&*lock);
        if storage.len() - next_uncarved >= self.stride {
            self.next_uncarved
                .replace(&mut *lock, next_uncarved + self.stride);
            // Safety: as above
            return Some(unsafe { NonNull::new_unchecked(base.add(next_uncarved)) });
        }

        None
    }
}
