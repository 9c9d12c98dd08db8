use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{GfxError, GfxResult};

/// free list 为空时 head 中存放的索引
const EMPTY_SLOT: u32 = u32::MAX;
/// 已经分配出去的槽位在 `next_free` 中的标记
const ALLOCATED_SLOT: u32 = u32::MAX - 1;

/// 描述符表中的一个槽位，shader 通过这个索引访问资源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorSlot(u32);
impl DescriptorSlot {
    #[inline]
    pub fn index(&self) -> u32 {
        self.0
    }
}

/// 无锁的描述符槽位分配器
///
/// 管理一张固定大小的描述符表（bindless 表），可以在多个线程中同时分配和释放，不需要加锁。
///
/// # 结构
/// - `current_index`: bump 指针，表示曾经分配过的最大槽位 + 1，只增不减
/// - `free_head`: free list 的头，低 32 位是槽位索引，高 32 位是每次修改都递增的 tag，
///   用于避免 CAS 的 ABA 问题
/// - `next_free`: 侵入式 free list，空闲槽位中存放下一个空闲槽位的索引，
///   已分配的槽位中存放 `ALLOCATED_SLOT`
///
/// 释放的槽位按照 LIFO 的顺序复用。释放时把 `ALLOCATED_SLOT` 换出，因此重复释放会被拒绝。
pub struct DescriptorSlotAllocator {
    next_free: Box<[AtomicU32]>,
    current_index: AtomicU32,
    free_head: AtomicU64,
    capacity: u32,
}

// new & init
impl DescriptorSlotAllocator {
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0 && capacity < ALLOCATED_SLOT, "invalid descriptor table size: {capacity}");
        Self {
            next_free: (0..capacity).map(|_| AtomicU32::new(EMPTY_SLOT)).collect(),
            current_index: AtomicU32::new(0),
            free_head: AtomicU64::new(pack_head(0, EMPTY_SLOT)),
            capacity,
        }
    }
}

// getters
impl DescriptorSlotAllocator {
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// 曾经通过 bump 分配出去的槽位数量
    #[inline]
    pub fn current_index(&self) -> u32 {
        self.current_index.load(Ordering::Acquire)
    }
}

// tools
impl DescriptorSlotAllocator {
    /// 分配一个槽位：优先从 free list 中取，否则推进 bump 指针
    ///
    /// # Panics
    /// 描述符表已满
    pub fn allocate(&self) -> DescriptorSlot {
        if let Some(index) = self.pop_free() {
            self.next_free[index as usize].store(ALLOCATED_SLOT, Ordering::Release);
            return DescriptorSlot(index);
        }

        let mut current = self.current_index.load(Ordering::Relaxed);
        loop {
            if current >= self.capacity {
                log::error!("descriptor table exhausted: all {} slots are allocated", self.capacity);
                panic!("descriptor table exhausted: capacity {}", self.capacity);
            }
            match self.current_index.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.next_free[current as usize].store(ALLOCATED_SLOT, Ordering::Release);
                    return DescriptorSlot(current);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// 释放一个槽位，放回 free list 的头部
    ///
    /// 从未分配过的槽位和已经释放的槽位都会被拒绝
    pub fn free(&self, slot: DescriptorSlot) -> GfxResult<()> {
        let current = self.current_index();
        if slot.0 >= current {
            log::error!("freeing descriptor slot {} which was never allocated (current index {})", slot.0, current);
            return Err(GfxError::InvalidDescriptorSlot { index: slot.0, current });
        }

        // 同时释放同一个槽位时只有一个线程能换出标记
        if self.next_free[slot.0 as usize]
            .compare_exchange(ALLOCATED_SLOT, EMPTY_SLOT, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            log::error!("descriptor slot {} is freed twice", slot.0);
            return Err(GfxError::DescriptorSlotAlreadyFree(slot.0));
        }

        let mut head = self.free_head.load(Ordering::Relaxed);
        loop {
            let (tag, head_index) = unpack_head(head);
            self.next_free[slot.0 as usize].store(head_index, Ordering::Relaxed);

            let new_head = pack_head(tag.wrapping_add(1), slot.0);
            match self.free_head.compare_exchange_weak(head, new_head, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return Ok(()),
                Err(actual) => head = actual,
            }
        }
    }

    fn pop_free(&self) -> Option<u32> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let (tag, index) = unpack_head(head);
            if index == EMPTY_SLOT {
                return None;
            }

            let next = self.next_free[index as usize].load(Ordering::Relaxed);
            let new_head = pack_head(tag.wrapping_add(1), next);
            match self.free_head.compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(index),
                Err(actual) => head = actual,
            }
        }
    }
}

#[inline]
fn pack_head(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[inline]
fn unpack_head(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_bump_allocation() {
        let allocator = DescriptorSlotAllocator::new(8);
        assert_eq!(allocator.allocate().index(), 0);
        assert_eq!(allocator.allocate().index(), 1);
        assert_eq!(allocator.allocate().index(), 2);
        assert_eq!(allocator.current_index(), 3);
    }

    #[test]
    fn test_free_then_allocate_reuses_slot() {
        let allocator = DescriptorSlotAllocator::new(8);
        let slot = allocator.allocate();
        assert_eq!(allocator.current_index(), 1);

        allocator.free(slot).unwrap();
        let again = allocator.allocate();

        assert_eq!(again, slot);
        assert_eq!(allocator.current_index(), 1);
    }

    #[test]
    fn test_free_list_is_lifo() {
        let allocator = DescriptorSlotAllocator::new(8);
        let slots: Vec<_> = (0..4).map(|_| allocator.allocate()).collect();
        allocator.free(slots[1]).unwrap();
        allocator.free(slots[3]).unwrap();

        assert_eq!(allocator.allocate(), slots[3]);
        assert_eq!(allocator.allocate(), slots[1]);
        assert_eq!(allocator.allocate().index(), 4);
    }

    #[test]
    fn test_free_unallocated_slot_is_refused() {
        let allocator = DescriptorSlotAllocator::new(8);
        allocator.allocate();
        let err = allocator.free(DescriptorSlot(5)).unwrap_err();
        assert!(matches!(err, GfxError::InvalidDescriptorSlot { index: 5, current: 1 }));
    }

    #[test]
    fn test_double_free_is_refused() {
        let allocator = DescriptorSlotAllocator::new(8);
        let a = allocator.allocate();
        let b = allocator.allocate();

        allocator.free(a).unwrap();
        let err = allocator.free(a).unwrap_err();
        assert!(matches!(err, GfxError::DescriptorSlotAlreadyFree(0)));

        // free list 中只有一份 a，不会被分配给两个使用者
        allocator.free(b).unwrap();
        assert_eq!(allocator.allocate(), b);
        assert_eq!(allocator.allocate(), a);
        assert_eq!(allocator.allocate().index(), 2);
    }

    #[test]
    fn test_reallocated_slot_can_be_freed_again() {
        let allocator = DescriptorSlotAllocator::new(4);
        let slot = allocator.allocate();
        allocator.free(slot).unwrap();

        let again = allocator.allocate();
        assert_eq!(again, slot);
        allocator.free(again).unwrap();
        assert!(allocator.free(again).is_err());
    }

    #[test]
    #[should_panic(expected = "descriptor table exhausted")]
    fn test_exhaustion_is_fatal() {
        let allocator = DescriptorSlotAllocator::new(2);
        allocator.allocate();
        allocator.allocate();
        allocator.allocate();
    }

    #[test]
    fn test_concurrent_allocate_and_free() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 500;
        let allocator = DescriptorSlotAllocator::new(4096);

        let held: Vec<Vec<DescriptorSlot>> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        let mut mine = Vec::new();
                        for round in 0..ROUNDS {
                            mine.push(allocator.allocate());
                            if round % 2 == 1 {
                                let slot = mine.swap_remove(round % mine.len());
                                allocator.free(slot).unwrap();
                            }
                        }
                        mine
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        // 同时持有的槽位不能重复
        let all: Vec<_> = held.into_iter().flatten().collect();
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
        assert_eq!(all.len(), THREADS * ROUNDS / 2);
        assert!(allocator.current_index() <= allocator.capacity());
    }
}
