use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::backend::{GfxBackend, NativeAllocator, NativeCommandList};
use crate::commands::command_queue::QueueType;
use crate::commands::fence::Fence;
use crate::error::{GfxError, GfxResult};

/// allocator 的状态；没有出现在 ring 中的 slot 处于未初始化状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocatorState {
    /// 没有未完成的 GPU 工作
    Idle,
    /// 当前 generation 正在从中分配 command list
    InUse,
    /// 已经不再分配，但是提交的命令可能还没有执行完
    PendingFence,
}

/// allocator 中需要跨线程访问的部分
///
/// command list 可能在录制线程之外的线程提交，提交时通过这里归还 list 并记录 fence。
pub(crate) struct AllocatorShared {
    lists_in_use: Box<[AtomicBool]>,
    /// 还没有归还的额外 list 数量
    overflow_outstanding: AtomicUsize,
    /// 每个 queue 上最后一次使用这个 allocator 的提交
    fences: Mutex<Vec<Fence>>,
}

impl AllocatorShared {
    fn new(max_lists: usize) -> Self {
        Self {
            lists_in_use: (0..max_lists).map(|_| AtomicBool::new(false)).collect(),
            overflow_outstanding: AtomicUsize::new(0),
            fences: Mutex::new(Vec::new()),
        }
    }

    /// 归还一个 list
    ///
    /// # 参数
    /// - `slot`: list 在 ring 中的位置，`None` 表示额外分配的 list
    /// - `fence`: list 被提交时得到的 fence；没有提交就丢弃的 list 为 `None`
    pub(crate) fn release_list(&self, slot: Option<usize>, fence: Option<Fence>) {
        if let Some(fence) = fence.filter(|f| !f.is_null()) {
            let mut fences = self.fences.lock();
            match fences.iter_mut().find(|f| f.queue == fence.queue) {
                Some(stamped) => stamped.value = stamped.value.max(fence.value),
                None => fences.push(fence),
            }
        }

        match slot {
            Some(slot) => self.lists_in_use[slot].store(false, Ordering::Release),
            None => {
                self.overflow_outstanding.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    fn outstanding_lists(&self) -> usize {
        let pooled = self.lists_in_use.iter().filter(|in_use| in_use.load(Ordering::Acquire)).count();
        pooled + self.overflow_outstanding.load(Ordering::Acquire)
    }

    fn pending_fences(&self) -> Vec<Fence> {
        self.fences.lock().clone()
    }

    fn clear_fences(&self) {
        self.fences.lock().clear();
    }
}

/// 从回收池中取出的 list
pub(crate) struct PooledList {
    pub(crate) native: NativeCommandList,
    pub(crate) allocator: NativeAllocator,
    pub(crate) owner: Arc<AllocatorShared>,
    pub(crate) slot: Option<usize>,
}

impl PooledList {
    #[inline]
    pub(crate) fn release(&self, fence: Option<Fence>) {
        self.owner.release_list(self.slot, fence);
    }
}

struct AllocatorEntry {
    native: NativeAllocator,
    shared: Arc<AllocatorShared>,
    state: AllocatorState,

    /// 懒创建的 list ring
    lists: Vec<Option<NativeCommandList>>,
    list_cursor: usize,
    /// ring 用尽时额外分配的 list，在 allocator 下一次 reset 时销毁
    overflow_lists: Vec<NativeCommandList>,
}

/// 同一种 queue 的 allocator ring
#[derive(Default)]
struct AllocatorRing {
    /// 只增不减，长度达到上限之后开始循环复用
    entries: Vec<AllocatorEntry>,
    cursor: usize,
    /// 当前 generation 正在使用的 allocator
    current: Option<usize>,
}

/// 命令分配器回收池
///
/// 每个录制线程持有一个（放在 [`SubmissionContext`](crate::commands::submission_context::SubmissionContext) 中），
/// 按照 queue 种类管理 allocator ring，每个 allocator 管理一个 command list ring。
///
/// # 复用规则
/// - 设备的 reset generation 变化之后，当前的 allocator 全部作废，下一次取 list 时从 ring 中取下一个 allocator
/// - 取出的 allocator 如果记录了 fence，先阻塞等待 fence 完成，然后 reset
/// - list ring 中下一个 list 还没有归还时，额外分配一个 list，并输出性能警告
pub struct AllocatorRecyclingPool {
    rings: [AllocatorRing; QueueType::COUNT],
    cached_generation: u64,

    max_allocators: usize,
    max_lists: usize,
}

// new & init
impl AllocatorRecyclingPool {
    pub fn new(max_allocators: usize, max_lists: usize) -> Self {
        assert!(max_allocators > 0 && max_lists > 0, "allocator pool capacities must be non-zero");
        Self {
            rings: std::array::from_fn(|_| AllocatorRing::default()),
            cached_generation: 0,
            max_allocators,
            max_lists,
        }
    }
}

// getters
impl AllocatorRecyclingPool {
    #[inline]
    pub fn cached_generation(&self) -> u64 {
        self.cached_generation
    }

    /// 已经创建的 allocator 数量
    #[inline]
    pub fn allocator_count(&self, queue_type: QueueType) -> usize {
        self.rings[queue_type.index()].entries.len()
    }

    /// `None` 表示 slot 还没有初始化
    pub fn allocator_state(&self, queue_type: QueueType, index: usize) -> Option<AllocatorState> {
        self.rings[queue_type.index()].entries.get(index).map(|entry| entry.state)
    }
}

// tools
impl AllocatorRecyclingPool {
    /// 与设备的 reset generation 同步；generation 变化时丢弃所有缓存的当前 allocator
    pub fn sync_generation(&mut self, generation: u64) {
        if generation == self.cached_generation {
            return;
        }

        for ring in &mut self.rings {
            if let Some(index) = ring.current.take() {
                let entry = &mut ring.entries[index];
                let pending = entry.shared.outstanding_lists() > 0 || !entry.shared.pending_fences().is_empty();
                entry.state = if pending { AllocatorState::PendingFence } else { AllocatorState::Idle };
            }
        }
        self.cached_generation = generation;
    }

    /// 取出一个可以开始录制的 list
    ///
    /// # 参数
    /// - `wait`: 阻塞等待 fence 完成，allocator 被复用之前调用
    pub(crate) fn acquire_list(
        &mut self,
        backend: &dyn GfxBackend,
        queue_type: QueueType,
        wait: &mut dyn FnMut(Fence) -> GfxResult<()>,
    ) -> GfxResult<PooledList> {
        let index = match self.rings[queue_type.index()].current {
            Some(index) => index,
            None => self.pull_allocator(backend, queue_type, wait)?,
        };

        let max_lists = self.max_lists;
        let entry = &mut self.rings[queue_type.index()].entries[index];

        let slot = entry.list_cursor;
        entry.list_cursor = (slot + 1) % max_lists;

        if entry.shared.lists_in_use[slot].swap(true, Ordering::AcqRel) {
            log::warn!(
                "command list ring of {:?} allocator #{} is exhausted ({} lists), allocating an unpooled list; \
                 consider raising max_lists_per_allocator",
                queue_type,
                index,
                max_lists
            );
            let native = backend.create_command_list(entry.native, queue_type)?;
            entry.overflow_lists.push(native);
            entry.shared.overflow_outstanding.fetch_add(1, Ordering::AcqRel);
            return Ok(PooledList {
                native,
                allocator: entry.native,
                owner: entry.shared.clone(),
                slot: None,
            });
        }

        let native = match entry.lists[slot] {
            Some(native) => native,
            None => match backend.create_command_list(entry.native, queue_type) {
                Ok(native) => {
                    entry.lists[slot] = Some(native);
                    native
                }
                Err(e) => {
                    entry.shared.lists_in_use[slot].store(false, Ordering::Release);
                    return Err(e);
                }
            },
        };

        Ok(PooledList {
            native,
            allocator: entry.native,
            owner: entry.shared.clone(),
            slot: Some(slot),
        })
    }

    /// 从 ring 中取下一个 allocator，作为当前 generation 的 allocator
    fn pull_allocator(
        &mut self,
        backend: &dyn GfxBackend,
        queue_type: QueueType,
        wait: &mut dyn FnMut(Fence) -> GfxResult<()>,
    ) -> GfxResult<usize> {
        profile_span!("AllocatorRecyclingPool::pull_allocator");

        let max_lists = self.max_lists;
        let ring = &mut self.rings[queue_type.index()];
        // cursor 只在 allocator 可用之后才推进，失败时下一次仍然从同一个位置重试
        let index = ring.cursor;

        if index == ring.entries.len() {
            let native = backend.create_command_allocator(queue_type)?;
            log::info!(
                "Created {:?} command allocator #{} for generation {}",
                queue_type,
                index,
                self.cached_generation
            );
            ring.entries.push(AllocatorEntry {
                native,
                shared: Arc::new(AllocatorShared::new(max_lists)),
                state: AllocatorState::Idle,
                lists: vec![None; max_lists],
                list_cursor: 0,
                overflow_lists: Vec::new(),
            });
        } else {
            let entry = &mut ring.entries[index];

            let outstanding = entry.shared.outstanding_lists();
            if outstanding > 0 {
                log::error!(
                    "{:?} command allocator #{} still has {} command lists that were neither executed nor discarded",
                    queue_type,
                    index,
                    outstanding
                );
                return Err(GfxError::AllocatorBusy(queue_type));
            }

            // 确保 allocator 上的所有命令都执行完毕之后才能 reset
            for fence in entry.shared.pending_fences() {
                wait(fence)?;
            }
            entry.shared.clear_fences();

            backend.reset_command_allocator(entry.native)?;
            for list in entry.overflow_lists.drain(..) {
                backend.destroy_command_list(list);
            }
            entry.list_cursor = 0;
        }

        ring.entries[index].state = AllocatorState::InUse;
        ring.cursor = (index + 1) % self.max_allocators;
        ring.current = Some(index);
        Ok(index)
    }

    /// 销毁所有的 allocator 和 list；等待所有记录的 fence 完成
    ///
    /// 某个 fence 等待失败不会中断销毁，返回遇到的第一个错误
    pub(crate) fn destroy(
        &mut self,
        backend: &dyn GfxBackend,
        wait: &mut dyn FnMut(Fence) -> GfxResult<()>,
    ) -> GfxResult<()> {
        let mut first_error = None;
        for (queue_type, ring) in QueueType::ALL.iter().zip(self.rings.iter_mut()) {
            ring.current = None;
            ring.cursor = 0;
            for (index, entry) in ring.entries.drain(..).enumerate() {
                let outstanding = entry.shared.outstanding_lists();
                if outstanding > 0 {
                    log::warn!(
                        "destroying {:?} command allocator #{} with {} outstanding command lists",
                        queue_type,
                        index,
                        outstanding
                    );
                }
                for fence in entry.shared.pending_fences() {
                    if let Err(err) = wait(fence) {
                        log::error!(
                            "failed to wait for {:?} command allocator #{} before destroy: {}",
                            queue_type,
                            index,
                            err
                        );
                        first_error.get_or_insert(err);
                    }
                }

                for list in entry.lists.into_iter().flatten().chain(entry.overflow_lists) {
                    backend.destroy_command_list(list);
                }
                backend.destroy_command_allocator(entry.native);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null_backend::{NullBackend, NullCompletion};
    use crate::handles::QueueHandle;
    use slotmap::SlotMap;

    fn no_wait() -> impl FnMut(Fence) -> GfxResult<()> {
        |fence| panic!("unexpected wait for {:?}", fence)
    }

    fn make_queue_handle() -> QueueHandle {
        let mut map: SlotMap<QueueHandle, ()> = SlotMap::with_key();
        map.insert(())
    }

    #[test]
    fn test_lists_come_from_current_allocator() {
        let backend = NullBackend::new(NullCompletion::Immediate);
        let mut pool = AllocatorRecyclingPool::new(2, 4);

        let a = pool.acquire_list(&backend, QueueType::Graphics, &mut no_wait()).unwrap();
        let b = pool.acquire_list(&backend, QueueType::Graphics, &mut no_wait()).unwrap();

        assert_eq!(a.allocator, b.allocator);
        assert_ne!(a.native, b.native);
        assert_eq!(pool.allocator_count(QueueType::Graphics), 1);
        assert_eq!(pool.allocator_count(QueueType::Compute), 0);
        assert_eq!(pool.allocator_state(QueueType::Graphics, 0), Some(AllocatorState::InUse));
    }

    #[test]
    fn test_returned_list_is_reused() {
        let backend = NullBackend::new(NullCompletion::Immediate);
        let mut pool = AllocatorRecyclingPool::new(1, 1);

        let first = pool.acquire_list(&backend, QueueType::Copy, &mut no_wait()).unwrap();
        first.release(None);
        let second = pool.acquire_list(&backend, QueueType::Copy, &mut no_wait()).unwrap();

        assert_eq!(first.native, second.native);
        assert_eq!(backend.stats().command_lists_created, 1);
    }

    #[test]
    fn test_exhausted_list_ring_allocates_unpooled_list() {
        let backend = NullBackend::new(NullCompletion::Immediate);
        let mut pool = AllocatorRecyclingPool::new(1, 2);

        let lists: Vec<_> =
            (0..3).map(|_| pool.acquire_list(&backend, QueueType::Graphics, &mut no_wait()).unwrap()).collect();

        assert_eq!(lists[0].slot, Some(0));
        assert_eq!(lists[1].slot, Some(1));
        assert_eq!(lists[2].slot, None);
        assert_eq!(backend.stats().command_lists_created, 3);
    }

    #[test]
    fn test_generation_change_pulls_next_allocator() {
        let backend = NullBackend::new(NullCompletion::Immediate);
        let mut pool = AllocatorRecyclingPool::new(2, 2);
        let queue = make_queue_handle();

        let a = pool.acquire_list(&backend, QueueType::Graphics, &mut no_wait()).unwrap();
        a.release(Some(Fence::new(queue, 1)));

        pool.sync_generation(1);
        assert_eq!(pool.allocator_state(QueueType::Graphics, 0), Some(AllocatorState::PendingFence));
        let b = pool.acquire_list(&backend, QueueType::Graphics, &mut no_wait()).unwrap();
        assert_ne!(a.allocator, b.allocator);
        b.release(None);

        // ring 回到第一个 allocator：必须先等待它的 fence
        pool.sync_generation(2);
        let mut waited = Vec::new();
        let c = pool
            .acquire_list(&backend, QueueType::Graphics, &mut |fence| {
                waited.push(fence);
                Ok(())
            })
            .unwrap();

        assert_eq!(c.allocator, a.allocator);
        assert_eq!(waited, vec![Fence::new(queue, 1)]);
        assert_eq!(backend.stats().allocator_resets, 1);
    }

    #[test]
    fn test_fence_stamp_keeps_latest_value_per_queue() {
        let shared = AllocatorShared::new(2);
        let queue = make_queue_handle();
        shared.lists_in_use[0].store(true, Ordering::Release);
        shared.lists_in_use[1].store(true, Ordering::Release);

        shared.release_list(Some(1), Some(Fence::new(queue, 4)));
        shared.release_list(Some(0), Some(Fence::new(queue, 3)));

        assert_eq!(shared.pending_fences(), vec![Fence::new(queue, 4)]);
        assert_eq!(shared.outstanding_lists(), 0);
    }

    #[test]
    fn test_outstanding_list_blocks_reuse() {
        let backend = NullBackend::new(NullCompletion::Immediate);
        let mut pool = AllocatorRecyclingPool::new(1, 2);

        let _never_returned = pool.acquire_list(&backend, QueueType::Compute, &mut no_wait()).unwrap();
        pool.sync_generation(1);

        let err = pool.acquire_list(&backend, QueueType::Compute, &mut no_wait()).err().unwrap();
        assert!(matches!(err, GfxError::AllocatorBusy(QueueType::Compute)));
    }

    #[test]
    fn test_destroy_releases_backend_objects() {
        let backend = NullBackend::new(NullCompletion::Immediate);
        let mut pool = AllocatorRecyclingPool::new(1, 1);
        let a = pool.acquire_list(&backend, QueueType::Graphics, &mut no_wait()).unwrap();
        let b = pool.acquire_list(&backend, QueueType::Graphics, &mut no_wait()).unwrap();
        a.release(None);
        b.release(None);

        pool.destroy(&backend, &mut no_wait()).unwrap();
        assert_eq!(backend.stats().command_lists_destroyed, 2);
        assert_eq!(pool.allocator_count(QueueType::Graphics), 0);
    }

    #[test]
    fn test_failed_allocator_creation_can_be_retried() {
        let backend = NullBackend::new(NullCompletion::Immediate);
        let mut pool = AllocatorRecyclingPool::new(2, 2);

        backend.set_device_lost(true);
        let err = pool.acquire_list(&backend, QueueType::Graphics, &mut no_wait()).err().unwrap();
        assert!(matches!(err, GfxError::DeviceLost(_)));
        assert_eq!(pool.allocator_count(QueueType::Graphics), 0);

        backend.set_device_lost(false);
        let list = pool.acquire_list(&backend, QueueType::Graphics, &mut no_wait()).unwrap();
        assert_eq!(pool.allocator_count(QueueType::Graphics), 1);
        assert_eq!(pool.allocator_state(QueueType::Graphics, 0), Some(AllocatorState::InUse));

        // 第二个 generation 取 ring 中的下一个位置
        list.release(None);
        pool.sync_generation(1);
        pool.acquire_list(&backend, QueueType::Graphics, &mut no_wait()).unwrap();
        assert_eq!(pool.allocator_count(QueueType::Graphics), 2);
    }

    #[test]
    fn test_failed_reset_retries_same_allocator() {
        let backend = NullBackend::new(NullCompletion::Immediate);
        let mut pool = AllocatorRecyclingPool::new(1, 2);

        let first = pool.acquire_list(&backend, QueueType::Copy, &mut no_wait()).unwrap();
        let allocator = first.allocator;
        first.release(None);
        pool.sync_generation(1);

        backend.set_device_lost(true);
        assert!(pool.acquire_list(&backend, QueueType::Copy, &mut no_wait()).is_err());

        backend.set_device_lost(false);
        let again = pool.acquire_list(&backend, QueueType::Copy, &mut no_wait()).unwrap();
        assert_eq!(again.allocator, allocator);
        assert_eq!(pool.allocator_count(QueueType::Copy), 1);
    }

    #[test]
    fn test_destroy_continues_after_failed_wait() {
        let backend = NullBackend::new(NullCompletion::Immediate);
        let mut pool = AllocatorRecyclingPool::new(1, 2);
        let queue = make_queue_handle();

        let a = pool.acquire_list(&backend, QueueType::Graphics, &mut no_wait()).unwrap();
        let b = pool.acquire_list(&backend, QueueType::Compute, &mut no_wait()).unwrap();
        a.release(Some(Fence::new(queue, 1)));
        b.release(None);

        let mut failing_wait = |_fence: Fence| -> GfxResult<()> { Err(GfxError::DeviceLost("lost".to_string())) };
        let err = pool.destroy(&backend, &mut failing_wait).unwrap_err();

        assert!(matches!(err, GfxError::DeviceLost(_)));
        assert_eq!(backend.stats().command_lists_destroyed, 2);
        assert_eq!(pool.allocator_count(QueueType::Graphics), 0);
        assert_eq!(pool.allocator_count(QueueType::Compute), 0);
    }
}
