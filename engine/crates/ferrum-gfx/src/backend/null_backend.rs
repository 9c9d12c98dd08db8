//! CPU 模拟的后端
//!
//! 不访问任何 GPU，用于测试以及无窗口的工具。每个 queue 的计数器在 CPU 上推进：
//! - [`NullCompletion::Immediate`]: 提交后立刻完成（仍然遵守 GPU 端等待）
//! - [`NullCompletion::Manual`]: 只有调用 [`NullBackend::complete_up_to`] 才会完成

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::backend::{BackendKind, GfxBackend, NativeAllocator, NativeCommandList, NativeQueue, NativeWait};
use crate::commands::barrier::ResolvedBarriers;
use crate::commands::command_queue::QueueType;
use crate::error::{GfxError, GfxResult};

/// 模拟的完成方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NullCompletion {
    Immediate,
    Manual,
}

/// 后端调用的统计，用于测试
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NullBackendStats {
    pub completed_queries: u64,
    pub blocking_waits: u64,
    pub allocators_created: u64,
    pub allocator_resets: u64,
    pub command_lists_created: u64,
    pub command_lists_destroyed: u64,
    pub submissions: u64,
    pub barrier_batches: u64,
}

struct PendingSubmit {
    signal_value: u64,
    waits: Vec<NativeWait>,
}

#[derive(Default)]
struct NullQueue {
    completed: u64,
    /// Manual 模式下允许完成到的值
    release_limit: u64,
    pending: VecDeque<PendingSubmit>,
}

#[derive(Default)]
struct Counters {
    completed_queries: AtomicU64,
    blocking_waits: AtomicU64,
    allocators_created: AtomicU64,
    allocator_resets: AtomicU64,
    command_lists_created: AtomicU64,
    command_lists_destroyed: AtomicU64,
    submissions: AtomicU64,
    barrier_batches: AtomicU64,
}

struct NullBackendState {
    completion: NullCompletion,
    next_object_id: AtomicU64,
    device_lost: AtomicBool,

    queues: Mutex<HashMap<NativeQueue, NullQueue>>,
    queue_progress: Condvar,

    emitted_barriers: Mutex<Vec<(NativeCommandList, ResolvedBarriers)>>,
    counters: Counters,
}

/// 可以 clone，所有 clone 共享同一个模拟设备，测试可以保留一份用于检查
#[derive(Clone)]
pub struct NullBackend {
    state: Arc<NullBackendState>,
}

// new & init
impl NullBackend {
    pub fn new(completion: NullCompletion) -> Self {
        Self {
            state: Arc::new(NullBackendState {
                completion,
                next_object_id: AtomicU64::new(1),
                device_lost: AtomicBool::new(false),
                queues: Mutex::new(HashMap::new()),
                queue_progress: Condvar::new(),
                emitted_barriers: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        }
    }
}

// getters
impl NullBackend {
    pub fn stats(&self) -> NullBackendStats {
        let c = &self.state.counters;
        NullBackendStats {
            completed_queries: c.completed_queries.load(Ordering::Relaxed),
            blocking_waits: c.blocking_waits.load(Ordering::Relaxed),
            allocators_created: c.allocators_created.load(Ordering::Relaxed),
            allocator_resets: c.allocator_resets.load(Ordering::Relaxed),
            command_lists_created: c.command_lists_created.load(Ordering::Relaxed),
            command_lists_destroyed: c.command_lists_destroyed.load(Ordering::Relaxed),
            submissions: c.submissions.load(Ordering::Relaxed),
            barrier_batches: c.barrier_batches.load(Ordering::Relaxed),
        }
    }

    /// 所有录制到 command list 中的 barrier，按照录制顺序
    pub fn emitted_barriers(&self) -> Vec<(NativeCommandList, ResolvedBarriers)> {
        self.state.emitted_barriers.lock().clone()
    }

    /// 不经过统计，直接读取 queue 的完成值
    pub fn peek_completed(&self, queue: NativeQueue) -> u64 {
        self.state.queues.lock().get(&queue).map(|q| q.completed).unwrap_or_default()
    }
}

// tools
impl NullBackend {
    /// Manual 模式下让 queue 执行到 `value`；被 GPU 端等待阻塞的提交会推迟到依赖的 queue 完成
    ///
    /// # 返回
    /// queue 当前的完成值
    pub fn complete_up_to(&self, queue: NativeQueue, value: u64) -> u64 {
        let mut queues = self.state.queues.lock();
        if let Some(q) = queues.get_mut(&queue) {
            q.release_limit = q.release_limit.max(value);
        }
        Self::pump(&mut queues);
        self.state.queue_progress.notify_all();
        queues.get(&queue).map(|q| q.completed).unwrap_or_default()
    }

    /// 模拟设备丢失：之后所有会失败的调用都返回 [`GfxError::DeviceLost`]
    pub fn set_device_lost(&self, lost: bool) {
        self.state.device_lost.store(lost, Ordering::Release);
        self.state.queue_progress.notify_all();
    }

    fn check_lost(&self) -> GfxResult<()> {
        if self.state.device_lost.load(Ordering::Acquire) {
            return Err(GfxError::DeviceLost("null backend marked as lost".to_string()));
        }
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.state.next_object_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 在所有 queue 上推进可以完成的提交，直到没有任何进展
    fn pump(queues: &mut HashMap<NativeQueue, NullQueue>) {
        loop {
            let completed: HashMap<NativeQueue, u64> = queues.iter().map(|(k, q)| (*k, q.completed)).collect();
            let mut progressed = false;

            for queue in queues.values_mut() {
                while let Some(front) = queue.pending.front() {
                    let released = front.signal_value <= queue.release_limit;
                    let unblocked = front
                        .waits
                        .iter()
                        .all(|wait| completed.get(&wait.queue).copied().unwrap_or_default() >= wait.value);
                    if !(released && unblocked) {
                        break;
                    }
                    queue.completed = front.signal_value;
                    queue.pending.pop_front();
                    progressed = true;
                }
            }

            if !progressed {
                break;
            }
        }
    }
}

impl GfxBackend for NullBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Null
    }

    fn create_queue(&self, queue_type: QueueType, debug_name: &str) -> GfxResult<NativeQueue> {
        self.check_lost()?;
        let queue = NativeQueue(self.next_id());
        let release_limit = match self.state.completion {
            NullCompletion::Immediate => u64::MAX,
            NullCompletion::Manual => 0,
        };
        self.state.queues.lock().insert(
            queue,
            NullQueue {
                release_limit,
                ..Default::default()
            },
        );
        log::debug!("null backend: created {:?} queue `{}` as {:?}", queue_type, debug_name, queue);
        Ok(queue)
    }

    fn destroy_queue(&self, queue: NativeQueue) {
        self.state.queues.lock().remove(&queue);
    }

    fn create_command_allocator(&self, _queue_type: QueueType) -> GfxResult<NativeAllocator> {
        self.check_lost()?;
        self.state.counters.allocators_created.fetch_add(1, Ordering::Relaxed);
        Ok(NativeAllocator(self.next_id()))
    }

    fn reset_command_allocator(&self, _allocator: NativeAllocator) -> GfxResult<()> {
        self.check_lost()?;
        self.state.counters.allocator_resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn destroy_command_allocator(&self, _allocator: NativeAllocator) {}

    fn create_command_list(&self, _allocator: NativeAllocator, _queue_type: QueueType) -> GfxResult<NativeCommandList> {
        self.check_lost()?;
        self.state.counters.command_lists_created.fetch_add(1, Ordering::Relaxed);
        Ok(NativeCommandList(self.next_id()))
    }

    fn destroy_command_list(&self, _list: NativeCommandList) {
        self.state.counters.command_lists_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    fn begin_command_list(
        &self,
        _list: NativeCommandList,
        _allocator: NativeAllocator,
        _debug_name: &str,
    ) -> GfxResult<()> {
        self.check_lost()
    }

    fn close_command_list(&self, _list: NativeCommandList) -> GfxResult<()> {
        self.check_lost()
    }

    fn emit_barriers(&self, list: NativeCommandList, barriers: &ResolvedBarriers) -> GfxResult<()> {
        self.check_lost()?;
        self.state.counters.barrier_batches.fetch_add(1, Ordering::Relaxed);
        self.state.emitted_barriers.lock().push((list, barriers.clone()));
        Ok(())
    }

    fn submit(
        &self,
        queue: NativeQueue,
        _lists: &[NativeCommandList],
        waits: &[NativeWait],
        signal_value: u64,
    ) -> GfxResult<()> {
        self.check_lost()?;
        let mut queues = self.state.queues.lock();
        let q = queues.get_mut(&queue).ok_or_else(|| GfxError::Backend {
            call: "submit",
            message: format!("unknown queue {:?}", queue),
        })?;
        q.pending.push_back(PendingSubmit {
            signal_value,
            waits: waits.to_vec(),
        });
        self.state.counters.submissions.fetch_add(1, Ordering::Relaxed);

        Self::pump(&mut queues);
        self.state.queue_progress.notify_all();
        Ok(())
    }

    fn completed_value(&self, queue: NativeQueue) -> GfxResult<u64> {
        self.check_lost()?;
        self.state.counters.completed_queries.fetch_add(1, Ordering::Relaxed);
        Ok(self.peek_completed(queue))
    }

    fn wait_for_value(&self, queue: NativeQueue, value: u64, timeout: Option<Duration>) -> GfxResult<bool> {
        self.state.counters.blocking_waits.fetch_add(1, Ordering::Relaxed);
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut queues = self.state.queues.lock();
        loop {
            self.check_lost()?;
            let completed = queues.get(&queue).map(|q| q.completed).unwrap_or_default();
            if completed >= value {
                return Ok(true);
            }

            match deadline {
                None => self.state.queue_progress.wait(&mut queues),
                Some(deadline) => {
                    if self.state.queue_progress.wait_until(&mut queues, deadline).timed_out() {
                        let completed = queues.get(&queue).map(|q| q.completed).unwrap_or_default();
                        return Ok(completed >= value);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_completes_on_submit() {
        let backend = NullBackend::new(NullCompletion::Immediate);
        let queue = backend.create_queue(QueueType::Graphics, "q").unwrap();
        backend.submit(queue, &[], &[], 1).unwrap();
        assert_eq!(backend.completed_value(queue).unwrap(), 1);
    }

    #[test]
    fn test_manual_completes_on_request() {
        let backend = NullBackend::new(NullCompletion::Manual);
        let queue = backend.create_queue(QueueType::Graphics, "q").unwrap();
        backend.submit(queue, &[], &[], 1).unwrap();
        backend.submit(queue, &[], &[], 2).unwrap();

        assert_eq!(backend.completed_value(queue).unwrap(), 0);
        assert_eq!(backend.complete_up_to(queue, 1), 1);
        assert_eq!(backend.complete_up_to(queue, 5), 2);
    }

    #[test]
    fn test_gpu_wait_orders_queues() {
        let backend = NullBackend::new(NullCompletion::Manual);
        let copy = backend.create_queue(QueueType::Copy, "copy").unwrap();
        let gfx = backend.create_queue(QueueType::Graphics, "gfx").unwrap();

        backend.submit(copy, &[], &[], 1).unwrap();
        backend.submit(gfx, &[], &[NativeWait { queue: copy, value: 1 }], 1).unwrap();

        // graphics 被 copy 阻塞
        assert_eq!(backend.complete_up_to(gfx, 1), 0);
        backend.complete_up_to(copy, 1);
        assert_eq!(backend.peek_completed(gfx), 1);
    }

    #[test]
    fn test_device_lost_fails_calls() {
        let backend = NullBackend::new(NullCompletion::Immediate);
        let queue = backend.create_queue(QueueType::Compute, "q").unwrap();
        backend.set_device_lost(true);

        assert!(matches!(backend.submit(queue, &[], &[], 1), Err(GfxError::DeviceLost(_))));
        assert!(matches!(backend.wait_for_value(queue, 1, None), Err(GfxError::DeviceLost(_))));
    }
}
