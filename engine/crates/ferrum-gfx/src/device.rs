//! 运行时的入口
//!
//! [`GfxDevice`] 持有后端以及所有全局的池：queue、command list、资源、描述符表。
//! 所有接口都可以从多个线程同时调用；录制相关的接口需要调用线程自己的 [`SubmissionContext`]。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};

use crate::backend::{BackendKind, GfxBackend, NativeCommandList, NativeQueue, NativeWait};
use crate::commands::barrier::{
    BarrierSync, ResolvedBarriers, ResourceBarrierBatcher, ResourceBarrierRequest, ResourceState,
};
use crate::commands::cmd_allocator::AllocatorRecyclingPool;
use crate::commands::command_list::{CommandListDesc, CommandListRecord, CommandListState};
use crate::commands::command_queue::{GfxQueue, QueueDesc, QueueType};
use crate::commands::fence::{Fence, FenceSynchronizer};
use crate::commands::submission_context::SubmissionContext;
use crate::config::GfxConfig;
use crate::descriptors::slot_allocator::{DescriptorSlot, DescriptorSlotAllocator};
use crate::error::{GfxError, GfxResult};
use crate::handles::{CommandListHandle, QueueHandle, RawHandle, ResourceHandle};
use crate::pool::handle_pool::HandlePool;
use crate::resources::{ResourceDesc, ResourceKind};

pub struct GfxDevice {
    backend: Box<dyn GfxBackend>,
    config: GfxConfig,

    /// queue 以 `Arc` 存放：等待 fence 时不持有池的锁
    queues: RwLock<HandlePool<QueueHandle, Arc<GfxQueue>, QueueDesc>>,
    command_lists: Mutex<HandlePool<CommandListHandle, CommandListRecord, CommandListDesc>>,
    resources: RwLock<HandlePool<ResourceHandle, ResourceKind, ResourceDesc>>,
    descriptors: DescriptorSlotAllocator,

    /// 每次 `reset_allocators` 加一，submission context 据此丢弃缓存的 allocator
    reset_generation: AtomicU64,
    next_context_id: AtomicU64,
    live_contexts: AtomicUsize,

    destroyed: AtomicBool,
}

// new & init
impl GfxDevice {
    pub fn new<B: GfxBackend + 'static>(backend: B, config: GfxConfig) -> GfxResult<Self> {
        config.validate()?;
        log::info!("Creating GfxDevice on {:?} backend with {:?}", backend.kind(), config);

        Ok(Self {
            backend: Box::new(backend),
            queues: RwLock::new(HandlePool::new("queues", config.max_queues)),
            command_lists: Mutex::new(HandlePool::new("command-lists", config.max_command_lists)),
            resources: RwLock::new(HandlePool::new("resources", config.max_resources)),
            descriptors: DescriptorSlotAllocator::new(config.descriptor_table_size),
            reset_generation: AtomicU64::new(0),
            next_context_id: AtomicU64::new(1),
            live_contexts: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            config,
        })
    }

    pub fn create_queue(&self, queue_type: QueueType, debug_name: &str) -> GfxResult<QueueHandle> {
        let native = self.backend.create_queue(queue_type, debug_name)?;
        let queue = Arc::new(GfxQueue {
            queue_type,
            sync: FenceSynchronizer::new(native),
        });
        let handle = self.queues.write().add_with_extended(
            queue,
            QueueDesc {
                debug_name: debug_name.to_string(),
            },
        );

        log::info!("Created {:?} queue `{}`: {:#x}", queue_type, debug_name, handle.to_raw());
        Ok(handle)
    }

    /// 每个录制线程持有一个
    pub fn create_submission_context(&self) -> SubmissionContext {
        let id = self.next_context_id.fetch_add(1, Ordering::Relaxed);
        self.live_contexts.fetch_add(1, Ordering::AcqRel);

        let mut allocators = AllocatorRecyclingPool::new(
            self.config.max_allocators_per_queue_type,
            self.config.max_lists_per_allocator,
        );
        allocators.sync_generation(self.reset_generation());

        log::debug!("Created SubmissionContext #{}", id);
        SubmissionContext::new(id, allocators)
    }

    pub fn register_resource(&self, desc: ResourceDesc) -> ResourceHandle {
        let kind = desc.kind;
        let handle = self.resources.write().add_with_extended(kind, desc);
        log::trace!("registered {:?} {:#x}", kind, handle.to_raw());
        handle
    }
}

// destroy
impl GfxDevice {
    /// 归还 submission context，销毁其中的 allocator 和 command list
    ///
    /// 这个 context 录制的、还没有提交的 command list 会被丢弃。
    pub fn release_submission_context(&self, mut ctx: SubmissionContext) -> GfxResult<()> {
        let abandoned = {
            let mut lists = self.command_lists.lock();
            let owned = lists
                .iter()
                .filter(|(_, record)| record.context_id == ctx.id)
                .map(|(handle, _)| handle)
                .collect_vec();
            owned.into_iter().filter_map(|handle| lists.remove_with_extended(handle)).collect_vec()
        };
        for (record, desc) in abandoned {
            log::warn!(
                "SubmissionContext #{} released with unsubmitted command list `{}`",
                ctx.id,
                desc.map(|d| d.debug_name).unwrap_or_default()
            );
            record.pooled.release(None);
        }
        ctx.open_list = None;

        // 即使等待失败，allocator 和 list 也已经全部销毁，context 视为已归还
        let result = ctx.allocators.destroy(self.backend.as_ref(), &mut |fence| self.wait_for_allocator_fence(fence));
        ctx.released = true;
        self.live_contexts.fetch_sub(1, Ordering::AcqRel);

        log::debug!("Released SubmissionContext #{}", ctx.id);
        result
    }

    /// 设备销毁时已经等待所有 queue 空闲，queue 被销毁之后它的 fence 都视为已完成
    fn wait_for_allocator_fence(&self, fence: Fence) -> GfxResult<()> {
        if self.destroyed.load(Ordering::Acquire) && !self.queues.read().contains(fence.queue) {
            return Ok(());
        }
        self.wait_for_fence_on_cpu(fence)
    }

    pub fn destroy_resource(&self, resource: ResourceHandle) -> GfxResult<ResourceDesc> {
        let (kind, desc) = self.resources.write().remove_with_extended(resource).ok_or_else(|| {
            log::error!("destroying invalid resource handle {:#x}", resource.to_raw());
            invalid_handle("resource", resource)
        })?;
        Ok(desc.unwrap_or_else(|| ResourceDesc {
            kind,
            debug_name: String::new(),
            size: 0,
        }))
    }

    /// 等待所有 queue 空闲，然后销毁 queue 以及还没有提交的 command list
    ///
    /// 所有的 submission context 应该在这之前归还。
    pub fn destroy(&self) -> GfxResult<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let live_contexts = self.live_contexts.load(Ordering::Acquire);
        if live_contexts > 0 {
            log::warn!("destroying GfxDevice with {} unreleased submission contexts", live_contexts);
        }

        self.wait_idle()?;

        for (_, record, desc) in self.command_lists.lock().drain() {
            log::warn!("discarding unsubmitted command list `{}`", desc.map(|d| d.debug_name).unwrap_or_default());
            record.pooled.release(None);
        }
        for (_, queue, desc) in self.queues.write().drain() {
            log::info!("Destroying queue `{}`", desc.map(|d| d.debug_name).unwrap_or_default());
            self.backend.destroy_queue(queue.sync.native());
        }
        Ok(())
    }
}

impl Drop for GfxDevice {
    fn drop(&mut self) {
        log::info!("Dropping GfxDevice");
        if let Err(e) = self.destroy() {
            log::error!("failed to destroy GfxDevice: {}", e);
        }
    }
}

// getters
impl GfxDevice {
    #[inline]
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    #[inline]
    pub fn config(&self) -> &GfxConfig {
        &self.config
    }

    #[inline]
    pub fn reset_generation(&self) -> u64 {
        self.reset_generation.load(Ordering::Acquire)
    }

    pub fn queue_type(&self, queue: QueueHandle) -> GfxResult<QueueType> {
        Ok(self.queue(queue)?.queue_type())
    }

    pub fn native_queue(&self, queue: QueueHandle) -> GfxResult<NativeQueue> {
        Ok(self.queue(queue)?.sync().native())
    }

    /// queue 上最近一次提交得到的 fence 值
    pub fn queue_last_signaled(&self, queue: QueueHandle) -> GfxResult<u64> {
        Ok(self.queue(queue)?.sync().last_signaled())
    }

    pub fn resource_kind(&self, resource: ResourceHandle) -> GfxResult<ResourceKind> {
        self.resources.read().get(resource).copied().ok_or_else(|| invalid_handle("resource", resource))
    }

    pub fn resource_desc(&self, resource: ResourceHandle) -> GfxResult<ResourceDesc> {
        self.resources.read().get_extended(resource).cloned().ok_or_else(|| invalid_handle("resource", resource))
    }

    pub fn command_list_state(&self, list: CommandListHandle) -> GfxResult<CommandListState> {
        self.command_lists
            .lock()
            .get(list)
            .map(|record| record.state)
            .ok_or_else(|| invalid_handle("command list", list))
    }

    /// 带有 generation 前缀的调试名
    pub fn command_list_name(&self, list: CommandListHandle) -> GfxResult<String> {
        self.command_lists
            .lock()
            .get_extended(list)
            .map(|desc| desc.debug_name.clone())
            .ok_or_else(|| invalid_handle("command list", list))
    }

    fn queue(&self, queue: QueueHandle) -> GfxResult<Arc<GfxQueue>> {
        self.queues.read().get(queue).cloned().ok_or_else(|| {
            log::error!("invalid queue handle {:#x}", queue.to_raw());
            invalid_handle("queue", queue)
        })
    }
}

// recording
impl GfxDevice {
    /// 标记一个新的 generation：所有 submission context 在下一次获取 command list 时切换到下一个 allocator
    ///
    /// 通常每帧调用一次。
    ///
    /// # 返回
    /// 新的 generation
    pub fn reset_allocators(&self) -> u64 {
        let generation = self.reset_generation.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("reset allocators, generation {}", generation);
        generation
    }

    /// 获取一个处于录制状态的 command list
    ///
    /// 同一个 context 上一个 command list 还没有 commit 时返回 [`GfxError::ListNotCommitted`]。
    /// 需要复用的 allocator 还有未完成的 GPU 工作时会阻塞。
    pub fn get_command_list(
        &self,
        ctx: &mut SubmissionContext,
        queue_type: QueueType,
        debug_name: &str,
    ) -> GfxResult<CommandListHandle> {
        if let Some(open) = ctx.open_list {
            log::error!(
                "SubmissionContext #{} requested a command list while {:#x} is still recording",
                ctx.id,
                open.to_raw()
            );
            return Err(GfxError::ListNotCommitted(open.to_raw()));
        }

        let generation = self.reset_generation();
        ctx.allocators.sync_generation(generation);

        let pooled = ctx.allocators.acquire_list(self.backend.as_ref(), queue_type, &mut |fence| {
            self.wait_for_fence_on_cpu(fence)
        })?;

        let desc = CommandListDesc::new(debug_name, generation);
        if let Err(e) = self.backend.begin_command_list(pooled.native, pooled.allocator, &desc.debug_name) {
            pooled.release(None);
            return Err(e);
        }

        let record = CommandListRecord {
            state: CommandListState::Recording,
            queue_type,
            context_id: ctx.id,
            pooled,
            barriers: ResourceBarrierBatcher::new(
                self.config.max_tracked_resources_per_barrier_pool,
                self.config.max_pending_barriers,
                self.config.log_barriers,
            ),
        };
        let handle = self.command_lists.lock().add_with_extended(record, desc);
        ctx.open_list = Some(handle);

        Ok(handle)
    }

    /// 声明接下来对资源的使用方式，在下一次 flush 时解析
    pub fn enqueue_barrier(&self, list: CommandListHandle, request: ResourceBarrierRequest) -> GfxResult<()> {
        let actual = self.resource_kind(request.resource)?;
        if actual != request.kind {
            log::error!(
                "barrier for resource {:#x} declares {:?} but the resource is a {:?}",
                request.resource.to_raw(),
                request.kind,
                actual
            );
            return Err(GfxError::ResourceKindMismatch {
                raw: request.resource.to_raw(),
                declared: request.kind,
                actual,
            });
        }

        let mut lists = self.command_lists.lock();
        let record = recording_list(&mut lists, list)?;
        record.barriers.enqueue_barrier(request);
        Ok(())
    }

    /// 告知资源在这个 command list 开始时的状态
    pub fn import_resource_state(
        &self,
        list: CommandListHandle,
        resource: ResourceHandle,
        state: ResourceState,
    ) -> GfxResult<()> {
        self.resource_kind(resource)?;

        let mut lists = self.command_lists.lock();
        let record = recording_list(&mut lists, list)?;
        record.barriers.import_state(resource, state);
        Ok(())
    }

    /// 解析所有积累的 barrier 请求并录制到 command list 中
    ///
    /// # 返回
    /// 实际录制的 barrier 数量
    pub fn flush_barriers(&self, list: CommandListHandle, current_stage: BarrierSync) -> GfxResult<usize> {
        profile_span!("GfxDevice::flush_barriers");

        let (native, resolved, saved) = {
            let mut lists = self.command_lists.lock();
            let record = recording_list(&mut lists, list)?;
            let saved = (record.barriers.pending_count() > 0).then(|| record.barriers.clone());
            (record.pooled.native, record.barriers.generate_barrier_commands(current_stage), saved)
        };

        if let Some(saved) = saved.filter(|_| !resolved.is_empty()) {
            self.emit_or_restore(list, native, &resolved, saved)?;
        }
        Ok(resolved.len())
    }

    /// 结束录制；还没有 flush 的 barrier 在这里以 [`BarrierSync::ALL`] 录制
    pub fn commit_command_list(&self, ctx: &mut SubmissionContext, list: CommandListHandle) -> GfxResult<()> {
        let (native, leftovers) = {
            let mut lists = self.command_lists.lock();
            let record = owned_list(&mut lists, list, ctx.id)?;
            if record.state != CommandListState::Recording {
                return Err(list_state_error(list, CommandListState::Recording, record.state));
            }

            let leftovers = (record.barriers.pending_count() > 0)
                .then(|| {
                    let saved = record.barriers.clone();
                    (record.barriers.generate_barrier_commands(BarrierSync::ALL), saved)
                })
                .filter(|(barriers, _)| !barriers.is_empty());
            (record.pooled.native, leftovers)
        };

        if let Some((leftovers, saved)) = leftovers {
            self.emit_or_restore(list, native, &leftovers, saved)?;
        }
        self.backend.close_command_list(native)?;

        if let Some(record) = self.command_lists.lock().get_mut(list) {
            record.state = CommandListState::Committed;
        }
        if ctx.open_list == Some(list) {
            ctx.open_list = None;
        }
        Ok(())
    }

    /// 丢弃一个不打算提交的 command list，handle 随之失效
    pub fn discard_command_list(&self, ctx: &mut SubmissionContext, list: CommandListHandle) -> GfxResult<()> {
        let (record, _) = {
            let mut lists = self.command_lists.lock();
            owned_list(&mut lists, list, ctx.id)?;
            lists.remove_with_extended(list).ok_or_else(|| invalid_handle("command list", list))?
        };

        if record.state == CommandListState::Recording {
            if let Err(e) = self.backend.close_command_list(record.pooled.native) {
                log::error!("failed to close discarded command list {:#x}: {}", list.to_raw(), e);
            }
        }
        record.pooled.release(None);

        if ctx.open_list == Some(list) {
            ctx.open_list = None;
        }
        Ok(())
    }

    /// 录制失败时把 barrier 合并器恢复到 flush 之前，请求可以在下一次 flush 或者 commit 时重新录制
    fn emit_or_restore(
        &self,
        list: CommandListHandle,
        native: NativeCommandList,
        resolved: &ResolvedBarriers,
        saved: ResourceBarrierBatcher,
    ) -> GfxResult<()> {
        if let Err(e) = self.backend.emit_barriers(native, resolved) {
            log::error!("failed to record barriers into command list {:#x}: {}", list.to_raw(), e);
            if let Some(record) = self.command_lists.lock().get_mut(list) {
                record.barriers = saved;
            }
            return Err(e);
        }
        Ok(())
    }
}

// submission & synchronization
impl GfxDevice {
    /// 提交一组已经 commit 的 command list
    ///
    /// `waits` 中的 fence 在 GPU 端等待：它们完成之前，这次提交的命令不会开始执行。
    /// 提交之后（无论成功与否）所有 list 的 handle 都失效。
    ///
    /// # 返回
    /// 这次提交的 fence
    pub fn execute_command_lists(
        &self,
        queue: QueueHandle,
        lists: &[CommandListHandle],
        waits: &[Fence],
    ) -> GfxResult<Fence> {
        profile_span!("GfxDevice::execute_command_lists");

        let target = self.queue(queue)?;
        let native_waits = self.native_waits(queue, waits)?;

        if let Some((_, &duplicate)) = lists.iter().enumerate().find(|(i, list)| lists[..*i].contains(list)) {
            log::error!("command list {:#x} was passed to execute_command_lists more than once", duplicate.to_raw());
            return Err(invalid_handle("command list", duplicate));
        }

        let records = {
            let mut pool = self.command_lists.lock();
            for &list in lists {
                let record = pool.get(list).ok_or_else(|| invalid_handle("command list", list))?;
                if record.state != CommandListState::Committed {
                    log::error!("executing command list {:#x} which was not committed", list.to_raw());
                    return Err(list_state_error(list, CommandListState::Committed, record.state));
                }
                if record.queue_type != target.queue_type() {
                    log::error!(
                        "command list {:#x} records {:?} work but was submitted to a {:?} queue",
                        list.to_raw(),
                        record.queue_type,
                        target.queue_type()
                    );
                    return Err(GfxError::QueueTypeMismatch {
                        raw: list.to_raw(),
                        list_type: record.queue_type,
                        queue_type: target.queue_type(),
                    });
                }
            }
            lists.iter().filter_map(|&list| pool.remove(list)).collect_vec()
        };

        let natives = records.iter().map(|record| record.pooled.native).collect_vec();
        let value = match target.sync().submit(self.backend.as_ref(), &natives, &native_waits) {
            Ok(value) => value,
            Err(e) => {
                log::error!("submission to queue {:#x} failed: {}", queue.to_raw(), e);
                for record in &records {
                    record.pooled.release(None);
                }
                return Err(e);
            }
        };

        // 先记录 fence，再归还 list
        let fence = Fence::new(queue, value);
        for record in &records {
            record.pooled.release(Some(fence));
        }
        Ok(fence)
    }

    /// 阻塞直到 fence 完成；超过配置的超时时间返回 [`GfxError::DeviceLost`]
    pub fn wait_for_fence_on_cpu(&self, fence: Fence) -> GfxResult<()> {
        if fence.is_null() {
            return Ok(());
        }
        let queue = self.queue(fence.queue)?;
        queue.sync().wait_on_cpu(self.backend.as_ref(), fence.value, self.config.fence_wait_timeout())
    }

    /// 非阻塞地检查 fence 是否完成
    pub fn is_fence_completed(&self, fence: Fence) -> GfxResult<bool> {
        if fence.is_null() {
            return Ok(true);
        }
        let queue = self.queue(fence.queue)?;
        queue.sync().is_completed(self.backend.as_ref(), fence.value)
    }

    /// 等待所有 queue 上已经提交的工作完成
    pub fn wait_idle(&self) -> GfxResult<()> {
        let queues = self.queues.read().iter().map(|(handle, queue)| (handle, queue.clone())).collect_vec();
        for (handle, queue) in queues {
            self.wait_for_fence_on_cpu(Fence::new(handle, queue.sync().last_signaled()))?;
        }
        Ok(())
    }

    fn native_waits(&self, queue: QueueHandle, waits: &[Fence]) -> GfxResult<Vec<NativeWait>> {
        let mut native_waits = Vec::with_capacity(waits.len());
        for wait in waits.iter().filter(|w| !w.is_null()) {
            let source = self.queue(wait.queue)?;
            let last_signaled = source.sync().last_signaled();
            if wait.value > last_signaled {
                log::error!("GPU wait on fence value {} which has not been submitted yet", wait.value);
                return Err(GfxError::FenceFromFuture {
                    value: wait.value,
                    last_signaled,
                });
            }
            // 同一个 queue 上按照提交顺序执行，已经完成的 fence 也不需要等待
            if wait.queue == queue || wait.value <= source.sync().cached_completed() {
                continue;
            }
            native_waits.push(NativeWait {
                queue: source.sync().native(),
                value: wait.value,
            });
        }
        Ok(native_waits)
    }
}

// descriptors
impl GfxDevice {
    /// # Panics
    /// 描述符表已满
    #[inline]
    pub fn allocate_descriptor(&self) -> DescriptorSlot {
        self.descriptors.allocate()
    }

    #[inline]
    pub fn free_descriptor(&self, slot: DescriptorSlot) -> GfxResult<()> {
        self.descriptors.free(slot)
    }
}

fn invalid_handle<K: RawHandle>(kind: &'static str, handle: K) -> GfxError {
    GfxError::InvalidHandle {
        kind,
        raw: handle.to_raw(),
    }
}

fn list_state_error(list: CommandListHandle, expected: CommandListState, actual: CommandListState) -> GfxError {
    GfxError::InvalidListState {
        raw: list.to_raw(),
        expected,
        actual,
    }
}

/// 取出一个处于录制状态的 list
fn recording_list<'a>(
    lists: &'a mut HandlePool<CommandListHandle, CommandListRecord, CommandListDesc>,
    list: CommandListHandle,
) -> GfxResult<&'a mut CommandListRecord> {
    let record = lists.get_mut(list).ok_or_else(|| {
        log::error!("invalid or stale command list handle {:#x}", list.to_raw());
        invalid_handle("command list", list)
    })?;
    if record.state != CommandListState::Recording {
        log::error!("command list {:#x} is {:?}, it can no longer record", list.to_raw(), record.state);
        return Err(list_state_error(list, CommandListState::Recording, record.state));
    }
    Ok(record)
}

/// 取出一个属于 `context` 的 list
fn owned_list<'a>(
    lists: &'a mut HandlePool<CommandListHandle, CommandListRecord, CommandListDesc>,
    list: CommandListHandle,
    context: u64,
) -> GfxResult<&'a mut CommandListRecord> {
    let record = lists.get_mut(list).ok_or_else(|| invalid_handle("command list", list))?;
    if record.context_id != context {
        log::error!(
            "command list {:#x} belongs to SubmissionContext #{}, not #{}",
            list.to_raw(),
            record.context_id,
            context
        );
        return Err(GfxError::ForeignCommandList {
            raw: list.to_raw(),
            owner: record.context_id,
            context,
        });
    }
    Ok(record)
}
