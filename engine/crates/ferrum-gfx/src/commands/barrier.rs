//! Barrier 合并
//!
//! 录制命令时只需要声明"接下来要以什么方式使用某个资源"，在进入下一个同步阶段之前统一 flush：
//! 根据每个资源最后已知的状态补全 barrier 的 before 部分，并且保证每次 flush 每个资源最多只产生一个 barrier。

use indexmap::IndexMap;
use indexmap::map::Entry;

use crate::handles::{RawHandle, ResourceHandle};
use crate::resources::ResourceKind;

bitflags::bitflags! {
    /// 同步阶段：barrier 之前需要等待的阶段，以及之后会被阻塞的阶段
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BarrierSync: u32 {
        const ALL = 1 << 0;
        const DRAW = 1 << 1;
        const INDEX_INPUT = 1 << 2;
        const VERTEX_SHADING = 1 << 3;
        const PIXEL_SHADING = 1 << 4;
        const DEPTH_STENCIL = 1 << 5;
        const RENDER_TARGET = 1 << 6;
        const COMPUTE_SHADING = 1 << 7;
        const RAYTRACING = 1 << 8;
        const COPY = 1 << 9;
        const RESOLVE = 1 << 10;
        const EXECUTE_INDIRECT = 1 << 11;
        const ALL_SHADING = 1 << 12;
    }
}

bitflags::bitflags! {
    /// 资源的访问方式；空集合表示没有访问
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BarrierAccess: u32 {
        const VERTEX_BUFFER = 1 << 0;
        const CONSTANT_BUFFER = 1 << 1;
        const INDEX_BUFFER = 1 << 2;
        const RENDER_TARGET = 1 << 3;
        const UNORDERED_ACCESS = 1 << 4;
        const DEPTH_STENCIL_WRITE = 1 << 5;
        const DEPTH_STENCIL_READ = 1 << 6;
        const SHADER_RESOURCE = 1 << 7;
        const INDIRECT_ARGUMENT = 1 << 8;
        const COPY_DEST = 1 << 9;
        const COPY_SOURCE = 1 << 10;
        const RESOLVE_DEST = 1 << 11;
        const RESOLVE_SOURCE = 1 << 12;
    }
}

impl BarrierAccess {
    pub const WRITE_MASK: Self = Self::RENDER_TARGET
        .union(Self::UNORDERED_ACCESS)
        .union(Self::DEPTH_STENCIL_WRITE)
        .union(Self::COPY_DEST)
        .union(Self::RESOLVE_DEST);

    #[inline]
    pub fn is_write(self) -> bool {
        self.intersects(Self::WRITE_MASK)
    }
}

/// texture 的布局
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BarrierLayout {
    /// 内容可以被丢弃
    Undefined,
    Common,
    Present,
    RenderTarget,
    DepthStencilWrite,
    DepthStencilRead,
    ShaderResource,
    UnorderedAccess,
    CopySource,
    CopyDest,
    ResolveSource,
    ResolveDest,
}

/// 资源最后已知的状态；只在一个 command list 的生命周期内有效
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceState {
    pub sync: BarrierSync,
    pub access: BarrierAccess,
    /// 只有 texture 有布局
    pub layout: Option<BarrierLayout>,
}

impl ResourceState {
    pub fn buffer(sync: BarrierSync, access: BarrierAccess) -> Self {
        Self {
            sync,
            access,
            layout: None,
        }
    }

    pub fn texture(sync: BarrierSync, access: BarrierAccess, layout: BarrierLayout) -> Self {
        Self {
            sync,
            access,
            layout: Some(layout),
        }
    }
}

/// 一次资源状态转换的声明
///
/// `None` 表示不指定：before 部分在 flush 时根据资源最后已知的状态补全，`sync_after`
/// 默认为 flush 时进入的阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceBarrierRequest {
    pub resource: ResourceHandle,
    pub kind: ResourceKind,

    pub sync_before: Option<BarrierSync>,
    pub sync_after: Option<BarrierSync>,
    pub access_before: Option<BarrierAccess>,
    pub access_after: BarrierAccess,
    pub layout_before: Option<BarrierLayout>,
    pub layout_after: Option<BarrierLayout>,
}

// new & init
impl ResourceBarrierRequest {
    fn new(resource: ResourceHandle, kind: ResourceKind) -> Self {
        Self {
            resource,
            kind,
            sync_before: None,
            sync_after: None,
            access_before: None,
            access_after: BarrierAccess::empty(),
            layout_before: None,
            layout_after: None,
        }
    }

    pub fn buffer(resource: ResourceHandle) -> Self {
        Self::new(resource, ResourceKind::Buffer)
    }

    pub fn texture(resource: ResourceHandle) -> Self {
        Self::new(resource, ResourceKind::Texture)
    }
}

// builder
impl ResourceBarrierRequest {
    #[inline]
    pub fn after(mut self, access: BarrierAccess) -> Self {
        self.access_after = access;
        self
    }

    #[inline]
    pub fn after_sync(mut self, sync: BarrierSync) -> Self {
        self.sync_after = Some(sync);
        self
    }

    /// builder
    /// buffer 没有布局，设置了也会被忽略
    #[inline]
    pub fn after_layout(mut self, layout: BarrierLayout) -> Self {
        self.layout_after = Some(layout);
        self
    }

    #[inline]
    pub fn before(mut self, access: BarrierAccess) -> Self {
        self.access_before = Some(access);
        self
    }

    #[inline]
    pub fn before_sync(mut self, sync: BarrierSync) -> Self {
        self.sync_before = Some(sync);
        self
    }

    #[inline]
    pub fn before_layout(mut self, layout: BarrierLayout) -> Self {
        self.layout_before = Some(layout);
        self
    }
}

/// 所有字段都已经确定的 barrier，交给后端翻译为具体的 API 调用
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedBarrier {
    pub resource: ResourceHandle,
    pub kind: ResourceKind,

    pub sync_before: BarrierSync,
    pub sync_after: BarrierSync,
    pub access_before: BarrierAccess,
    pub access_after: BarrierAccess,
    pub layout_before: Option<BarrierLayout>,
    pub layout_after: Option<BarrierLayout>,
}

impl ResolvedBarrier {
    #[inline]
    pub fn before_state(&self) -> ResourceState {
        ResourceState {
            sync: self.sync_before,
            access: self.access_before,
            layout: self.layout_before,
        }
    }

    #[inline]
    pub fn after_state(&self) -> ResourceState {
        ResourceState {
            sync: self.sync_after,
            access: self.access_after,
            layout: self.layout_after,
        }
    }

    /// 这个 barrier 之后资源应该被记录的状态
    ///
    /// 被跳过的 read→read 不会等待之前的读者，之前读者的 stage 和 access 要继续累积，
    /// 后续的写操作才能等待所有的读者
    pub fn tracked_state(&self) -> ResourceState {
        if self.needs_barrier() {
            return self.after_state();
        }
        ResourceState {
            sync: self.sync_before | self.sync_after,
            access: self.access_before | self.access_after,
            layout: self.layout_after,
        }
    }

    /// 检查是否真的需要 barrier
    ///
    /// 布局相同且前后都是只读访问时可以跳过；before 没有任何访问信息时保守地保留
    pub fn needs_barrier(&self) -> bool {
        // Layout 不同一定需要 barrier
        if self.layout_before != self.layout_after {
            return true;
        }

        // 有写操作需要 barrier（确保可见性）
        if self.access_before.is_write() || self.access_after.is_write() {
            return true;
        }

        self.access_before.is_empty()
    }
}

/// 一次 flush 的结果，按照资源种类分开
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedBarriers {
    pub buffers: Vec<ResolvedBarrier>,
    pub textures: Vec<ResolvedBarrier>,
}

impl ResolvedBarriers {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.textures.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffers.len() + self.textures.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedBarrier> {
        self.buffers.iter().chain(self.textures.iter())
    }
}

/// 单个 command list 的 barrier 合并器
///
/// 只被录制这个 command list 的线程访问，不需要同步。command list 提交之后整个合并器被丢弃，
/// 跟踪的资源状态也随之失效。
#[derive(Clone)]
pub struct ResourceBarrierBatcher {
    /// 资源最后已知的状态
    states: IndexMap<ResourceHandle, ResourceState>,
    /// 还没有 flush 的请求，按照声明的顺序
    pending: Vec<ResourceBarrierRequest>,

    max_tracked_resources: usize,
    max_pending: usize,
    /// 诊断模式：记录每一个解析后的 barrier
    log_barriers: bool,
}

// new & init
impl ResourceBarrierBatcher {
    pub fn new(max_tracked_resources: usize, max_pending: usize, log_barriers: bool) -> Self {
        Self {
            states: IndexMap::with_capacity(max_tracked_resources),
            pending: Vec::with_capacity(max_pending),
            max_tracked_resources,
            max_pending,
            log_barriers,
        }
    }
}

// getters
impl ResourceBarrierBatcher {
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn tracked_count(&self) -> usize {
        self.states.len()
    }

    #[inline]
    pub fn known_state(&self, resource: ResourceHandle) -> Option<ResourceState> {
        self.states.get(&resource).copied()
    }
}

// tools
impl ResourceBarrierBatcher {
    /// 原样记录一个请求，等待 flush
    ///
    /// # Panics
    /// 请求队列已满
    pub fn enqueue_barrier(&mut self, request: ResourceBarrierRequest) {
        if self.pending.len() >= self.max_pending {
            log::error!(
                "barrier queue is full ({} pending requests), flush more often or raise max_pending_barriers",
                self.max_pending
            );
            panic!("barrier queue exhausted: capacity {}", self.max_pending);
        }
        self.pending.push(request);
    }

    /// 告知资源在这个 command list 开始时的状态，例如从 swapchain 获取的图像处于 Present 布局
    pub fn import_state(&mut self, resource: ResourceHandle, state: ResourceState) {
        self.track(resource, state);
    }

    /// 解析所有待处理的请求，生成需要执行的 barriers
    ///
    /// # 参数
    /// - `current_stage`: 即将进入的同步阶段，作为没有指定 `sync_after` 的请求的默认值
    pub fn generate_barrier_commands(&mut self, current_stage: BarrierSync) -> ResolvedBarriers {
        profile_span!("ResourceBarrierBatcher::generate_barrier_commands");

        let mut pending = std::mem::take(&mut self.pending);
        let mut merged: IndexMap<ResourceHandle, ResolvedBarrier> = IndexMap::with_capacity(pending.len());

        for request in pending.drain(..) {
            let resolved = Self::resolve(&request, self.known_state(request.resource), current_stage);
            self.track(request.resource, resolved.tracked_state());

            match merged.entry(request.resource) {
                // 同一次 flush 中多次声明同一个资源：保留第一次的 before 和最后一次的 after
                Entry::Occupied(mut entry) => {
                    let barrier = entry.get_mut();
                    if resolved.needs_barrier() {
                        barrier.sync_after = resolved.sync_after;
                        barrier.access_after = resolved.access_after;
                    } else {
                        // 追加的读者并入同一个 barrier
                        barrier.sync_after |= resolved.sync_after;
                        barrier.access_after |= resolved.access_after;
                    }
                    barrier.layout_after = resolved.layout_after;
                }
                Entry::Vacant(entry) => {
                    entry.insert(resolved);
                }
            }
        }
        // 保留 Vec 的内存，下次 flush 复用
        self.pending = pending;

        let mut barriers = ResolvedBarriers::default();
        for barrier in merged.into_values().filter(ResolvedBarrier::needs_barrier) {
            if self.log_barriers {
                log::debug!(
                    "barrier {:#x} ({:?}): {:?}/{:?}/{:?} -> {:?}/{:?}/{:?}",
                    barrier.resource.to_raw(),
                    barrier.kind,
                    barrier.sync_before,
                    barrier.access_before,
                    barrier.layout_before,
                    barrier.sync_after,
                    barrier.access_after,
                    barrier.layout_after,
                );
            }
            match barrier.kind {
                ResourceKind::Buffer => barriers.buffers.push(barrier),
                ResourceKind::Texture => barriers.textures.push(barrier),
            }
        }
        barriers
    }

    /// 丢弃所有状态和请求
    pub fn reset(&mut self) {
        self.states.clear();
        self.pending.clear();
    }

    fn resolve(
        request: &ResourceBarrierRequest,
        prior: Option<ResourceState>,
        current_stage: BarrierSync,
    ) -> ResolvedBarrier {
        let sync_before = request.sync_before.or(prior.map(|s| s.sync)).unwrap_or(BarrierSync::empty());
        let access_before = request.access_before.or(prior.map(|s| s.access)).unwrap_or(BarrierAccess::empty());

        let (layout_before, layout_after) = match request.kind {
            ResourceKind::Buffer => (None, None),
            ResourceKind::Texture => {
                let before =
                    request.layout_before.or(prior.and_then(|s| s.layout)).unwrap_or(BarrierLayout::Undefined);
                // 没有指定目标布局时保持原布局
                let after = request.layout_after.unwrap_or(before);
                (Some(before), Some(after))
            }
        };

        ResolvedBarrier {
            resource: request.resource,
            kind: request.kind,
            sync_before,
            sync_after: request.sync_after.unwrap_or(current_stage),
            access_before,
            access_after: request.access_after,
            layout_before,
            layout_after,
        }
    }

    fn track(&mut self, resource: ResourceHandle, state: ResourceState) {
        if let Some(known) = self.states.get_mut(&resource) {
            *known = state;
            return;
        }
        if self.states.len() >= self.max_tracked_resources {
            log::error!(
                "barrier state table is full ({} resources), raise max_tracked_resources_per_barrier_pool",
                self.max_tracked_resources
            );
            panic!("barrier state table exhausted: capacity {}", self.max_tracked_resources);
        }
        self.states.insert(resource, state);
    }
}
