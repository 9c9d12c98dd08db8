//! 图形 API 后端
//!
//! 运行时只通过 [`GfxBackend`] 与具体的图形 API 交互；后端在设备创建时选定，之后不再改变。
//! 后端对象全部以不透明的 `u64` 表示，运行时不解释其含义。

use std::time::Duration;

use crate::commands::barrier::ResolvedBarriers;
use crate::commands::command_queue::QueueType;
use crate::error::GfxResult;

pub mod null_backend;

/// 后端的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// CPU 模拟，不访问 GPU
    Null,
    Vulkan,
    D3D12,
    Metal,
}

/// 后端的命令队列，以及与之绑定的 timeline 计数器（timeline semaphore / ID3D12Fence / MTLSharedEvent）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct NativeQueue(pub u64);

/// 后端的命令分配器（VkCommandPool / ID3D12CommandAllocator）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct NativeAllocator(pub u64);

/// 后端的命令列表（VkCommandBuffer / ID3D12GraphicsCommandList / MTLCommandBuffer）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct NativeCommandList(pub u64);

/// 提交时插入的 GPU 端等待：在 `queue` 的计数器到达 `value` 之前，本次提交的命令不会开始执行
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeWait {
    pub queue: NativeQueue,
    pub value: u64,
}

/// 后端需要提供的能力
///
/// 除了 `destroy_*` 之外，所有调用都可能失败，失败会原样返回给调用者。
pub trait GfxBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn create_queue(&self, queue_type: QueueType, debug_name: &str) -> GfxResult<NativeQueue>;
    fn destroy_queue(&self, queue: NativeQueue);

    fn create_command_allocator(&self, queue_type: QueueType) -> GfxResult<NativeAllocator>;
    /// 回收 allocator 的全部内存，调用时 allocator 上的所有命令必须已经执行完毕
    fn reset_command_allocator(&self, allocator: NativeAllocator) -> GfxResult<()>;
    fn destroy_command_allocator(&self, allocator: NativeAllocator);

    fn create_command_list(&self, allocator: NativeAllocator, queue_type: QueueType) -> GfxResult<NativeCommandList>;
    fn destroy_command_list(&self, list: NativeCommandList);
    /// 开始录制，list 的命令从 `allocator` 中分配
    fn begin_command_list(&self, list: NativeCommandList, allocator: NativeAllocator, debug_name: &str)
    -> GfxResult<()>;
    fn close_command_list(&self, list: NativeCommandList) -> GfxResult<()>;

    fn emit_barriers(&self, list: NativeCommandList, barriers: &ResolvedBarriers) -> GfxResult<()>;

    /// 提交命令：先插入 `waits` 中的 GPU 端等待，然后执行 `lists`，最后将 queue 的计数器 signal 为 `signal_value`
    fn submit(
        &self,
        queue: NativeQueue,
        lists: &[NativeCommandList],
        waits: &[NativeWait],
        signal_value: u64,
    ) -> GfxResult<()>;

    /// 查询 queue 的计数器当前已经完成的值
    fn completed_value(&self, queue: NativeQueue) -> GfxResult<u64>;

    /// 阻塞直到 queue 的计数器到达 `value`；`timeout` 为 `None` 时无限等待
    ///
    /// # 返回
    /// 超时返回 `Ok(false)`
    fn wait_for_value(&self, queue: NativeQueue, value: u64, timeout: Option<Duration>) -> GfxResult<bool>;
}
