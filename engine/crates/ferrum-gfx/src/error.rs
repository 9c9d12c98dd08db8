use crate::commands::command_list::CommandListState;
use crate::commands::command_queue::QueueType;
use crate::resources::ResourceKind;

/// GFX 运行时的错误
///
/// 容量耗尽不在这里：那是静态配置的错误，会直接 panic。
#[derive(Debug, thiserror::Error)]
pub enum GfxError {
    /// 句柄越界、已被移除或者来自其他的池
    #[error("invalid or stale {kind} handle: {raw:#x}")]
    InvalidHandle { kind: &'static str, raw: u64 },

    /// 同一个 submission context 上一个 command list 还没有 commit
    #[error("command list {0:#x} is still recording, commit it before requesting another one")]
    ListNotCommitted(u64),

    #[error("command list {raw:#x} is {actual:?}, expected {expected:?}")]
    InvalidListState {
        raw: u64,
        expected: CommandListState,
        actual: CommandListState,
    },

    #[error("command list {raw:#x} belongs to submission context {owner}, not {context}")]
    ForeignCommandList { raw: u64, owner: u64, context: u64 },

    #[error("command list {raw:#x} records {list_type:?} work but was submitted to a {queue_type:?} queue")]
    QueueTypeMismatch {
        raw: u64,
        list_type: QueueType,
        queue_type: QueueType,
    },

    #[error("resource {raw:#x} is a {actual:?}, but the barrier declares a {declared:?}")]
    ResourceKindMismatch {
        raw: u64,
        declared: ResourceKind,
        actual: ResourceKind,
    },

    #[error("descriptor slot {index} was never allocated (current index {current})")]
    InvalidDescriptorSlot { index: u32, current: u32 },

    /// 重复释放同一个槽位
    #[error("descriptor slot {0} is already free")]
    DescriptorSlotAlreadyFree(u32),

    /// 等待一个还没有 signal 的 fence 会永远阻塞
    #[error("fence value {value} has not been signalled yet (last signalled {last_signaled})")]
    FenceFromFuture { value: u64, last_signaled: u64 },

    /// allocator 上还有没有提交也没有丢弃的 command list，不能 reset
    #[error("command allocator for {0:?} still has outstanding command lists")]
    AllocatorBusy(QueueType),

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("backend call `{call}` failed: {message}")]
    Backend { call: &'static str, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type GfxResult<T> = Result<T, GfxError>;
