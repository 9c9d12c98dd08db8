use crate::commands::barrier::ResourceBarrierBatcher;
use crate::commands::cmd_allocator::PooledList;
use crate::commands::command_queue::QueueType;

/// command list 在 handle pool 中可见的生命周期
///
/// `get_command_list` 得到 `Recording` 状态的 list，`commit_command_list` 之后进入 `Committed`。
///
/// 提交之后的阶段没有单独的状态：`execute_command_lists` 把记录从 pool 中移除，handle 随之失效，
/// native list 归还给 allocator 并打上提交得到的 [`Fence`](crate::commands::fence::Fence)。
/// 执行中与执行完毕通过这个 fence 查询（`is_fence_completed`），
/// 回到空闲则发生在 allocator 等待 fence 之后被 reset 时。`discard_command_list` 同样使 handle 失效。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandListState {
    Recording,
    Committed,
}

/// command list 的热数据
pub(crate) struct CommandListRecord {
    pub(crate) state: CommandListState,
    pub(crate) queue_type: QueueType,
    /// 录制这个 list 的 submission context
    pub(crate) context_id: u64,
    pub(crate) pooled: PooledList,
    pub(crate) barriers: ResourceBarrierBatcher,
}

/// command list 的冷数据
#[derive(Clone, Debug)]
pub struct CommandListDesc {
    /// 带有 generation 前缀的名字，例如 `[G3]shadow-pass`
    pub debug_name: String,
    pub generation: u64,
}

impl CommandListDesc {
    pub fn new(name: &str, generation: u64) -> Self {
        Self {
            debug_name: format!("[G{}]{}", generation, name),
            generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_name_carries_generation() {
        let desc = CommandListDesc::new("shadow-pass", 3);
        assert_eq!(desc.debug_name, "[G3]shadow-pass");
        assert_eq!(desc.generation, 3);
    }
}
