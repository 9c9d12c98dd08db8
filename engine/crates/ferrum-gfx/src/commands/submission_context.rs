use crate::commands::cmd_allocator::AllocatorRecyclingPool;
use crate::handles::CommandListHandle;

/// 录制线程的提交上下文
///
/// 持有这个线程自己的 [`AllocatorRecyclingPool`]，同一时刻最多有一个正在录制的 command list。
/// 由 [`GfxDevice::create_submission_context`](crate::device::GfxDevice::create_submission_context) 创建，
/// 需要通过 [`GfxDevice::release_submission_context`](crate::device::GfxDevice::release_submission_context) 归还。
pub struct SubmissionContext {
    pub(crate) id: u64,
    pub(crate) allocators: AllocatorRecyclingPool,
    pub(crate) open_list: Option<CommandListHandle>,
    pub(crate) released: bool,
}

impl SubmissionContext {
    pub(crate) fn new(id: u64, allocators: AllocatorRecyclingPool) -> Self {
        Self {
            id,
            allocators,
            open_list: None,
            released: false,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 正在录制的 command list
    #[inline]
    pub fn open_list(&self) -> Option<CommandListHandle> {
        self.open_list
    }

    #[inline]
    pub fn allocators(&self) -> &AllocatorRecyclingPool {
        &self.allocators
    }
}

impl Drop for SubmissionContext {
    fn drop(&mut self) {
        if !self.released {
            log::warn!("SubmissionContext #{} dropped without being released; its command allocators leak", self.id);
        }
    }
}
