use crate::commands::fence::FenceSynchronizer;

/// queue 的种类；command allocator 按照种类回收
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    Compute,
    Copy,
}

impl QueueType {
    pub const COUNT: usize = 3;
    pub const ALL: [QueueType; Self::COUNT] = [QueueType::Graphics, QueueType::Compute, QueueType::Copy];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// queue 的热数据：每次提交和等待都会访问
pub struct GfxQueue {
    pub(crate) queue_type: QueueType,
    pub(crate) sync: FenceSynchronizer,
}

impl GfxQueue {
    #[inline]
    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    #[inline]
    pub fn sync(&self) -> &FenceSynchronizer {
        &self.sync
    }
}

/// queue 的冷数据
#[derive(Clone, Debug)]
pub struct QueueDesc {
    pub debug_name: String,
}
