use slotmap::{Key, KeyData, new_key_type};

new_key_type! {
    /// 命令队列
    pub struct QueueHandle;
    /// 一次录制单元，提交之后失效
    pub struct CommandListHandle;
    /// GPU 资源（buffer 或 texture）
    pub struct ResourceHandle;
}

/// 句柄与 ABI 稳定的 `u64` 之间的转换
///
/// 低 32 位是 slot 索引，高 32 位是 slot 的版本号；slot 被复用之后旧的整数会失效
pub trait RawHandle: Key {
    #[inline]
    fn to_raw(self) -> u64 {
        self.data().as_ffi()
    }

    #[inline]
    fn from_raw(raw: u64) -> Self {
        KeyData::from_ffi(raw).into()
    }
}

impl<K: Key> RawHandle for K {}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn test_raw_round_trip() {
        let mut map: SlotMap<ResourceHandle, u32> = SlotMap::with_key();
        let handle = map.insert(7);

        let raw = handle.to_raw();
        assert_eq!(ResourceHandle::from_raw(raw), handle);
        assert_eq!(map.get(ResourceHandle::from_raw(raw)), Some(&7));
    }

    #[test]
    fn test_null_is_not_live() {
        let map: SlotMap<QueueHandle, u32> = SlotMap::with_key();
        assert!(QueueHandle::null().is_null());
        assert!(map.get(QueueHandle::null()).is_none());
    }
}
