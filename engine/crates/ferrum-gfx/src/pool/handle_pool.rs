use slotmap::{Key, SecondaryMap, SlotMap};

use crate::handles::RawHandle;

/// 固定容量的句柄池
///
/// 热数据（每次访问都会用到）存放在 `SlotMap` 中，冷数据（只在创建和销毁时用到的
/// 调试名、创建参数等）存放在以同一个句柄为 key 的 `SecondaryMap` 中。
///
/// # 容量
/// 容量在创建时确定，永远不会扩容。超出容量说明静态配置太小，会直接 panic。
///
/// # 句柄失效
/// 句柄带有 slot 的版本号，slot 被 remove 之后，旧句柄的所有访问都会返回 `None`，
/// 即使这个 slot 已经被新的对象复用。
pub struct HandlePool<K: Key, T, E = ()> {
    hot: SlotMap<K, T>,
    cold: SecondaryMap<K, E>,

    capacity: usize,
    debug_name: &'static str,
}

// new & init
impl<K: Key, T, E> HandlePool<K, T, E> {
    pub fn new(debug_name: &'static str, capacity: usize) -> Self {
        assert!(capacity > 0, "HandlePool `{debug_name}` must have a non-zero capacity");
        Self {
            hot: SlotMap::with_capacity_and_key(capacity),
            cold: SecondaryMap::with_capacity(capacity),
            capacity,
            debug_name,
        }
    }
}

// getters
impl<K: Key, T, E> HandlePool<K, T, E> {
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.hot.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.hot.is_empty()
    }

    #[inline]
    pub fn debug_name(&self) -> &'static str {
        self.debug_name
    }

    #[inline]
    pub fn contains(&self, handle: K) -> bool {
        self.hot.contains_key(handle)
    }

    #[inline]
    pub fn get(&self, handle: K) -> Option<&T> {
        self.hot.get(handle)
    }

    #[inline]
    pub fn get_mut(&mut self, handle: K) -> Option<&mut T> {
        self.hot.get_mut(handle)
    }

    /// 访问冷数据；对象存在但是创建时没有提供冷数据时也返回 `None`
    #[inline]
    pub fn get_extended(&self, handle: K) -> Option<&E> {
        self.cold.get(handle)
    }

    #[inline]
    pub fn get_extended_mut(&mut self, handle: K) -> Option<&mut E> {
        self.cold.get_mut(handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.hot.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.hot.keys()
    }
}

// tools
impl<K: Key, T, E> HandlePool<K, T, E> {
    /// 放入一个对象，O(1)
    ///
    /// # Panics
    /// 池已满
    pub fn add(&mut self, value: T) -> K {
        self.ensure_capacity();
        self.hot.insert(value)
    }

    /// 同时放入热数据和冷数据
    ///
    /// # Panics
    /// 池已满
    pub fn add_with_extended(&mut self, value: T, extended: E) -> K {
        self.ensure_capacity();
        let handle = self.hot.insert(value);
        self.cold.insert(handle, extended);
        handle
    }

    /// 移除对象，slot 回到 free list 中等待复用
    pub fn remove(&mut self, handle: K) -> Option<T> {
        self.remove_with_extended(handle).map(|(value, _)| value)
    }

    pub fn remove_with_extended(&mut self, handle: K) -> Option<(T, Option<E>)> {
        let value = self.hot.remove(handle)?;
        let extended = self.cold.remove(handle);
        Some((value, extended))
    }

    /// 取出所有对象，池变为空
    pub fn drain(&mut self) -> impl Iterator<Item = (K, T, Option<E>)> + '_ {
        let cold = &mut self.cold;
        self.hot.drain().map(move |(handle, value)| {
            let extended = cold.remove(handle);
            (handle, value, extended)
        })
    }

    fn ensure_capacity(&self) {
        if self.hot.len() >= self.capacity {
            log::error!(
                "HandlePool `{}` is exhausted ({} slots), the configured capacity is too small",
                self.debug_name,
                self.capacity
            );
            panic!("HandlePool `{}` exhausted: capacity {}", self.debug_name, self.capacity);
        }
    }
}

impl<K: Key, T, E> Drop for HandlePool<K, T, E> {
    fn drop(&mut self) {
        if !self.hot.is_empty() {
            log::debug!(
                "Dropping HandlePool `{}` with {} live objects: {:x?}",
                self.debug_name,
                self.hot.len(),
                self.hot.keys().take(8).map(|handle| handle.to_raw()).collect::<Vec<_>>()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::ResourceHandle;
    use std::collections::HashSet;

    #[test]
    fn test_add_get_remove() {
        let mut pool: HandlePool<ResourceHandle, u32> = HandlePool::new("test", 4);
        let a = pool.add(1);
        let b = pool.add(2);

        assert_eq!(pool.get(a), Some(&1));
        assert_eq!(pool.get(b), Some(&2));
        assert_eq!(pool.len(), 2);

        assert_eq!(pool.remove(a), Some(1));
        assert_eq!(pool.get(a), None);
        assert_eq!(pool.remove(a), None);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_stale_handle_does_not_alias_reused_slot() {
        let mut pool: HandlePool<ResourceHandle, &str> = HandlePool::new("test", 1);
        let old = pool.add("old");
        pool.remove(old);

        // 容量为 1，新对象一定复用同一个 slot
        let new = pool.add("new");
        assert_ne!(old, new);
        assert_eq!(pool.get(old), None);
        assert_eq!(pool.get(new), Some(&"new"));
    }

    #[test]
    fn test_live_handles_are_unique() {
        let mut pool: HandlePool<ResourceHandle, usize> = HandlePool::new("test", 16);
        let mut live = Vec::new();
        for i in 0..64 {
            if i % 3 == 2 {
                let handle = live.remove(i % live.len());
                pool.remove(handle);
            } else if pool.len() < pool.capacity() {
                live.push(pool.add(i));
            }

            let unique: HashSet<_> = live.iter().copied().collect();
            assert_eq!(unique.len(), live.len());
            assert_eq!(pool.len(), live.len());
        }
        for handle in &live {
            assert!(pool.contains(*handle));
        }
    }

    #[test]
    fn test_extended_record() {
        let mut pool: HandlePool<ResourceHandle, u32, String> = HandlePool::new("test", 4);
        let with_ext = pool.add_with_extended(1, "cold".to_string());
        let without_ext = pool.add(2);

        assert_eq!(pool.get_extended(with_ext).map(String::as_str), Some("cold"));
        assert_eq!(pool.get_extended(without_ext), None);

        let (value, ext) = pool.remove_with_extended(with_ext).unwrap();
        assert_eq!(value, 1);
        assert_eq!(ext.as_deref(), Some("cold"));
        assert_eq!(pool.get_extended(with_ext), None);
    }

    #[test]
    fn test_drain() {
        let mut pool: HandlePool<ResourceHandle, u32, u32> = HandlePool::new("test", 4);
        pool.add_with_extended(1, 10);
        pool.add(2);

        let mut drained: Vec<_> = pool.drain().map(|(_, value, ext)| (value, ext)).collect();
        drained.sort();
        assert_eq!(drained, vec![(1, Some(10)), (2, None)]);
        assert!(pool.is_empty());
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn test_capacity_exhaustion_is_fatal() {
        let mut pool: HandlePool<ResourceHandle, u32> = HandlePool::new("test", 2);
        pool.add(1);
        pool.add(2);
        pool.add(3);
    }
}
