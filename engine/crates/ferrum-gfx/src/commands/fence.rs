use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{GfxBackend, NativeCommandList, NativeQueue, NativeWait};
use crate::error::{GfxError, GfxResult};
use crate::handles::QueueHandle;

/// queue 执行顺序中的一个点
///
/// 每次提交都会让 queue 的计数器加一，返回的 fence 在这次提交的命令全部执行完毕后完成。
/// `value == 0` 表示一个永远已完成的空 fence。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fence {
    pub queue: QueueHandle,
    pub value: u64,
}

impl Fence {
    #[inline]
    pub fn new(queue: QueueHandle, value: u64) -> Self {
        Self { queue, value }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.value == 0
    }
}

/// 单个 queue 的 fence 同步器
///
/// 维护 queue 的单调递增计数器，以及缓存的已完成值。已经确认完成的 fence 再次查询时
/// 直接命中缓存，不会访问后端。
pub struct FenceSynchronizer {
    native: NativeQueue,

    /// 最近一次 signal 的值
    last_signaled: AtomicU64,
    /// 缓存的已完成值，只增不减
    last_completed: AtomicU64,

    /// 保证计数器的递增顺序与后端提交的顺序一致
    submit_lock: Mutex<()>,
}

// new & init
impl FenceSynchronizer {
    pub fn new(native: NativeQueue) -> Self {
        Self {
            native,
            last_signaled: AtomicU64::new(0),
            last_completed: AtomicU64::new(0),
            submit_lock: Mutex::new(()),
        }
    }
}

// getters
impl FenceSynchronizer {
    #[inline]
    pub fn native(&self) -> NativeQueue {
        self.native
    }

    #[inline]
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled.load(Ordering::Acquire)
    }

    /// 缓存的已完成值，不会查询后端
    #[inline]
    pub fn cached_completed(&self) -> u64 {
        self.last_completed.load(Ordering::Acquire)
    }
}

// tools
impl FenceSynchronizer {
    /// 提交命令并 signal 下一个计数值
    ///
    /// 后端提交失败时计数器不会前进。
    pub fn submit(
        &self,
        backend: &dyn GfxBackend,
        lists: &[NativeCommandList],
        waits: &[NativeWait],
    ) -> GfxResult<u64> {
        let _guard = self.submit_lock.lock();

        let value = self.last_signaled.load(Ordering::Acquire) + 1;
        backend.submit(self.native, lists, waits, value)?;
        self.last_signaled.store(value, Ordering::Release);

        Ok(value)
    }

    /// 非阻塞地检查 `value` 是否已经完成
    pub fn is_completed(&self, backend: &dyn GfxBackend, value: u64) -> GfxResult<bool> {
        if value <= self.cached_completed() {
            return Ok(true);
        }
        self.check_signaled(value)?;

        let completed = self.query_completed(backend)?;
        Ok(value <= completed)
    }

    /// 阻塞直到 `value` 完成
    ///
    /// 先检查缓存，再查询后端，仍未完成时才在后端的等待原语上阻塞。
    /// `timeout` 为 `None` 时无限等待，超时返回 [`GfxError::DeviceLost`]。
    pub fn wait_on_cpu(&self, backend: &dyn GfxBackend, value: u64, timeout: Option<Duration>) -> GfxResult<()> {
        if value <= self.cached_completed() {
            return Ok(());
        }
        self.check_signaled(value)?;

        if value <= self.query_completed(backend)? {
            return Ok(());
        }

        profile_span!("FenceSynchronizer::wait_on_cpu");
        if !backend.wait_for_value(self.native, value, timeout)? {
            let timeout_ms = timeout.map(|t| t.as_millis()).unwrap_or_default();
            log::error!(
                "waiting for value {} on queue {:?} timed out after {} ms (completed {})",
                value,
                self.native,
                timeout_ms,
                self.cached_completed()
            );
            return Err(GfxError::DeviceLost(format!(
                "fence value {value} was not signalled within {timeout_ms} ms"
            )));
        }

        self.last_completed.fetch_max(value, Ordering::AcqRel);
        Ok(())
    }

    fn query_completed(&self, backend: &dyn GfxBackend) -> GfxResult<u64> {
        let completed = backend.completed_value(self.native)?;
        let previous = self.last_completed.fetch_max(completed, Ordering::AcqRel);
        Ok(previous.max(completed))
    }

    /// 等待一个还没有提交的值会永远阻塞
    fn check_signaled(&self, value: u64) -> GfxResult<()> {
        let last_signaled = self.last_signaled();
        if value > last_signaled {
            log::error!("fence value {} is ahead of the last signalled value {}", value, last_signaled);
            return Err(GfxError::FenceFromFuture { value, last_signaled });
        }
        Ok(())
    }
}
