//! 跨后端的 GPU 命令与资源运行时
//!
//! 这里只处理与具体图形 API 无关的部分：对象生命周期、命令录制与复用、描述符槽位分配、
//! 资源 hazard 跟踪以及 GPU/CPU 同步。具体的图形 API 调用由实现了 [`backend::GfxBackend`]
//! 的后端完成。
//!
//! 所有对外接口都通过 [`device::GfxDevice`] 完成，且只使用不透明的整数句柄。
//!
//! # 使用流程
//! ```ignore
//! let device = GfxDevice::new(NullBackend::new(NullCompletion::Immediate), GfxConfig::default())?;
//! let queue = device.create_queue(QueueType::Graphics, "main-queue")?;
//! let mut ctx = device.create_submission_context();
//!
//! let cmd = device.get_command_list(&mut ctx, QueueType::Graphics, "shadow-pass")?;
//! device.enqueue_barrier(cmd, ResourceBarrierRequest::texture(shadow_map).after(BarrierAccess::DEPTH_STENCIL_WRITE))?;
//! device.flush_barriers(cmd, BarrierSync::DEPTH_STENCIL)?;
//! device.commit_command_list(&mut ctx, cmd)?;
//!
//! let fence = device.execute_command_lists(queue, &[cmd], &[])?;
//! device.wait_for_fence_on_cpu(fence)?;
//! ```

/// 在开启 `profiling` feature 时打开一个 tracy span，否则什么都不做
macro_rules! profile_span {
    ($name:expr) => {
        #[cfg(feature = "profiling")]
        let _span = tracy_client::span!($name);
    };
}

pub mod backend;
pub mod commands;
pub mod config;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod handles;
pub mod pool;
pub mod resources;
#[cfg(feature = "vulkan")]
pub mod vulkan;
