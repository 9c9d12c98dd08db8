//! GPU 资源的登记信息
//!
//! 这里不持有任何 GPU 内存，只记录 barrier 跟踪需要的资源种类，以及调试用的描述信息。
//! 真正的内存由后端或者外部系统（例如 swapchain）负责创建。

/// 资源种类；不同的后端对 buffer 和 texture 的 barrier 格式不同
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Texture,
}

/// 资源的冷数据：只在创建、销毁和调试时访问
#[derive(Clone, Debug)]
pub struct ResourceDesc {
    pub kind: ResourceKind,
    pub debug_name: String,
    /// buffer 为字节数，texture 为 texel 数，仅用于调试
    pub size: u64,
}

impl ResourceDesc {
    pub fn buffer(debug_name: impl Into<String>, size: u64) -> Self {
        Self {
            kind: ResourceKind::Buffer,
            debug_name: debug_name.into(),
            size,
        }
    }

    pub fn texture(debug_name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            kind: ResourceKind::Texture,
            debug_name: debug_name.into(),
            size: width as u64 * height as u64,
        }
    }
}
