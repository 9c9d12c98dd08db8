use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{GfxError, GfxResult};

/// 设备创建时确定的容量与行为配置
///
/// 所有容量在设备创建之后都不会改变；超出容量是配置错误，会直接 panic。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GfxConfig {
    /// 同时存在的 queue 数量上限
    pub max_queues: usize,
    /// 同时存在（录制中或者已 commit 未提交）的 command list 数量上限
    pub max_command_lists: usize,
    /// 登记的资源数量上限
    pub max_resources: usize,
    /// 全局描述符表的槽位数量
    pub descriptor_table_size: u32,

    /// 每个 submission context 中，每种 queue 的 allocator ring 长度
    pub max_allocators_per_queue_type: usize,
    /// 每个 allocator 的 command list ring 长度
    pub max_lists_per_allocator: usize,

    /// 每个 command list 最多跟踪的资源数量
    pub max_tracked_resources_per_barrier_pool: usize,
    /// 每个 command list 两次 flush 之间最多积累的 barrier 请求数量
    pub max_pending_barriers: usize,

    /// CPU 等待 fence 的超时时间，超时视为设备丢失；`None` 表示无限等待
    ///
    /// TOML 无法表示 `None`，省略时使用默认值，无限等待只能在代码中设置
    pub fence_wait_timeout_ms: Option<u64>,
    /// 以 debug 级别记录每一个解析后的 barrier
    pub log_barriers: bool,
}

impl Default for GfxConfig {
    fn default() -> Self {
        Self {
            max_queues: 16,
            max_command_lists: 1024,
            max_resources: 1 << 16,
            descriptor_table_size: 1 << 16,
            max_allocators_per_queue_type: 3,
            max_lists_per_allocator: 32,
            max_tracked_resources_per_barrier_pool: 256,
            max_pending_barriers: 256,
            fence_wait_timeout_ms: Some(10_000),
            log_barriers: false,
        }
    }
}

impl GfxConfig {
    /// 从 TOML 文件加载配置，缺省的字段使用默认值
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read gfx config: {:?}", path.as_ref()))?;

        let config: GfxConfig =
            toml::from_str(&content).with_context(|| format!("failed to parse gfx config: {:?}", path.as_ref()))?;
        config.validate().with_context(|| format!("invalid gfx config: {:?}", path.as_ref()))?;

        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize gfx config")?;

        fs::write(path.as_ref(), content).with_context(|| format!("failed to write gfx config: {:?}", path.as_ref()))?;

        Ok(())
    }

    /// 所有容量都必须大于 0
    pub fn validate(&self) -> GfxResult<()> {
        let capacities = [
            ("max_queues", self.max_queues),
            ("max_command_lists", self.max_command_lists),
            ("max_resources", self.max_resources),
            ("descriptor_table_size", self.descriptor_table_size as usize),
            ("max_allocators_per_queue_type", self.max_allocators_per_queue_type),
            ("max_lists_per_allocator", self.max_lists_per_allocator),
            ("max_tracked_resources_per_barrier_pool", self.max_tracked_resources_per_barrier_pool),
            ("max_pending_barriers", self.max_pending_barriers),
        ];

        if let Some((name, _)) = capacities.iter().find(|(_, value)| *value == 0) {
            return Err(GfxError::InvalidConfig(format!("`{name}` must be greater than zero")));
        }
        if self.fence_wait_timeout_ms == Some(0) {
            return Err(GfxError::InvalidConfig("`fence_wait_timeout_ms` must be greater than zero".to_string()));
        }

        Ok(())
    }

    #[inline]
    pub fn fence_wait_timeout(&self) -> Option<Duration> {
        self.fence_wait_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("ferrum-gfx-{}-{}.toml", name, std::process::id()))
    }

    #[test]
    fn test_default_is_valid() {
        let config = GfxConfig::default();
        config.validate().unwrap();
        assert_eq!(config.fence_wait_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let config = GfxConfig {
            max_lists_per_allocator: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, GfxError::InvalidConfig(ref msg) if msg.contains("max_lists_per_allocator")));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let path = temp_path("partial");
        fs::write(&path, "max_queues = 4\nlog_barriers = true\n").unwrap();

        let config = GfxConfig::from_file(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.max_queues, 4);
        assert!(config.log_barriers);
        assert_eq!(config.max_command_lists, GfxConfig::default().max_command_lists);
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_path("save");
        let config = GfxConfig {
            max_allocators_per_queue_type: 5,
            fence_wait_timeout_ms: Some(2500),
            ..Default::default()
        };

        config.save_to_file(&path).unwrap();
        let loaded = GfxConfig::from_file(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(loaded, config);
        assert_eq!(loaded.fence_wait_timeout(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_invalid_file_reports_context() {
        let path = temp_path("invalid");
        fs::write(&path, "max_queues = 0\n").unwrap();

        let err = GfxConfig::from_file(&path).unwrap_err();
        fs::remove_file(&path).unwrap();

        assert!(format!("{err:#}").contains("max_queues"));
    }
}
