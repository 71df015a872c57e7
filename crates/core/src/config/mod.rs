//! 配置管理
//!
//! 加载顺序: 内置默认值 → TOML配置文件 → 环境变量(前缀 `QTASK`，层级分隔符 `__`)。
//!
//! ```text
//! QTASK__QUEUE__MAX_WORKERS=8
//! QTASK__DATABASE__URL=postgresql://localhost/qtask
//! ```

pub mod models;

pub use models::*;
