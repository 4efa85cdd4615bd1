/// Easy Deploy - 公共库
/// 
/// 提供控制面各组件共享的类型、错误处理、指纹计算、工具函数等

pub mod errors;
pub mod fingerprint;
pub mod models;
pub mod utils;

// 重新导出常用类型
pub use errors::{Error, IndexedErrors, Result};
pub use fingerprint::Fingerprint;
pub use models::{Action, DeployType, ResourceKey, ResourceState, TaskItemState, TaskState};
