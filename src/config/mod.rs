// ==========================================
// 模式化排产系统 - 配置层
// ==========================================
// 职责: 系统级求解配置 + 模式级求解参数
// 存储: config_kv 表 / pattern.solver_parameters_json
// ==========================================

pub mod config_manager;
pub mod solver_parameters;

// 重导出核心配置类型
pub use config_manager::{config_keys, ConfigManager, SolverSettings};
pub use solver_parameters::{ParameterError, SearchStrategy, SolverParameters};
