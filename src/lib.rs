// ==========================================
// 模式化排产系统 - 核心库
// ==========================================
// 技术栈: Rust + SQLite + tokio
// 系统定位: 模式编译 + 分层多目标排产引擎
// 目标次序: 拖期 → 完工时间 → 成本 (严格字典序)
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 引擎层 - 编译 / 展开 / 求解
pub mod engine;

// 配置层 - 系统配置
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一）
pub mod db;

// 演示场景
pub mod demo;

// 日志系统
pub mod logging;

// 性能埋点
pub mod perf;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{InstanceStatus, ResourceType, SolvePhase, SolveStatus};

// 领域实体
pub use domain::{
    JobInstance, Machine, ObjectiveValues, Pattern, PatternTask, PerformanceRecord, Precedence,
    SequenceResource, SetupTimeEntry, SolvedSchedule, TaskAssignment, TaskMode,
};

// 引擎
pub use engine::{
    BranchAndBoundEngine, CancellationFlag, EngineError, HierarchicalSolver, InstanceExpander,
    PatternCompiler, ScheduleOrchestrator, SequenceReservationManager, SolveRequest,
};

// 配置
pub use config::{ConfigManager, SolverParameters, SolverSettings};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "模式化排产系统";
