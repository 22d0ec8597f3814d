// ==========================================
// 模式化排产系统 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// 职责: 提供数据访问接口,屏蔽数据库细节
// 约束: 所有查询使用参数化,防止 SQL 注入
// ==========================================

pub mod error;
pub mod pattern_repo;
pub mod performance_repo;
pub mod schedule_repo;
pub mod sql_types;
pub mod traits;

// 重导出核心仓储
pub use error::{RepositoryError, RepositoryResult};
pub use pattern_repo::{PatternRepository, PatternSummary};
pub use performance_repo::PerformanceRepository;
pub use schedule_repo::{ScheduleRepository, ScheduleSummary};
pub use traits::{PatternSource, PerformanceStore, ScheduleStore};
