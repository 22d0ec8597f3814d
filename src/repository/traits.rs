// ==========================================
// 模式化排产系统 - 数据访问接口
// ==========================================
// 职责: 定义引擎层依赖的数据源 / 结果存储 / 性能历史接口
// 红线: 接口不含业务规则，只做数据读写
// 实现者: PatternRepository / ScheduleRepository / PerformanceRepository (rusqlite)
// ==========================================

use crate::domain::instance::JobInstance;
use crate::domain::pattern::{Machine, Pattern};
use crate::domain::performance::PerformanceRecord;
use crate::domain::resource::SequenceResource;
use crate::domain::schedule::SolvedSchedule;
use crate::repository::error::RepositoryResult;
use async_trait::async_trait;

// ==========================================
// PatternSource Trait
// ==========================================
#[async_trait]
pub trait PatternSource: Send + Sync {
    /// 加载模式 (任务 / 模式 / 前序 / 换型 / 求解参数)
    ///
    /// # 返回
    /// - Ok(Pattern)
    /// - Err(RepositoryError::NotFound): 模式不存在
    async fn load_pattern(&self, pattern_id: &str) -> RepositoryResult<Pattern>;

    /// 加载设备主数据
    async fn load_machines(&self) -> RepositoryResult<Vec<Machine>>;

    /// 加载可排产实例 (PENDING / SCHEDULED), 按交期升序
    ///
    /// # 参数
    /// - pattern_id: 模式ID
    /// - limit: 最多返回条数
    async fn load_instances(&self, pattern_id: &str, limit: usize) -> RepositoryResult<Vec<JobInstance>>;

    /// 按ID加载指定实例 (保持请求顺序)
    ///
    /// # 返回
    /// - Err(RepositoryError::NotFound): 任一实例不存在
    /// - Err(RepositoryError::InvalidStateTransition): 任一实例已不可排产
    async fn load_instances_by_ids(&self, instance_ids: &[String]) -> RepositoryResult<Vec<JobInstance>>;

    /// 加载序列资源
    ///
    /// # 参数
    /// - active_only: 仅返回启用的资源
    async fn load_sequence_resources(&self, active_only: bool) -> RepositoryResult<Vec<SequenceResource>>;
}

// ==========================================
// ScheduleStore Trait
// ==========================================
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// 保存排程结果 (单事务), 参与实例置为 SCHEDULED
    async fn store_solved_schedule(&self, schedule: &SolvedSchedule) -> RepositoryResult<()>;

    /// 按ID加载排程结果
    async fn load_solved_schedule(&self, schedule_id: &str) -> RepositoryResult<SolvedSchedule>;
}

// ==========================================
// PerformanceStore Trait
// ==========================================
#[async_trait]
pub trait PerformanceStore: Send + Sync {
    /// 模式的基线求解耗时 (秒)
    async fn baseline(&self, pattern_id: &str) -> RepositoryResult<Option<f64>>;

    /// 设置模式基线
    async fn set_baseline(&self, pattern_id: &str, seconds: f64) -> RepositoryResult<()>;

    /// 追加一条性能记录 (只追加, 不修改)
    async fn append(&self, record: &PerformanceRecord) -> RepositoryResult<()>;

    /// 最近的性能记录 (按记录时间倒序)
    async fn history(&self, pattern_id: &str, limit: usize) -> RepositoryResult<Vec<PerformanceRecord>>;
}
