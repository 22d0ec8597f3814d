// ==========================================
// 模式化排产系统 - 引擎层仓储聚合
// ==========================================
// 职责: 聚合编排器所需的数据源 / 结果存储 / 性能历史
// 目标: 编排器只依赖接口，测试时可整体替换为内存实现
// ==========================================

use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::repository::{
    PatternRepository, PatternSource, PerformanceRepository, PerformanceStore, ScheduleRepository,
    ScheduleStore,
};

/// 排产编排仓储集合
///
/// # 包含的接口
/// - `pattern_source`: 模式 / 设备 / 实例 / 序列资源读取
/// - `schedule_store`: 排程结果读写
/// - `performance_store`: 基线与性能历史
#[derive(Clone)]
pub struct ScheduleRepositories {
    pub pattern_source: Arc<dyn PatternSource>,
    pub schedule_store: Arc<dyn ScheduleStore>,
    pub performance_store: Arc<dyn PerformanceStore>,
}

impl ScheduleRepositories {
    pub fn new(
        pattern_source: Arc<dyn PatternSource>,
        schedule_store: Arc<dyn ScheduleStore>,
        performance_store: Arc<dyn PerformanceStore>,
    ) -> Self {
        Self {
            pattern_source,
            schedule_store,
            performance_store,
        }
    }

    /// 基于同一 SQLite 连接构建全部仓储
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            pattern_source: Arc::new(PatternRepository::from_connection(conn.clone())),
            schedule_store: Arc::new(ScheduleRepository::from_connection(conn.clone())),
            performance_store: Arc::new(PerformanceRepository::from_connection(conn)),
        }
    }

    pub fn pattern_source(&self) -> &Arc<dyn PatternSource> {
        &self.pattern_source
    }

    pub fn schedule_store(&self) -> &Arc<dyn ScheduleStore> {
        &self.schedule_store
    }

    pub fn performance_store(&self) -> &Arc<dyn PerformanceStore> {
        &self.performance_store
    }
}
