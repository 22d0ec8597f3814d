// ==========================================
// 测试辅助函数
// ==========================================
// 职责: 临时数据库、演示场景种子数据、编排器构建
// ==========================================

#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime};
use pattern_aps::config::{ConfigManager, SolverSettings};
use pattern_aps::db::{init_schema, open_sqlite_connection};
use pattern_aps::demo::seed_demo_scenario;
use pattern_aps::engine::{ScheduleOrchestrator, ScheduleRepositories};
use pattern_aps::logging;
use pattern_aps::repository::{PatternRepository, PerformanceRepository, ScheduleRepository};
use rusqlite::Connection;
use std::error::Error;
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// 创建临时测试数据库并初始化 schema
///
/// # 返回
/// - NamedTempFile: 临时数据库文件（需要保持存活）
/// - String: 数据库文件路径
pub fn create_test_db() -> Result<(NamedTempFile, String), Box<dyn Error>> {
    logging::init_test();

    let temp_file = NamedTempFile::new()?;
    let db_path = temp_file.path().to_str().unwrap().to_string();

    let conn = open_sqlite_connection(&db_path)?;
    init_schema(&conn)?;

    Ok((temp_file, db_path))
}

/// 打开共享连接 (与 CLI 相同的装配方式)
pub fn open_shared(db_path: &str) -> Arc<Mutex<Connection>> {
    let conn = open_sqlite_connection(db_path).unwrap();
    init_schema(&conn).unwrap();
    Arc::new(Mutex::new(conn))
}

pub fn origin() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, 2)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap()
}

/// 演示场景: 3 实例 × 2 任务, 期望 (0, 5, 3500)
pub fn seed_scenario(conn: &Arc<Mutex<Connection>>) {
    seed_demo_scenario(&PatternRepository::from_connection(conn.clone()), origin()).unwrap();
}

pub fn test_settings() -> SolverSettings {
    SolverSettings {
        time_budget_seconds: 10.0,
        ..SolverSettings::default()
    }
}

pub fn orchestrator(conn: &Arc<Mutex<Connection>>) -> ScheduleOrchestrator {
    ScheduleOrchestrator::new(ScheduleRepositories::from_connection(conn.clone()), test_settings())
}

/// 从 config_kv 读取配置构建编排器
pub fn orchestrator_from_config(conn: &Arc<Mutex<Connection>>) -> ScheduleOrchestrator {
    let settings = ConfigManager::from_connection(conn.clone())
        .unwrap()
        .load_solver_settings()
        .unwrap();
    ScheduleOrchestrator::new(ScheduleRepositories::from_connection(conn.clone()), settings)
}

pub fn pattern_repo(conn: &Arc<Mutex<Connection>>) -> PatternRepository {
    PatternRepository::from_connection(conn.clone())
}

pub fn schedule_repo(conn: &Arc<Mutex<Connection>>) -> ScheduleRepository {
    ScheduleRepository::from_connection(conn.clone())
}

pub fn performance_repo(conn: &Arc<Mutex<Connection>>) -> PerformanceRepository {
    PerformanceRepository::from_connection(conn.clone())
}
