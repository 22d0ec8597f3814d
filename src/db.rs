// ==========================================
// 模式化排产系统 - SQLite 连接与建库
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为（外键、busy_timeout）
// - 提供幂等的建表脚本 init_schema
// ==========================================

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use std::path::PathBuf;
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 数据库路径环境变量
pub const DB_PATH_ENV: &str = "PATTERN_APS_DB_PATH";

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要“每个连接”单独开启
/// - busy_timeout 需要“每个连接”单独配置
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 读取 schema_version（若表不存在则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}

/// 建表（幂等）
///
/// 说明：所有表均使用 IF NOT EXISTS，可在已有库上重复执行
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [CURRENT_SCHEMA_VERSION],
    )?;

    match read_schema_version(conn)? {
        Some(v) if v > CURRENT_SCHEMA_VERSION => {
            tracing::warn!(
                db_version = v,
                code_version = CURRENT_SCHEMA_VERSION,
                "数据库 schema 版本高于当前代码版本"
            );
        }
        _ => {}
    }
    Ok(())
}

/// 默认数据库路径
///
/// 优先级: PATTERN_APS_DB_PATH > 用户数据目录 > 当前目录
pub fn get_default_db_path() -> String {
    if let Ok(path) = std::env::var(DB_PATH_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let mut path = PathBuf::from("./pattern_aps.db");

    if let Some(data_dir) = dirs::data_dir() {
        let dir = data_dir.join("pattern-aps");
        // best-effort: 创建失败时回退到当前目录
        if std::fs::create_dir_all(&dir).is_ok() {
            path = dir.join("pattern_aps.db");
        }
    }

    path.to_string_lossy().to_string()
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS config_scope (
    scope_id TEXT PRIMARY KEY,
    scope_type TEXT NOT NULL,
    scope_key TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(scope_type, scope_key)
);

INSERT OR IGNORE INTO config_scope (scope_id, scope_type, scope_key)
VALUES ('global', 'GLOBAL', 'global');

CREATE TABLE IF NOT EXISTS config_kv (
    scope_id TEXT NOT NULL REFERENCES config_scope(scope_id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (scope_id, key)
);

CREATE TABLE IF NOT EXISTS machine (
    machine_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    cost_per_hour_cents INTEGER NOT NULL CHECK (cost_per_hour_cents >= 0)
);

CREATE TABLE IF NOT EXISTS pattern (
    pattern_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    solver_parameters_json TEXT,
    baseline_performance_seconds REAL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS pattern_task (
    pattern_id TEXT NOT NULL REFERENCES pattern(pattern_id) ON DELETE CASCADE,
    task_id TEXT NOT NULL,
    name TEXT NOT NULL,
    position INTEGER NOT NULL,
    department TEXT,
    sequence_id TEXT,
    min_operators INTEGER NOT NULL DEFAULT 1,
    max_operators INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (pattern_id, task_id)
);

CREATE TABLE IF NOT EXISTS task_mode (
    pattern_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    mode_id TEXT NOT NULL,
    machine_id TEXT NOT NULL REFERENCES machine(machine_id),
    duration_minutes INTEGER NOT NULL,
    setup_cost_cents INTEGER NOT NULL DEFAULT 0,
    mode_order INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (pattern_id, task_id, mode_id),
    FOREIGN KEY (pattern_id, task_id) REFERENCES pattern_task(pattern_id, task_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS pattern_precedence (
    pattern_id TEXT NOT NULL REFERENCES pattern(pattern_id) ON DELETE CASCADE,
    before_task_id TEXT NOT NULL,
    after_task_id TEXT NOT NULL,
    min_lag_minutes INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (pattern_id, before_task_id, after_task_id)
);

CREATE TABLE IF NOT EXISTS setup_time (
    pattern_id TEXT NOT NULL REFERENCES pattern(pattern_id) ON DELETE CASCADE,
    from_task_id TEXT NOT NULL,
    to_task_id TEXT NOT NULL,
    machine_id TEXT NOT NULL,
    setup_time_minutes INTEGER NOT NULL CHECK (setup_time_minutes >= 0),
    PRIMARY KEY (pattern_id, from_task_id, to_task_id, machine_id)
);

CREATE TABLE IF NOT EXISTS sequence_resource (
    sequence_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    capacity INTEGER NOT NULL,
    max_concurrent_jobs INTEGER NOT NULL,
    resource_type TEXT NOT NULL,
    setup_minutes INTEGER NOT NULL DEFAULT 0,
    teardown_minutes INTEGER NOT NULL DEFAULT 0,
    window_start_minute INTEGER NOT NULL DEFAULT 0,
    window_end_minute INTEGER,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS job_instance (
    instance_id TEXT PRIMARY KEY,
    pattern_id TEXT NOT NULL REFERENCES pattern(pattern_id),
    due_date TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'PENDING',
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_job_instance_pattern_status
    ON job_instance(pattern_id, status, due_date);

CREATE TABLE IF NOT EXISTS solved_schedule (
    schedule_id TEXT PRIMARY KEY,
    pattern_id TEXT NOT NULL REFERENCES pattern(pattern_id),
    instance_ids_json TEXT NOT NULL,
    origin TEXT NOT NULL,
    status TEXT NOT NULL,
    solve_time_seconds REAL NOT NULL,
    total_lateness_minutes INTEGER NOT NULL,
    makespan_minutes INTEGER NOT NULL,
    total_cost_cents INTEGER NOT NULL,
    phase_results_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_assignment (
    schedule_id TEXT NOT NULL REFERENCES solved_schedule(schedule_id) ON DELETE CASCADE,
    instance_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    mode_id TEXT NOT NULL,
    machine_id TEXT NOT NULL,
    start_minute INTEGER NOT NULL,
    end_minute INTEGER NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    PRIMARY KEY (schedule_id, instance_id, task_id)
);

CREATE TABLE IF NOT EXISTS sequence_reservation (
    schedule_id TEXT NOT NULL REFERENCES solved_schedule(schedule_id) ON DELETE CASCADE,
    sequence_id TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    start_minute INTEGER NOT NULL,
    end_minute INTEGER NOT NULL,
    PRIMARY KEY (schedule_id, sequence_id, instance_id, task_id)
);

CREATE TABLE IF NOT EXISTS pattern_performance_history (
    record_id TEXT PRIMARY KEY,
    pattern_id TEXT NOT NULL REFERENCES pattern(pattern_id),
    solve_time_seconds REAL NOT NULL,
    instance_count INTEGER NOT NULL,
    speedup_factor REAL,
    baseline_seconds REAL NOT NULL,
    degradation_percent REAL NOT NULL,
    is_regression INTEGER NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_perf_history_pattern
    ON pattern_performance_history(pattern_id, recorded_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(read_schema_version(&conn).unwrap(), Some(CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn test_schema_version_absent_on_fresh_db() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(read_schema_version(&conn).unwrap(), None);
    }
}
