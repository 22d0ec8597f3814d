// ==========================================
// 模式化排产系统 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写管理
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use crate::db::open_sqlite_connection;
use crate::domain::performance::DEFAULT_REGRESSION_THRESHOLD_PCT;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};

// ==========================================
// SolverSettings - 求解全局配置快照
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    pub time_budget_seconds: f64,          // 整体时间预算
    pub phase_fractions: [f64; 3],         // L/M/C 三阶段预算占比
    pub instance_limit: usize,             // 单次加载实例上限
    pub regression_threshold_pct: f64,     // 性能回归阈值 (%)
    pub compare_legacy: bool,              // 是否同时跑扁平建模计算加速比
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            time_budget_seconds: 30.0,
            phase_fractions: [0.4, 0.3, 0.3],
            instance_limit: 100,
            regression_threshold_pct: DEFAULT_REGRESSION_THRESHOLD_PCT,
            compare_legacy: false,
        }
    }
}

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> Result<Self, Box<dyn Error>> {
        let conn = open_sqlite_connection(db_path)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：会对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Result<Self, Box<dyn Error>> {
        {
            let conn_guard = conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
            crate::db::configure_sqlite_connection(&conn_guard)?;
        }

        Ok(Self { conn })
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    ///
    /// # 返回
    /// - Some(String): 配置值
    /// - None: 配置不存在
    fn get_config_value(&self, key: &str) -> Result<Option<String>, Box<dyn Error>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let result = conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    /// 读取 global scope 的配置值（公开方法，供其他模块复用）
    pub fn get_global_config_value(&self, key: &str) -> Result<Option<String>, Box<dyn Error>> {
        self.get_config_value(key)
    }

    /// 写入 global scope 的配置值 (UPSERT)
    pub fn set_global_config_value(&self, key: &str, value: &str) -> Result<(), Box<dyn Error>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value) VALUES ('global', ?1, ?2)
             ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_config_or_default(&self, key: &str, default: &str) -> Result<String, Box<dyn Error>> {
        Ok(self.get_config_value(key)?.unwrap_or_else(|| default.to_string()))
    }

    /// 读取 f64 配置，格式错误时回退默认值并告警
    fn get_f64_or(&self, key: &str, default: f64) -> Result<f64, Box<dyn Error>> {
        let value = self.get_config_or_default(key, &default.to_string())?;
        Ok(value.trim().parse::<f64>().unwrap_or_else(|_| {
            tracing::warn!(config_key = key, raw_value = %value, "配置格式错误，使用默认值");
            default
        }))
    }

    /// 获取所有配置的快照（JSON格式）
    ///
    /// # 用途
    /// - 在排程结果旁记录当时的求解配置
    pub fn get_config_snapshot(&self) -> Result<String, Box<dyn Error>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let mut stmt = conn.prepare(
            "SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key"
        )?;

        let mut config_map: HashMap<String, String> = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
            ))
        })?;

        for row in rows {
            let (key, value) = row?;
            config_map.insert(key, value);
        }

        let json_value = json!(config_map);
        Ok(serde_json::to_string(&json_value)?)
    }

    /// 从配置快照恢复配置
    ///
    /// # 返回
    /// - Ok(usize): 恢复的配置项数量
    ///
    /// # 注意
    /// - 此方法会覆盖现有的global配置
    pub fn restore_config_from_snapshot(&self, snapshot_json: &str) -> Result<usize, Box<dyn Error>> {
        let config_map: HashMap<String, String> = serde_json::from_str(snapshot_json)?;

        let mut conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
        let tx = conn.transaction()?;

        let mut count = 0;
        for (key, value) in config_map.iter() {
            let affected = tx.execute(
                "INSERT INTO config_kv (scope_id, key, value) VALUES ('global', ?1, ?2)
                 ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2",
                params![key, value],
            )?;
            count += affected;
        }

        tx.commit()?;
        Ok(count)
    }

    // ===== 求解配置 =====

    pub fn get_time_budget_seconds(&self) -> Result<f64, Box<dyn Error>> {
        let secs = self.get_f64_or(config_keys::TIME_BUDGET_SECONDS, 30.0)?;
        Ok(if secs > 0.0 { secs } else { 30.0 })
    }

    /// 获取 L/M/C 三阶段预算占比
    ///
    /// # 说明
    /// 三者之和不为 1 时按比例归一化；任一项 ≤ 0 时整体回退默认 0.4/0.3/0.3
    pub fn get_phase_fractions(&self) -> Result<[f64; 3], Box<dyn Error>> {
        let raw = [
            self.get_f64_or(config_keys::PHASE_FRACTION_LATENESS, 0.4)?,
            self.get_f64_or(config_keys::PHASE_FRACTION_MAKESPAN, 0.3)?,
            self.get_f64_or(config_keys::PHASE_FRACTION_COST, 0.3)?,
        ];

        if raw.iter().any(|f| !(*f > 0.0)) {
            tracing::warn!(?raw, "阶段预算占比非法，使用默认 0.4/0.3/0.3");
            return Ok([0.4, 0.3, 0.3]);
        }

        let sum: f64 = raw.iter().sum();
        Ok([raw[0] / sum, raw[1] / sum, raw[2] / sum])
    }

    pub fn get_instance_limit(&self) -> Result<usize, Box<dyn Error>> {
        let value = self.get_config_or_default(config_keys::INSTANCE_LIMIT, "100")?;
        Ok(value.trim().parse::<usize>().ok().filter(|n| *n > 0).unwrap_or(100))
    }

    pub fn get_regression_threshold_pct(&self) -> Result<f64, Box<dyn Error>> {
        self.get_f64_or(
            config_keys::REGRESSION_THRESHOLD_PCT,
            DEFAULT_REGRESSION_THRESHOLD_PCT,
        )
    }

    pub fn get_compare_legacy(&self) -> Result<bool, Box<dyn Error>> {
        let value = self.get_config_or_default(config_keys::COMPARE_LEGACY, "false")?;
        Ok(matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ))
    }

    /// 一次性读取全部求解配置
    pub fn load_solver_settings(&self) -> Result<SolverSettings, Box<dyn Error>> {
        Ok(SolverSettings {
            time_budget_seconds: self.get_time_budget_seconds()?,
            phase_fractions: self.get_phase_fractions()?,
            instance_limit: self.get_instance_limit()?,
            regression_threshold_pct: self.get_regression_threshold_pct()?,
            compare_legacy: self.get_compare_legacy()?,
        })
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    // 求解预算
    pub const TIME_BUDGET_SECONDS: &str = "solver.time_budget_seconds";
    pub const PHASE_FRACTION_LATENESS: &str = "solver.phase_fraction.lateness";
    pub const PHASE_FRACTION_MAKESPAN: &str = "solver.phase_fraction.makespan";
    pub const PHASE_FRACTION_COST: &str = "solver.phase_fraction.cost";

    // 实例加载
    pub const INSTANCE_LIMIT: &str = "solver.instance_limit";

    // 性能
    pub const REGRESSION_THRESHOLD_PCT: &str = "performance.regression_threshold_pct";
    pub const COMPARE_LEGACY: &str = "solver.compare_legacy";
}
