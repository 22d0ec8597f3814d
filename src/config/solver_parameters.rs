// ==========================================
// 模式化排产系统 - 求解参数
// ==========================================
// 职责: 将 Pattern 上的 solver_parameters JSON 类型化
// 红线: 只校验已建模键的类型/范围，未建模键原样透传给求解引擎
// 红线: 不存在进程级的全局参数单例，每次 solve 显式传入
// ==========================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 参数校验错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("求解参数必须是 JSON 对象, 实际: {0}")]
    NotAnObject(String),

    #[error("参数类型错误 (key={key}): 期望 {expected}, 实际 {actual}")]
    WrongType {
        key: String,
        expected: &'static str,
        actual: String,
    },

    #[error("参数越界 (key={key}): {message}")]
    OutOfRange { key: String, message: String },

    #[error("未知的搜索策略: {0}")]
    UnknownStrategy(String),
}

// ==========================================
// SearchStrategy - 搜索策略
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    #[default]
    Automatic,  // 引擎自行决定分支顺序
    FixedOrder, // 严格按任务稳定顺序分支
    DepthFirst, // 最早开始优先的深度优先
}

impl fmt::Display for SearchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchStrategy::Automatic => write!(f, "automatic"),
            SearchStrategy::FixedOrder => write!(f, "fixed_order"),
            SearchStrategy::DepthFirst => write!(f, "depth_first"),
        }
    }
}

impl FromStr for SearchStrategy {
    type Err = ParameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "automatic" | "auto" => Ok(SearchStrategy::Automatic),
            "fixed_order" | "fixed" => Ok(SearchStrategy::FixedOrder),
            "depth_first" | "dfs" => Ok(SearchStrategy::DepthFirst),
            other => Err(ParameterError::UnknownStrategy(other.to_string())),
        }
    }
}

// ==========================================
// SolverParameters - 类型化求解参数
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverParameters {
    pub worker_count: u32,                   // 工作线程数 (≥ 1)
    pub time_limit_seconds: f64,             // 单次求解时限 (> 0)
    pub search_strategy: SearchStrategy,     // 搜索策略
    pub log_search_progress: bool,           // 是否输出搜索过程日志
    #[serde(default)]
    pub extra: BTreeMap<String, JsonValue>,  // 未建模的引擎参数 (透传)
}

impl Default for SolverParameters {
    fn default() -> Self {
        Self {
            worker_count: 1,
            time_limit_seconds: 30.0,
            search_strategy: SearchStrategy::Automatic,
            log_search_progress: false,
            extra: BTreeMap::new(),
        }
    }
}

// 已建模的键 (含常见别名)
const WORKER_KEYS: [&str; 3] = ["worker_count", "num_workers", "num_search_workers"];
const TIME_LIMIT_KEYS: [&str; 2] = ["time_limit_seconds", "max_time_in_seconds"];
const STRATEGY_KEYS: [&str; 1] = ["search_strategy"];
const LOG_KEYS: [&str; 1] = ["log_search_progress"];

impl SolverParameters {
    /// 从 Pattern 的 solver_parameters JSON 解析
    ///
    /// # 参数
    /// - raw: JSON 值 (null 视为空对象)
    ///
    /// # 返回
    /// - Ok(SolverParameters): 默认值 + JSON 覆写
    /// - Err(ParameterError): 已建模键类型/范围错误
    pub fn from_json(raw: &JsonValue) -> Result<Self, ParameterError> {
        Self::default().with_overrides(raw)
    }

    /// 在当前参数上叠加覆写 (请求级参数覆盖模式默认值)
    pub fn with_overrides(&self, raw: &JsonValue) -> Result<Self, ParameterError> {
        let map = match raw {
            JsonValue::Null => return Ok(self.clone()),
            JsonValue::Object(map) => map,
            other => return Err(ParameterError::NotAnObject(type_name(other).to_string())),
        };

        let mut params = self.clone();

        for (key, value) in map {
            let key_str = key.as_str();
            if WORKER_KEYS.contains(&key_str) {
                let n = expect_u64(key, value)?;
                if n < 1 || n > u32::MAX as u64 {
                    return Err(ParameterError::OutOfRange {
                        key: key.clone(),
                        message: format!("worker_count 必须 ≥ 1, 实际 {}", n),
                    });
                }
                params.worker_count = n as u32;
            } else if TIME_LIMIT_KEYS.contains(&key_str) {
                let secs = expect_f64(key, value)?;
                if !(secs > 0.0) || !secs.is_finite() {
                    return Err(ParameterError::OutOfRange {
                        key: key.clone(),
                        message: format!("time_limit_seconds 必须 > 0, 实际 {}", secs),
                    });
                }
                params.time_limit_seconds = secs;
            } else if STRATEGY_KEYS.contains(&key_str) {
                let s = value.as_str().ok_or_else(|| ParameterError::WrongType {
                    key: key.clone(),
                    expected: "string",
                    actual: type_name(value).to_string(),
                })?;
                params.search_strategy = s.parse()?;
            } else if LOG_KEYS.contains(&key_str) {
                params.log_search_progress =
                    value.as_bool().ok_or_else(|| ParameterError::WrongType {
                        key: key.clone(),
                        expected: "bool",
                        actual: type_name(value).to_string(),
                    })?;
            } else {
                params.extra.insert(key.clone(), value.clone());
            }
        }

        Ok(params)
    }

    /// 序列化为给外部引擎的扁平 JSON (已建模键 + 透传键)
    pub fn to_engine_json(&self) -> JsonValue {
        let mut map = Map::new();
        for (k, v) in &self.extra {
            map.insert(k.clone(), v.clone());
        }
        map.insert("worker_count".to_string(), JsonValue::from(self.worker_count));
        map.insert(
            "time_limit_seconds".to_string(),
            JsonValue::from(self.time_limit_seconds),
        );
        map.insert(
            "search_strategy".to_string(),
            JsonValue::from(self.search_strategy.to_string()),
        );
        map.insert(
            "log_search_progress".to_string(),
            JsonValue::from(self.log_search_progress),
        );
        JsonValue::Object(map)
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn expect_u64(key: &str, value: &JsonValue) -> Result<u64, ParameterError> {
    value.as_u64().ok_or_else(|| ParameterError::WrongType {
        key: key.to_string(),
        expected: "non-negative integer",
        actual: value.to_string(),
    })
}

fn expect_f64(key: &str, value: &JsonValue) -> Result<f64, ParameterError> {
    value.as_f64().ok_or_else(|| ParameterError::WrongType {
        key: key.to_string(),
        expected: "number",
        actual: value.to_string(),
    })
}
