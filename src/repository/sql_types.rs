// ==========================================
// 模式化排产系统 - 列值编解码
// ==========================================
// 职责: 时间戳 / 枚举列的 TEXT 编解码
// ==========================================

use crate::repository::error::{RepositoryError, RepositoryResult};
use chrono::NaiveDateTime;
use std::str::FromStr;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

pub fn format_datetime(value: &NaiveDateTime) -> String {
    value.format(DATETIME_FORMAT).to_string()
}

pub fn parse_datetime(field: &str, raw: &str) -> RepositoryResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|e| RepositoryError::field(field, format!("无法解析时间 '{}': {}", raw, e)))
}

pub fn parse_enum<T>(field: &str, raw: &str) -> RepositoryResult<T>
where
    T: FromStr<Err = String>,
{
    raw.parse::<T>()
        .map_err(|message| RepositoryError::field(field, message))
}
