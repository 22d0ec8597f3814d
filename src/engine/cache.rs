// ==========================================
// 模式化排产系统 - 编译结果缓存
// ==========================================
// 职责: 按 (pattern_id, version_hash) 共享只读的 CompiledPattern
// 红线: 缓存内容不可变; 模式内容变化即换键，不做原地更新
// 红线: 每个 pattern_id 只保留最新写入的一个版本
// ==========================================

use crate::domain::pattern::{Machine, Pattern};
use crate::engine::compiler::{CompiledPattern, PatternCompiler};
use crate::engine::error::CompileError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

type CacheKey = (String, u64);

#[derive(Default)]
pub struct CompiledPatternCache {
    entries: Mutex<HashMap<CacheKey, Arc<CompiledPattern>>>,
}

impl CompiledPatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 命中则返回共享结果，否则编译并放入缓存
    ///
    /// 编译在锁外执行; 并发编译同一模式时以先写入者为准
    pub fn get_or_compile(
        &self,
        compiler: &PatternCompiler,
        pattern: &Pattern,
        machines: &[Machine],
    ) -> Result<Arc<CompiledPattern>, CompileError> {
        let key = (
            pattern.pattern_id.clone(),
            PatternCompiler::version_hash(pattern, machines),
        );

        if let Some(hit) = self.lookup(&key) {
            debug!(pattern_id = %key.0, version_hash = key.1, "编译缓存命中");
            return Ok(hit);
        }

        let compiled = Arc::new(compiler.compile(pattern, machines)?);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|(id, hash), _| id != &key.0 || *hash == key.1);
        if entries.len() < before {
            debug!(pattern_id = %key.0, version_hash = key.1, "模式内容变化, 淘汰旧版本");
        }
        Ok(entries.entry(key).or_insert(compiled).clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 丢弃某模式的全部版本
    pub fn invalidate(&self, pattern_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|(id, _), _| id != pattern_id);
    }

    fn lookup(&self, key: &CacheKey) -> Option<Arc<CompiledPattern>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }
}
