// ==========================================
// 模式化排产系统 - 实例展开器
// ==========================================
// 职责: CompiledPattern + JobInstance[] → CompiledProblem
// 复杂度: O(模式规模 × 实例数)，换型约束复用编译期矩阵，不逐对展开
// 红线: CompiledProblem 只引用 (Arc) CompiledPattern，不复制
// 红线: 换型只发生在同一设备上、不同实例的相邻任务之间
// ==========================================

use crate::domain::instance::JobInstance;
use crate::domain::pattern::{Machine, Pattern};
use crate::engine::compiler::{CompiledPattern, PatternCompiler};
use crate::engine::error::{CompileError, ExpansionError};
use chrono::NaiveDateTime;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

// ==========================================
// ProblemInstance - 问题中的实例
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProblemInstance {
    pub instance_id: String,
    pub priority: i32,
    pub due_offset_minutes: i64, // 交期相对原点 (分钟)
}

// ==========================================
// InstanceSlot - (实例, 任务) 变量组
// ==========================================
// slot_id = instance_idx × task_count + task_idx
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSlot {
    pub slot_id: usize,
    pub instance_idx: usize,
    pub task_idx: usize,
    pub start_var: usize,
    pub end_var: usize,
    pub mode_vars: Vec<usize>, // 每个模式一个选择布尔量
}

// ==========================================
// SlotPrecedence - 实例化后的前序约束
// ==========================================
// start(after) ≥ end(before) + min_lag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPrecedence {
    pub before_slot: usize,
    pub after_slot: usize,
    pub min_lag_minutes: i64,
}

// ==========================================
// SetupSource - 换型时间来源
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub enum SetupSource {
    /// 共享编译期矩阵 (模式化建模)
    Shared,
    /// 逐对展开的跨实例换型表 (扁平建模, 仅用于基准对比)
    Materialized(HashMap<(usize, usize, usize), i64>),
}

// ==========================================
// CompiledProblem - 单次求解的问题
// ==========================================
#[derive(Debug, Clone)]
pub struct CompiledProblem {
    pub pattern: Arc<CompiledPattern>,
    pub origin: NaiveDateTime,
    pub instances: Vec<ProblemInstance>,
    pub slots: Vec<InstanceSlot>,
    pub precedences: Vec<SlotPrecedence>,
    pub setup_source: SetupSource,
    pub variable_count: usize,
    pub horizon_minutes: i64,
}

impl CompiledProblem {
    pub fn pattern_id(&self) -> &str {
        &self.pattern.pattern_id
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.instance_id.clone()).collect()
    }

    pub fn slot_id(&self, instance_idx: usize, task_idx: usize) -> usize {
        instance_idx * self.pattern.task_count() + task_idx
    }

    /// 两个 slot 在同一设备上相邻时的换型时间
    ///
    /// # 说明
    /// 同一实例内的相邻任务不计换型
    pub fn setup_between(&self, from_slot: usize, to_slot: usize, machine_idx: usize) -> i64 {
        let from = &self.slots[from_slot];
        let to = &self.slots[to_slot];
        if from.instance_idx == to.instance_idx {
            return 0;
        }
        match &self.setup_source {
            SetupSource::Shared => {
                self.pattern
                    .setup_minutes(from.task_idx, to.task_idx, machine_idx)
            }
            SetupSource::Materialized(pairs) => pairs
                .get(&(from_slot, to_slot, machine_idx))
                .copied()
                .unwrap_or(0),
        }
    }

    /// 实例的交期偏移
    pub fn due_of(&self, instance_idx: usize) -> i64 {
        self.instances[instance_idx].due_offset_minutes
    }
}

// ==========================================
// InstanceExpander - 实例展开器
// ==========================================
pub struct InstanceExpander {
    // 无状态展开器
}

impl InstanceExpander {
    pub fn new() -> Self {
        Self {}
    }

    /// 展开实例
    ///
    /// # 参数
    /// - compiled: 已编译模式 (共享)
    /// - instances: 作业实例 (顺序即实例索引)
    /// - origin: 时间原点
    ///
    /// # 返回
    /// - Ok(CompiledProblem)
    /// - Err(ExpansionError): 空实例 / 模式不匹配 / 实例重复
    #[instrument(skip(self, compiled, instances), fields(pattern_id = %compiled.pattern_id, instance_count = instances.len()))]
    pub fn expand(
        &self,
        compiled: Arc<CompiledPattern>,
        instances: &[JobInstance],
        origin: NaiveDateTime,
    ) -> Result<CompiledProblem, ExpansionError> {
        let problem_instances = validate_instances(&compiled, instances, origin)?;
        let problem = build_problem(compiled, problem_instances, origin, SetupSource::Shared);

        debug!(
            slot_count = problem.slots.len(),
            precedence_count = problem.precedences.len(),
            variable_count = problem.variable_count,
            horizon = problem.horizon_minutes,
            "实例展开完成"
        );
        Ok(problem)
    }
}

impl Default for InstanceExpander {
    fn default() -> Self {
        Self::new()
    }
}

// ==========================================
// LegacyExpander - 扁平建模 (基准对比)
// ==========================================
// 每个实例单独编译一次模式，并逐对展开所有跨实例换型 (O(总任务数²))
pub struct LegacyExpander {
    compiler: PatternCompiler,
}

/// 扁平建模失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LegacyExpansionError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Expansion(#[from] ExpansionError),
}

impl LegacyExpander {
    pub fn new() -> Self {
        Self {
            compiler: PatternCompiler::new(),
        }
    }

    #[instrument(skip_all, fields(pattern_id = %pattern.pattern_id, instance_count = instances.len()))]
    pub fn expand(
        &self,
        pattern: &Pattern,
        machines: &[Machine],
        instances: &[JobInstance],
        origin: NaiveDateTime,
    ) -> Result<CompiledProblem, LegacyExpansionError> {
        if instances.is_empty() {
            return Err(ExpansionError::NoInstancesProvided {
                pattern_id: pattern.pattern_id.clone(),
            }
            .into());
        }

        // 每个实例独立编译 (不共享)
        let mut per_instance = Vec::with_capacity(instances.len());
        for _ in instances {
            let compiled = self.compiler.compile(pattern, machines)?;
            per_instance.push(Arc::new(compiled));
        }
        let compiled = per_instance[0].clone();

        let problem_instances = validate_instances(&compiled, instances, origin)?;

        // 逐对展开: 所有 (slot_a, slot_b, machine) 组合
        let n_tasks = compiled.task_count();
        let total = instances.len() * n_tasks;
        let mut pairs = HashMap::new();
        for a in 0..total {
            let (ia, ta) = (a / n_tasks, a % n_tasks);
            for b in 0..total {
                let (ib, tb) = (b / n_tasks, b % n_tasks);
                if ia == ib {
                    continue;
                }
                let from_task = &per_instance[ia].tasks[ta];
                for mode in &from_task.modes {
                    let minutes = per_instance[ib].setup_minutes(ta, tb, mode.machine_idx);
                    if minutes > 0 && per_instance[ib].tasks[tb].runs_on(mode.machine_idx) {
                        pairs.insert((a, b, mode.machine_idx), minutes);
                    }
                }
            }
        }

        debug!(materialized_setups = pairs.len(), "扁平建模换型展开完成");

        Ok(build_problem(
            compiled,
            problem_instances,
            origin,
            SetupSource::Materialized(pairs),
        ))
    }
}

impl Default for LegacyExpander {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_instances(
    compiled: &CompiledPattern,
    instances: &[JobInstance],
    origin: NaiveDateTime,
) -> Result<Vec<ProblemInstance>, ExpansionError> {
    if instances.is_empty() {
        return Err(ExpansionError::NoInstancesProvided {
            pattern_id: compiled.pattern_id.clone(),
        });
    }

    let mut seen = HashSet::new();
    let mut problem_instances = Vec::with_capacity(instances.len());
    for inst in instances {
        if inst.pattern_id != compiled.pattern_id {
            return Err(ExpansionError::UnknownPattern {
                instance_id: inst.instance_id.clone(),
                expected: compiled.pattern_id.clone(),
                found: inst.pattern_id.clone(),
            });
        }
        if !seen.insert(inst.instance_id.as_str()) {
            return Err(ExpansionError::DuplicateInstance {
                pattern_id: compiled.pattern_id.clone(),
                instance_id: inst.instance_id.clone(),
            });
        }
        problem_instances.push(ProblemInstance {
            instance_id: inst.instance_id.clone(),
            priority: inst.priority,
            due_offset_minutes: inst.due_offset_minutes(origin),
        });
    }
    Ok(problem_instances)
}

fn build_problem(
    compiled: Arc<CompiledPattern>,
    instances: Vec<ProblemInstance>,
    origin: NaiveDateTime,
    setup_source: SetupSource,
) -> CompiledProblem {
    let n_tasks = compiled.task_count();
    let mut slots = Vec::with_capacity(instances.len() * n_tasks);
    let mut precedences = Vec::with_capacity(instances.len() * compiled.edges.len());
    let mut next_var = 0usize;

    for instance_idx in 0..instances.len() {
        for (task_idx, task) in compiled.tasks.iter().enumerate() {
            let start_var = next_var;
            let end_var = next_var + 1;
            let mode_vars: Vec<usize> = (0..task.modes.len()).map(|m| end_var + 1 + m).collect();
            next_var = end_var + 1 + task.modes.len();

            slots.push(InstanceSlot {
                slot_id: instance_idx * n_tasks + task_idx,
                instance_idx,
                task_idx,
                start_var,
                end_var,
                mode_vars,
            });
        }

        let base = instance_idx * n_tasks;
        for edge in &compiled.edges {
            precedences.push(SlotPrecedence {
                before_slot: base + edge.before,
                after_slot: base + edge.after,
                min_lag_minutes: edge.min_lag_minutes,
            });
        }
    }

    // horizon: 所有任务取最长工时串行 + 全部 lag + 每个 slot 一次最大换型
    let max_durations: i64 = compiled
        .tasks
        .iter()
        .map(|t| t.modes.iter().map(|m| m.duration_minutes).max().unwrap_or(0))
        .sum();
    let lags: i64 = compiled.edges.iter().map(|e| e.min_lag_minutes).sum();
    let n_inst = instances.len() as i64;
    let horizon_minutes =
        n_inst * (max_durations + lags) + (slots.len() as i64) * compiled.max_setup_minutes();

    CompiledProblem {
        pattern: compiled,
        origin,
        instances,
        slots,
        precedences,
        setup_source,
        variable_count: next_var,
        horizon_minutes,
    }
}
