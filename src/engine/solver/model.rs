// ==========================================
// 模式化排产系统 - 求解模型
// ==========================================
// 职责: 单阶段求解模型 / 变量赋值 / 目标值评估 / 可行性校验
// 职责: 生成给外部求解引擎的可序列化模型描述 (ModelDescription)
// ==========================================

use crate::config::SolverParameters;
use crate::domain::schedule::{ObjectiveLock, ObjectiveValues, SequenceReservation, TaskAssignment};
use crate::domain::types::SolvePhase;
use crate::engine::expander::{CompiledProblem, SetupSource};
use crate::engine::reservation::ReservationConstraintSet;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

// ==========================================
// SlotAssignment / Assignment - 变量赋值
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAssignment {
    pub mode_idx: usize,
    pub start: i64,
    pub end: i64,
}

/// 按 slot_id 索引的完整赋值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub slots: Vec<SlotAssignment>,
}

// ==========================================
// SolverModel - 单阶段模型
// ==========================================
#[derive(Debug, Clone)]
pub struct SolverModel {
    pub problem: Arc<CompiledProblem>,
    pub reservations: Arc<ReservationConstraintSet>,
    pub objective: SolvePhase,                     // 本阶段优化目标
    pub locks: Vec<(SolvePhase, ObjectiveLock)>,   // 已锁定的前序阶段目标
    pub hint: Option<Assignment>,                  // 上一阶段的解 (满足全部锁)
}

impl SolverModel {
    pub fn new(
        problem: Arc<CompiledProblem>,
        reservations: Arc<ReservationConstraintSet>,
        objective: SolvePhase,
    ) -> Self {
        Self {
            problem,
            reservations,
            objective,
            locks: Vec::new(),
            hint: None,
        }
    }

    pub fn with_lock(mut self, phase: SolvePhase, lock: ObjectiveLock) -> Self {
        self.locks.push((phase, lock));
        self
    }

    pub fn with_hint(mut self, hint: Option<Assignment>) -> Self {
        self.hint = hint;
        self
    }

    /// 目标值是否满足全部锁
    pub fn admits(&self, values: &ObjectiveValues) -> bool {
        self.locks
            .iter()
            .all(|(phase, lock)| lock.admits(values.value_of(*phase)))
    }

    /// 模型时间上界
    pub fn horizon(&self) -> i64 {
        self.problem.horizon_minutes + self.reservations.max_window_offset()
    }
}

/// 按最终赋值计算三个目标值
///
/// # 说明
/// - 拖期: Σ max(0, 实例完工 - 交期)
/// - 完工: 所有任务最大结束时间
/// - 成本: Σ 模式成本 + Σ 换型分钟按设备费率计费
pub fn evaluate(problem: &CompiledProblem, assignment: &Assignment) -> ObjectiveValues {
    let pattern = &problem.pattern;
    let n_tasks = pattern.task_count();

    let mut total_lateness = 0;
    for (idx, inst) in problem.instances.iter().enumerate() {
        let completion = (0..n_tasks)
            .map(|t| assignment.slots[idx * n_tasks + t].end)
            .max()
            .unwrap_or(0);
        total_lateness += (completion - inst.due_offset_minutes).max(0);
    }

    let makespan = assignment.slots.iter().map(|s| s.end).max().unwrap_or(0).max(0);

    let mut cost: i64 = problem
        .slots
        .iter()
        .map(|slot| pattern.tasks[slot.task_idx].modes[assignment.slots[slot.slot_id].mode_idx].cost_cents)
        .sum();

    for (machine_idx, machine) in pattern.machines.iter().enumerate() {
        for (prev, cur) in machine_sequence(problem, assignment, machine_idx)
            .windows(2)
            .map(|w| (w[0], w[1]))
        {
            let setup = problem.setup_between(prev, cur, machine_idx);
            if setup > 0 {
                cost += machine.cost_for_minutes(setup);
            }
        }
    }

    ObjectiveValues {
        total_lateness_minutes: total_lateness,
        makespan_minutes: makespan,
        total_cost_cents: cost,
    }
}

/// 某设备上按开始时间排序的 slot 序列
fn machine_sequence(problem: &CompiledProblem, assignment: &Assignment, machine_idx: usize) -> Vec<usize> {
    let mut seq: Vec<usize> = problem
        .slots
        .iter()
        .filter(|slot| {
            let task = &problem.pattern.tasks[slot.task_idx];
            task.modes[assignment.slots[slot.slot_id].mode_idx].machine_idx == machine_idx
        })
        .map(|slot| slot.slot_id)
        .collect();
    seq.sort_by_key(|&s| (assignment.slots[s].start, s));
    seq
}

/// 校验赋值满足全部硬约束
///
/// # 返回
/// - Ok(()): 可行
/// - Err(String): 第一条违规
pub fn check_feasible(
    problem: &CompiledProblem,
    reservations: &ReservationConstraintSet,
    assignment: &Assignment,
) -> Result<(), String> {
    let pattern = &problem.pattern;
    if assignment.slots.len() != problem.slots.len() {
        return Err(format!(
            "赋值长度 {} 与 slot 数 {} 不一致",
            assignment.slots.len(),
            problem.slots.len()
        ));
    }

    for slot in &problem.slots {
        let a = &assignment.slots[slot.slot_id];
        let task = &pattern.tasks[slot.task_idx];
        let mode = task
            .modes
            .get(a.mode_idx)
            .ok_or_else(|| format!("slot {} 模式索引越界: {}", slot.slot_id, a.mode_idx))?;
        if a.start < 0 || a.end - a.start != mode.duration_minutes {
            return Err(format!(
                "slot {} 时间非法: start={}, end={}, duration={}",
                slot.slot_id, a.start, a.end, mode.duration_minutes
            ));
        }
    }

    for p in &problem.precedences {
        let before = &assignment.slots[p.before_slot];
        let after = &assignment.slots[p.after_slot];
        if after.start < before.end + p.min_lag_minutes {
            return Err(format!(
                "前序违规: slot {} (end={}) → slot {} (start={}), lag={}",
                p.before_slot, before.end, p.after_slot, after.start, p.min_lag_minutes
            ));
        }
    }

    for machine_idx in 0..pattern.machines.len() {
        let seq = machine_sequence(problem, assignment, machine_idx);
        for w in seq.windows(2) {
            let (prev, cur) = (w[0], w[1]);
            let setup = problem.setup_between(prev, cur, machine_idx);
            if assignment.slots[cur].start < assignment.slots[prev].end + setup {
                return Err(format!(
                    "设备 {} 冲突: slot {} 与 slot {} (换型 {})",
                    pattern.machines[machine_idx].machine_id, prev, cur, setup
                ));
            }
        }
    }

    for group in &reservations.groups {
        let mut events: Vec<(i64, i64)> = Vec::with_capacity(group.members.len() * 2);
        for &slot in &group.members {
            let a = &assignment.slots[slot];
            if !group.within_window(a.start, a.end) {
                return Err(format!(
                    "资源 {} 窗口违规: slot {} [{}, {})",
                    group.sequence_id, slot, a.start, a.end
                ));
            }
            let (from, to) = group.occupied(a.start, a.end);
            events.push((from, 1));
            events.push((to, -1));
        }
        // 同一时刻先释放后占用 (半开区间)
        events.sort();
        let mut load = 0i64;
        for (_, delta) in events {
            load += delta;
            if load > group.limit as i64 {
                return Err(format!(
                    "资源 {} 并发超限: {} > {}",
                    group.sequence_id, load, group.limit
                ));
            }
        }
    }

    Ok(())
}

/// 赋值 → 任务分配记录
pub fn to_task_assignments(problem: &CompiledProblem, assignment: &Assignment) -> Vec<TaskAssignment> {
    let pattern = &problem.pattern;
    problem
        .slots
        .iter()
        .map(|slot| {
            let a = &assignment.slots[slot.slot_id];
            let task = &pattern.tasks[slot.task_idx];
            let mode = &task.modes[a.mode_idx];
            TaskAssignment {
                instance_id: problem.instances[slot.instance_idx].instance_id.clone(),
                task_id: task.task_id.clone(),
                mode_id: mode.mode_id.clone(),
                machine_id: pattern.machines[mode.machine_idx].machine_id.clone(),
                start_minute: a.start,
                end_minute: a.end,
            }
        })
        .collect()
}

/// 赋值 → 序列资源预留记录 (含准备/拆卸)
pub fn to_reservations(
    problem: &CompiledProblem,
    reservations: &ReservationConstraintSet,
    assignment: &Assignment,
) -> Vec<SequenceReservation> {
    let mut records = Vec::new();
    for group in &reservations.groups {
        for &slot_id in &group.members {
            let slot = &problem.slots[slot_id];
            let a = &assignment.slots[slot_id];
            let (from, to) = group.occupied(a.start, a.end);
            records.push(SequenceReservation {
                sequence_id: group.sequence_id.clone(),
                instance_id: problem.instances[slot.instance_idx].instance_id.clone(),
                task_id: problem.pattern.tasks[slot.task_idx].task_id.clone(),
                start_minute: from,
                end_minute: to,
            });
        }
    }
    records
}

// ==========================================
// ModelDescription - 外部引擎交换格式
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescription {
    pub pattern_id: String,
    pub horizon: i64,
    pub objective: SolvePhase,
    pub locks: Vec<LockDescription>,
    pub machines: Vec<MachineDescription>,
    pub intervals: Vec<IntervalDescription>,
    pub precedences: Vec<PrecedenceDescription>,
    pub setup_rules: Vec<SetupRuleDescription>,
    pub capacities: Vec<CapacityDescription>,
    pub due_dates: Vec<DueDateDescription>,
    pub parameters: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockDescription {
    pub phase: SolvePhase,
    pub lock: ObjectiveLock,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineDescription {
    pub machine_id: String,
    pub cost_per_hour_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalDescription {
    pub slot_id: usize,
    pub instance_id: String,
    pub task_id: String,
    pub start_var: usize,
    pub end_var: usize,
    pub modes: Vec<ModeDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeDescription {
    pub mode_var: usize,
    pub mode_id: String,
    pub machine_id: String,
    pub duration: i64,
    pub cost_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrecedenceDescription {
    pub before_slot: usize,
    pub after_slot: usize,
    pub min_lag: i64,
}

/// 换型条件约束: 同设备、不同实例，from 紧接 to 时生效
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetupRuleDescription {
    pub from_task_id: String,
    pub to_task_id: String,
    pub machine_id: String,
    pub minutes: i64,
    pub from_slot: Option<usize>, // 扁平建模时逐对给出
    pub to_slot: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityDescription {
    pub sequence_id: String,
    pub limit: usize,
    pub setup: i64,
    pub teardown: i64,
    pub window_start: i64,
    pub window_end: Option<i64>,
    pub members: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DueDateDescription {
    pub instance_id: String,
    pub due_offset: i64,
}

impl ModelDescription {
    pub fn from_model(model: &SolverModel, parameters: &SolverParameters) -> Self {
        let problem = &model.problem;
        let pattern = &problem.pattern;
        let machine_id = |idx: usize| pattern.machines[idx].machine_id.clone();

        let intervals = problem
            .slots
            .iter()
            .map(|slot| {
                let task = &pattern.tasks[slot.task_idx];
                IntervalDescription {
                    slot_id: slot.slot_id,
                    instance_id: problem.instances[slot.instance_idx].instance_id.clone(),
                    task_id: task.task_id.clone(),
                    start_var: slot.start_var,
                    end_var: slot.end_var,
                    modes: task
                        .modes
                        .iter()
                        .zip(&slot.mode_vars)
                        .map(|(mode, &var)| ModeDescription {
                            mode_var: var,
                            mode_id: mode.mode_id.clone(),
                            machine_id: machine_id(mode.machine_idx),
                            duration: mode.duration_minutes,
                            cost_cents: mode.cost_cents,
                        })
                        .collect(),
                }
            })
            .collect();

        let setup_rules = match &problem.setup_source {
            SetupSource::Shared => pattern
                .setup_matrix
                .iter()
                .map(|(&(from, to, m), &minutes)| SetupRuleDescription {
                    from_task_id: pattern.tasks[from].task_id.clone(),
                    to_task_id: pattern.tasks[to].task_id.clone(),
                    machine_id: machine_id(m),
                    minutes,
                    from_slot: None,
                    to_slot: None,
                })
                .collect(),
            SetupSource::Materialized(pairs) => {
                let mut rules: Vec<_> = pairs
                    .iter()
                    .map(|(&(a, b, m), &minutes)| SetupRuleDescription {
                        from_task_id: pattern.tasks[problem.slots[a].task_idx].task_id.clone(),
                        to_task_id: pattern.tasks[problem.slots[b].task_idx].task_id.clone(),
                        machine_id: machine_id(m),
                        minutes,
                        from_slot: Some(a),
                        to_slot: Some(b),
                    })
                    .collect();
                rules.sort_by_key(|r| (r.from_slot, r.to_slot, r.machine_id.clone()));
                rules
            }
        };

        Self {
            pattern_id: pattern.pattern_id.clone(),
            horizon: model.horizon(),
            objective: model.objective,
            locks: model
                .locks
                .iter()
                .map(|&(phase, lock)| LockDescription { phase, lock })
                .collect(),
            machines: pattern
                .machines
                .iter()
                .map(|m| MachineDescription {
                    machine_id: m.machine_id.clone(),
                    cost_per_hour_cents: m.cost_per_hour_cents,
                })
                .collect(),
            intervals,
            precedences: problem
                .precedences
                .iter()
                .map(|p| PrecedenceDescription {
                    before_slot: p.before_slot,
                    after_slot: p.after_slot,
                    min_lag: p.min_lag_minutes,
                })
                .collect(),
            setup_rules,
            capacities: model
                .reservations
                .groups
                .iter()
                .map(|g| CapacityDescription {
                    sequence_id: g.sequence_id.clone(),
                    limit: g.limit,
                    setup: g.setup_minutes,
                    teardown: g.teardown_minutes,
                    window_start: g.window_start_minute,
                    window_end: g.window_end_minute,
                    members: g.members.clone(),
                })
                .collect(),
            due_dates: problem
                .instances
                .iter()
                .map(|i| DueDateDescription {
                    instance_id: i.instance_id.clone(),
                    due_offset: i.due_offset_minutes,
                })
                .collect(),
            parameters: parameters.to_engine_json(),
        }
    }
}
