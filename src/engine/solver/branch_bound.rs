// ==========================================
// 模式化排产系统 - 分支定界求解引擎
// ==========================================
// 职责: 内置单目标约束求解 (ConstraintSolver 的默认实现)
// 搜索: 深度优先, 每层选择 (可排 slot, 模式), 设备上追加排布
// 定界: 拖期 / 完工 / 成本三类下界 + 前序阶段锁定目标
// 对称: 交期与优先级相同的实例, 其首任务按实例索引顺序排入
// 红线: 只在阻塞线程池中运行 (spawn_blocking), 不阻塞异步运行时
// 红线: 每 CHECK_INTERVAL 个节点检查一次取消与截止时间
// ==========================================

use crate::config::{SearchStrategy, SolverParameters};
use crate::domain::schedule::ObjectiveValues;
use crate::domain::types::{SolvePhase, SolveStatus};
use crate::engine::solver::model::{check_feasible, evaluate, Assignment, SlotAssignment, SolverModel};
use crate::engine::solver::{CancellationFlag, ConstraintSolver, EngineOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

const CHECK_INTERVAL: u64 = 256;
const MAX_TIME_LIMIT_SECONDS: f64 = 1.0e9;

// ==========================================
// BranchAndBoundEngine
// ==========================================
pub struct BranchAndBoundEngine {
    // 无状态引擎
}

impl BranchAndBoundEngine {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for BranchAndBoundEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConstraintSolver for BranchAndBoundEngine {
    fn name(&self) -> &str {
        "branch_and_bound"
    }

    #[instrument(skip_all, fields(
        pattern_id = %model.problem.pattern_id(),
        phase = %model.objective,
        slot_count = model.problem.slots.len()
    ))]
    async fn solve(
        &self,
        model: SolverModel,
        parameters: SolverParameters,
        cancel: CancellationFlag,
    ) -> anyhow::Result<EngineOutcome> {
        let limit = parameters.time_limit_seconds.clamp(0.0, MAX_TIME_LIMIT_SECONDS);
        let deadline = Instant::now().checked_add(Duration::from_secs_f64(limit));

        let outcome =
            tokio::task::spawn_blocking(move || Search::new(model, &parameters, cancel, deadline).run())
                .await?;

        debug!(
            status = %outcome.status,
            objective = ?outcome.objective_value,
            nodes = outcome.nodes_explored,
            "分支定界搜索结束"
        );
        Ok(outcome)
    }
}

// ==========================================
// 搜索状态
// ==========================================
#[derive(Debug, Clone, Copy)]
struct Candidate {
    slot: usize,
    mode_idx: usize,
    machine_idx: usize,
    start: i64,
    end: i64,
    cost_delta: i64,
}

struct Undo {
    prev_free: i64,
    prev_last: Option<usize>,
    group: Option<usize>,
}

struct Search {
    model: SolverModel,
    strategy: SearchStrategy,
    log_progress: bool,
    cancel: CancellationFlag,
    deadline: Option<Instant>,

    // 静态结构
    preds: Vec<Vec<(usize, i64)>>,
    succs: Vec<Vec<usize>>,
    sym_before: Vec<Option<usize>>,
    tail: Vec<i64>,
    min_cost: Vec<i64>,
    single_machine: Vec<Option<usize>>,

    // 动态状态
    remaining_preds: Vec<usize>,
    placed: Vec<Option<SlotAssignment>>,
    placed_count: usize,
    machine_free: Vec<i64>,
    machine_last: Vec<Option<usize>>,
    group_intervals: Vec<Vec<(i64, i64)>>,
    cost_so_far: i64,

    // 当前最优
    best_value: Option<i64>,
    best: Option<Assignment>,
    nodes: u64,
    aborted: bool,
}

impl Search {
    fn new(
        model: SolverModel,
        parameters: &SolverParameters,
        cancel: CancellationFlag,
        deadline: Option<Instant>,
    ) -> Self {
        let problem = &model.problem;
        let pattern = &problem.pattern;
        let n = problem.slots.len();

        let mut preds = vec![Vec::new(); n];
        let mut succs = vec![Vec::new(); n];
        for p in &problem.precedences {
            preds[p.after_slot].push((p.before_slot, p.min_lag_minutes));
            succs[p.before_slot].push(p.after_slot);
        }
        let remaining_preds = preds.iter().map(Vec::len).collect();

        let mut tail = Vec::with_capacity(n);
        let mut min_cost = Vec::with_capacity(n);
        let mut single_machine = Vec::with_capacity(n);
        for slot in &problem.slots {
            let task = &pattern.tasks[slot.task_idx];
            tail.push(pattern.tail_minutes[slot.task_idx]);
            min_cost.push(task.min_cost());
            let first = task.modes.first().map(|m| m.machine_idx);
            single_machine.push(first.filter(|&m| task.modes.iter().all(|x| x.machine_idx == m)));
        }

        // 等价实例 (交期 + 优先级相同) 的首任务按索引顺序排入
        let mut sym_before = vec![None; n];
        if let Some(&first_task) = pattern.topo_order.first() {
            let mut last_seen: HashMap<(i64, i32), usize> = HashMap::new();
            for (idx, inst) in problem.instances.iter().enumerate() {
                let slot = problem.slot_id(idx, first_task);
                if let Some(prev) = last_seen.insert((inst.due_offset_minutes, inst.priority), slot) {
                    sym_before[slot] = Some(prev);
                }
            }
        }

        let machine_count = pattern.machines.len();
        let group_count = model.reservations.groups.len();

        Self {
            strategy: parameters.search_strategy,
            log_progress: parameters.log_search_progress,
            cancel,
            deadline,
            preds,
            succs,
            sym_before,
            tail,
            min_cost,
            single_machine,
            remaining_preds,
            placed: vec![None; n],
            placed_count: 0,
            machine_free: vec![0; machine_count],
            machine_last: vec![None; machine_count],
            group_intervals: vec![Vec::new(); group_count],
            cost_so_far: 0,
            best_value: None,
            best: None,
            nodes: 0,
            aborted: false,
            model,
        }
    }

    fn run(mut self) -> EngineOutcome {
        self.seed_from_hint();

        if self.should_stop() {
            self.aborted = true;
        } else {
            self.dfs();
        }

        let status = match (self.aborted, self.best.is_some()) {
            (false, true) => SolveStatus::Optimal,
            (false, false) => SolveStatus::Infeasible,
            (true, true) => SolveStatus::Feasible,
            (true, false) => SolveStatus::Timeout,
        };

        EngineOutcome {
            status,
            objective_value: self.best_value,
            assignment: self.best,
            nodes_explored: self.nodes,
        }
    }

    /// 用上一阶段的解作为初始上界
    fn seed_from_hint(&mut self) {
        let Some(hint) = self.model.hint.clone() else {
            return;
        };
        if let Err(reason) = check_feasible(&self.model.problem, &self.model.reservations, &hint) {
            debug!(reason = %reason, "初始解不可行, 忽略");
            return;
        }
        let values = evaluate(&self.model.problem, &hint);
        if self.model.admits(&values) {
            self.best_value = Some(values.value_of(self.model.objective));
            self.best = Some(hint);
        }
    }

    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    fn dfs(&mut self) {
        self.nodes += 1;
        if self.nodes % CHECK_INTERVAL == 0 && self.should_stop() {
            self.aborted = true;
            return;
        }

        if self.placed_count == self.placed.len() {
            self.record_leaf();
            return;
        }

        if self.prune() {
            return;
        }

        for candidate in self.candidates() {
            let undo = self.apply(&candidate);
            self.dfs();
            self.revert(&candidate, undo);
            if self.aborted {
                return;
            }
        }
    }

    // ==========================================
    // 叶子节点
    // ==========================================
    fn record_leaf(&mut self) {
        let slots: Option<Vec<SlotAssignment>> = self.placed.iter().copied().collect();
        let Some(slots) = slots else {
            return;
        };
        let assignment = Assignment { slots };
        let values = evaluate(&self.model.problem, &assignment);
        if !self.model.admits(&values) {
            return;
        }

        let value = values.value_of(self.model.objective);
        if self.best_value.map_or(true, |best| value < best) {
            if self.log_progress {
                info!(
                    phase = %self.model.objective,
                    value,
                    nodes = self.nodes,
                    "找到更优解"
                );
            }
            self.best_value = Some(value);
            self.best = Some(assignment);
        }
    }

    // ==========================================
    // 下界与剪枝
    // ==========================================
    fn lower_bounds(&self) -> ObjectiveValues {
        let problem = &self.model.problem;
        let pattern = &problem.pattern;

        let mut completion = vec![0i64; problem.instances.len()];
        let mut remaining_on = vec![0i64; self.machine_free.len()];
        let mut remaining_cost = 0;

        for slot in &problem.slots {
            let id = slot.slot_id;
            let bound = match self.placed[id] {
                Some(a) => a.end,
                None => {
                    let task = &pattern.tasks[slot.task_idx];
                    let ready = self.preds[id]
                        .iter()
                        .filter_map(|&(p, lag)| self.placed[p].map(|a| a.end + lag))
                        .max()
                        .unwrap_or(0);
                    let machine_ready = task
                        .modes
                        .iter()
                        .map(|m| self.machine_free[m.machine_idx])
                        .min()
                        .unwrap_or(0);
                    let group_ready = self
                        .model
                        .reservations
                        .group_of(id)
                        .map_or(0, |g| g.earliest_start());

                    remaining_cost += self.min_cost[id];
                    if let Some(m) = self.single_machine[id] {
                        remaining_on[m] += task.min_duration();
                    }
                    ready.max(machine_ready).max(group_ready).max(0) + self.tail[id]
                }
            };
            let inst = &mut completion[slot.instance_idx];
            *inst = (*inst).max(bound);
        }

        let lateness = completion
            .iter()
            .zip(&problem.instances)
            .map(|(&c, inst)| (c - inst.due_offset_minutes).max(0))
            .sum();
        let machine_bound = self
            .machine_free
            .iter()
            .zip(&remaining_on)
            .map(|(free, rem)| free + rem)
            .max()
            .unwrap_or(0);
        let makespan = completion.iter().copied().max().unwrap_or(0).max(machine_bound);

        ObjectiveValues {
            total_lateness_minutes: lateness,
            makespan_minutes: makespan,
            total_cost_cents: self.cost_so_far + remaining_cost,
        }
    }

    fn prune(&self) -> bool {
        let bounds = self.lower_bounds();
        for (phase, lock) in &self.model.locks {
            if bounds.value_of(*phase) > lock.bound() {
                return true;
            }
        }
        self.best_value
            .map_or(false, |best| bounds.value_of(self.model.objective) >= best)
    }

    // ==========================================
    // 分支生成
    // ==========================================
    fn candidates(&self) -> Vec<Candidate> {
        let problem = &self.model.problem;
        let pattern = &problem.pattern;
        let mut out = Vec::new();

        for slot in &problem.slots {
            let id = slot.slot_id;
            if self.placed[id].is_some() || self.remaining_preds[id] > 0 {
                continue;
            }
            if let Some(before) = self.sym_before[id] {
                if self.placed[before].is_none() {
                    continue;
                }
            }

            let ready = self.preds[id]
                .iter()
                .filter_map(|&(p, lag)| self.placed[p].map(|a| a.end + lag))
                .max()
                .unwrap_or(0)
                .max(0);

            let task = &pattern.tasks[slot.task_idx];
            for (mode_idx, mode) in task.modes.iter().enumerate() {
                let m = mode.machine_idx;
                let setup = self.machine_last[m].map_or(0, |last| problem.setup_between(last, id, m));
                let lower = ready.max(self.machine_free[m] + setup);
                let start = match self.model.reservations.slot_group.get(id).copied().flatten() {
                    Some(g) => match self.place_in_group(g, lower, mode.duration_minutes) {
                        Some(t) => t,
                        None => continue,
                    },
                    None => lower,
                };
                let changeover = if setup > 0 {
                    pattern.machines[m].cost_for_minutes(setup)
                } else {
                    0
                };
                out.push(Candidate {
                    slot: id,
                    mode_idx,
                    machine_idx: m,
                    start,
                    end: start + mode.duration_minutes,
                    cost_delta: mode.cost_cents + changeover,
                });
            }
        }

        self.order(&mut out);
        out
    }

    fn order(&self, candidates: &mut [Candidate]) {
        match self.strategy {
            SearchStrategy::FixedOrder => candidates.sort_by_key(|c| (c.slot, c.mode_idx)),
            SearchStrategy::DepthFirst => candidates.sort_by_key(|c| (c.start, c.slot, c.mode_idx)),
            SearchStrategy::Automatic => match self.model.objective {
                SolvePhase::Lateness => {
                    let problem = &self.model.problem;
                    candidates.sort_by_key(|c| {
                        let due = problem.due_of(problem.slots[c.slot].instance_idx);
                        (c.start, due, c.slot, c.mode_idx)
                    })
                }
                SolvePhase::Makespan => {
                    candidates.sort_by_key(|c| (c.end, c.start, c.slot, c.mode_idx))
                }
                SolvePhase::Cost => {
                    candidates.sort_by_key(|c| (c.cost_delta, c.start, c.slot, c.mode_idx))
                }
            },
        }
    }

    /// 序列资源上的最早可行开始时间
    ///
    /// # 说明
    /// 候选点 = 下界 ∪ {已有预留结束 + 准备时间}; 占用区间半开
    fn place_in_group(&self, group_idx: usize, lower: i64, duration: i64) -> Option<i64> {
        let group = &self.model.reservations.groups[group_idx];
        let placed = &self.group_intervals[group_idx];
        let lower = lower.max(group.earliest_start());

        let mut points: Vec<i64> = placed
            .iter()
            .map(|&(_, to)| to + group.setup_minutes)
            .filter(|&t| t > lower)
            .collect();
        points.push(lower);
        points.sort_unstable();
        points.dedup();

        for t in points {
            if !group.within_window(t, t + duration) {
                return None;
            }
            let (from, to) = group.occupied(t, t + duration);
            if peak_load(placed, from, to) < group.limit {
                return Some(t);
            }
        }
        None
    }

    // ==========================================
    // 状态推进 / 回退
    // ==========================================
    fn apply(&mut self, c: &Candidate) -> Undo {
        let undo = Undo {
            prev_free: self.machine_free[c.machine_idx],
            prev_last: self.machine_last[c.machine_idx],
            group: self.model.reservations.slot_group.get(c.slot).copied().flatten(),
        };

        self.placed[c.slot] = Some(SlotAssignment {
            mode_idx: c.mode_idx,
            start: c.start,
            end: c.end,
        });
        self.placed_count += 1;
        self.machine_free[c.machine_idx] = c.end;
        self.machine_last[c.machine_idx] = Some(c.slot);
        self.cost_so_far += c.cost_delta;
        if let Some(g) = undo.group {
            let interval = self.model.reservations.groups[g].occupied(c.start, c.end);
            self.group_intervals[g].push(interval);
        }
        for &s in &self.succs[c.slot] {
            self.remaining_preds[s] -= 1;
        }
        undo
    }

    fn revert(&mut self, c: &Candidate, undo: Undo) {
        for &s in &self.succs[c.slot] {
            self.remaining_preds[s] += 1;
        }
        if let Some(g) = undo.group {
            self.group_intervals[g].pop();
        }
        self.cost_so_far -= c.cost_delta;
        self.machine_last[c.machine_idx] = undo.prev_last;
        self.machine_free[c.machine_idx] = undo.prev_free;
        self.placed_count -= 1;
        self.placed[c.slot] = None;
    }
}

/// [from, to) 内已有占用的最大并发数
fn peak_load(intervals: &[(i64, i64)], from: i64, to: i64) -> usize {
    let mut events: Vec<(i64, i32)> = intervals
        .iter()
        .filter(|&&(a, b)| a < to && from < b)
        .flat_map(|&(a, b)| [(a.max(from), 1), (b.min(to), -1)])
        .collect();
    // 同一时刻先释放后占用
    events.sort_unstable();

    let mut load = 0i32;
    let mut peak = 0i32;
    for (_, delta) in events {
        load += delta;
        peak = peak.max(load);
    }
    peak.max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_load_half_open() {
        let placed = vec![(0, 5), (5, 10), (3, 8)];
        assert_eq!(peak_load(&placed, 0, 10), 2);
        assert_eq!(peak_load(&placed, 10, 12), 0);
        assert_eq!(peak_load(&placed, 8, 10), 1);
        assert_eq!(peak_load(&[], 0, 100), 0);
    }
}
