// ==========================================
// 模式化排产系统 - 模式编译器
// ==========================================
// 职责: Pattern → CompiledPattern (校验 + 索引化 + 拓扑排序)
// 输入: Pattern + 设备主数据
// 输出: 不可变的 CompiledPattern，可在多次求解间共享
// 红线: 纯函数，无副作用；同一输入必须得到结构相同的输出
// 红线: 前序图以整数索引 arena 表示，环在此处拒绝，不进入求解
// ==========================================

use crate::config::SolverParameters;
use crate::domain::pattern::{Machine, Pattern};
use crate::engine::error::CompileError;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, instrument};

// ==========================================
// CompiledMode - 编译后的执行模式
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledMode {
    pub mode_id: String,
    pub machine_idx: usize,     // 指向 CompiledPattern::machines
    pub duration_minutes: i64,
    pub cost_cents: i64,        // 设备费 (按时长) + 固定装夹成本
}

// ==========================================
// CompiledTask - 编译后的任务
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledTask {
    pub task_id: String,
    pub name: String,
    pub position: i32,
    pub department: Option<String>,
    pub sequence_id: Option<String>,
    pub min_operators: i32,
    pub max_operators: i32,
    pub modes: Vec<CompiledMode>,
}

impl CompiledTask {
    /// 最短工时
    pub fn min_duration(&self) -> i64 {
        self.modes
            .iter()
            .map(|m| m.duration_minutes)
            .min()
            .unwrap_or(0)
    }

    /// 最低成本
    pub fn min_cost(&self) -> i64 {
        self.modes.iter().map(|m| m.cost_cents).min().unwrap_or(0)
    }

    /// 是否存在该设备上的模式
    pub fn runs_on(&self, machine_idx: usize) -> bool {
        self.modes.iter().any(|m| m.machine_idx == machine_idx)
    }
}

// ==========================================
// CompiledEdge - 前序边 (任务索引)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct CompiledEdge {
    pub before: usize,
    pub after: usize,
    pub min_lag_minutes: i64,
}

// ==========================================
// CompiledPattern - 编译结果
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPattern {
    pub pattern_id: String,
    pub pattern_version: i32,
    pub version_hash: u64,
    pub tasks: Vec<CompiledTask>,              // 稳定顺序 (position, task_id)
    pub task_index: HashMap<String, usize>,    // task_id → 索引
    pub machines: Vec<Machine>,                // 本模式用到的设备 (按 machine_id 排序)
    pub edges: Vec<CompiledEdge>,              // 去重后的前序边 (有序)
    pub predecessors: Vec<Vec<(usize, i64)>>,  // 每个任务的 (前序, lag)
    pub successors: Vec<Vec<(usize, i64)>>,    // 每个任务的 (后序, lag)
    pub topo_order: Vec<usize>,                // 拓扑序 (同层按稳定顺序)
    pub tail_minutes: Vec<i64>,                // 从任务开始到其后继链结束的最短时长
    pub setup_matrix: BTreeMap<(usize, usize, usize), i64>, // (from, to, machine) → 分钟
    pub default_parameters: SolverParameters,  // 模式默认求解参数
}

impl CompiledPattern {
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn machine_index(&self, machine_id: &str) -> Option<usize> {
        self.machines.iter().position(|m| m.machine_id == machine_id)
    }

    /// 换型时间 (无条目视为 0)
    pub fn setup_minutes(&self, from_task: usize, to_task: usize, machine_idx: usize) -> i64 {
        self.setup_matrix
            .get(&(from_task, to_task, machine_idx))
            .copied()
            .unwrap_or(0)
    }

    /// 单个实例的关键路径长度 (按最短工时)
    pub fn critical_path_minutes(&self) -> i64 {
        self.tail_minutes.iter().copied().max().unwrap_or(0)
    }

    /// 某设备上任意换型的最大值 (用于 horizon 估计)
    pub fn max_setup_minutes(&self) -> i64 {
        self.setup_matrix.values().copied().max().unwrap_or(0)
    }
}

// ==========================================
// PatternCompiler - 模式编译器
// ==========================================
pub struct PatternCompiler {
    // 无状态编译器
}

impl PatternCompiler {
    pub fn new() -> Self {
        Self {}
    }

    /// 计算模式的版本哈希 (不做校验，可用于缓存查找)
    ///
    /// # 说明
    /// 对规范化后的模式内容 (任务按稳定顺序、前序/换型按键排序、所用设备费率) 求 SHA-256，
    /// 内容不变则哈希不变 (与进程、平台无关)
    pub fn version_hash(pattern: &Pattern, machines: &[Machine]) -> u64 {
        let mut tasks: Vec<_> = pattern.tasks.iter().collect();
        tasks.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.task_id.cmp(&b.task_id)));

        let mut precedences: Vec<_> = pattern
            .precedences
            .iter()
            .map(|p| (&p.before_task_id, &p.after_task_id, p.min_lag_minutes))
            .collect();
        precedences.sort();

        let mut setups: Vec<_> = pattern
            .setup_times
            .iter()
            .map(|s| (&s.from_task_id, &s.to_task_id, &s.machine_id, s.setup_time_minutes))
            .collect();
        setups.sort();

        let used: HashSet<&str> = pattern
            .tasks
            .iter()
            .flat_map(|t| t.modes.iter().map(|m| m.machine_id.as_str()))
            .collect();
        let mut rates: Vec<_> = machines
            .iter()
            .filter(|m| used.contains(m.machine_id.as_str()))
            .map(|m| (&m.machine_id, m.cost_per_hour_cents))
            .collect();
        rates.sort();

        let canonical = serde_json::json!({
            "pattern_id": pattern.pattern_id,
            "version": pattern.version,
            "tasks": tasks,
            "precedences": precedences,
            "setups": setups,
            "rates": rates,
            "solver_parameters": pattern.solver_parameters,
        });

        // SHA-256 前 8 字节: 跨进程 / 跨工具链稳定, 可作为对外标识
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }

    /// 编译模式
    ///
    /// # 参数
    /// - pattern: 模式定义
    /// - machines: 设备主数据 (至少包含模式引用的设备)
    ///
    /// # 返回
    /// - Ok(CompiledPattern): 校验通过的编译结果
    /// - Err(CompileError): 第一个校验失败项
    #[instrument(skip(self, pattern, machines), fields(pattern_id = %pattern.pattern_id))]
    pub fn compile(
        &self,
        pattern: &Pattern,
        machines: &[Machine],
    ) -> Result<CompiledPattern, CompileError> {
        let pattern_id = pattern.pattern_id.clone();

        // ==========================================
        // 1. 任务集合校验
        // ==========================================
        if pattern.tasks.is_empty() {
            return Err(CompileError::EmptyPattern { pattern_id });
        }

        let mut seen = HashSet::new();
        for task in &pattern.tasks {
            if !seen.insert(task.task_id.as_str()) {
                return Err(CompileError::DuplicateTask {
                    pattern_id,
                    task_id: task.task_id.clone(),
                });
            }
        }

        // 稳定顺序: (position, task_id)
        let mut ordered: Vec<_> = pattern.tasks.iter().collect();
        ordered.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.task_id.cmp(&b.task_id)));

        let task_index: HashMap<String, usize> = ordered
            .iter()
            .enumerate()
            .map(|(i, t)| (t.task_id.clone(), i))
            .collect();

        // ==========================================
        // 2. 设备索引 (仅本模式用到的设备)
        // ==========================================
        let machine_by_id: HashMap<&str, &Machine> =
            machines.iter().map(|m| (m.machine_id.as_str(), m)).collect();

        let mut used_machines: Vec<Machine> = Vec::new();
        for task in &ordered {
            for mode in &task.modes {
                let machine = machine_by_id.get(mode.machine_id.as_str()).ok_or_else(|| {
                    CompileError::UnknownMachine {
                        pattern_id: pattern_id.clone(),
                        task_id: task.task_id.clone(),
                        machine_id: mode.machine_id.clone(),
                    }
                })?;
                if !used_machines.iter().any(|m| m.machine_id == machine.machine_id) {
                    used_machines.push((*machine).clone());
                }
            }
        }
        used_machines.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));

        // ==========================================
        // 3. 任务/模式校验
        // ==========================================
        let mut tasks = Vec::with_capacity(ordered.len());
        for task in &ordered {
            if task.modes.is_empty() {
                return Err(CompileError::MissingMode {
                    pattern_id,
                    task_id: task.task_id.clone(),
                });
            }
            if task.min_operators < 0 || task.min_operators > task.max_operators {
                return Err(CompileError::InvalidOperatorBounds {
                    pattern_id,
                    task_id: task.task_id.clone(),
                    min: task.min_operators,
                    max: task.max_operators,
                });
            }

            let mut mode_ids = HashSet::new();
            let mut modes = Vec::with_capacity(task.modes.len());
            for mode in &task.modes {
                let invalid = |reason: String| CompileError::InvalidMode {
                    pattern_id: pattern_id.clone(),
                    task_id: task.task_id.clone(),
                    mode_id: mode.mode_id.clone(),
                    reason,
                };
                if !mode_ids.insert(mode.mode_id.as_str()) {
                    return Err(invalid("模式ID重复".to_string()));
                }
                if mode.duration_minutes <= 0 {
                    return Err(invalid(format!("工时必须 > 0, 实际 {}", mode.duration_minutes)));
                }
                if mode.setup_cost_cents < 0 {
                    return Err(invalid(format!("装夹成本不能为负, 实际 {}", mode.setup_cost_cents)));
                }

                // 设备已在第 2 步校验存在
                let machine_idx = used_machines
                    .iter()
                    .position(|m| m.machine_id == mode.machine_id)
                    .ok_or_else(|| invalid("设备索引缺失".to_string()))?;
                let run_cost = used_machines[machine_idx].cost_for_minutes(mode.duration_minutes);

                modes.push(CompiledMode {
                    mode_id: mode.mode_id.clone(),
                    machine_idx,
                    duration_minutes: mode.duration_minutes,
                    cost_cents: run_cost + mode.setup_cost_cents,
                });
            }

            tasks.push(CompiledTask {
                task_id: task.task_id.clone(),
                name: task.name.clone(),
                position: task.position,
                department: task.department.clone(),
                sequence_id: task.sequence_id.clone(),
                min_operators: task.min_operators,
                max_operators: task.max_operators,
                modes,
            });
        }

        // ==========================================
        // 4. 前序边校验 + 去重 (重复边取最大 lag)
        // ==========================================
        let mut edge_map: BTreeMap<(usize, usize), i64> = BTreeMap::new();
        for prec in &pattern.precedences {
            let before = *task_index.get(&prec.before_task_id).ok_or_else(|| {
                CompileError::UnknownTask {
                    pattern_id: pattern_id.clone(),
                    task_id: prec.before_task_id.clone(),
                }
            })?;
            let after = *task_index.get(&prec.after_task_id).ok_or_else(|| {
                CompileError::UnknownTask {
                    pattern_id: pattern_id.clone(),
                    task_id: prec.after_task_id.clone(),
                }
            })?;
            if before == after {
                return Err(CompileError::SelfPrecedence {
                    pattern_id,
                    task_id: prec.before_task_id.clone(),
                });
            }
            if prec.min_lag_minutes < 0 {
                return Err(CompileError::InvalidPrecedence {
                    pattern_id,
                    before_task_id: prec.before_task_id.clone(),
                    after_task_id: prec.after_task_id.clone(),
                    reason: format!("最小间隔不能为负, 实际 {}", prec.min_lag_minutes),
                });
            }
            let lag = edge_map.entry((before, after)).or_insert(prec.min_lag_minutes);
            *lag = (*lag).max(prec.min_lag_minutes);
        }

        let edges: Vec<CompiledEdge> = edge_map
            .iter()
            .map(|(&(before, after), &lag)| CompiledEdge {
                before,
                after,
                min_lag_minutes: lag,
            })
            .collect();

        let n = tasks.len();
        let mut predecessors = vec![Vec::new(); n];
        let mut successors = vec![Vec::new(); n];
        for e in &edges {
            successors[e.before].push((e.after, e.min_lag_minutes));
            predecessors[e.after].push((e.before, e.min_lag_minutes));
        }

        // ==========================================
        // 5. 拓扑排序 (Kahn)
        // ==========================================
        let topo_order = topological_order(&successors, &predecessors).map_err(|cycle| {
            CompileError::CycleDetected {
                pattern_id: pattern_id.clone(),
                tasks: cycle.iter().map(|&i| tasks[i].task_id.clone()).collect(),
            }
        })?;

        // 尾长: 逆拓扑序 tail[i] = min_dur(i) + max(lag + tail[succ])
        let mut tail_minutes = vec![0i64; n];
        for &i in topo_order.iter().rev() {
            let downstream = successors[i]
                .iter()
                .map(|&(s, lag)| lag + tail_minutes[s])
                .max()
                .unwrap_or(0);
            tail_minutes[i] = tasks[i].min_duration() + downstream;
        }

        // ==========================================
        // 6. 换型时间矩阵
        // ==========================================
        let mut setup_matrix = BTreeMap::new();
        for entry in &pattern.setup_times {
            let invalid = |reason: &str| CompileError::InvalidSetupEntry {
                pattern_id: pattern_id.clone(),
                from_task_id: entry.from_task_id.clone(),
                to_task_id: entry.to_task_id.clone(),
                machine_id: entry.machine_id.clone(),
                reason: reason.to_string(),
            };
            if entry.from_task_id == entry.to_task_id {
                return Err(invalid("from 与 to 不能相同"));
            }
            if entry.setup_time_minutes < 0 {
                return Err(invalid("换型时间不能为负"));
            }
            let from = *task_index
                .get(&entry.from_task_id)
                .ok_or_else(|| invalid("from 任务不在本模式内"))?;
            let to = *task_index
                .get(&entry.to_task_id)
                .ok_or_else(|| invalid("to 任务不在本模式内"))?;
            let machine_idx = used_machines
                .iter()
                .position(|m| m.machine_id == entry.machine_id)
                .ok_or_else(|| invalid("设备未被任何任务模式使用"))?;
            if !tasks[from].runs_on(machine_idx) || !tasks[to].runs_on(machine_idx) {
                return Err(invalid("from/to 任务在该设备上没有执行模式"));
            }
            if setup_matrix
                .insert((from, to, machine_idx), entry.setup_time_minutes)
                .is_some()
            {
                return Err(invalid("换型条目重复"));
            }
        }

        // ==========================================
        // 7. 求解参数
        // ==========================================
        let default_parameters = SolverParameters::from_json(&pattern.solver_parameters)
            .map_err(|source| CompileError::InvalidParameters {
                pattern_id: pattern_id.clone(),
                source,
            })?;

        let version_hash = Self::version_hash(pattern, machines);

        debug!(
            task_count = n,
            edge_count = edges.len(),
            setup_count = setup_matrix.len(),
            machine_count = used_machines.len(),
            version_hash,
            "模式编译完成"
        );

        Ok(CompiledPattern {
            pattern_id,
            pattern_version: pattern.version,
            version_hash,
            tasks,
            task_index,
            machines: used_machines,
            edges,
            predecessors,
            successors,
            topo_order,
            tail_minutes,
            setup_matrix,
            default_parameters,
        })
    }
}

impl Default for PatternCompiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Kahn 拓扑排序
///
/// # 返回
/// - Ok(order): 拓扑序 (就绪集合按索引升序弹出，保证确定性)
/// - Err(cycle): 位于环上的任务索引 (升序)
fn topological_order(
    successors: &[Vec<(usize, i64)>],
    predecessors: &[Vec<(usize, i64)>],
) -> Result<Vec<usize>, Vec<usize>> {
    let n = successors.len();
    let mut indegree: Vec<usize> = predecessors.iter().map(|p| p.len()).collect();
    let mut ready: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(i) = ready.pop_front() {
        order.push(i);
        let mut released = Vec::new();
        for &(s, _) in &successors[i] {
            indegree[s] -= 1;
            if indegree[s] == 0 {
                released.push(s);
            }
        }
        released.sort_unstable();
        ready.extend(released);
    }

    if order.len() == n {
        return Ok(order);
    }

    // 剩余节点中剥离只通向环外的下游节点，留下环本身
    let mut remaining: Vec<bool> = indegree.iter().map(|&d| d > 0).collect();
    loop {
        let mut changed = false;
        for i in 0..n {
            if remaining[i] && !successors[i].iter().any(|&(s, _)| remaining[s]) {
                remaining[i] = false;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    Err((0..n).filter(|&i| remaining[i]).collect())
}
