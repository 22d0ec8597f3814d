// ==========================================
// 模式化排产系统 - 作业模式领域模型
// ==========================================
// 职责: 作业模式 (Pattern) 及其任务/模式/前序/换型时间
// 红线: 前序边只能在同一 Pattern 内构成 DAG
// 生命周期: 外部录入，本核心只读
// ==========================================

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ==========================================
// Machine - 设备
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub machine_id: String,       // 设备ID
    pub name: String,             // 设备名称
    pub cost_per_hour_cents: i64, // 小时费率 (分/小时)
}

impl Machine {
    pub fn new(machine_id: &str, name: &str, cost_per_hour_cents: i64) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            name: name.to_string(),
            cost_per_hour_cents,
        }
    }

    /// 按分钟计费 (四舍五入到分)
    pub fn cost_for_minutes(&self, minutes: i64) -> i64 {
        (self.cost_per_hour_cents * minutes + 30) / 60
    }
}

// ==========================================
// TaskMode - 执行模式 (设备 + 工时)
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMode {
    pub mode_id: String,        // 模式ID
    pub machine_id: String,     // 设备
    pub duration_minutes: i64,  // 工时 (分钟, > 0)
    #[serde(default)]
    pub setup_cost_cents: i64,  // 固定装夹/工装成本 (分)
}

impl TaskMode {
    pub fn new(mode_id: &str, machine_id: &str, duration_minutes: i64) -> Self {
        Self {
            mode_id: mode_id.to_string(),
            machine_id: machine_id.to_string(),
            duration_minutes,
            setup_cost_cents: 0,
        }
    }

    pub fn with_setup_cost(mut self, setup_cost_cents: i64) -> Self {
        self.setup_cost_cents = setup_cost_cents;
        self
    }
}

// ==========================================
// PatternTask - 模式任务
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternTask {
    pub task_id: String,             // 任务ID
    pub name: String,                // 任务名称
    pub position: i32,               // 位置 (稳定排序/对称破除)
    pub department: Option<String>,  // 所属部门
    pub sequence_id: Option<String>, // 绑定的序列资源
    pub min_operators: i32,          // 最少操作工
    pub max_operators: i32,          // 最多操作工
    pub modes: Vec<TaskMode>,        // 有序的执行模式
}

impl PatternTask {
    pub fn new(task_id: &str, position: i32) -> Self {
        Self {
            task_id: task_id.to_string(),
            name: task_id.to_string(),
            position,
            department: None,
            sequence_id: None,
            min_operators: 1,
            max_operators: 1,
            modes: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: TaskMode) -> Self {
        self.modes.push(mode);
        self
    }

    pub fn with_sequence(mut self, sequence_id: &str) -> Self {
        self.sequence_id = Some(sequence_id.to_string());
        self
    }

    pub fn with_department(mut self, department: &str) -> Self {
        self.department = Some(department.to_string());
        self
    }

    pub fn with_operators(mut self, min_operators: i32, max_operators: i32) -> Self {
        self.min_operators = min_operators;
        self.max_operators = max_operators;
        self
    }
}

// ==========================================
// Precedence - 前序约束
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precedence {
    pub before_task_id: String, // 前序任务
    pub after_task_id: String,  // 后序任务
    #[serde(default)]
    pub min_lag_minutes: i64,   // 最小间隔 (分钟)
}

impl Precedence {
    pub fn new(before_task_id: &str, after_task_id: &str) -> Self {
        Self {
            before_task_id: before_task_id.to_string(),
            after_task_id: after_task_id.to_string(),
            min_lag_minutes: 0,
        }
    }

    pub fn with_lag(mut self, min_lag_minutes: i64) -> Self {
        self.min_lag_minutes = min_lag_minutes;
        self
    }
}

// ==========================================
// SetupTimeEntry - 换型时间
// ==========================================
// 键: (from_task, to_task, machine), 非对称
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupTimeEntry {
    pub from_task_id: String,
    pub to_task_id: String,
    pub machine_id: String,
    pub setup_time_minutes: i64,
}

impl SetupTimeEntry {
    pub fn new(from_task_id: &str, to_task_id: &str, machine_id: &str, setup_time_minutes: i64) -> Self {
        Self {
            from_task_id: from_task_id.to_string(),
            to_task_id: to_task_id.to_string(),
            machine_id: machine_id.to_string(),
            setup_time_minutes,
        }
    }
}

// ==========================================
// Pattern - 作业模式
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub pattern_id: String,                  // 模式ID
    pub name: String,                        // 模式名称
    pub version: i32,                        // 模式版本
    pub tasks: Vec<PatternTask>,             // 有序任务列表
    pub precedences: Vec<Precedence>,        // 前序边
    pub setup_times: Vec<SetupTimeEntry>,    // 换型时间
    #[serde(default)]
    pub solver_parameters: JsonValue,        // 求解参数 (JSON, 由配置层类型化)
    pub baseline_performance_seconds: Option<f64>, // 性能基线
}

impl Pattern {
    pub fn new(pattern_id: &str, name: &str) -> Self {
        Self {
            pattern_id: pattern_id.to_string(),
            name: name.to_string(),
            version: 1,
            tasks: Vec::new(),
            precedences: Vec::new(),
            setup_times: Vec::new(),
            solver_parameters: JsonValue::Null,
            baseline_performance_seconds: None,
        }
    }

    pub fn with_task(mut self, task: PatternTask) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_precedence(mut self, precedence: Precedence) -> Self {
        self.precedences.push(precedence);
        self
    }

    pub fn with_setup(mut self, entry: SetupTimeEntry) -> Self {
        self.setup_times.push(entry);
        self
    }

    pub fn with_solver_parameters(mut self, parameters: JsonValue) -> Self {
        self.solver_parameters = parameters;
        self
    }

    /// 按ID查找任务
    pub fn task(&self, task_id: &str) -> Option<&PatternTask> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_cost_rounding() {
        let m1 = Machine::new("M1", "CNC-1", 12_000);
        assert_eq!(m1.cost_for_minutes(1), 200);
        assert_eq!(m1.cost_for_minutes(90), 18_000);

        // 100 分/小时 × 1 分钟 = 1.67 分 → 2 分
        let cheap = Machine::new("M9", "Bench", 100);
        assert_eq!(cheap.cost_for_minutes(1), 2);
    }

    #[test]
    fn test_pattern_builder() {
        let pattern = Pattern::new("P1", "Board")
            .with_task(PatternTask::new("T1", 1).with_mode(TaskMode::new("T1-M1", "M1", 5)))
            .with_task(PatternTask::new("T2", 2).with_mode(TaskMode::new("T2-M2", "M2", 3)))
            .with_precedence(Precedence::new("T1", "T2"));

        assert_eq!(pattern.tasks.len(), 2);
        assert_eq!(pattern.task("T2").map(|t| t.position), Some(2));
        assert!(pattern.task("T3").is_none());
    }
}
