// ==========================================
// 模式化排产系统 - 序列资源预留管理
// ==========================================
// 职责: 为一次求解的全部实例生成序列资源互斥/并发约束
// 规则:
// - EXCLUSIVE: 任意时刻至多 1 个预留 (no-overlap)
// - SHARED/POOLED: 同时预留数 ≤ max_concurrent_jobs
// - 占用区间 = [start - setup, end + teardown]
// 红线: 任务绑定的资源在其可用窗口内放不下任何模式 → 求解前报错
// 红线: 只作用于当前 CompiledProblem，不读写其他求解的预留
// ==========================================

use crate::domain::resource::SequenceResource;
use crate::domain::types::ResourceType;
use crate::engine::error::ReservationError;
use crate::engine::expander::CompiledProblem;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, instrument};

// ==========================================
// ReservationGroup - 单个资源的预留约束
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationGroup {
    pub sequence_id: String,
    pub resource_type: ResourceType,
    pub limit: usize,                  // 同时预留上限
    pub setup_minutes: i64,
    pub teardown_minutes: i64,
    pub window_start_minute: i64,
    pub window_end_minute: Option<i64>,
    pub members: Vec<usize>,           // 绑定该资源的 slot
}

impl ReservationGroup {
    /// slot 以 start/end 执行时的占用区间
    pub fn occupied(&self, start: i64, end: i64) -> (i64, i64) {
        (start - self.setup_minutes, end + self.teardown_minutes)
    }

    /// 占用区间是否落在可用窗口内
    pub fn within_window(&self, start: i64, end: i64) -> bool {
        let (from, to) = self.occupied(start, end);
        from >= self.window_start_minute && self.window_end_minute.map_or(true, |w| to <= w)
    }

    /// 满足窗口下沿的最早开始时间 (不早于原点)
    pub fn earliest_start(&self) -> i64 {
        (self.window_start_minute + self.setup_minutes).max(0)
    }
}

// ==========================================
// ReservationConstraintSet - 本次求解的全部预留约束
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ReservationConstraintSet {
    pub groups: Vec<ReservationGroup>,
    pub slot_group: Vec<Option<usize>>, // slot → group 索引
}

impl ReservationConstraintSet {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group_of(&self, slot: usize) -> Option<&ReservationGroup> {
        self.slot_group
            .get(slot)
            .copied()
            .flatten()
            .map(|g| &self.groups[g])
    }

    /// 所有资源窗口中最晚的起点 (用于 horizon 放宽)
    pub fn max_window_offset(&self) -> i64 {
        self.groups
            .iter()
            .map(|g| g.window_start_minute.max(0) + g.setup_minutes + g.teardown_minutes)
            .max()
            .unwrap_or(0)
    }
}

// ==========================================
// SequenceReservationManager
// ==========================================
pub struct SequenceReservationManager {
    // 无状态
}

impl SequenceReservationManager {
    pub fn new() -> Self {
        Self {}
    }

    /// 生成预留约束
    ///
    /// # 参数
    /// - problem: 已展开的问题
    /// - resources: 序列资源 (通常为全部启用资源)
    ///
    /// # 返回
    /// - Ok(ReservationConstraintSet)
    /// - Err(ReservationError): 资源非法 / 资源缺失 / 窗口放不下
    #[instrument(skip_all, fields(pattern_id = %problem.pattern_id(), resource_count = resources.len()))]
    pub fn build(
        &self,
        problem: &CompiledProblem,
        resources: &[SequenceResource],
    ) -> Result<ReservationConstraintSet, ReservationError> {
        // ==========================================
        // 1. 资源自检
        // ==========================================
        let mut by_id: HashMap<&str, &SequenceResource> = HashMap::new();
        for resource in resources {
            resource
                .validate()
                .map_err(|reason| ReservationError::InvalidResource {
                    sequence_id: resource.sequence_id.clone(),
                    reason,
                })?;
            if by_id.insert(resource.sequence_id.as_str(), resource).is_some() {
                return Err(ReservationError::InvalidResource {
                    sequence_id: resource.sequence_id.clone(),
                    reason: "资源ID重复".to_string(),
                });
            }
        }

        // ==========================================
        // 2. 任务绑定解析 + 窗口可满足性
        // ==========================================
        let pattern = &problem.pattern;
        let mut used_ids: BTreeSet<String> = BTreeSet::new();
        let mut task_group: Vec<Option<&SequenceResource>> = vec![None; pattern.task_count()];

        for (task_idx, task) in pattern.tasks.iter().enumerate() {
            let Some(sequence_id) = task.sequence_id.as_deref() else {
                continue;
            };

            let resource = by_id
                .get(sequence_id)
                .copied()
                .filter(|r| r.is_active)
                .ok_or_else(|| ReservationError::UnknownSequenceResource {
                    pattern_id: pattern.pattern_id.clone(),
                    task_id: task.task_id.clone(),
                    sequence_id: sequence_id.to_string(),
                })?;

            if let Some(window_end) = resource.window_end_minute {
                let fits = task
                    .modes
                    .iter()
                    .any(|m| resource.fits_duration(m.duration_minutes));
                if !fits {
                    let shortest = resource.occupied_length(task.min_duration());
                    return Err(ReservationError::ResourceUnsatisfiable {
                        pattern_id: pattern.pattern_id.clone(),
                        task_id: task.task_id.clone(),
                        sequence_id: sequence_id.to_string(),
                        reason: format!(
                            "最短占用 {} 分钟 (含准备 {} / 拆卸 {}) 放不进可用窗口 [{}, {}) (最早开始 {})",
                            shortest,
                            resource.setup_minutes,
                            resource.teardown_minutes,
                            resource.window_start_minute,
                            window_end,
                            resource.earliest_start_minute()
                        ),
                    });
                }
            }

            task_group[task_idx] = Some(resource);
            used_ids.insert(sequence_id.to_string());
        }

        // ==========================================
        // 3. 生成分组 (按 sequence_id 排序，保证确定性)
        // ==========================================
        let ordered_ids: Vec<String> = used_ids.into_iter().collect();
        let mut groups: Vec<ReservationGroup> = ordered_ids
            .iter()
            .filter_map(|id| by_id.get(id.as_str()))
            .map(|r| ReservationGroup {
                sequence_id: r.sequence_id.clone(),
                resource_type: r.resource_type,
                limit: r.concurrency_limit().max(1) as usize,
                setup_minutes: r.setup_minutes,
                teardown_minutes: r.teardown_minutes,
                window_start_minute: r.window_start_minute,
                window_end_minute: r.window_end_minute,
                members: Vec::new(),
            })
            .collect();

        let mut slot_group = vec![None; problem.slots.len()];
        for slot in &problem.slots {
            if let Some(resource) = task_group[slot.task_idx] {
                if let Some(g) = ordered_ids.iter().position(|id| *id == resource.sequence_id) {
                    groups[g].members.push(slot.slot_id);
                    slot_group[slot.slot_id] = Some(g);
                }
            }
        }

        debug!(
            group_count = groups.len(),
            member_count = slot_group.iter().filter(|g| g.is_some()).count(),
            "序列资源约束生成完成"
        );

        Ok(ReservationConstraintSet { groups, slot_group })
    }
}

impl Default for SequenceReservationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instance::JobInstance;
    use crate::domain::pattern::{Machine, Pattern, PatternTask, Precedence, TaskMode};
    use crate::engine::compiler::PatternCompiler;
    use crate::engine::expander::InstanceExpander;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::sync::Arc;

    fn origin() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    fn problem(instance_count: usize) -> CompiledProblem {
        let pattern = Pattern::new("P1", "Optic")
            .with_task(PatternTask::new("assemble", 1).with_mode(TaskMode::new("a", "M1", 5)))
            .with_task(
                PatternTask::new("opto", 2)
                    .with_sequence("Opto")
                    .with_mode(TaskMode::new("o-fast", "M2", 10))
                    .with_mode(TaskMode::new("o-slow", "M2", 20)),
            )
            .with_precedence(Precedence::new("assemble", "opto"));
        let machines = vec![
            Machine::new("M1", "Bench", 6_000),
            Machine::new("M2", "Opto rig", 9_000),
        ];
        let compiled = Arc::new(PatternCompiler::new().compile(&pattern, &machines).unwrap());
        let instances: Vec<_> = (0..instance_count)
            .map(|i| JobInstance::new(&format!("J{}", i), "P1", origin()))
            .collect();
        InstanceExpander::new()
            .expand(compiled, &instances, origin())
            .unwrap()
    }

    #[test]
    fn test_exclusive_group_members() {
        let opto = SequenceResource::exclusive("Opto").with_offsets(2, 1);
        let set = SequenceReservationManager::new()
            .build(&problem(3), &[opto])
            .unwrap();

        assert_eq!(set.groups.len(), 1);
        let group = &set.groups[0];
        assert_eq!(group.limit, 1);
        assert_eq!(group.members, vec![1, 3, 5]);
        assert_eq!(set.group_of(3).map(|g| g.sequence_id.as_str()), Some("Opto"));
        assert!(set.group_of(0).is_none());
        assert_eq!(group.occupied(10, 20), (8, 21));
    }

    #[test]
    fn test_exclusive_with_concurrency_rejected() {
        let mut opto = SequenceResource::exclusive("Opto");
        opto.capacity = 2;
        opto.max_concurrent_jobs = 2;
        assert!(matches!(
            SequenceReservationManager::new().build(&problem(1), &[opto]),
            Err(ReservationError::InvalidResource { .. })
        ));
    }

    #[test]
    fn test_missing_or_inactive_resource() {
        assert!(matches!(
            SequenceReservationManager::new().build(&problem(1), &[]),
            Err(ReservationError::UnknownSequenceResource { sequence_id, .. }) if sequence_id == "Opto"
        ));

        let mut opto = SequenceResource::exclusive("Opto");
        opto.is_active = false;
        assert!(matches!(
            SequenceReservationManager::new().build(&problem(1), &[opto]),
            Err(ReservationError::UnknownSequenceResource { .. })
        ));
    }

    #[test]
    fn test_window_too_short_is_unsatisfiable() {
        // 最短模式 10 + 准备 2 + 拆卸 1 = 13 > 12
        let opto = SequenceResource::exclusive("Opto")
            .with_offsets(2, 1)
            .with_window(0, Some(12));
        assert!(matches!(
            SequenceReservationManager::new().build(&problem(1), &[opto]),
            Err(ReservationError::ResourceUnsatisfiable { task_id, .. }) if task_id == "opto"
        ));

        // 13 分钟窗口恰好放下快速模式
        let opto = SequenceResource::exclusive("Opto")
            .with_offsets(2, 1)
            .with_window(0, Some(13));
        assert!(SequenceReservationManager::new().build(&problem(1), &[opto]).is_ok());
    }

    #[test]
    fn test_window_starting_before_origin_is_clipped() {
        // 原始长度 23 ≥ 13, 但加工最早从 0 开始: 0 + 10 + 1 > 10
        let opto = SequenceResource::exclusive("Opto")
            .with_offsets(2, 1)
            .with_window(-13, Some(10));
        assert!(matches!(
            SequenceReservationManager::new().build(&problem(1), &[opto]),
            Err(ReservationError::ResourceUnsatisfiable { task_id, .. }) if task_id == "opto"
        ));

        // 准备时间落在原点之前: 0 开始, 10 + 1 = 11 ≤ 11
        let opto = SequenceResource::exclusive("Opto")
            .with_offsets(2, 1)
            .with_window(-13, Some(11));
        let set = SequenceReservationManager::new()
            .build(&problem(1), &[opto])
            .unwrap();
        assert_eq!(set.groups[0].earliest_start(), 0);
    }

    #[test]
    fn test_shared_limit_and_unused_resources() {
        let oven = SequenceResource::shared("Oven", 4, 2);
        let opto = SequenceResource::shared("Opto", 3, 3);
        let set = SequenceReservationManager::new()
            .build(&problem(2), &[oven, opto])
            .unwrap();
        // 未被绑定的 Oven 不生成分组
        assert_eq!(set.groups.len(), 1);
        assert_eq!(set.groups[0].limit, 3);
    }
}
