//! Job execution tracking for accepted estimates.
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::{
    error::JobsiteError,
    estimate::{ClientInfo, Estimate, EstimateStatus, ProjectInfo},
    properties::{ContentType, DocId},
    store::Document,
};

const HOUR_UNITS: [&str; 5] = ["hr", "hrs", "hour", "hours", "h"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkOrderStatus {
    Scheduled,
    InProgress,
    OnHold,
    Completed,
    Cancelled,
}

impl WorkOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkOrderStatus::Scheduled => "scheduled",
            WorkOrderStatus::InProgress => "inProgress",
            WorkOrderStatus::OnHold => "onHold",
            WorkOrderStatus::Completed => "completed",
            WorkOrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkOrderStatus::Completed | WorkOrderStatus::Cancelled)
    }

    /// Whether the lifecycle permits moving from `self` to `next`, ignoring task completion.
    pub fn can_become(&self, next: WorkOrderStatus) -> bool {
        use WorkOrderStatus::*;
        matches!(
            (self, next),
            (Scheduled, InProgress)
                | (InProgress, OnHold)
                | (OnHold, InProgress)
                | (InProgress, Completed)
                | (Scheduled | InProgress | OnHold, Cancelled)
        )
    }
}

impl Display for WorkOrderStatus {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

/// Procurement state of a material line. Only moves forward.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum MaterialReadiness {
    #[default]
    Needed,
    Ordered,
    Received,
    Staged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaborTask {
    pub id: DocId,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub planned_hours: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialLine {
    pub id: DocId,
    pub content_type: ContentType,
    pub description: String,
    pub quantity: f64,
    pub unit: String,
    #[serde(default)]
    pub readiness: MaterialReadiness,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub id: DocId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl Milestone {
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrder {
    pub id: DocId,
    pub number: String,
    pub estimate_id: DocId,
    pub client: ClientInfo,
    pub project: ProjectInfo,
    pub status: WorkOrderStatus,
    #[serde(default)]
    pub labor_tasks: Vec<LaborTask>,
    #[serde(default)]
    pub materials: Vec<MaterialLine>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Document for WorkOrder {
    const COLLECTION: &'static str = "work_orders";

    fn doc_id(&self) -> &DocId {
        &self.id
    }
}

fn is_hour_unit(unit: &str) -> bool {
    let unit = unit.trim().to_lowercase();
    HOUR_UNITS.contains(&unit.as_str())
}

impl WorkOrder {
    pub fn from_estimate(
        estimate: &Estimate,
        number: &str,
        now: i64,
    ) -> Result<WorkOrder, JobsiteError> {
        if estimate.status != EstimateStatus::Accepted {
            return Err(JobsiteError::InvalidState(format!(
                "estimate {} is {}; only accepted estimates become work orders",
                estimate.number, estimate.status
            )));
        }
        let mut labor_tasks = Vec::new();
        let mut materials = Vec::new();
        for line in estimate.line_items.iter() {
            if line.content_type == ContentType::Labor {
                labor_tasks.push(LaborTask {
                    id: DocId::new(),
                    description: line.description.clone(),
                    section: line.section.clone(),
                    planned_hours: if is_hour_unit(&line.unit) {
                        line.quantity
                    } else {
                        0.0
                    },
                    assignee: None,
                    status: TaskStatus::Todo,
                });
            } else {
                materials.push(MaterialLine {
                    id: DocId::new(),
                    content_type: line.content_type,
                    description: line.description.clone(),
                    quantity: line.quantity,
                    unit: line.unit.clone(),
                    readiness: MaterialReadiness::Needed,
                });
            }
        }
        Ok(WorkOrder {
            id: DocId::new(),
            number: number.to_string(),
            estimate_id: estimate.id.clone(),
            client: estimate.client.clone(),
            project: estimate.project.clone(),
            status: WorkOrderStatus::Scheduled,
            labor_tasks,
            materials,
            milestones: Vec::new(),
            notes: estimate.notes.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    fn require_open(&self) -> Result<(), JobsiteError> {
        if self.status.is_terminal() {
            return Err(JobsiteError::InvalidState(format!(
                "work order {} is {}",
                self.number, self.status
            )));
        }
        Ok(())
    }

    fn task_mut(&mut self, task_id: &DocId) -> Result<&mut LaborTask, JobsiteError> {
        self.labor_tasks
            .iter_mut()
            .find(|t| t.id == *task_id)
            .ok_or_else(|| JobsiteError::NotFound(format!("labor task {task_id}")))
    }

    pub fn transition(&mut self, next: WorkOrderStatus, now: i64) -> Result<(), JobsiteError> {
        if !self.status.can_become(next) {
            return Err(JobsiteError::InvalidState(format!(
                "work order {} cannot go from {} to {next}",
                self.number, self.status
            )));
        }
        if next == WorkOrderStatus::Completed {
            let open_tasks = self
                .labor_tasks
                .iter()
                .filter(|t| t.status != TaskStatus::Done)
                .count();
            let open_milestones = self.milestones.iter().filter(|m| !m.is_complete()).count();
            if open_tasks > 0 || open_milestones > 0 {
                return Err(JobsiteError::InvalidState(format!(
                    "work order {} has {open_tasks} open tasks and {open_milestones} open milestones",
                    self.number
                )));
            }
        }
        tracing::debug!("Work order {}: {} -> {next}", self.number, self.status);
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn set_task_status(
        &mut self,
        task_id: &DocId,
        status: TaskStatus,
        now: i64,
    ) -> Result<(), JobsiteError> {
        self.require_open()?;
        self.task_mut(task_id)?.status = status;
        self.updated_at = now;
        Ok(())
    }

    pub fn assign_task(
        &mut self,
        task_id: &DocId,
        assignee: Option<String>,
        now: i64,
    ) -> Result<(), JobsiteError> {
        self.require_open()?;
        let assignee = assignee
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());
        self.task_mut(task_id)?.assignee = assignee;
        self.updated_at = now;
        Ok(())
    }

    pub fn set_material_readiness(
        &mut self,
        material_id: &DocId,
        readiness: MaterialReadiness,
        now: i64,
    ) -> Result<(), JobsiteError> {
        self.require_open()?;
        let line = self
            .materials
            .iter_mut()
            .find(|m| m.id == *material_id)
            .ok_or_else(|| JobsiteError::NotFound(format!("material line {material_id}")))?;
        if readiness < line.readiness {
            return Err(JobsiteError::InvalidState(format!(
                "material '{}' is already {:?}",
                line.description, line.readiness
            )));
        }
        line.readiness = readiness;
        self.updated_at = now;
        Ok(())
    }

    pub fn materials_ready(&self) -> bool {
        self.materials
            .iter()
            .all(|m| m.readiness >= MaterialReadiness::Received)
    }

    pub fn add_milestone(
        &mut self,
        title: &str,
        due: Option<i64>,
        now: i64,
    ) -> Result<DocId, JobsiteError> {
        self.require_open()?;
        let title = title.trim();
        if title.is_empty() {
            return Err(JobsiteError::Validation(
                "milestone needs a title".to_string(),
            ));
        }
        let id = DocId::new();
        self.milestones.push(Milestone {
            id: id.clone(),
            title: title.to_string(),
            due,
            completed_at: None,
        });
        self.updated_at = now;
        Ok(id)
    }

    pub fn complete_milestone(&mut self, milestone_id: &DocId, now: i64) -> Result<(), JobsiteError> {
        self.require_open()?;
        let milestone = self
            .milestones
            .iter_mut()
            .find(|m| m.id == *milestone_id)
            .ok_or_else(|| JobsiteError::NotFound(format!("milestone {milestone_id}")))?;
        if milestone.completed_at.is_none() {
            milestone.completed_at = Some(now);
            self.updated_at = now;
        }
        Ok(())
    }

    /// Fraction of labor tasks done. A work order without tasks counts as complete.
    pub fn progress(&self) -> f64 {
        if self.labor_tasks.is_empty() {
            return 1.0;
        }
        let done = self
            .labor_tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .count();
        done as f64 / self.labor_tasks.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        estimate::LineItem,
        properties::{Cents, MILLIS_PER_DAY},
    };
    use test_log::test;

    fn accepted() -> Estimate {
        let client = ClientInfo {
            name: "Dana".into(),
            ..Default::default()
        };
        let mut e = Estimate::new("EST-2026-0001", client, ProjectInfo::default()).unwrap();
        e.add_line_item(LineItem::new(ContentType::Labor, "Frame walls", 12.0, "hr", Cents(6000)))
            .unwrap();
        e.add_line_item(LineItem::new(ContentType::Labor, "Permit visit", 1.0, "visit", Cents(15000)))
            .unwrap();
        e.add_line_item(LineItem::new(ContentType::Products, "2x4 stud", 40.0, "ea", Cents(450)))
            .unwrap();
        e.add_line_item(LineItem::new(ContentType::Equipment, "Lift", 2.0, "day", Cents(20000)))
            .unwrap();
        let token = e.send(0, 30 * MILLIS_PER_DAY).unwrap();
        e.accept(&token, "Dana", None, 1).unwrap();
        e
    }

    #[test]
    fn test_from_estimate_requires_acceptance() {
        let mut e = accepted();
        e.status = EstimateStatus::Viewed;
        assert!(matches!(
            WorkOrder::from_estimate(&e, "WO-1", 0),
            Err(JobsiteError::InvalidState(_))
        ));
    }

    #[test]
    fn test_from_estimate_splits_labor_and_materials() {
        let wo = WorkOrder::from_estimate(&accepted(), "WO-1", 10).unwrap();
        assert_eq!(wo.status, WorkOrderStatus::Scheduled);
        assert_eq!(wo.labor_tasks.len(), 2);
        assert_eq!(wo.labor_tasks[0].planned_hours, 12.0);
        assert_eq!(wo.labor_tasks[1].planned_hours, 0.0);
        assert_eq!(wo.materials.len(), 2);
        assert_eq!(wo.materials[1].content_type, ContentType::Equipment);
        assert!(!wo.materials_ready());
        assert_eq!(wo.progress(), 0.0);
    }

    #[test]
    fn test_completion_requires_done_tasks_and_milestones() {
        let mut wo = WorkOrder::from_estimate(&accepted(), "WO-1", 10).unwrap();
        assert!(wo.transition(WorkOrderStatus::Completed, 11).is_err());
        wo.transition(WorkOrderStatus::InProgress, 11).unwrap();
        wo.transition(WorkOrderStatus::OnHold, 12).unwrap();
        wo.transition(WorkOrderStatus::InProgress, 13).unwrap();

        let milestone = wo.add_milestone("Rough-in inspection", None, 14).unwrap();
        let ids: Vec<DocId> = wo.labor_tasks.iter().map(|t| t.id.clone()).collect();
        for id in ids.iter() {
            wo.set_task_status(id, TaskStatus::Done, 15).unwrap();
        }
        assert_eq!(wo.progress(), 1.0);
        assert!(wo.transition(WorkOrderStatus::Completed, 16).is_err());
        wo.complete_milestone(&milestone, 16).unwrap();
        wo.transition(WorkOrderStatus::Completed, 17).unwrap();

        assert!(wo.transition(WorkOrderStatus::Cancelled, 18).is_err());
        assert!(wo.set_task_status(&ids[0], TaskStatus::Todo, 18).is_err());
    }

    #[test]
    fn test_material_readiness_moves_forward_only() {
        let mut wo = WorkOrder::from_estimate(&accepted(), "WO-1", 10).unwrap();
        let ids: Vec<DocId> = wo.materials.iter().map(|m| m.id.clone()).collect();
        wo.set_material_readiness(&ids[0], MaterialReadiness::Ordered, 11)
            .unwrap();
        assert!(wo
            .set_material_readiness(&ids[0], MaterialReadiness::Needed, 12)
            .is_err());
        wo.set_material_readiness(&ids[0], MaterialReadiness::Staged, 12)
            .unwrap();
        assert!(!wo.materials_ready());
        wo.set_material_readiness(&ids[1], MaterialReadiness::Received, 13)
            .unwrap();
        assert!(wo.materials_ready());
        assert!(wo
            .set_material_readiness(&DocId::new(), MaterialReadiness::Received, 13)
            .is_err());
    }

    #[test]
    fn test_assign_task_trims_and_clears() {
        let mut wo = WorkOrder::from_estimate(&accepted(), "WO-1", 10).unwrap();
        let id = wo.labor_tasks[0].id.clone();
        wo.assign_task(&id, Some("  Sam ".into()), 11).unwrap();
        assert_eq!(wo.labor_tasks[0].assignee.as_deref(), Some("Sam"));
        wo.assign_task(&id, Some(" ".into()), 12).unwrap();
        assert!(wo.labor_tasks[0].assignee.is_none());
    }

    #[test]
    fn test_cancel_from_any_open_status() {
        let mut wo = WorkOrder::from_estimate(&accepted(), "WO-1", 10).unwrap();
        wo.transition(WorkOrderStatus::Cancelled, 11).unwrap();
        assert!(wo.transition(WorkOrderStatus::InProgress, 12).is_err());
    }
}
