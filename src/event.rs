use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};

use crate::{
    diff::Patch,
    estimate::{Decision, EstimateStatus},
    properties::DocId,
    work_order::WorkOrderStatus,
};

/// A change to the document store. Stores accept batches of these through
/// [crate::store::DocumentStore::apply], and services broadcast them after a successful write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreEvent {
    /// Collection, id, full document body
    Upserted(String, DocId, Value),
    /// Collection, id, field-level changes
    Patched(String, DocId, Patch),
    Removed(String, Vec<DocId>),
}

impl StoreEvent {
    pub fn collection(&self) -> &str {
        match self {
            StoreEvent::Upserted(c, _, _) => c,
            StoreEvent::Patched(c, _, _) => c,
            StoreEvent::Removed(c, _) => c,
        }
    }
}

impl Display for StoreEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            StoreEvent::Upserted(c, id, _) => write!(f, "Upserted({c}/{id})"),
            StoreEvent::Patched(c, id, p) => write!(f, "Patched({c}/{id}, {} ops)", p.len()),
            StoreEvent::Removed(c, ids) => write!(f, "Removed({c}, {} ids)", ids.len()),
        }
    }
}

/// Business-level notifications about estimates, work orders and the product cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkflowEvent {
    /// Estimate id, estimate number
    EstimateSent(DocId, String),
    EstimateDecided(DocId, Decision),
    EstimateStatusChanged(DocId, EstimateStatus),
    /// Work order id, source estimate id
    WorkOrderCreated(DocId, DocId),
    WorkOrderStatusChanged(DocId, WorkOrderStatus),
    /// Number of items now in the cache
    CacheRefreshed(usize),
}

impl Display for WorkflowEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            WorkflowEvent::EstimateSent(id, number) => write!(f, "EstimateSent({number}, {id})"),
            WorkflowEvent::EstimateDecided(id, d) => write!(f, "EstimateDecided({id}, {d:?})"),
            WorkflowEvent::EstimateStatusChanged(id, s) => {
                write!(f, "EstimateStatusChanged({id}, {s:?})")
            }
            WorkflowEvent::WorkOrderCreated(id, est) => {
                write!(f, "WorkOrderCreated({id} from {est})")
            }
            WorkflowEvent::WorkOrderStatusChanged(id, s) => {
                write!(f, "WorkOrderStatusChanged({id}, {s:?})")
            }
            WorkflowEvent::CacheRefreshed(n) => write!(f, "CacheRefreshed({n} items)"),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    #[default]
    Ping,
    Store(StoreEvent),
    Workflow(WorkflowEvent),
}

impl From<StoreEvent> for Event {
    fn from(e: StoreEvent) -> Self {
        Event::Store(e)
    }
}

impl From<WorkflowEvent> for Event {
    fn from(e: WorkflowEvent) -> Self {
        Event::Workflow(e)
    }
}
