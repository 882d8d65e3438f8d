use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::{
    collection::{CategoryTab, Collection},
    estimate::{ClientInfo, ClientView, ClientViewSettings, Discount, Estimate, LineItem, ProjectInfo},
    hierarchy::CategoryPath,
    inventory::{InventoryItem, OutlineNode},
    mail::OutgoingEmail,
    properties::{ContentType, DocId},
    work_order::{MaterialReadiness, TaskStatus, WorkOrder, WorkOrderStatus},
};

/// Command interface between clients (HTTP, CLI) and the [crate::service::JobsiteService].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    CreateCollection {
        name: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        job_type: Option<String>,
    },
    GetCollection(DocId),
    ListCollections,
    RenameCollection(DocId, String),
    SelectCategory(DocId, ContentType, CategoryPath),
    DeselectCategory(DocId, ContentType, CategoryPath),
    /// Collection, content type, inventory item, quantity
    SelectItem(DocId, ContentType, DocId, f64),
    DeselectItem(DocId, ContentType, DocId),
    RebuildTabs(DocId, ContentType),
    DeleteCollection(DocId),

    /// Price the collection's selected items into a new draft estimate
    CreateEstimate {
        collection_id: DocId,
        client: ClientInfo,
        #[serde(default)]
        project: ProjectInfo,
    },
    GetEstimate(DocId),
    ListEstimates,
    AddLineItem(DocId, LineItem),
    /// Estimate, line item
    RemoveLineItem(DocId, DocId),
    SetTaxRate(DocId, i64),
    SetDiscount(DocId, Discount),
    SetClientView(DocId, ClientViewSettings),
    SendEstimate(DocId),
    ReviseEstimate(DocId, String),
    /// Client-side operations, authorized by the share token
    ViewEstimate {
        estimate_id: DocId,
        token: String,
    },
    AcceptEstimate {
        estimate_id: DocId,
        token: String,
        signer: String,
        #[serde(default)]
        comment: Option<String>,
    },
    RejectEstimate {
        estimate_id: DocId,
        token: String,
        #[serde(default)]
        reason: Option<String>,
    },

    /// From an accepted estimate
    CreateWorkOrder(DocId),
    GetWorkOrder(DocId),
    ListWorkOrders,
    /// Work order, task
    SetTaskStatus(DocId, DocId, TaskStatus),
    AssignTask(DocId, DocId, Option<String>),
    /// Work order, material line
    SetMaterialReadiness(DocId, DocId, MaterialReadiness),
    AddMilestone(DocId, String, Option<i64>),
    CompleteMilestone(DocId, DocId),
    TransitionWorkOrder(DocId, WorkOrderStatus),

    UpsertItem(InventoryItem),
    ListItems(Option<ContentType>),
    CatalogOutline(ContentType),
    RefreshCache,
    ListOutbox,
}

impl Display for Op {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Op::CreateCollection { name, .. } => write!(f, "CreateCollection({name})"),
            Op::GetCollection(id) => write!(f, "GetCollection({id})"),
            Op::ListCollections => write!(f, "ListCollections"),
            Op::RenameCollection(id, name) => write!(f, "RenameCollection({id}, {name})"),
            Op::SelectCategory(id, ct, path) => write!(f, "SelectCategory({id}, {ct}, {path})"),
            Op::DeselectCategory(id, ct, path) => {
                write!(f, "DeselectCategory({id}, {ct}, {path})")
            }
            Op::SelectItem(id, ct, item, qty) => write!(f, "SelectItem({id}, {ct}, {item} x{qty})"),
            Op::DeselectItem(id, ct, item) => write!(f, "DeselectItem({id}, {ct}, {item})"),
            Op::RebuildTabs(id, ct) => write!(f, "RebuildTabs({id}, {ct})"),
            Op::DeleteCollection(id) => write!(f, "DeleteCollection({id})"),
            Op::CreateEstimate {
                collection_id,
                client,
                ..
            } => write!(f, "CreateEstimate({collection_id}, {})", client.name),
            Op::GetEstimate(id) => write!(f, "GetEstimate({id})"),
            Op::ListEstimates => write!(f, "ListEstimates"),
            Op::AddLineItem(id, line) => write!(f, "AddLineItem({id}, {})", line.description),
            Op::RemoveLineItem(id, line) => write!(f, "RemoveLineItem({id}, {line})"),
            Op::SetTaxRate(id, bps) => write!(f, "SetTaxRate({id}, {bps} bps)"),
            Op::SetDiscount(id, d) => write!(f, "SetDiscount({id}, {d:?})"),
            Op::SetClientView(id, _) => write!(f, "SetClientView({id})"),
            Op::SendEstimate(id) => write!(f, "SendEstimate({id})"),
            Op::ReviseEstimate(id, _) => write!(f, "ReviseEstimate({id})"),
            // Tokens never reach the logs.
            Op::ViewEstimate { estimate_id, .. } => write!(f, "ViewEstimate({estimate_id})"),
            Op::AcceptEstimate { estimate_id, .. } => write!(f, "AcceptEstimate({estimate_id})"),
            Op::RejectEstimate { estimate_id, .. } => write!(f, "RejectEstimate({estimate_id})"),
            Op::CreateWorkOrder(id) => write!(f, "CreateWorkOrder({id})"),
            Op::GetWorkOrder(id) => write!(f, "GetWorkOrder({id})"),
            Op::ListWorkOrders => write!(f, "ListWorkOrders"),
            Op::SetTaskStatus(id, task, status) => {
                write!(f, "SetTaskStatus({id}, {task}, {status:?})")
            }
            Op::AssignTask(id, task, who) => write!(f, "AssignTask({id}, {task}, {who:?})"),
            Op::SetMaterialReadiness(id, line, r) => {
                write!(f, "SetMaterialReadiness({id}, {line}, {r:?})")
            }
            Op::AddMilestone(id, title, _) => write!(f, "AddMilestone({id}, {title})"),
            Op::CompleteMilestone(id, m) => write!(f, "CompleteMilestone({id}, {m})"),
            Op::TransitionWorkOrder(id, status) => write!(f, "TransitionWorkOrder({id}, {status})"),
            Op::UpsertItem(item) => write!(f, "UpsertItem({}, {})", item.id, item.name),
            Op::ListItems(ct) => write!(f, "ListItems({ct:?})"),
            Op::CatalogOutline(ct) => write!(f, "CatalogOutline({ct})"),
            Op::RefreshCache => write!(f, "RefreshCache"),
            Op::ListOutbox => write!(f, "ListOutbox"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpPayload {
    pub op: Op,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpResult {
    Ok,
    Removed(bool),
    Collection(Collection),
    Collections(Vec<Collection>),
    Tabs(Vec<CategoryTab>),
    Estimate(Estimate),
    Estimates(Vec<Estimate>),
    /// The estimate and the client link carrying its share token
    Sent(Estimate, String),
    ClientView(ClientView),
    WorkOrder(WorkOrder),
    WorkOrders(Vec<WorkOrder>),
    Items(Vec<InventoryItem>),
    Outline(Vec<OutlineNode>),
    CacheRefreshed(usize),
    Outbox(Vec<OutgoingEmail>),
}

impl Display for OpResult {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            OpResult::Ok => write!(f, "Ok"),
            OpResult::Removed(removed) => write!(f, "Removed({removed})"),
            OpResult::Collection(c) => write!(f, "Collection({}, {})", c.id, c.name),
            OpResult::Collections(v) => write!(f, "Collections({})", v.len()),
            OpResult::Tabs(v) => write!(
                f,
                "Tabs({})",
                v.iter()
                    .map(|t| t.label.clone())
                    .collect::<Vec<String>>()
                    .join(", ")
            ),
            OpResult::Estimate(e) => write!(f, "Estimate({}, {})", e.number, e.status),
            OpResult::Estimates(v) => write!(f, "Estimates({})", v.len()),
            OpResult::Sent(e, _) => write!(f, "Sent({})", e.number),
            OpResult::ClientView(v) => write!(f, "ClientView({}, {})", v.number, v.status),
            OpResult::WorkOrder(w) => write!(f, "WorkOrder({}, {})", w.number, w.status),
            OpResult::WorkOrders(v) => write!(f, "WorkOrders({})", v.len()),
            OpResult::Items(v) => write!(f, "Items({})", v.len()),
            OpResult::Outline(v) => write!(f, "Outline({} trades)", v.len()),
            OpResult::CacheRefreshed(n) => write!(f, "CacheRefreshed({n})"),
            OpResult::Outbox(v) => write!(f, "Outbox({})", v.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_log::test;

    #[test]
    fn test_payload_wire_shape() {
        let payload: OpPayload = serde_json::from_value(json!({
            "op": {"SelectCategory": ["c1", "products", ["Electrical", "Rough-In"]]}
        }))
        .unwrap();
        match &payload.op {
            Op::SelectCategory(id, ct, path) => {
                assert_eq!(id.as_str(), "c1");
                assert_eq!(*ct, ContentType::Products);
                assert_eq!(path.to_string(), "Electrical / Rough-In");
            }
            other => panic!("unexpected op {other}"),
        }

        let payload: OpPayload = serde_json::from_value(json!({"op": "ListCollections"})).unwrap();
        assert_eq!(payload.op, Op::ListCollections);

        let payload: OpPayload = serde_json::from_value(json!({
            "op": {"CreateCollection": {"name": "Kitchen"}}
        }))
        .unwrap();
        assert_eq!(
            payload.op,
            Op::CreateCollection {
                name: "Kitchen".into(),
                description: None,
                job_type: None
            }
        );
    }

    #[test]
    fn test_display_hides_tokens() {
        let op = Op::AcceptEstimate {
            estimate_id: DocId::try_from("e1").unwrap(),
            token: "secret-token".into(),
            signer: "Dana".into(),
            comment: None,
        };
        let shown = op.to_string();
        assert_eq!(shown, "AcceptEstimate(e1)");
        assert!(!shown.contains("secret"));
    }
}
