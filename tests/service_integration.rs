//! Integration tests for JobsiteService (commands, persistence, email outbox, auto-save)
//!
//! These tests drive the service through its public [Op] interface against a SQLite database in
//! a temporary directory:
//! - Collection editing and tab rebuilding
//! - The estimate lifecycle from pricing to client acceptance
//! - Work orders created from accepted estimates
//! - Legacy selection upgrades and auto-saved collections
//! - Concurrent decisions and numbering
#![cfg(feature = "service")]

mod common;

use jobsite_core::{
    collection::Collection,
    commands::{Op, OpResult},
    config::{AppConfig, ConfigProvider},
    estimate::{ClientInfo, EstimateStatus, ProjectInfo},
    event::{Event, WorkflowEvent},
    hierarchy::CategoryPath,
    inventory::InventoryItem,
    properties::{Cents, ContentType, DocId},
    service::JobsiteService,
    store::{Document, DocumentStore, TypedStore},
    work_order::{TaskStatus, WorkOrderStatus},
    JobsiteError,
};
use serde_json::json;
use std::{
    sync::{
        mpsc::{channel, Receiver},
        Arc,
    },
    time::Duration,
};
use tempfile::TempDir;
use test_log::test;

async fn open_service(temp_dir: &TempDir) -> (JobsiteService, Receiver<Event>) {
    common::init_logging();
    common::write_test_config(temp_dir.path());
    let (tx, rx) = channel::<Event>();
    let service = JobsiteService::open(temp_dir.path().to_path_buf(), tx)
        .await
        .unwrap();
    (service, rx)
}

async fn seed_catalog(service: &JobsiteService) -> Vec<InventoryItem> {
    let items = common::sample_items();
    for item in items.iter() {
        service.execute(Op::UpsertItem(item.clone())).await.unwrap();
    }
    items
}

fn id_of(items: &[InventoryItem], name: &str) -> DocId {
    items.iter().find(|i| i.name == name).unwrap().id.clone()
}

fn path(s: &str) -> CategoryPath {
    s.parse().unwrap()
}

async fn create_collection(service: &JobsiteService, name: &str) -> Collection {
    match service
        .execute(Op::CreateCollection {
            name: name.to_string(),
            description: None,
            job_type: Some("remodel".to_string()),
        })
        .await
        .unwrap()
    {
        OpResult::Collection(c) => c,
        other => panic!("unexpected result {other}"),
    }
}

/// Price `collection_id` as a new estimate, returning its id.
async fn create_estimate(service: &JobsiteService, collection_id: &DocId) -> DocId {
    match service
        .execute(Op::CreateEstimate {
            collection_id: collection_id.clone(),
            client: client(),
            project: ProjectInfo::default(),
        })
        .await
        .unwrap()
    {
        OpResult::Estimate(e) => e.id,
        other => panic!("unexpected result {other}"),
    }
}

async fn receptacle_collection(service: &JobsiteService) -> DocId {
    let items = seed_catalog(service).await;
    let collection = create_collection(service, "Outlets").await;
    service
        .execute(Op::SelectItem(
            collection.id.clone(),
            ContentType::Products,
            id_of(&items, "Duplex receptacle"),
            4.0,
        ))
        .await
        .unwrap();
    collection.id
}

/// Send an estimate, returning the share token from its link.
async fn send(service: &JobsiteService, estimate_id: &DocId) -> String {
    match service
        .execute(Op::SendEstimate(estimate_id.clone()))
        .await
        .unwrap()
    {
        OpResult::Sent(_, link) => link.split("token=").nth(1).unwrap().to_string(),
        other => panic!("unexpected result {other}"),
    }
}

async fn outbox(service: &JobsiteService) -> Vec<jobsite_core::mail::OutgoingEmail> {
    match service.execute(Op::ListOutbox).await.unwrap() {
        OpResult::Outbox(mail) => mail,
        other => panic!("unexpected result {other}"),
    }
}

/// Serves a fixed config without validating it.
struct FixedConfig(AppConfig);

impl ConfigProvider for FixedConfig {
    fn get_config(&self) -> Result<AppConfig, JobsiteError> {
        Ok(self.0.clone())
    }

    fn set_config(&self, _config: &AppConfig) -> Result<(), JobsiteError> {
        Ok(())
    }
}

fn client() -> ClientInfo {
    ClientInfo {
        name: "Dana Rivera".to_string(),
        email: Some("dana@example.com".to_string()),
        ..Default::default()
    }
}

#[test(tokio::test)]
async fn test_collection_selection_and_tabs() {
    let temp_dir = TempDir::new().unwrap();
    let (service, _rx) = open_service(&temp_dir).await;
    let items = seed_catalog(&service).await;
    let collection = create_collection(&service, "Kitchen").await;

    service
        .execute(Op::SelectCategory(
            collection.id.clone(),
            ContentType::Products,
            path("Electrical/Rough-In"),
        ))
        .await
        .unwrap();
    service
        .execute(Op::SelectItem(
            collection.id.clone(),
            ContentType::Products,
            id_of(&items, "Old work box"),
            10.0,
        ))
        .await
        .unwrap();

    let tabs = match service
        .execute(Op::RebuildTabs(collection.id.clone(), ContentType::Products))
        .await
        .unwrap()
    {
        OpResult::Tabs(tabs) => tabs,
        other => panic!("unexpected result {other}"),
    };
    assert_eq!(tabs.len(), 2, "one tab per matching category: {tabs:?}");

    // Selecting an item under the wrong content type is rejected.
    let err = service
        .execute(Op::SelectItem(
            collection.id.clone(),
            ContentType::Labor,
            id_of(&items, "Old work box"),
            1.0,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, JobsiteError::Validation(_)));

    // Deselecting the category prunes the items it covered.
    let collection = match service
        .execute(Op::DeselectCategory(
            collection.id.clone(),
            ContentType::Products,
            path("Electrical"),
        ))
        .await
        .unwrap()
    {
        OpResult::Collection(c) => c,
        other => panic!("unexpected result {other}"),
    };
    assert!(collection.selected_item_ids().is_empty());

    let stored: Collection = service.db_connection().fetch(&collection.id).await.unwrap();
    assert_eq!(stored, collection);
}

#[test(tokio::test)]
async fn test_estimate_to_work_order_workflow() {
    let temp_dir = TempDir::new().unwrap();
    let (service, rx) = open_service(&temp_dir).await;
    let items = seed_catalog(&service).await;
    let collection = create_collection(&service, "Basement wiring").await;
    let id = collection.id.clone();

    service
        .execute(Op::SelectCategory(id.clone(), ContentType::Products, path("Electrical/Rough-In")))
        .await
        .unwrap();
    for (ct, name, qty) in [
        (ContentType::Products, "Old work box", 10.0),
        (ContentType::Products, "12/2 Romex", 100.0),
        (ContentType::Labor, "Electrician", 8.0),
    ] {
        service
            .execute(Op::SelectItem(id.clone(), ct, id_of(&items, name), qty))
            .await
            .unwrap();
    }

    // Price the collection.
    let estimate = match service
        .execute(Op::CreateEstimate {
            collection_id: id.clone(),
            client: client(),
            project: ProjectInfo {
                name: "Basement".to_string(),
                ..Default::default()
            },
        })
        .await
        .unwrap()
    {
        OpResult::Estimate(e) => e,
        other => panic!("unexpected result {other}"),
    };
    assert!(estimate.number.starts_with("EST-"));
    assert!(estimate.number.ends_with("-0001"));
    assert_eq!(estimate.status, EstimateStatus::Draft);
    let descriptions: Vec<&str> = estimate
        .line_items
        .iter()
        .map(|l| l.description.as_str())
        .collect();
    assert_eq!(descriptions, vec!["Old work box", "12/2 Romex", "Electrician"]);
    let totals = estimate.totals().unwrap();
    assert_eq!(totals.subtotal, Cents(87_000));
    // Labor is not taxable; 10% of the 110.00 in products.
    assert_eq!(totals.tax, Cents(1_100));
    assert_eq!(totals.total, Cents(88_100));

    // Send it; the client email lands in the outbox.
    let (sent, link) = match service.execute(Op::SendEstimate(estimate.id.clone())).await.unwrap() {
        OpResult::Sent(e, link) => (e, link),
        other => panic!("unexpected result {other}"),
    };
    assert_eq!(sent.status, EstimateStatus::Sent);
    let prefix = format!("https://jobs.acme.test/client/estimates/{}?token=", sent.id);
    assert!(link.starts_with(&prefix), "{link}");
    let token = link[prefix.len()..].to_string();
    assert!(!serde_json::to_string(&sent).unwrap().contains(&token));

    // Drafts cannot be edited once sent.
    let err = service
        .execute(Op::SetTaxRate(sent.id.clone(), 0))
        .await
        .unwrap_err();
    assert!(matches!(err, JobsiteError::InvalidState(_)));

    // A wrong token is refused.
    let err = service
        .execute(Op::ViewEstimate {
            estimate_id: sent.id.clone(),
            token: "not-the-token".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err, JobsiteError::PermissionDenied);

    let view = match service
        .execute(Op::ViewEstimate {
            estimate_id: sent.id.clone(),
            token: token.clone(),
        })
        .await
        .unwrap()
    {
        OpResult::ClientView(v) => v,
        other => panic!("unexpected result {other}"),
    };
    assert_eq!(view.status, EstimateStatus::Viewed);
    assert_eq!(view.totals.total, Cents(88_100));

    let view = match service
        .execute(Op::AcceptEstimate {
            estimate_id: sent.id.clone(),
            token: token.clone(),
            signer: "Dana Rivera".to_string(),
            comment: Some("Start next week".to_string()),
        })
        .await
        .unwrap()
    {
        OpResult::ClientView(v) => v,
        other => panic!("unexpected result {other}"),
    };
    assert_eq!(view.status, EstimateStatus::Accepted);

    let outbox = match service.execute(Op::ListOutbox).await.unwrap() {
        OpResult::Outbox(mail) => mail,
        other => panic!("unexpected result {other}"),
    };
    let recipients: Vec<&str> = outbox.iter().map(|m| m.to.as_str()).collect();
    assert_eq!(recipients.len(), 2);
    assert!(recipients.contains(&"dana@example.com"));
    assert!(recipients.contains(&"office@acme.test"));

    // The accepted estimate becomes a work order, once.
    let work_order = match service
        .execute(Op::CreateWorkOrder(sent.id.clone()))
        .await
        .unwrap()
    {
        OpResult::WorkOrder(w) => w,
        other => panic!("unexpected result {other}"),
    };
    assert_eq!(work_order.status, WorkOrderStatus::Scheduled);
    assert_eq!(work_order.labor_tasks.len(), 1);
    assert_eq!(work_order.labor_tasks[0].planned_hours, 8.0);
    assert_eq!(work_order.materials.len(), 2);
    let err = service
        .execute(Op::CreateWorkOrder(sent.id.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, JobsiteError::InvalidState(_)));

    let wo = work_order.id.clone();
    let task = work_order.labor_tasks[0].id.clone();
    service
        .execute(Op::TransitionWorkOrder(wo.clone(), WorkOrderStatus::InProgress))
        .await
        .unwrap();
    let err = service
        .execute(Op::TransitionWorkOrder(wo.clone(), WorkOrderStatus::Completed))
        .await
        .unwrap_err();
    assert!(matches!(err, JobsiteError::InvalidState(_)));
    service
        .execute(Op::SetTaskStatus(wo.clone(), task, TaskStatus::Done))
        .await
        .unwrap();
    let done = match service
        .execute(Op::TransitionWorkOrder(wo.clone(), WorkOrderStatus::Completed))
        .await
        .unwrap()
    {
        OpResult::WorkOrder(w) => w,
        other => panic!("unexpected result {other}"),
    };
    assert_eq!(done.status, WorkOrderStatus::Completed);

    let workflow: Vec<WorkflowEvent> = rx
        .try_iter()
        .filter_map(|e| match e {
            Event::Workflow(w) => Some(w),
            _ => None,
        })
        .collect();
    assert!(workflow
        .iter()
        .any(|e| matches!(e, WorkflowEvent::EstimateSent(eid, _) if *eid == sent.id)));
    assert!(workflow
        .iter()
        .any(|e| matches!(e, WorkflowEvent::WorkOrderCreated(w, eid) if *w == wo && *eid == sent.id)));
    assert!(workflow.iter().any(|e| matches!(
        e,
        WorkflowEvent::WorkOrderStatusChanged(w, WorkOrderStatus::Completed) if *w == wo
    )));
}

#[test(tokio::test)]
async fn test_revised_estimate_invalidates_token() {
    let temp_dir = TempDir::new().unwrap();
    let (service, _rx) = open_service(&temp_dir).await;
    let items = seed_catalog(&service).await;
    let collection = create_collection(&service, "Bath").await;
    service
        .execute(Op::SelectItem(
            collection.id.clone(),
            ContentType::Products,
            id_of(&items, "PEX 1/2in"),
            50.0,
        ))
        .await
        .unwrap();
    let estimate = match service
        .execute(Op::CreateEstimate {
            collection_id: collection.id.clone(),
            client: client(),
            project: ProjectInfo::default(),
        })
        .await
        .unwrap()
    {
        OpResult::Estimate(e) => e,
        other => panic!("unexpected result {other}"),
    };
    let token = match service.execute(Op::SendEstimate(estimate.id.clone())).await.unwrap() {
        OpResult::Sent(_, link) => link.split("token=").nth(1).unwrap().to_string(),
        other => panic!("unexpected result {other}"),
    };

    let revised = match service
        .execute(Op::ReviseEstimate(estimate.id.clone(), "Client asked for tile".into()))
        .await
        .unwrap()
    {
        OpResult::Estimate(e) => e,
        other => panic!("unexpected result {other}"),
    };
    assert_eq!(revised.status, EstimateStatus::Draft);
    assert_eq!(revised.revisions.len(), 1);

    let err = service
        .execute(Op::ViewEstimate {
            estimate_id: estimate.id.clone(),
            token,
        })
        .await
        .unwrap_err();
    assert_eq!(err, JobsiteError::PermissionDenied);
}

#[test(tokio::test)]
async fn test_legacy_selection_upgraded_on_load() {
    let temp_dir = TempDir::new().unwrap();
    let (service, _rx) = open_service(&temp_dir).await;
    seed_catalog(&service).await;

    let collection = Collection::new("Old plumbing template").unwrap();
    let mut data = serde_json::to_value(&collection).unwrap();
    data["content"] = json!({
        "products": {"selection": {"trades": ["Plumbing"], "sections": ["Supply"]}}
    });
    let db = service.db_connection();
    db.put(Collection::COLLECTION, &collection.id, data)
        .await
        .unwrap();

    let loaded = match service
        .execute(Op::GetCollection(collection.id.clone()))
        .await
        .unwrap()
    {
        OpResult::Collection(c) => c,
        other => panic!("unexpected result {other}"),
    };
    let selection = &loaded.state(ContentType::Products).unwrap().selection;
    assert!(selection.covers(&path("Plumbing/Supply/Pipe")));
    assert!(!selection.covers(&path("Electrical/Rough-In")));

    // The upgrade was written back.
    let stored = db
        .get(Collection::COLLECTION, &collection.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!jobsite_core::collection::has_legacy_selections(&stored.data));
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_autosaved_collection_edits_reach_database() {
    let temp_dir = TempDir::new().unwrap();
    let (service, _rx) = open_service(&temp_dir).await;
    let collection = create_collection(&service, "Deck").await;
    let id = collection.id.clone();

    service.enable_autosave(&id).await.unwrap();
    assert!(service.enable_autosave(&id).await.is_err());

    service
        .execute(Op::RenameCollection(id.clone(), "Deck and railing".into()))
        .await
        .unwrap();
    service
        .execute(Op::SelectCategory(id.clone(), ContentType::Labor, path("Carpentry")))
        .await
        .unwrap();

    // Reads see the live copy before anything is written.
    let live = match service.execute(Op::GetCollection(id.clone())).await.unwrap() {
        OpResult::Collection(c) => c,
        other => panic!("unexpected result {other}"),
    };
    assert_eq!(live.name, "Deck and railing");

    service.flush_autosave(&id).await.unwrap();
    let stats = service.autosave_stats(&id).unwrap();
    assert_eq!(stats.updates, 2);
    assert!(stats.ops_written > 0);

    let stored: Collection = service.db_connection().fetch(&id).await.unwrap();
    assert_eq!(stored.name, "Deck and railing");
    assert!(stored
        .state(ContentType::Labor)
        .unwrap()
        .selection
        .covers(&path("Carpentry/Framing")));

    // Edits after disabling go straight to the store.
    service
        .execute(Op::RenameCollection(id.clone(), "Deck".into()))
        .await
        .unwrap();
    service.disable_autosave(&id).await.unwrap();
    assert!(service.autosave_stats(&id).is_none());
    service
        .execute(Op::RenameCollection(id.clone(), "Deck (final)".into()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored: Collection = service.db_connection().fetch(&id).await.unwrap();
    assert_eq!(stored.name, "Deck (final)");
    service.shutdown().await.unwrap();
}

#[test(tokio::test)]
async fn test_catalog_served_from_cache_file() {
    let temp_dir = TempDir::new().unwrap();
    let (service, _rx) = open_service(&temp_dir).await;
    let items = seed_catalog(&service).await;

    let listed = match service
        .execute(Op::ListItems(Some(ContentType::Products)))
        .await
        .unwrap()
    {
        OpResult::Items(items) => items,
        other => panic!("unexpected result {other}"),
    };
    assert_eq!(listed.len(), 4);
    assert!(temp_dir
        .path()
        .join(jobsite_core::cache::PRODUCT_CACHE_FILE)
        .exists());

    // A later upsert reaches the cached copy too.
    let mut renamed = items[0].clone();
    renamed.name = "Old work box (deep)".to_string();
    service.execute(Op::UpsertItem(renamed)).await.unwrap();
    let names: Vec<String> = match service.execute(Op::ListItems(None)).await.unwrap() {
        OpResult::Items(items) => items.into_iter().map(|i| i.name).collect(),
        other => panic!("unexpected result {other}"),
    };
    assert!(names.contains(&"Old work box (deep)".to_string()));

    match service.execute(Op::RefreshCache).await.unwrap() {
        OpResult::CacheRefreshed(n) => assert_eq!(n, items.len()),
        other => panic!("unexpected result {other}"),
    }
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_decisions_settle_once() {
    let temp_dir = TempDir::new().unwrap();
    let (service, _rx) = open_service(&temp_dir).await;
    let service = Arc::new(service);
    let collection_id = receptacle_collection(&service).await;
    let estimate_id = create_estimate(&service, &collection_id).await;
    let token = send(&service, &estimate_id).await;

    let accept = Op::AcceptEstimate {
        estimate_id: estimate_id.clone(),
        token: token.clone(),
        signer: "Dana Rivera".to_string(),
        comment: None,
    };
    let reject = Op::RejectEstimate {
        estimate_id: estimate_id.clone(),
        token,
        reason: Some("Found someone cheaper".to_string()),
    };
    let handles: Vec<_> = [accept, reject]
        .into_iter()
        .map(|op| {
            let service = service.clone();
            tokio::spawn(async move { service.execute(op).await })
        })
        .collect();
    let mut decided = Vec::new();
    let mut refused = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(OpResult::ClientView(view)) => decided.push(view.status),
            Ok(other) => panic!("unexpected result {other}"),
            Err(e) => refused.push(e),
        }
    }
    assert_eq!(decided.len(), 1);
    assert_eq!(refused.len(), 1);
    assert!(matches!(refused[0], JobsiteError::InvalidState(_)));

    let stored = match service.execute(Op::GetEstimate(estimate_id)).await.unwrap() {
        OpResult::Estimate(e) => e,
        other => panic!("unexpected result {other}"),
    };
    assert_eq!(stored.status, decided[0]);

    // The client's link plus exactly one decision notice.
    let mail = outbox(&service).await;
    assert_eq!(mail.len(), 2);
    assert_eq!(
        mail.iter().filter(|m| m.to == "office@acme.test").count(),
        1
    );
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_creation_keeps_numbers_unique() {
    let temp_dir = TempDir::new().unwrap();
    let (service, _rx) = open_service(&temp_dir).await;
    let service = Arc::new(service);
    let collection_id = receptacle_collection(&service).await;

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let service = service.clone();
            let collection_id = collection_id.clone();
            tokio::spawn(async move { create_estimate(&service, &collection_id).await })
        })
        .collect();
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    let mut numbers = match service.execute(Op::ListEstimates).await.unwrap() {
        OpResult::Estimates(estimates) => estimates
            .into_iter()
            .map(|e| e.number)
            .collect::<Vec<_>>(),
        other => panic!("unexpected result {other}"),
    };
    assert_eq!(numbers.len(), 6);
    numbers.sort();
    numbers.dedup();
    assert_eq!(numbers.len(), 6, "duplicate estimate numbers: {numbers:?}");

    // One work order per accepted estimate, however many requests race for it.
    let estimate_id = ids[0].clone();
    let token = send(&service, &estimate_id).await;
    service
        .execute(Op::AcceptEstimate {
            estimate_id: estimate_id.clone(),
            token,
            signer: "Dana Rivera".to_string(),
            comment: None,
        })
        .await
        .unwrap();
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let service = service.clone();
            let estimate_id = estimate_id.clone();
            tokio::spawn(async move { service.execute(Op::CreateWorkOrder(estimate_id)).await })
        })
        .collect();
    let mut created = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(OpResult::WorkOrder(_)) => created += 1,
            Ok(other) => panic!("unexpected result {other}"),
            Err(e) => assert!(matches!(e, JobsiteError::InvalidState(_))),
        }
    }
    assert_eq!(created, 1);
    match service.execute(Op::ListWorkOrders).await.unwrap() {
        OpResult::WorkOrders(work_orders) => assert_eq!(work_orders.len(), 1),
        other => panic!("unexpected result {other}"),
    }
}

#[test(tokio::test)]
async fn test_decision_kept_when_company_email_is_invalid() {
    let temp_dir = TempDir::new().unwrap();
    common::init_logging();
    let mut config = AppConfig::default();
    config.company.email = "front desk".to_string();
    assert!(config.validate().is_err());
    let (tx, _rx) = channel::<Event>();
    let service = JobsiteService::with_provider(
        temp_dir.path().to_path_buf(),
        Arc::new(FixedConfig(config)),
        tx,
    )
    .await
    .unwrap();
    let collection_id = receptacle_collection(&service).await;
    let estimate_id = create_estimate(&service, &collection_id).await;
    let token = send(&service, &estimate_id).await;

    let view = match service
        .execute(Op::AcceptEstimate {
            estimate_id: estimate_id.clone(),
            token,
            signer: "Dana Rivera".to_string(),
            comment: None,
        })
        .await
        .unwrap()
    {
        OpResult::ClientView(v) => v,
        other => panic!("unexpected result {other}"),
    };
    assert_eq!(view.status, EstimateStatus::Accepted);

    let stored = match service.execute(Op::GetEstimate(estimate_id)).await.unwrap() {
        OpResult::Estimate(e) => e,
        other => panic!("unexpected result {other}"),
    };
    assert_eq!(stored.status, EstimateStatus::Accepted);
    let mail = outbox(&service).await;
    assert_eq!(mail.len(), 1);
    assert_eq!(mail[0].to, "dana@example.com");
}
