//! # Jobsite Service
//!
//! [JobsiteService] ties the domain modules to the SQLite document store. It executes [Op]
//! commands, keeps the product cache warm, queues client email, and broadcasts every write as
//! an [Event] on the channel it was created with.
//!
//! ## Auto-saved collections
//!
//! Collections being edited interactively can be handed to an [AutoSaver] with
//! [JobsiteService::enable_autosave]. While enabled, the service keeps the live [Collection] in
//! memory; edits mutate it and push a snapshot to the saver, which writes field-level patches
//! after the configured debounce. Reads see the in-memory copy. [JobsiteService::disable_autosave]
//! flushes and stops the saver.
//!
//! ## Concurrent writes
//!
//! Every load-modify-store of an estimate, work order or stored collection holds a per-document
//! lock, so two requests against the same document apply one after the other. Creating
//! estimates and work orders also holds a numbering lock, which keeps `EST-`/`WO-` numbers
//! unique and allows one work order per estimate.
//!
//! ```rust,no_run
//! use jobsite_core::{commands::Op, event::Event, service::JobsiteService};
//! use std::{path::PathBuf, sync::mpsc::channel};
//!
//! # async fn run() -> Result<(), jobsite_core::JobsiteError> {
//! let (tx, _rx) = channel::<Event>();
//! let service = JobsiteService::open(PathBuf::from("/srv/jobsite"), tx).await?;
//! let result = service
//!     .execute(Op::CreateCollection {
//!         name: "Kitchen remodel".into(),
//!         description: None,
//!         job_type: None,
//!     })
//!     .await?;
//! println!("{result}");
//! # Ok(())
//! # }
//! ```
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{mpsc::Sender, Arc},
};
use tokio::sync::OwnedMutexGuard;

use crate::{
    autosave::{AutoSaveStats, AutoSaver},
    cache::{load_catalog, ProductCache},
    collection::{has_legacy_selections, upgrade_legacy_selections, Collection},
    commands::{Op, OpResult},
    config::{AppConfig, ConfigProvider, TomlConfigProvider, CONFIG_FILE},
    db::DbConnection,
    error::JobsiteError,
    estimate::{year_of, ClientView, Estimate, next_estimate_number},
    event::{Event, StoreEvent, WorkflowEvent},
    inventory::{Catalog, InventoryItem},
    mail::{client_estimate_link, estimate_decision_email, estimate_sent_email, OutboxMailer},
    properties::{now_millis, DocId},
    store::{DocQuery, Document, DocumentStore, FieldFilter, TypedStore},
    work_order::WorkOrder,
};

const WORK_ORDER_PREFIX: &str = "WO";

/// A collection under auto-save: the live document and the saver persisting it.
struct ActiveCollection {
    doc: Collection,
    saver: Arc<AutoSaver<Collection>>,
}

#[derive(Default)]
struct ActiveCollections(HashMap<DocId, ActiveCollection>);

type DocLockMap = HashMap<(&'static str, DocId), Arc<tokio::sync::Mutex<()>>>;

/// Write locks keyed by (collection, id). Entries nobody holds or awaits are dropped.
#[derive(Default)]
struct DocLocks(Mutex<DocLockMap>);

impl DocLocks {
    async fn lock(&self, collection: &'static str, id: &DocId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.0.lock();
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry((collection, id.clone())).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct JobsiteService {
    db: DbConnection,
    config: AppConfig,
    config_provider: Arc<dyn ConfigProvider>,
    cache: tokio::sync::Mutex<ProductCache>,
    active: Arc<Mutex<ActiveCollections>>,
    doc_locks: DocLocks,
    numbering: tokio::sync::Mutex<()>,
    mailer: OutboxMailer<DbConnection>,
    event_tx: Sender<Event>,
}

impl JobsiteService {
    /// Open the service rooted at `root_dir`, reading `jobsite.toml` there if present.
    pub async fn open(root_dir: PathBuf, event_tx: Sender<Event>) -> Result<Self, JobsiteError> {
        let config_path = root_dir.join(CONFIG_FILE);
        tracing::debug!(
            "Initializing TomlConfigProvider with path: {:?}",
            config_path
        );
        let provider: Arc<dyn ConfigProvider> = Arc::new(TomlConfigProvider::new(config_path));
        Self::with_provider(root_dir, provider, event_tx).await
    }

    pub async fn with_provider(
        root_dir: PathBuf,
        config_provider: Arc<dyn ConfigProvider>,
        event_tx: Sender<Event>,
    ) -> Result<Self, JobsiteError> {
        let config = config_provider.get_config()?.rooted(&root_dir);
        let db = DbConnection::open(config.store.database.clone()).await?;
        let cache = ProductCache::open(&config.cache.path, config.cache.ttl());
        tracing::info!(
            "Jobsite service ready (database {:?}, {} cached products)",
            config.store.database,
            cache.len()
        );
        Ok(JobsiteService {
            mailer: OutboxMailer::new(db.clone()),
            db,
            config,
            config_provider,
            cache: tokio::sync::Mutex::new(cache),
            active: Arc::new(Mutex::new(ActiveCollections::default())),
            doc_locks: DocLocks::default(),
            numbering: tokio::sync::Mutex::new(()),
            event_tx,
        })
    }

    pub fn db_connection(&self) -> DbConnection {
        self.db.clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn config_provider(&self) -> Arc<dyn ConfigProvider> {
        self.config_provider.clone()
    }

    fn notify<E: Into<Event>>(&self, event: E) {
        if self.event_tx.send(event.into()).is_err() {
            tracing::debug!("[JobsiteService] no event receiver");
        }
    }

    async fn persist<T: Document>(&self, doc: &T) -> Result<(), JobsiteError> {
        let stored = self.db.save(doc).await?;
        self.notify(StoreEvent::Upserted(
            stored.collection,
            stored.id,
            stored.data,
        ));
        Ok(())
    }

    /// Write a batch in one transaction, then broadcast it.
    async fn persist_all(&self, events: Vec<StoreEvent>) -> Result<(), JobsiteError> {
        self.db.apply(&events).await?;
        for event in events {
            self.notify(event);
        }
        Ok(())
    }

    pub async fn catalog(&self) -> Result<Catalog, JobsiteError> {
        let mut cache = self.cache.lock().await;
        let (catalog, from_store) = load_catalog(&self.db, &mut cache, now_millis()).await?;
        if from_store {
            self.notify(WorkflowEvent::CacheRefreshed(catalog.len()));
        }
        Ok(catalog)
    }

    pub async fn refresh_cache(&self) -> Result<usize, JobsiteError> {
        self.cache.lock().await.invalidate()?;
        Ok(self.catalog().await?.len())
    }

    /// Load a collection, preferring the live copy of an auto-saved one. Documents still
    /// carrying legacy selections are upgraded against the catalog and written back.
    pub async fn load_collection(&self, id: &DocId) -> Result<Collection, JobsiteError> {
        let live = self.active.lock().0.get(id).map(|a| a.doc.clone());
        if let Some(doc) = live {
            return Ok(doc);
        }
        let stored = self
            .db
            .get(Collection::COLLECTION, id)
            .await?
            .ok_or_else(|| JobsiteError::NotFound(format!("collection {id}")))?;
        self.decode_collection(stored.data).await
    }

    async fn decode_collection(&self, mut data: serde_json::Value) -> Result<Collection, JobsiteError> {
        if !has_legacy_selections(&data) {
            return Ok(serde_json::from_value(data)?);
        }
        let catalog = self.catalog().await?;
        upgrade_legacy_selections(&mut data, &catalog)?;
        let collection: Collection = serde_json::from_value(data)?;
        self.persist(&collection).await?;
        Ok(collection)
    }

    pub async fn list_collections(&self) -> Result<Vec<Collection>, JobsiteError> {
        let docs = self
            .db
            .query(&DocQuery::collection(Collection::COLLECTION).order_by("name", false)?)
            .await?;
        let mut collections = Vec::with_capacity(docs.len());
        for doc in docs {
            let live = self.active.lock().0.get(&doc.id).map(|a| a.doc.clone());
            match live {
                Some(collection) => collections.push(collection),
                None => collections.push(self.decode_collection(doc.data).await?),
            }
        }
        Ok(collections)
    }

    /// Apply `edit` to a collection and persist it, through its auto-saver when one is active.
    async fn edit_collection<F, R>(&self, id: &DocId, edit: F) -> Result<(Collection, R), JobsiteError>
    where
        F: FnOnce(&mut Collection) -> Result<R, JobsiteError>,
    {
        {
            let mut active = self.active.lock();
            if let Some(entry) = active.0.get_mut(id) {
                let mut doc = entry.doc.clone();
                let out = edit(&mut doc)?;
                let dirty = doc.take_dirty();
                tracing::debug!("[JobsiteService] collection {id} changed {dirty:?} (auto-saved)");
                entry.saver.update(&doc)?;
                entry.doc = doc.clone();
                return Ok((doc, out));
            }
        }
        let _guard = self.doc_locks.lock(Collection::COLLECTION, id).await;
        let mut doc = self.load_collection(id).await?;
        let out = edit(&mut doc)?;
        let dirty = doc.take_dirty();
        tracing::debug!("[JobsiteService] collection {id} changed {dirty:?}");
        self.persist(&doc).await?;
        Ok((doc, out))
    }

    pub async fn enable_autosave(&self, id: &DocId) -> Result<(), JobsiteError> {
        if self.active.lock().0.contains_key(id) {
            return Err(JobsiteError::Custom(format!(
                "Auto-save is already enabled for collection {id}"
            )));
        }
        let doc = self.load_collection(id).await?;
        let saver = AutoSaver::spawn(
            self.db.clone(),
            Collection::COLLECTION,
            id,
            &doc,
            self.config.autosave.debounce(),
            Some(self.event_tx.clone()),
        )?;
        let mut active = self.active.lock();
        if active.0.contains_key(id) {
            return Err(JobsiteError::Custom(format!(
                "Auto-save is already enabled for collection {id}"
            )));
        }
        active.0.insert(
            id.clone(),
            ActiveCollection {
                doc,
                saver: Arc::new(saver),
            },
        );
        tracing::info!("[JobsiteService] auto-save enabled for collection {id}");
        Ok(())
    }

    /// Flush and stop the auto-saver of a collection. Returns the ops written by the final flush.
    pub async fn disable_autosave(&self, id: &DocId) -> Result<usize, JobsiteError> {
        let removed = self.active.lock().0.remove(id);
        let Some(active) = removed else {
            return Ok(0);
        };
        let written = match Arc::try_unwrap(active.saver) {
            Ok(saver) => saver.shutdown().await?,
            // A flush is in flight; the last handle to drop closes the worker.
            Err(shared) => shared.flush().await?,
        };
        tracing::info!("[JobsiteService] auto-save disabled for collection {id}");
        Ok(written)
    }

    pub fn autosave_stats(&self, id: &DocId) -> Option<AutoSaveStats> {
        self.active.lock().0.get(id).map(|a| a.saver.stats())
    }

    /// Write pending auto-save edits of a collection now.
    pub async fn flush_autosave(&self, id: &DocId) -> Result<usize, JobsiteError> {
        let saver = self.active.lock().0.get(id).map(|a| a.saver.clone());
        match saver {
            Some(saver) => saver.flush().await,
            None => Ok(0),
        }
    }

    /// Stop every auto-saver, flushing pending edits.
    pub async fn shutdown(&self) -> Result<(), JobsiteError> {
        let ids: Vec<DocId> = self.active.lock().0.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.disable_autosave(&id).await {
                tracing::warn!("[JobsiteService] final flush of collection {id} failed: {e}");
            }
        }
        Ok(())
    }

    /// Load an estimate, moving it to Expired first when its validity has passed.
    pub async fn load_estimate(&self, id: &DocId) -> Result<Estimate, JobsiteError> {
        let _guard = self.doc_locks.lock(Estimate::COLLECTION, id).await;
        self.fetch_estimate(id).await
    }

    /// [Self::load_estimate] for callers already holding the estimate's lock.
    async fn fetch_estimate(&self, id: &DocId) -> Result<Estimate, JobsiteError> {
        let mut estimate: Estimate = self.db.fetch(id).await?;
        if estimate.expire_if_due(now_millis()) {
            self.persist(&estimate).await?;
            self.notify(WorkflowEvent::EstimateStatusChanged(
                estimate.id.clone(),
                estimate.status,
            ));
        }
        Ok(estimate)
    }

    async fn edit_estimate<F, R>(&self, id: &DocId, edit: F) -> Result<(Estimate, R), JobsiteError>
    where
        F: FnOnce(&mut Estimate) -> Result<R, JobsiteError>,
    {
        let _guard = self.doc_locks.lock(Estimate::COLLECTION, id).await;
        let mut estimate = self.fetch_estimate(id).await?;
        let out = edit(&mut estimate)?;
        self.persist(&estimate).await?;
        Ok((estimate, out))
    }

    async fn edit_work_order<F, R>(&self, id: &DocId, edit: F) -> Result<(WorkOrder, R), JobsiteError>
    where
        F: FnOnce(&mut WorkOrder) -> Result<R, JobsiteError>,
    {
        let _guard = self.doc_locks.lock(WorkOrder::COLLECTION, id).await;
        let mut work_order: WorkOrder = self.db.fetch(id).await?;
        let out = edit(&mut work_order)?;
        self.persist(&work_order).await?;
        Ok((work_order, out))
    }

    async fn create_estimate(
        &self,
        collection_id: &DocId,
        client: crate::estimate::ClientInfo,
        project: crate::estimate::ProjectInfo,
    ) -> Result<Estimate, JobsiteError> {
        let collection = self.load_collection(collection_id).await?;
        let catalog = self.catalog().await?;
        let _numbering = self.numbering.lock().await;
        let existing: Vec<Estimate> = self.db.list(Vec::new()).await?;
        let number = next_estimate_number(
            &self.config.estimates.number_prefix,
            year_of(now_millis()),
            existing.iter().map(|e| e.number.as_str()),
        )?;
        let mut estimate =
            Estimate::from_collection(&number, &collection, &catalog, client, project)?;
        estimate.set_tax_rate(self.config.estimates.default_tax_rate_bps)?;
        self.persist(&estimate).await?;
        tracing::info!(
            "[JobsiteService] estimate {} created from collection '{}' with {} lines",
            estimate.number,
            collection.name,
            estimate.line_items.len()
        );
        Ok(estimate)
    }

    async fn send_estimate(&self, id: &DocId) -> Result<(Estimate, String), JobsiteError> {
        let _guard = self.doc_locks.lock(Estimate::COLLECTION, id).await;
        let mut estimate = self.fetch_estimate(id).await?;
        let token = estimate.send(now_millis(), self.config.estimates.validity_ms())?;
        let link = client_estimate_link(&self.config.server.public_base_url, &estimate.id, &token);

        let mut writes = vec![StoreEvent::Upserted(
            Estimate::COLLECTION.to_string(),
            estimate.id.clone(),
            serde_json::to_value(&estimate)?,
        )];
        match estimate_sent_email(
            &estimate,
            &self.config.company.name,
            &self.config.server.public_base_url,
            &token,
        ) {
            Ok(email) => writes.push(StoreEvent::Upserted(
                crate::mail::OutgoingEmail::COLLECTION.to_string(),
                email.id.clone(),
                serde_json::to_value(&email)?,
            )),
            Err(e) => tracing::warn!(
                "[JobsiteService] estimate {} sent without email: {e}",
                estimate.number
            ),
        }
        self.persist_all(writes).await?;
        self.notify(WorkflowEvent::EstimateSent(
            estimate.id.clone(),
            estimate.number.clone(),
        ));
        Ok((estimate, link))
    }

    async fn view_estimate(&self, id: &DocId, token: &str) -> Result<ClientView, JobsiteError> {
        let _guard = self.doc_locks.lock(Estimate::COLLECTION, id).await;
        let mut estimate = self.fetch_estimate(id).await?;
        if estimate.mark_viewed(token, now_millis())? {
            self.persist(&estimate).await?;
            self.notify(WorkflowEvent::EstimateStatusChanged(
                estimate.id.clone(),
                estimate.status,
            ));
        }
        ClientView::render(&estimate)
    }

    async fn decide_estimate<F>(&self, id: &DocId, decide: F) -> Result<ClientView, JobsiteError>
    where
        F: FnOnce(&mut Estimate) -> Result<(), JobsiteError>,
    {
        let _guard = self.doc_locks.lock(Estimate::COLLECTION, id).await;
        let mut estimate = self.fetch_estimate(id).await?;
        decide(&mut estimate)?;
        let mut writes = vec![StoreEvent::Upserted(
            Estimate::COLLECTION.to_string(),
            estimate.id.clone(),
            serde_json::to_value(&estimate)?,
        )];
        match estimate_decision_email(&estimate, &self.config.company.email) {
            Ok(email) => writes.push(StoreEvent::Upserted(
                crate::mail::OutgoingEmail::COLLECTION.to_string(),
                email.id.clone(),
                serde_json::to_value(&email)?,
            )),
            Err(e) => tracing::warn!(
                "[JobsiteService] decision on estimate {} recorded without email: {e}",
                estimate.number
            ),
        }
        self.persist_all(writes).await?;
        if let Some(approval) = estimate.approval.as_ref() {
            self.notify(WorkflowEvent::EstimateDecided(
                estimate.id.clone(),
                approval.decision,
            ));
        }
        ClientView::render(&estimate)
    }

    async fn create_work_order(&self, estimate_id: &DocId) -> Result<WorkOrder, JobsiteError> {
        let estimate = self.load_estimate(estimate_id).await?;
        let _numbering = self.numbering.lock().await;
        let existing: Vec<WorkOrder> = self
            .db
            .list(vec![FieldFilter::eq("estimateId", estimate_id.as_str())?])
            .await?;
        if let Some(wo) = existing.first() {
            return Err(JobsiteError::InvalidState(format!(
                "estimate {} already has work order {}",
                estimate.number, wo.number
            )));
        }
        let all: Vec<WorkOrder> = self.db.list(Vec::new()).await?;
        let now = now_millis();
        let number = next_estimate_number(
            WORK_ORDER_PREFIX,
            year_of(now),
            all.iter().map(|w| w.number.as_str()),
        )?;
        let work_order = WorkOrder::from_estimate(&estimate, &number, now)?;
        self.persist(&work_order).await?;
        self.notify(WorkflowEvent::WorkOrderCreated(
            work_order.id.clone(),
            estimate.id.clone(),
        ));
        Ok(work_order)
    }

    async fn upsert_item(&self, item: InventoryItem) -> Result<InventoryItem, JobsiteError> {
        item.validate()?;
        self.persist(&item).await?;
        if let Err(e) = self.cache.lock().await.upsert(item.clone()) {
            tracing::warn!("[JobsiteService] product cache not updated: {e}");
        }
        Ok(item)
    }

    pub async fn execute(&self, op: Op) -> Result<OpResult, JobsiteError> {
        tracing::info!("[JobsiteService] {op}");
        let now = now_millis();
        let result = match op {
            Op::CreateCollection {
                name,
                description,
                job_type,
            } => {
                let mut collection = Collection::new(&name)?;
                collection.description = description;
                collection.job_type = job_type;
                self.persist(&collection).await?;
                OpResult::Collection(collection)
            }
            Op::GetCollection(id) => OpResult::Collection(self.load_collection(&id).await?),
            Op::ListCollections => OpResult::Collections(self.list_collections().await?),
            Op::RenameCollection(id, name) => {
                let (c, _) = self.edit_collection(&id, |c| c.rename(&name)).await?;
                OpResult::Collection(c)
            }
            Op::SelectCategory(id, ct, path) => {
                let (c, _) = self
                    .edit_collection(&id, |c| Ok(c.select_category(ct, &path)))
                    .await?;
                OpResult::Collection(c)
            }
            Op::DeselectCategory(id, ct, path) => {
                let catalog = self.catalog().await?;
                let (c, _) = self
                    .edit_collection(&id, |c| {
                        c.deselect_category(ct, &path);
                        Ok(c.prune_items(ct, &catalog))
                    })
                    .await?;
                OpResult::Collection(c)
            }
            Op::SelectItem(id, ct, item, qty) => {
                let catalog = self.catalog().await?;
                let (c, _) = self
                    .edit_collection(&id, |c| c.select_item(ct, &item, qty, &catalog))
                    .await?;
                OpResult::Collection(c)
            }
            Op::DeselectItem(id, ct, item) => {
                let (c, _) = self
                    .edit_collection(&id, |c| Ok(c.deselect_item(ct, &item)))
                    .await?;
                OpResult::Collection(c)
            }
            Op::RebuildTabs(id, ct) => {
                let catalog = self.catalog().await?;
                let (_, tabs) = self
                    .edit_collection(&id, |c| Ok(c.rebuild_tabs(ct, &catalog).to_vec()))
                    .await?;
                OpResult::Tabs(tabs)
            }
            Op::DeleteCollection(id) => {
                self.disable_autosave(&id).await?;
                let removed = self.db.remove::<Collection>(&id).await?;
                if removed {
                    self.notify(StoreEvent::Removed(
                        Collection::COLLECTION.to_string(),
                        vec![id],
                    ));
                }
                OpResult::Removed(removed)
            }

            Op::CreateEstimate {
                collection_id,
                client,
                project,
            } => OpResult::Estimate(self.create_estimate(&collection_id, client, project).await?),
            Op::GetEstimate(id) => OpResult::Estimate(self.load_estimate(&id).await?),
            Op::ListEstimates => {
                let mut estimates: Vec<Estimate> = self.db.list(Vec::new()).await?;
                estimates.sort_by(|a, b| a.number.cmp(&b.number));
                OpResult::Estimates(estimates)
            }
            Op::AddLineItem(id, line) => {
                let (e, _) = self.edit_estimate(&id, |e| e.add_line_item(line)).await?;
                OpResult::Estimate(e)
            }
            Op::RemoveLineItem(id, line_id) => {
                let (e, _) = self
                    .edit_estimate(&id, |e| e.remove_line_item(&line_id))
                    .await?;
                OpResult::Estimate(e)
            }
            Op::SetTaxRate(id, bps) => {
                let (e, _) = self.edit_estimate(&id, |e| e.set_tax_rate(bps)).await?;
                OpResult::Estimate(e)
            }
            Op::SetDiscount(id, discount) => {
                let (e, _) = self
                    .edit_estimate(&id, |e| e.set_discount(discount))
                    .await?;
                OpResult::Estimate(e)
            }
            Op::SetClientView(id, settings) => {
                let (e, _) = self
                    .edit_estimate(&id, |e| {
                        e.set_client_view(settings);
                        Ok(())
                    })
                    .await?;
                OpResult::Estimate(e)
            }
            Op::SendEstimate(id) => {
                let (estimate, link) = self.send_estimate(&id).await?;
                OpResult::Sent(estimate, link)
            }
            Op::ReviseEstimate(id, reason) => {
                let (e, _) = self.edit_estimate(&id, |e| e.revise(&reason, now)).await?;
                self.notify(WorkflowEvent::EstimateStatusChanged(e.id.clone(), e.status));
                OpResult::Estimate(e)
            }
            Op::ViewEstimate { estimate_id, token } => {
                OpResult::ClientView(self.view_estimate(&estimate_id, &token).await?)
            }
            Op::AcceptEstimate {
                estimate_id,
                token,
                signer,
                comment,
            } => OpResult::ClientView(
                self.decide_estimate(&estimate_id, |e| e.accept(&token, &signer, comment, now))
                    .await?,
            ),
            Op::RejectEstimate {
                estimate_id,
                token,
                reason,
            } => OpResult::ClientView(
                self.decide_estimate(&estimate_id, |e| e.reject(&token, reason, now))
                    .await?,
            ),

            Op::CreateWorkOrder(estimate_id) => {
                OpResult::WorkOrder(self.create_work_order(&estimate_id).await?)
            }
            Op::GetWorkOrder(id) => OpResult::WorkOrder(self.db.fetch(&id).await?),
            Op::ListWorkOrders => {
                let mut work_orders: Vec<WorkOrder> = self.db.list(Vec::new()).await?;
                work_orders.sort_by(|a, b| a.number.cmp(&b.number));
                OpResult::WorkOrders(work_orders)
            }
            Op::SetTaskStatus(id, task, status) => {
                let (w, _) = self
                    .edit_work_order(&id, |w| w.set_task_status(&task, status, now))
                    .await?;
                OpResult::WorkOrder(w)
            }
            Op::AssignTask(id, task, assignee) => {
                let (w, _) = self
                    .edit_work_order(&id, |w| w.assign_task(&task, assignee, now))
                    .await?;
                OpResult::WorkOrder(w)
            }
            Op::SetMaterialReadiness(id, line, readiness) => {
                let (w, _) = self
                    .edit_work_order(&id, |w| w.set_material_readiness(&line, readiness, now))
                    .await?;
                OpResult::WorkOrder(w)
            }
            Op::AddMilestone(id, title, due) => {
                let (w, _) = self
                    .edit_work_order(&id, |w| w.add_milestone(&title, due, now))
                    .await?;
                OpResult::WorkOrder(w)
            }
            Op::CompleteMilestone(id, milestone) => {
                let (w, _) = self
                    .edit_work_order(&id, |w| w.complete_milestone(&milestone, now))
                    .await?;
                OpResult::WorkOrder(w)
            }
            Op::TransitionWorkOrder(id, status) => {
                let (w, _) = self
                    .edit_work_order(&id, |w| w.transition(status, now))
                    .await?;
                self.notify(WorkflowEvent::WorkOrderStatusChanged(w.id.clone(), w.status));
                OpResult::WorkOrder(w)
            }

            Op::UpsertItem(item) => OpResult::Items(vec![self.upsert_item(item).await?]),
            Op::ListItems(content_type) => {
                let catalog = self.catalog().await?;
                OpResult::Items(
                    catalog
                        .into_items()
                        .into_iter()
                        .filter(|i| content_type.map(|ct| i.content_type == ct).unwrap_or(true))
                        .collect(),
                )
            }
            Op::CatalogOutline(content_type) => {
                OpResult::Outline(self.catalog().await?.outline(content_type))
            }
            Op::RefreshCache => OpResult::CacheRefreshed(self.refresh_cache().await?),
            Op::ListOutbox => OpResult::Outbox(self.mailer.outbox().await?),
        };
        tracing::debug!("[JobsiteService] -> {result}");
        Ok(result)
    }
}
