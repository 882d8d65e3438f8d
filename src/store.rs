//! The document database abstraction.
//!
//! Documents are JSON objects addressed by `(collection, id)`. [DocumentStore] is implemented
//! by the in-memory [MemoryStore] and, with the `service` feature, by the SQLite-backed
//! [crate::db::DbConnection]. Filters ([FieldFilter]) have one Rust-side evaluation
//! ([FieldFilter::matches]) and one SQL rendering ([AsSql]); both implement the same typed
//! comparison rules so that the two stores return identical results for the same [DocQuery].
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt::{Display, Formatter},
    future::Future,
    sync::Arc,
};

#[cfg(feature = "service")]
use sqlx::{QueryBuilder, Sqlite};

use crate::{
    diff::Patch,
    error::JobsiteError,
    event::StoreEvent,
    properties::{now_millis, DocId},
};

pub const DEFAULT_LIMIT: usize = 100;
pub const DEFAULT_OFFSET: usize = 0;

static FIELD_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+)*$")
        .expect("field path pattern to be a valid regex")
});

/// A page of query results.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultsPage<B> {
    pub count: usize,
    pub start: usize,
    pub results: B,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDocument {
    pub collection: String,
    pub id: DocId,
    pub data: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A dotted path of object keys inside a document, e.g. `client.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn lookup<'a>(&self, data: &'a Value) -> Option<&'a Value> {
        self.0.iter().try_fold(data, |cursor, key| cursor.get(key))
    }

    /// The path in SQLite JSON path syntax.
    pub fn sql_path(&self) -> String {
        let quoted = self
            .0
            .iter()
            .map(|s| format!("\"{s}\""))
            .collect::<Vec<String>>();
        format!("$.{}", quoted.join("."))
    }
}

impl TryFrom<String> for FieldPath {
    type Error = JobsiteError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FieldPath::try_from(value.as_str())
    }
}

impl TryFrom<&str> for FieldPath {
    type Error = JobsiteError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if !FIELD_PATH_RE.is_match(value) {
            return Err(JobsiteError::Validation(format!(
                "'{value}' is not a valid field path"
            )));
        }
        Ok(FieldPath(value.split('.').map(|s| s.to_string()).collect()))
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> String {
        path.0.join(".")
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Gt,
    In,
    ArrayContains,
}

/// A typed comparison against one document field.
///
/// Comparisons only succeed between values of the same JSON kind (string with string, number
/// with number, boolean with boolean). A missing field never matches, except that `Eq null`
/// matches both missing and explicit null fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub op: FilterOp,
    pub value: Value,
}

impl FieldFilter {
    pub fn new<V: Into<Value>>(
        field: &str,
        op: FilterOp,
        value: V,
    ) -> Result<FieldFilter, JobsiteError> {
        let filter = FieldFilter {
            field: FieldPath::try_from(field)?,
            op,
            value: value.into(),
        };
        filter.validate()?;
        Ok(filter)
    }

    pub fn eq<V: Into<Value>>(field: &str, value: V) -> Result<FieldFilter, JobsiteError> {
        FieldFilter::new(field, FilterOp::Eq, value)
    }

    pub fn validate(&self) -> Result<(), JobsiteError> {
        let ok = match self.op {
            FilterOp::Eq | FilterOp::Ne => is_scalar(&self.value) || self.value.is_null(),
            FilterOp::Lt | FilterOp::Gt => self.value.is_number() || self.value.is_string(),
            FilterOp::ArrayContains => is_scalar(&self.value),
            FilterOp::In => self
                .value
                .as_array()
                .map(|a| a.iter().all(is_scalar))
                .unwrap_or(false),
        };
        if ok {
            Ok(())
        } else {
            Err(JobsiteError::Validation(format!(
                "{:?} on '{}' cannot compare against {}",
                self.op, self.field, self.value
            )))
        }
    }

    pub fn matches(&self, data: &Value) -> bool {
        let field = self.field.lookup(data);
        match self.op {
            FilterOp::Eq if self.value.is_null() => field.map(|v| v.is_null()).unwrap_or(true),
            FilterOp::Ne if self.value.is_null() => field.map(|v| !v.is_null()).unwrap_or(false),
            FilterOp::Eq => field.map(|v| scalar_eq(v, &self.value)).unwrap_or(false),
            FilterOp::Ne => field
                .map(|v| same_kind(v, &self.value) && !scalar_eq(v, &self.value))
                .unwrap_or(false),
            FilterOp::Lt => field
                .and_then(|v| scalar_cmp(v, &self.value))
                .map(|o| o == Ordering::Less)
                .unwrap_or(false),
            FilterOp::Gt => field
                .and_then(|v| scalar_cmp(v, &self.value))
                .map(|o| o == Ordering::Greater)
                .unwrap_or(false),
            FilterOp::In => match (field, self.value.as_array()) {
                (Some(v), Some(options)) => options.iter().any(|o| scalar_eq(v, o)),
                _ => false,
            },
            FilterOp::ArrayContains => field
                .and_then(|v| v.as_array())
                .map(|a| a.iter().any(|e| scalar_eq(e, &self.value)))
                .unwrap_or(false),
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    value.is_string() || value.is_number() || value.is_boolean()
}

fn same_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::String(_), Value::String(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::Bool(_), Value::Bool(_))
    )
}

fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::String(_), Value::String(_)) | (Value::Bool(_), Value::Bool(_)) => a == b,
        _ => false,
    }
}

fn scalar_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        _ => None,
    }
}

/// Ordering of `json_extract` results in SQLite: NULL, then numbers (booleans as 0/1), then
/// text (objects and arrays as their JSON text).
fn sql_value_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) | Some(Value::Number(_)) => 1,
            _ => 2,
        }
    }
    fn numeric(v: Option<&Value>) -> f64 {
        match v {
            Some(Value::Bool(b)) => f64::from(u8::from(*b)),
            Some(Value::Number(n)) => n.as_f64().unwrap_or_default(),
            _ => 0.0,
        }
    }
    fn text(v: Option<&Value>) -> String {
        match v {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
    match rank(a).cmp(&rank(b)) {
        Ordering::Equal => match rank(a) {
            0 => Ordering::Equal,
            1 => numeric(a).total_cmp(&numeric(b)),
            _ => text(a).cmp(&text(b)),
        },
        other => other,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: FieldPath,
    #[serde(default)]
    pub descending: bool,
}

/// A filtered, ordered and optionally paginated read of one collection. Without `order_by`,
/// results are in id order; ties are always broken by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocQuery {
    pub collection: String,
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl DocQuery {
    pub fn collection(collection: &str) -> DocQuery {
        DocQuery {
            collection: collection.to_string(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
            offset: None,
        }
    }

    pub fn filter(mut self, filter: FieldFilter) -> DocQuery {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: &str, descending: bool) -> Result<DocQuery, JobsiteError> {
        self.order_by = Some(OrderBy {
            field: FieldPath::try_from(field)?,
            descending,
        });
        Ok(self)
    }

    pub fn paginate(mut self, limit: usize, offset: usize) -> DocQuery {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }

    pub fn validate(&self) -> Result<(), JobsiteError> {
        if self.collection.trim().is_empty() {
            return Err(JobsiteError::Validation(
                "query requires a collection".to_string(),
            ));
        }
        for filter in self.filters.iter() {
            filter.validate()?;
        }
        Ok(())
    }

    pub fn matches(&self, doc: &StoredDocument) -> bool {
        doc.collection == self.collection && self.filters.iter().all(|f| f.matches(&doc.data))
    }

    pub fn compare(&self, a: &StoredDocument, b: &StoredDocument) -> Ordering {
        let by_field = match &self.order_by {
            Some(order) => {
                let ord = sql_value_cmp(order.field.lookup(&a.data), order.field.lookup(&b.data));
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
            None => Ordering::Equal,
        };
        by_field.then_with(|| a.id.cmp(&b.id))
    }

    /// The same query without pagination.
    pub fn unpaged(&self) -> DocQuery {
        DocQuery {
            limit: None,
            offset: None,
            ..self.clone()
        }
    }

    /// Sort, then apply offset and limit to an already filtered set.
    pub fn finish(&self, mut docs: Vec<StoredDocument>) -> Vec<StoredDocument> {
        docs.sort_by(|a, b| self.compare(a, b));
        let offset = self.offset.unwrap_or(DEFAULT_OFFSET);
        let limit = self.limit.unwrap_or(usize::MAX);
        docs.into_iter().skip(offset).take(limit).collect()
    }
}

#[cfg(feature = "service")]
pub trait AsSql {
    fn build_query(&self, match_pred: bool, qb: &mut QueryBuilder<Sqlite>);
}

#[cfg(feature = "service")]
fn push_scalar(qb: &mut QueryBuilder<Sqlite>, value: &Value) {
    match value {
        Value::String(s) => {
            qb.push_bind(s.clone());
        }
        Value::Number(n) => match n.as_i64() {
            Some(i) => {
                qb.push_bind(i);
            }
            None => {
                qb.push_bind(n.as_f64().unwrap_or_default());
            }
        },
        Value::Bool(b) => {
            qb.push_bind(i64::from(*b));
        }
        _ => {
            qb.push("NULL");
        }
    }
}

#[cfg(feature = "service")]
fn sql_types(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "('text')",
        Value::Number(_) => "('integer', 'real')",
        Value::Bool(_) => "('true', 'false')",
        _ => "('null')",
    }
}

#[cfg(feature = "service")]
fn push_typed_cmp(qb: &mut QueryBuilder<Sqlite>, path: &str, sql_op: &str, value: &Value) {
    qb.push("(json_type(data, ");
    qb.push_bind(path.to_string());
    qb.push(format!(") IN {} AND json_extract(data, ", sql_types(value)));
    qb.push_bind(path.to_string());
    qb.push(format!(") {sql_op} "));
    push_scalar(qb, value);
    qb.push(")");
}

#[cfg(feature = "service")]
impl AsSql for FieldFilter {
    fn build_query(&self, match_pred: bool, qb: &mut QueryBuilder<Sqlite>) {
        let path = self.field.sql_path();
        if !match_pred {
            qb.push("NOT ");
        }
        qb.push("(");
        match self.op {
            FilterOp::Eq if self.value.is_null() => {
                qb.push("json_type(data, ");
                qb.push_bind(path.clone());
                qb.push(") IS NULL OR json_type(data, ");
                qb.push_bind(path);
                qb.push(") = 'null'");
            }
            FilterOp::Ne if self.value.is_null() => {
                qb.push("json_type(data, ");
                qb.push_bind(path);
                qb.push(") != 'null'");
            }
            FilterOp::Eq => push_typed_cmp(qb, &path, "=", &self.value),
            FilterOp::Ne => push_typed_cmp(qb, &path, "!=", &self.value),
            FilterOp::Lt => push_typed_cmp(qb, &path, "<", &self.value),
            FilterOp::Gt => push_typed_cmp(qb, &path, ">", &self.value),
            FilterOp::In => {
                let options = self.value.as_array().cloned().unwrap_or_default();
                if options.is_empty() {
                    qb.push("0");
                }
                let last_sep = options.len().saturating_sub(1);
                for (idx, option) in options.iter().enumerate() {
                    push_typed_cmp(qb, &path, "=", option);
                    if idx < last_sep {
                        qb.push(" OR ");
                    }
                }
            }
            FilterOp::ArrayContains => {
                qb.push("EXISTS (SELECT 1 FROM json_each(data, ");
                qb.push_bind(path);
                qb.push(format!(
                    ") AS elem WHERE elem.type IN {} AND elem.value = ",
                    sql_types(&self.value)
                ));
                push_scalar(qb, &self.value);
                qb.push(")");
            }
        }
        qb.push(")");
    }
}

#[cfg(feature = "service")]
impl AsSql for DocQuery {
    /// Renders the WHERE clause. `match_pred = false` selects the complement within the
    /// collection.
    fn build_query(&self, match_pred: bool, qb: &mut QueryBuilder<Sqlite>) {
        qb.push(" WHERE collection = ");
        qb.push_bind(self.collection.clone());
        if self.filters.is_empty() {
            if !match_pred {
                qb.push(" AND 0");
            }
            return;
        }
        qb.push(if match_pred { " AND (" } else { " AND NOT (" });
        let last_sep = self.filters.len() - 1;
        for (idx, filter) in self.filters.iter().enumerate() {
            filter.build_query(true, qb);
            if idx < last_sep {
                qb.push(" AND ");
            }
        }
        qb.push(")");
    }
}

/// Asynchronous access to a document database.
pub trait DocumentStore: Sync {
    fn get(
        &self,
        collection: &str,
        id: &DocId,
    ) -> impl Future<Output = Result<Option<StoredDocument>, JobsiteError>> + Send;

    /// Insert or replace. `created_at` survives replacement.
    fn put(
        &self,
        collection: &str,
        id: &DocId,
        data: Value,
    ) -> impl Future<Output = Result<StoredDocument, JobsiteError>> + Send;

    /// Apply field-level changes to an existing document. Missing documents are
    /// [JobsiteError::NotFound].
    fn patch(
        &self,
        collection: &str,
        id: &DocId,
        patch: &Patch,
    ) -> impl Future<Output = Result<StoredDocument, JobsiteError>> + Send;

    /// Returns whether a document was removed.
    fn delete(
        &self,
        collection: &str,
        id: &DocId,
    ) -> impl Future<Output = Result<bool, JobsiteError>> + Send;

    fn query(
        &self,
        query: &DocQuery,
    ) -> impl Future<Output = Result<Vec<StoredDocument>, JobsiteError>> + Send;

    /// Default implementation evaluates the unpaged query and slices it.
    fn query_page(
        &self,
        query: &DocQuery,
    ) -> impl Future<Output = Result<ResultsPage<Vec<StoredDocument>>, JobsiteError>> + Send {
        async move {
            let all = self.query(&query.unpaged()).await?;
            let count = all.len();
            let start = query.offset.unwrap_or(DEFAULT_OFFSET);
            let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
            let results = all.into_iter().skip(start).take(limit).collect();
            Ok(ResultsPage {
                count,
                start,
                results,
            })
        }
    }

    /// Apply a batch of events in order. Returns the number of documents touched. The default
    /// implementation is not atomic.
    fn apply(
        &self,
        events: &[StoreEvent],
    ) -> impl Future<Output = Result<usize, JobsiteError>> + Send {
        async move {
            let mut touched = 0;
            for event in events {
                match event {
                    StoreEvent::Upserted(collection, id, data) => {
                        self.put(collection, id, data.clone()).await?;
                        touched += 1;
                    }
                    StoreEvent::Patched(collection, id, patch) => {
                        self.patch(collection, id, patch).await?;
                        touched += 1;
                    }
                    StoreEvent::Removed(collection, ids) => {
                        for id in ids {
                            if self.delete(collection, id).await? {
                                touched += 1;
                            }
                        }
                    }
                }
            }
            Ok(touched)
        }
    }
}

/// A typed document with a fixed home collection.
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: &'static str;

    fn doc_id(&self) -> &DocId;
}

/// Typed helpers over any [DocumentStore].
pub trait TypedStore: DocumentStore {
    fn load<T: Document>(
        &self,
        id: &DocId,
    ) -> impl Future<Output = Result<Option<T>, JobsiteError>> + Send {
        async move {
            match self.get(T::COLLECTION, id).await? {
                Some(doc) => Ok(Some(serde_json::from_value(doc.data)?)),
                None => Ok(None),
            }
        }
    }

    /// Like [TypedStore::load], but a missing document is [JobsiteError::NotFound].
    fn fetch<T: Document>(
        &self,
        id: &DocId,
    ) -> impl Future<Output = Result<T, JobsiteError>> + Send {
        async move {
            self.load::<T>(id).await?.ok_or_else(|| {
                JobsiteError::NotFound(format!("{}/{} does not exist", T::COLLECTION, id))
            })
        }
    }

    fn save<T: Document>(
        &self,
        doc: &T,
    ) -> impl Future<Output = Result<StoredDocument, JobsiteError>> + Send {
        let value = serde_json::to_value(doc);
        let id = doc.doc_id().clone();
        async move { self.put(T::COLLECTION, &id, value?).await }
    }

    fn remove<T: Document>(
        &self,
        id: &DocId,
    ) -> impl Future<Output = Result<bool, JobsiteError>> + Send {
        self.delete(T::COLLECTION, id)
    }

    fn list<T: Document>(
        &self,
        filters: Vec<FieldFilter>,
    ) -> impl Future<Output = Result<Vec<T>, JobsiteError>> + Send {
        async move {
            let query = DocQuery {
                filters,
                ..DocQuery::collection(T::COLLECTION)
            };
            self.query(&query)
                .await?
                .into_iter()
                .map(|doc| Ok(serde_json::from_value(doc.data)?))
                .collect()
        }
    }
}

impl<S: DocumentStore> TypedStore for S {}

type DocKey = (String, DocId);

/// An in-process [DocumentStore]. Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    docs: Arc<RwLock<BTreeMap<DocKey, StoredDocument>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    fn put_locked(
        docs: &mut BTreeMap<DocKey, StoredDocument>,
        collection: &str,
        id: &DocId,
        data: Value,
    ) -> StoredDocument {
        let now = now_millis();
        let key = (collection.to_string(), id.clone());
        let created_at = docs.get(&key).map(|d| d.created_at).unwrap_or(now);
        let doc = StoredDocument {
            collection: collection.to_string(),
            id: id.clone(),
            data,
            created_at,
            updated_at: now,
        };
        docs.insert(key, doc.clone());
        doc
    }

    fn patch_locked(
        docs: &mut BTreeMap<DocKey, StoredDocument>,
        collection: &str,
        id: &DocId,
        patch: &Patch,
    ) -> Result<StoredDocument, JobsiteError> {
        let doc = docs
            .get_mut(&(collection.to_string(), id.clone()))
            .ok_or_else(|| JobsiteError::NotFound(format!("{collection}/{id} does not exist")))?;
        patch.apply(&mut doc.data);
        doc.updated_at = now_millis();
        Ok(doc.clone())
    }
}

impl DocumentStore for MemoryStore {
    #[tracing::instrument(skip(self))]
    async fn get(&self, collection: &str, id: &DocId) -> Result<Option<StoredDocument>, JobsiteError> {
        Ok(self
            .docs
            .read()
            .get(&(collection.to_string(), id.clone()))
            .cloned())
    }

    #[tracing::instrument(skip(self, data))]
    async fn put(
        &self,
        collection: &str,
        id: &DocId,
        data: Value,
    ) -> Result<StoredDocument, JobsiteError> {
        let mut docs = self.docs.write();
        Ok(MemoryStore::put_locked(&mut docs, collection, id, data))
    }

    #[tracing::instrument(skip(self, patch))]
    async fn patch(
        &self,
        collection: &str,
        id: &DocId,
        patch: &Patch,
    ) -> Result<StoredDocument, JobsiteError> {
        let mut docs = self.docs.write();
        MemoryStore::patch_locked(&mut docs, collection, id, patch)
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, collection: &str, id: &DocId) -> Result<bool, JobsiteError> {
        Ok(self
            .docs
            .write()
            .remove(&(collection.to_string(), id.clone()))
            .is_some())
    }

    #[tracing::instrument(skip(self))]
    async fn query(&self, query: &DocQuery) -> Result<Vec<StoredDocument>, JobsiteError> {
        query.validate()?;
        let matched = self
            .docs
            .read()
            .values()
            .filter(|doc| query.matches(doc))
            .cloned()
            .collect();
        Ok(query.finish(matched))
    }

    /// All-or-nothing: events are applied to a copy that replaces the map only on success.
    #[tracing::instrument(skip(self, events))]
    async fn apply(&self, events: &[StoreEvent]) -> Result<usize, JobsiteError> {
        let mut docs = self.docs.write();
        let mut staged = docs.clone();
        let mut touched = 0;
        for event in events {
            match event {
                StoreEvent::Upserted(collection, id, data) => {
                    MemoryStore::put_locked(&mut staged, collection, id, data.clone());
                    touched += 1;
                }
                StoreEvent::Patched(collection, id, patch) => {
                    MemoryStore::patch_locked(&mut staged, collection, id, patch)?;
                    touched += 1;
                }
                StoreEvent::Removed(collection, ids) => {
                    for id in ids {
                        if staged.remove(&(collection.clone(), id.clone())).is_some() {
                            touched += 1;
                        }
                    }
                }
            }
        }
        *docs = staged;
        Ok(touched)
    }
}
