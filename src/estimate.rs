//! Client-facing estimates and their approval workflow.
//!
//! ```text
//! Draft --send--> Sent --client opens--> Viewed --accept--> Accepted (terminal)
//!                   |                       |----reject--> Rejected
//!                   +------ valid_until passes ----------> Expired
//! Sent | Viewed | Rejected | Expired --revise--> Draft
//! ```
//!
//! Sending issues a random share token. Only its SHA-256 hash is kept on the estimate; the
//! plaintext goes to the client in the estimate link and must accompany accept/reject.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

use crate::{
    collection::Collection,
    error::JobsiteError,
    inventory::Catalog,
    properties::{civil_date, now_millis, Cents, ContentType, DocId, FULL_BPS},
    store::Document,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Largest quantity a single line may carry.
pub const MAX_QUANTITY: f64 = 1_000_000.0;

/// Largest unit price a single line may carry ($10,000,000.00).
pub const MAX_UNIT_PRICE: Cents = Cents(1_000_000_000);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub id: DocId,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_item_id: Option<DocId>,
    pub description: String,
    /// Longer text shown to the client when descriptions are enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub quantity: f64,
    pub unit: String,
    pub unit_price: Cents,
    pub taxable: bool,
}

impl LineItem {
    pub fn new(
        content_type: ContentType,
        description: &str,
        quantity: f64,
        unit: &str,
        unit_price: Cents,
    ) -> LineItem {
        LineItem {
            id: DocId::new(),
            content_type,
            inventory_item_id: None,
            description: description.trim().to_string(),
            details: None,
            section: None,
            category: None,
            quantity,
            unit: unit.to_string(),
            unit_price,
            taxable: content_type != ContentType::Labor,
        }
    }

    pub fn total(&self) -> Cents {
        self.unit_price.scale(self.quantity)
    }

    pub fn validate(&self) -> Result<(), JobsiteError> {
        if self.description.is_empty() {
            return Err(JobsiteError::Validation(
                "line item needs a description".to_string(),
            ));
        }
        if !self.quantity.is_finite() || self.quantity <= 0.0 || self.quantity > MAX_QUANTITY {
            return Err(JobsiteError::Validation(format!(
                "line item '{}' has invalid quantity {}",
                self.description, self.quantity
            )));
        }
        if self.unit_price.is_negative() {
            return Err(JobsiteError::Validation(format!(
                "line item '{}' has a negative unit price",
                self.description
            )));
        }
        if self.unit_price > MAX_UNIT_PRICE {
            return Err(JobsiteError::Validation(format!(
                "line item '{}' has a unit price above {MAX_UNIT_PRICE}",
                self.description
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Discount {
    #[default]
    None,
    /// Basis points of the subtotal.
    Percent(i64),
    Amount(Cents),
}

impl Discount {
    pub fn validate(&self) -> Result<(), JobsiteError> {
        match self {
            Discount::Percent(bps) if !(0..=FULL_BPS).contains(bps) => Err(
                JobsiteError::Validation(format!("discount of {bps} bps is out of range")),
            ),
            Discount::Amount(c) if c.is_negative() => Err(JobsiteError::Validation(
                "discount amount cannot be negative".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Amount off `subtotal`, never more than the subtotal itself.
    pub fn amount_of(&self, subtotal: Cents) -> Cents {
        let raw = match self {
            Discount::None => Cents::ZERO,
            Discount::Percent(bps) => subtotal.percent_bps(*bps),
            Discount::Amount(c) => *c,
        };
        Cents(raw.0.clamp(0, subtotal.0.max(0)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub subtotal: Cents,
    pub discount: Cents,
    pub taxable_base: Cents,
    pub tax: Cents,
    pub total: Cents,
}

fn checked_sum<'a>(mut lines: impl Iterator<Item = &'a LineItem>) -> Result<Cents, JobsiteError> {
    lines.try_fold(Cents::ZERO, |acc, l| {
        acc.checked_add(l.total()).ok_or_else(too_large)
    })
}

fn too_large() -> JobsiteError {
    JobsiteError::Validation("estimate total is too large".to_string())
}

impl Totals {
    /// Fails with [JobsiteError::Validation] when any amount would overflow.
    pub fn compute(
        lines: &[LineItem],
        discount: &Discount,
        tax_rate_bps: i64,
    ) -> Result<Totals, JobsiteError> {
        let subtotal = checked_sum(lines.iter())?;
        let taxable = checked_sum(lines.iter().filter(|l| l.taxable))?;
        let discount = discount.amount_of(subtotal);
        let taxable_discount = if subtotal.0 == 0 {
            Cents::ZERO
        } else {
            Cents(round_div(
                discount.0 as i128 * taxable.0 as i128,
                subtotal.0 as i128,
            ))
        };
        let taxable_base = taxable.checked_sub(taxable_discount).ok_or_else(too_large)?;
        let tax = taxable_base.percent_bps(tax_rate_bps);
        let total = subtotal
            .checked_sub(discount)
            .and_then(|net| net.checked_add(tax))
            .ok_or_else(too_large)?;
        Ok(Totals {
            subtotal,
            discount,
            taxable_base,
            tax,
            total,
        })
    }
}

/// `numerator / denominator`, rounded half away from zero.
fn round_div(numerator: i128, denominator: i128) -> i64 {
    let half = denominator.abs() / 2;
    let adjusted = if (numerator >= 0) == (denominator > 0) {
        numerator + half * denominator.signum()
    } else {
        numerator - half * denominator.signum()
    };
    (adjusted / denominator) as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EstimateStatus {
    Draft,
    Sent,
    Viewed,
    Accepted,
    Rejected,
    Expired,
}

impl EstimateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstimateStatus::Draft => "draft",
            EstimateStatus::Sent => "sent",
            EstimateStatus::Viewed => "viewed",
            EstimateStatus::Accepted => "accepted",
            EstimateStatus::Rejected => "rejected",
            EstimateStatus::Expired => "expired",
        }
    }

    /// Statuses in which the client may still decide.
    pub fn is_open(&self) -> bool {
        matches!(self, EstimateStatus::Sent | EstimateStatus::Viewed)
    }
}

impl Display for EstimateStatus {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Decision {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub decided_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub number: u32,
    pub created_at: i64,
    pub reason: String,
    pub line_items: Vec<LineItem>,
    pub totals: Totals,
    pub status_before: EstimateStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Grouping {
    None,
    ContentType,
    #[default]
    Section,
    Category,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientViewSettings {
    pub grouping: Grouping,
    pub show_quantities: bool,
    pub show_unit_prices: bool,
    pub show_line_totals: bool,
    pub show_descriptions: bool,
    pub show_tax_breakdown: bool,
}

impl Default for ClientViewSettings {
    fn default() -> Self {
        ClientViewSettings {
            grouping: Grouping::default(),
            show_quantities: true,
            show_unit_prices: true,
            show_line_totals: true,
            show_descriptions: true,
            show_tax_breakdown: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Estimate {
    pub id: DocId,
    pub number: String,
    pub client: ClientInfo,
    pub project: ProjectInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<DocId>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub tax_rate_bps: i64,
    #[serde(default)]
    pub discount: Discount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms: Option<String>,
    pub status: EstimateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_token_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<Approval>,
    #[serde(default)]
    pub revisions: Vec<Revision>,
    #[serde(default)]
    pub client_view: ClientViewSettings,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Document for Estimate {
    const COLLECTION: &'static str = "estimates";

    fn doc_id(&self) -> &DocId {
        &self.id
    }
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn new_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Equal-length byte comparison that does not stop at the first difference.
fn hashes_match(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

impl Estimate {
    pub fn new(number: &str, client: ClientInfo, project: ProjectInfo) -> Result<Estimate, JobsiteError> {
        if client.name.trim().is_empty() {
            return Err(JobsiteError::Validation(
                "estimate needs a client name".to_string(),
            ));
        }
        let now = now_millis();
        Ok(Estimate {
            id: DocId::new(),
            number: number.to_string(),
            client,
            project,
            collection_id: None,
            line_items: Vec::new(),
            tax_rate_bps: 0,
            discount: Discount::None,
            notes: None,
            terms: None,
            status: EstimateStatus::Draft,
            valid_until: None,
            share_token_hash: None,
            approval: None,
            revisions: Vec::new(),
            client_view: ClientViewSettings::default(),
            created_at: now,
            updated_at: now,
        })
    }

    /// One line per selected item of `collection`, in catalog order, priced at unit cost.
    pub fn from_collection(
        number: &str,
        collection: &Collection,
        catalog: &Catalog,
        client: ClientInfo,
        project: ProjectInfo,
    ) -> Result<Estimate, JobsiteError> {
        let mut estimate = Estimate::new(number, client, project)?;
        estimate.collection_id = Some(collection.id.clone());
        for item in catalog.items() {
            let Some(selected) = collection
                .state(item.content_type)
                .and_then(|s| s.items.get(&item.id))
            else {
                continue;
            };
            let line = LineItem {
                inventory_item_id: Some(item.id.clone()),
                details: item.description.clone(),
                section: item.path.section().map(|s| s.to_string()),
                category: item.path.category().map(|s| s.to_string()),
                ..LineItem::new(
                    item.content_type,
                    &item.name,
                    selected.quantity,
                    &item.unit,
                    item.unit_cost,
                )
            };
            line.validate()?;
            estimate.line_items.push(line);
        }
        estimate.totals()?;
        let missing = collection
            .selected_item_ids()
            .len()
            .saturating_sub(estimate.line_items.len());
        if missing > 0 {
            tracing::warn!(
                "{missing} items selected in collection '{}' are no longer in the catalog",
                collection.name
            );
        }
        Ok(estimate)
    }

    pub fn totals(&self) -> Result<Totals, JobsiteError> {
        Totals::compute(&self.line_items, &self.discount, self.tax_rate_bps)
    }

    fn require_draft(&self, action: &str) -> Result<(), JobsiteError> {
        if self.status != EstimateStatus::Draft {
            return Err(JobsiteError::InvalidState(format!(
                "cannot {action} estimate {} while it is {}",
                self.number, self.status
            )));
        }
        Ok(())
    }

    fn touch(&mut self, now: i64) {
        self.updated_at = now;
    }

    pub fn add_line_item(&mut self, line: LineItem) -> Result<(), JobsiteError> {
        self.require_draft("edit")?;
        line.validate()?;
        self.line_items.push(line);
        if let Err(e) = self.totals() {
            self.line_items.pop();
            return Err(e);
        }
        self.touch(now_millis());
        Ok(())
    }

    pub fn update_line_item(
        &mut self,
        line_id: &DocId,
        quantity: Option<f64>,
        unit_price: Option<Cents>,
    ) -> Result<(), JobsiteError> {
        self.require_draft("edit")?;
        let line = self
            .line_items
            .iter_mut()
            .find(|l| l.id == *line_id)
            .ok_or_else(|| JobsiteError::NotFound(format!("line item {line_id}")))?;
        let mut updated = line.clone();
        if let Some(q) = quantity {
            updated.quantity = q;
        }
        if let Some(p) = unit_price {
            updated.unit_price = p;
        }
        updated.validate()?;
        let previous = std::mem::replace(line, updated);
        if let Err(e) = self.totals() {
            if let Some(line) = self.line_items.iter_mut().find(|l| l.id == *line_id) {
                *line = previous;
            }
            return Err(e);
        }
        self.touch(now_millis());
        Ok(())
    }

    pub fn remove_line_item(&mut self, line_id: &DocId) -> Result<LineItem, JobsiteError> {
        self.require_draft("edit")?;
        let idx = self
            .line_items
            .iter()
            .position(|l| l.id == *line_id)
            .ok_or_else(|| JobsiteError::NotFound(format!("line item {line_id}")))?;
        self.touch(now_millis());
        Ok(self.line_items.remove(idx))
    }

    pub fn set_tax_rate(&mut self, bps: i64) -> Result<(), JobsiteError> {
        self.require_draft("edit")?;
        if !(0..=FULL_BPS).contains(&bps) {
            return Err(JobsiteError::Validation(format!(
                "tax rate of {bps} bps is out of range"
            )));
        }
        self.tax_rate_bps = bps;
        self.touch(now_millis());
        Ok(())
    }

    pub fn set_discount(&mut self, discount: Discount) -> Result<(), JobsiteError> {
        self.require_draft("edit")?;
        discount.validate()?;
        self.discount = discount;
        self.touch(now_millis());
        Ok(())
    }

    pub fn set_client_view(&mut self, settings: ClientViewSettings) {
        self.client_view = settings;
        self.touch(now_millis());
    }

    /// Move an open estimate whose validity has passed to Expired. Returns whether it did.
    pub fn expire_if_due(&mut self, now: i64) -> bool {
        match self.valid_until {
            Some(until) if self.status.is_open() && now > until => {
                self.status = EstimateStatus::Expired;
                self.touch(now);
                true
            }
            _ => false,
        }
    }

    /// Issue the estimate to the client. Returns the plaintext share token, which is not
    /// stored anywhere.
    pub fn send(&mut self, now: i64, validity_ms: i64) -> Result<String, JobsiteError> {
        self.require_draft("send")?;
        if self.line_items.is_empty() {
            return Err(JobsiteError::Validation(format!(
                "estimate {} has no line items",
                self.number
            )));
        }
        let valid_until = now.checked_add(validity_ms).ok_or_else(|| {
            JobsiteError::Validation(format!("validity of {validity_ms} ms is out of range"))
        })?;
        self.totals()?;
        let token = new_token();
        self.share_token_hash = Some(hash_token(&token));
        self.valid_until = Some(valid_until);
        self.status = EstimateStatus::Sent;
        self.touch(now);
        tracing::debug!("Estimate {} sent, valid until {:?}", self.number, self.valid_until);
        Ok(token)
    }

    pub fn verify_token(&self, token: &str) -> bool {
        match &self.share_token_hash {
            Some(stored) => hashes_match(stored, &hash_token(token)),
            None => false,
        }
    }

    fn require_token(&self, token: &str) -> Result<(), JobsiteError> {
        if self.verify_token(token) {
            Ok(())
        } else {
            Err(JobsiteError::PermissionDenied)
        }
    }

    /// Record that the client opened the estimate. Returns whether the status changed.
    pub fn mark_viewed(&mut self, token: &str, now: i64) -> Result<bool, JobsiteError> {
        self.require_token(token)?;
        if self.expire_if_due(now) {
            return Ok(true);
        }
        if self.status == EstimateStatus::Sent {
            self.status = EstimateStatus::Viewed;
            self.touch(now);
            return Ok(true);
        }
        Ok(false)
    }

    fn decide(
        &mut self,
        token: &str,
        decision: Decision,
        signer: Option<String>,
        comment: Option<String>,
        now: i64,
    ) -> Result<(), JobsiteError> {
        self.require_token(token)?;
        self.expire_if_due(now);
        if !self.status.is_open() {
            return Err(JobsiteError::InvalidState(format!(
                "estimate {} is {} and can no longer be decided",
                self.number, self.status
            )));
        }
        self.approval = Some(Approval {
            decision,
            signer,
            comment,
            decided_at: now,
        });
        self.status = match decision {
            Decision::Accepted => EstimateStatus::Accepted,
            Decision::Rejected => EstimateStatus::Rejected,
        };
        self.touch(now);
        Ok(())
    }

    pub fn accept(
        &mut self,
        token: &str,
        signer: &str,
        comment: Option<String>,
        now: i64,
    ) -> Result<(), JobsiteError> {
        let signer = signer.trim();
        if signer.is_empty() {
            return Err(JobsiteError::Validation(
                "accepting an estimate requires the signer's name".to_string(),
            ));
        }
        self.decide(token, Decision::Accepted, Some(signer.to_string()), comment, now)
    }

    pub fn reject(
        &mut self,
        token: &str,
        reason: Option<String>,
        now: i64,
    ) -> Result<(), JobsiteError> {
        self.decide(token, Decision::Rejected, None, reason, now)
    }

    /// Snapshot the current lines and return to Draft. Invalidates the share token.
    pub fn revise(&mut self, reason: &str, now: i64) -> Result<u32, JobsiteError> {
        match self.status {
            EstimateStatus::Sent
            | EstimateStatus::Viewed
            | EstimateStatus::Rejected
            | EstimateStatus::Expired => {}
            other => {
                return Err(JobsiteError::InvalidState(format!(
                    "cannot revise estimate {} while it is {other}",
                    self.number
                )))
            }
        }
        let number = self.revisions.len() as u32 + 1;
        self.revisions.push(Revision {
            number,
            created_at: now,
            reason: reason.trim().to_string(),
            line_items: self.line_items.clone(),
            totals: self.totals()?,
            status_before: self.status,
        });
        self.share_token_hash = None;
        self.approval = None;
        self.valid_until = None;
        self.status = EstimateStatus::Draft;
        self.touch(now);
        Ok(number)
    }
}

/// `PREFIX-YYYY-NNNN`, one past the highest sequence already used for `year`.
pub fn next_estimate_number<'a, I>(
    prefix: &str,
    year: i32,
    existing: I,
) -> Result<String, JobsiteError>
where
    I: IntoIterator<Item = &'a str>,
{
    let stem = format!("{prefix}-{year}-");
    let highest = existing
        .into_iter()
        .filter_map(|n| n.strip_prefix(&stem))
        .filter_map(|seq| seq.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    let next = highest.checked_add(1).ok_or_else(|| {
        JobsiteError::InvalidState(format!("{stem} numbers are exhausted"))
    })?;
    Ok(format!("{stem}{next:04}"))
}

/// Calendar year of a unix millisecond timestamp (UTC).
pub fn year_of(millis: i64) -> i32 {
    civil_date(millis).0 as i32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientLine {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<Cents>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<Cents>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientGroup {
    pub title: String,
    pub lines: Vec<ClientLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtotal: Option<Cents>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTotals {
    pub subtotal: Cents,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<Cents>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax: Option<Cents>,
    pub total: Cents,
}

/// What the client sees: the estimate filtered through its [ClientViewSettings].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientView {
    pub number: String,
    pub client: ClientInfo,
    pub project: ProjectInfo,
    pub status: EstimateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<i64>,
    pub groups: Vec<ClientGroup>,
    pub totals: ClientTotals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms: Option<String>,
}

const UNGROUPED_TITLE: &str = "Items";

impl ClientView {
    pub fn render(estimate: &Estimate) -> Result<ClientView, JobsiteError> {
        let totals = estimate.totals()?;
        let settings = &estimate.client_view;
        let mut groups: Vec<(String, Vec<&LineItem>)> = Vec::new();
        for line in estimate.line_items.iter() {
            let title = match settings.grouping {
                Grouping::None => UNGROUPED_TITLE.to_string(),
                Grouping::ContentType => {
                    let name = line.content_type.as_str();
                    let mut chars = name.chars();
                    chars
                        .next()
                        .map(|c| c.to_uppercase().collect::<String>() + chars.as_str())
                        .unwrap_or_default()
                }
                Grouping::Section => line
                    .section
                    .clone()
                    .unwrap_or_else(|| crate::inventory::GENERAL_LABEL.to_string()),
                Grouping::Category => line
                    .category
                    .clone()
                    .unwrap_or_else(|| crate::inventory::GENERAL_LABEL.to_string()),
            };
            match groups.iter_mut().find(|(t, _)| *t == title) {
                Some((_, lines)) => lines.push(line),
                None => groups.push((title, vec![line])),
            }
        }

        let groups = groups
            .into_iter()
            .map(|(title, lines)| ClientGroup {
                title,
                subtotal: settings
                    .show_line_totals
                    .then(|| lines.iter().map(|l| l.total()).sum()),
                lines: lines
                    .into_iter()
                    .map(|l| ClientLine {
                        description: l.description.clone(),
                        details: l.details.clone().filter(|_| settings.show_descriptions),
                        quantity: settings.show_quantities.then_some(l.quantity),
                        unit: settings.show_quantities.then(|| l.unit.clone()),
                        unit_price: settings.show_unit_prices.then_some(l.unit_price),
                        total: settings.show_line_totals.then(|| l.total()),
                    })
                    .collect(),
            })
            .collect();

        Ok(ClientView {
            number: estimate.number.clone(),
            client: estimate.client.clone(),
            project: estimate.project.clone(),
            status: estimate.status,
            valid_until: estimate.valid_until,
            groups,
            totals: ClientTotals {
                subtotal: totals.subtotal,
                discount: (totals.discount != Cents::ZERO).then_some(totals.discount),
                tax: settings.show_tax_breakdown.then_some(totals.tax),
                total: totals.total,
            },
            notes: estimate.notes.clone(),
            terms: estimate.terms.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::tests::sample_catalog;
    use test_log::test;

    const DAY: i64 = crate::properties::MILLIS_PER_DAY;

    fn client() -> ClientInfo {
        ClientInfo {
            name: "Dana Client".into(),
            email: Some("dana@example.com".into()),
            ..Default::default()
        }
    }

    fn draft() -> Estimate {
        let mut e = Estimate::new("EST-2026-0001", client(), ProjectInfo::default()).unwrap();
        let mut lumber = LineItem::new(ContentType::Products, "Lumber", 10.0, "ea", Cents(1000));
        lumber.section = Some("Framing".into());
        e.add_line_item(lumber).unwrap();
        let mut labor = LineItem::new(ContentType::Labor, "Carpenter", 2.0, "hr", Cents(5000));
        labor.section = Some("Framing".into());
        e.add_line_item(labor).unwrap();
        e
    }

    #[test]
    fn test_totals_apply_discount_proportionally_to_tax_base() {
        let mut e = draft();
        e.set_tax_rate(1000).unwrap();
        assert_eq!(
            e.totals().unwrap(),
            Totals {
                subtotal: Cents(20_000),
                discount: Cents::ZERO,
                taxable_base: Cents(10_000),
                tax: Cents(1_000),
                total: Cents(21_000),
            }
        );
        e.set_discount(Discount::Percent(1000)).unwrap();
        let totals = e.totals().unwrap();
        assert_eq!(totals.discount, Cents(2_000));
        assert_eq!(totals.taxable_base, Cents(9_000));
        assert_eq!(totals.tax, Cents(900));
        assert_eq!(totals.total, Cents(18_900));

        e.set_discount(Discount::Amount(Cents(1_000_000))).unwrap();
        let totals = e.totals().unwrap();
        assert_eq!(totals.discount, Cents(20_000));
        assert_eq!(totals.taxable_base, Cents::ZERO);
        assert_eq!(totals.tax, Cents::ZERO);
        assert_eq!(totals.total, Cents::ZERO);
        assert!(e.set_discount(Discount::Percent(20_000)).is_err());
    }

    #[test]
    fn test_send_issues_token_and_stores_hash_only() {
        let mut e = draft();
        let token = e.send(0, 30 * DAY).unwrap();
        assert_eq!(e.status, EstimateStatus::Sent);
        assert_eq!(token.len(), 64);
        let stored = e.share_token_hash.clone().unwrap();
        assert_ne!(stored, token);
        assert_eq!(stored, hash_token(&token));
        assert!(e.verify_token(&token));
        assert!(!e.verify_token("guess"));
        assert!(e
            .add_line_item(LineItem::new(ContentType::Tools, "Saw", 1.0, "day", Cents(100)))
            .is_err());
    }

    #[test]
    fn test_send_requires_line_items() {
        let mut e = Estimate::new("EST-2026-0002", client(), ProjectInfo::default()).unwrap();
        assert!(matches!(e.send(0, DAY), Err(JobsiteError::Validation(_))));
    }

    #[test]
    fn test_accept_flow() {
        let mut e = draft();
        let token = e.send(0, 30 * DAY).unwrap();
        assert!(matches!(
            e.accept("wrong", "Dana", None, DAY),
            Err(JobsiteError::PermissionDenied)
        ));
        assert!(e.mark_viewed(&token, DAY).unwrap());
        assert!(!e.mark_viewed(&token, DAY).unwrap());
        assert_eq!(e.status, EstimateStatus::Viewed);
        assert!(e.accept(&token, "  ", None, DAY).is_err());
        e.accept(&token, "Dana Client", Some("Looks good".into()), 2 * DAY)
            .unwrap();
        assert_eq!(e.status, EstimateStatus::Accepted);
        assert_eq!(e.approval.as_ref().unwrap().decision, Decision::Accepted);
        assert!(matches!(
            e.reject(&token, None, 2 * DAY),
            Err(JobsiteError::InvalidState(_))
        ));
        assert!(e.revise("change", 3 * DAY).is_err());
    }

    #[test]
    fn test_expired_estimate_cannot_be_accepted_but_can_be_revised() {
        let mut e = draft();
        let token = e.send(0, DAY).unwrap();
        assert!(matches!(
            e.accept(&token, "Dana", None, 2 * DAY),
            Err(JobsiteError::InvalidState(_))
        ));
        assert_eq!(e.status, EstimateStatus::Expired);

        assert_eq!(e.revise("new pricing", 3 * DAY).unwrap(), 1);
        assert_eq!(e.status, EstimateStatus::Draft);
        assert!(e.share_token_hash.is_none());
        assert!(!e.verify_token(&token));
        assert_eq!(e.revisions[0].status_before, EstimateStatus::Expired);
        assert_eq!(e.revisions[0].totals.subtotal, Cents(20_000));

        let token2 = e.send(3 * DAY, DAY).unwrap();
        assert_ne!(token, token2);
        e.reject(&token2, Some("too expensive".into()), 3 * DAY)
            .unwrap();
        assert_eq!(e.status, EstimateStatus::Rejected);
        assert_eq!(e.revise("cheaper", 4 * DAY).unwrap(), 2);
    }

    #[test]
    fn test_from_collection_prices_selected_items() {
        let catalog = sample_catalog();
        let romex = catalog
            .items()
            .find(|i| i.name == "12/2 Romex")
            .unwrap()
            .id
            .clone();
        let mut collection = Collection::new("Rewire").unwrap();
        collection
            .select_item(ContentType::Products, &romex, 2.0, &catalog)
            .unwrap();
        let e = Estimate::from_collection(
            "EST-2026-0003",
            &collection,
            &catalog,
            client(),
            ProjectInfo::default(),
        )
        .unwrap();
        assert_eq!(e.collection_id, Some(collection.id.clone()));
        assert_eq!(e.line_items.len(), 1);
        let line = &e.line_items[0];
        assert_eq!(line.total(), Cents(17_800));
        assert_eq!(line.section.as_deref(), Some("Rough-In"));
        assert_eq!(line.category.as_deref(), Some("Wire"));
        assert!(line.taxable);
    }

    #[test]
    fn test_client_view_hides_columns() {
        let mut e = draft();
        e.set_client_view(ClientViewSettings {
            grouping: Grouping::ContentType,
            show_unit_prices: false,
            show_tax_breakdown: false,
            ..Default::default()
        });
        let view = ClientView::render(&e).unwrap();
        let titles: Vec<&str> = view.groups.iter().map(|g| g.title.as_str()).collect();
        assert_eq!(titles, vec!["Products", "Labor"]);
        assert!(view.groups[0].lines[0].unit_price.is_none());
        assert_eq!(view.groups[0].lines[0].total, Some(Cents(10_000)));
        assert!(view.totals.tax.is_none());

        let json = serde_json::to_value(&view).unwrap();
        assert!(json["groups"][0]["lines"][0].get("unitPrice").is_none());

        e.set_client_view(ClientViewSettings::default());
        let view = ClientView::render(&e).unwrap();
        assert_eq!(view.groups.len(), 1);
        assert_eq!(view.groups[0].title, "Framing");
        assert_eq!(view.groups[0].subtotal, Some(Cents(20_000)));
    }

    #[test]
    fn test_estimate_numbers() {
        let existing = ["EST-2026-0007", "EST-2026-0012", "EST-2025-0099", "OTHER-2026-0500"];
        assert_eq!(
            next_estimate_number("EST", 2026, existing.iter().copied()).unwrap(),
            "EST-2026-0013"
        );
        assert_eq!(
            next_estimate_number("EST", 2027, existing.iter().copied()).unwrap(),
            "EST-2027-0001"
        );
        let last = ["EST-2026-4294967295"];
        assert!(matches!(
            next_estimate_number("EST", 2026, last.iter().copied()),
            Err(JobsiteError::InvalidState(_))
        ));
        assert_eq!(year_of(0), 1970);
        assert_eq!(year_of(1_767_225_600_000), 2026);
        assert_eq!(year_of(1_767_225_599_999), 2025);
    }

    #[test]
    fn test_oversized_lines_are_rejected() {
        let mut e = draft();
        e.set_tax_rate(825).unwrap();
        let wire = LineItem::new(ContentType::Products, "Wire", 1e30, "ft", Cents(100));
        assert!(matches!(wire.validate(), Err(JobsiteError::Validation(_))));
        assert!(e.add_line_item(wire).is_err());

        let pricey = LineItem::new(
            ContentType::Equipment,
            "Crane",
            1.0,
            "day",
            Cents(MAX_UNIT_PRICE.0 + 1),
        );
        assert!(e.add_line_item(pricey).is_err());
        assert_eq!(e.line_items.len(), 2);

        let line_id = e.line_items[0].id.clone();
        assert!(e
            .update_line_item(&line_id, Some(MAX_QUANTITY * 2.0), None)
            .is_err());
        assert_eq!(e.line_items[0].quantity, 10.0);
        assert!(e.totals().is_ok());
    }

    #[test]
    fn test_largest_allowed_lines_total_with_full_tax() {
        let mut e = Estimate::new("EST-2026-0003", client(), ProjectInfo::default()).unwrap();
        for name in ["Crane", "Excavator"] {
            e.add_line_item(LineItem::new(
                ContentType::Equipment,
                name,
                MAX_QUANTITY,
                "day",
                MAX_UNIT_PRICE,
            ))
            .unwrap();
        }
        e.set_tax_rate(FULL_BPS).unwrap();
        let line_total = MAX_UNIT_PRICE.scale(MAX_QUANTITY);
        let totals = e.totals().unwrap();
        assert_eq!(totals.subtotal, Cents(line_total.0 * 2));
        assert_eq!(totals.tax, totals.subtotal);
        assert_eq!(totals.total, Cents(line_total.0 * 4));

        e.set_discount(Discount::Amount(Cents(i64::MAX))).unwrap();
        let totals = e.totals().unwrap();
        assert_eq!(totals.discount, totals.subtotal);
        assert_eq!(totals.total, Cents::ZERO);
    }

    #[test]
    fn test_totals_overflow_is_a_validation_error() {
        // Stored documents are not re-validated on load.
        let mut huge = LineItem::new(ContentType::Products, "Wire", 1.0, "ft", Cents(100));
        huge.quantity = 1e30;
        assert!(matches!(
            Totals::compute(std::slice::from_ref(&huge), &Discount::None, 825),
            Err(JobsiteError::Validation(_))
        ));

        let mut e = draft();
        e.line_items.push(huge);
        assert!(e.totals().is_err());
        assert!(ClientView::render(&e).is_err());
        let small = LineItem::new(ContentType::Tools, "Tape", 1.0, "ea", Cents(500));
        assert!(e.add_line_item(small).is_err());
        assert_eq!(e.line_items.len(), 3);
        assert!(matches!(e.send(0, DAY), Err(JobsiteError::Validation(_))));
        assert_eq!(e.status, EstimateStatus::Draft);
    }

    #[test]
    fn test_send_rejects_validity_past_the_clock_range() {
        let mut e = draft();
        assert!(matches!(
            e.send(i64::MAX - DAY / 2, DAY),
            Err(JobsiteError::Validation(_))
        ));
        assert_eq!(e.status, EstimateStatus::Draft);
        assert!(e.share_token_hash.is_none());
    }
}
