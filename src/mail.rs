//! Outgoing email, persisted to an outbox collection.
//!
//! Delivery itself happens elsewhere: an external worker drains `mail_outbox` and marks each
//! message sent or failed.
use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::{
    error::JobsiteError,
    estimate::{Decision, Estimate},
    properties::{civil_date, now_millis, DocId},
    store::{Document, DocumentStore, TypedStore},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MailStatus {
    #[default]
    Queued,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingEmail {
    pub id: DocId,
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub status: MailStatus,
    pub created_at: i64,
    /// Estimate or work order the message is about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_id: Option<DocId>,
}

impl Document for OutgoingEmail {
    const COLLECTION: &'static str = "mail_outbox";

    fn doc_id(&self) -> &DocId {
        &self.id
    }
}

impl OutgoingEmail {
    pub fn new(to: &str, subject: &str, body: String) -> Result<OutgoingEmail, JobsiteError> {
        let to = to.trim();
        if to.is_empty() || !to.contains('@') {
            return Err(JobsiteError::Validation(format!(
                "'{to}' is not an email address"
            )));
        }
        Ok(OutgoingEmail {
            id: DocId::new(),
            to: to.to_string(),
            subject: subject.to_string(),
            body,
            status: MailStatus::Queued,
            created_at: now_millis(),
            related_id: None,
        })
    }
}

pub trait Mailer: Sync {
    fn queue(
        &self,
        email: OutgoingEmail,
    ) -> impl Future<Output = Result<OutgoingEmail, JobsiteError>> + Send;
}

/// [Mailer] that writes every message to the outbox collection of a [DocumentStore].
#[derive(Debug, Clone)]
pub struct OutboxMailer<S> {
    store: S,
}

impl<S: DocumentStore> OutboxMailer<S> {
    pub fn new(store: S) -> OutboxMailer<S> {
        OutboxMailer { store }
    }

    pub async fn outbox(&self) -> Result<Vec<OutgoingEmail>, JobsiteError> {
        let mut mail: Vec<OutgoingEmail> = self.store.list(Vec::new()).await?;
        mail.sort_by_key(|m| m.created_at);
        Ok(mail)
    }
}

impl<S: DocumentStore> Mailer for OutboxMailer<S> {
    async fn queue(&self, email: OutgoingEmail) -> Result<OutgoingEmail, JobsiteError> {
        self.store.save(&email).await?;
        tracing::info!("Queued email '{}' to {}", email.subject, email.to);
        Ok(email)
    }
}

pub fn client_estimate_link(base_url: &str, estimate_id: &DocId, token: &str) -> String {
    format!(
        "{}/client/estimates/{estimate_id}?token={token}",
        base_url.trim_end_matches('/')
    )
}

/// Message to the client carrying the share link. Requires a client email address.
pub fn estimate_sent_email(
    estimate: &Estimate,
    company_name: &str,
    base_url: &str,
    token: &str,
) -> Result<OutgoingEmail, JobsiteError> {
    let to = estimate.client.email.as_deref().ok_or_else(|| {
        JobsiteError::Validation(format!(
            "client of estimate {} has no email address",
            estimate.number
        ))
    })?;
    let totals = estimate.totals()?;
    let mut body = format!(
        "Hello {},\n\n{company_name} has prepared estimate {} for {}.\nTotal: {}\n",
        estimate.client.name,
        estimate.number,
        if estimate.project.name.is_empty() {
            "your project"
        } else {
            estimate.project.name.as_str()
        },
        totals.total,
    );
    if let Some(until) = estimate.valid_until {
        body.push_str(&format!(
            "This estimate is valid until {} (UTC).\n",
            format_date(until)
        ));
    }
    body.push_str(&format!(
        "\nReview and respond here:\n{}\n",
        client_estimate_link(base_url, &estimate.id, token)
    ));
    let mut email = OutgoingEmail::new(
        to,
        &format!("Estimate {} from {company_name}", estimate.number),
        body,
    )?;
    email.related_id = Some(estimate.id.clone());
    Ok(email)
}

/// Notice to the company that the client decided.
pub fn estimate_decision_email(
    estimate: &Estimate,
    company_email: &str,
) -> Result<OutgoingEmail, JobsiteError> {
    let approval = estimate.approval.as_ref().ok_or_else(|| {
        JobsiteError::InvalidState(format!("estimate {} has no decision", estimate.number))
    })?;
    let verb = match approval.decision {
        Decision::Accepted => "accepted",
        Decision::Rejected => "rejected",
    };
    let total = estimate.totals()?.total;
    let mut body = format!(
        "{} {verb} estimate {} ({total}).\n",
        approval
            .signer
            .as_deref()
            .unwrap_or(estimate.client.name.as_str()),
        estimate.number,
    );
    if let Some(comment) = approval.comment.as_deref() {
        body.push_str(&format!("\nComment:\n{comment}\n"));
    }
    let mut email = OutgoingEmail::new(
        company_email,
        &format!("Estimate {} {verb}", estimate.number),
        body,
    )?;
    email.related_id = Some(estimate.id.clone());
    Ok(email)
}

/// `YYYY-MM-DD` for a unix millisecond timestamp.
pub fn format_date(millis: i64) -> String {
    let (year, month, day) = civil_date(millis);
    format!("{year:04}-{month:02}-{day:02}")
}
