//! # jobsite-core
//!
//! Back-office core for a small contracting business: reusable **collections** of inventory
//! categories, **estimates** priced from those collections and approved by the client through a
//! share link, and **work orders** that track the accepted job to completion. Everything is stored
//! as JSON documents in a [store::DocumentStore], with SQLite as the production backend.
//!
//! ## Overview
//!
//! The inventory is a catalog of [inventory::InventoryItem]s (products, labor, materials), each
//! filed under a category path of up to five levels:
//!
//! ```text
//! Trade / Section / Category / Subcategory / Type
//! Electrical / Rough-In / Boxes / Old Work / Single Gang
//! ```
//!
//! A [collection::Collection] records, per content type, which parts of that hierarchy a job
//! template covers. Selecting a prefix covers everything below it; the selection lives in a
//! [hierarchy::SelectionTrie], so "Electrical" and "Electrical / Rough-In" never appear as two
//! separate selections. Collections written by older clients store a flat list of category
//! names instead; those are recognized on load and upgraded to the hierarchical form.
//!
//! From a collection, the [service::JobsiteService] prices an [estimate::Estimate]. Estimates
//! move through a small lifecycle:
//!
//! ```text
//! Draft -> Sent -> Viewed -> Accepted
//!             \        \--> Rejected
//!              \--> Expired          (revise -> Draft, keeping a Revision)
//! ```
//!
//! Sending mints a share token. Only its SHA-256 hash is stored; the client proves possession of
//! the token to view, accept or reject. An accepted estimate becomes a
//! [work_order::WorkOrder] with labor tasks, material readiness and milestones.
//!
//! ## Persistence
//!
//! - [store::TypedStore] reads and writes any [store::Document] by collection name
//! - [diff::Patch] computes field-level changes between two snapshots, which
//!   [autosave::AutoSaver] writes after a debounce instead of rewriting whole documents
//! - [cache::ProductCache] keeps a JSON copy of the catalog on disk with a time-to-live
//! - [mail::OutboxMailer] queues client email in the `mail_outbox` collection
//!
//! Every write the service performs is broadcast as an [event::Event].
//!
//! ## Features
//!
//! - **default**: `service`
//! - **service**: SQLite store ([db]), [service::JobsiteService] and the axum router in [http]
//! - **bin**: the `jobsite` command line tool
//!
//! Without `service` the crate is the domain model plus the in-memory store, which is enough to
//! build and price collections and estimates in tests or embedded callers.
//!
//! ## Errors
//!
//! All fallible operations return [JobsiteError], which maps onto an HTTP status through
//! [JobsiteError::status_code].

#[cfg(not(target_arch = "wasm32"))]
pub mod autosave;
pub mod cache;
pub mod collection;
pub mod commands;
pub mod config;
#[cfg(feature = "service")]
pub mod db;
pub mod diff;
pub mod error;
pub mod estimate;
pub mod event;
pub mod hierarchy;
#[cfg(feature = "service")]
pub mod http;
pub mod inventory;
pub mod mail;
pub mod properties;
#[cfg(all(feature = "service", not(target_arch = "wasm32")))]
pub mod service;
pub mod store;
pub mod work_order;

pub use error::*;
