//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use jobsite_core::{
    config::{AppConfig, ConfigProvider, TomlConfigProvider, CONFIG_FILE},
    hierarchy::CategoryPath,
    inventory::InventoryItem,
    properties::{Cents, ContentType},
};
use std::path::Path;

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; later calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Write a jobsite.toml into `dir` with a short auto-save debounce and known company details.
#[allow(dead_code)]
pub fn write_test_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.company.name = "Acme Builders".to_string();
    config.company.email = "office@acme.test".to_string();
    config.autosave.debounce_ms = 50;
    config.estimates.default_tax_rate_bps = 1_000;
    config.server.public_base_url = "https://jobs.acme.test".to_string();
    TomlConfigProvider::new(dir.join(CONFIG_FILE))
        .set_config(&config)
        .unwrap();
    config
}

fn item(name: &str, ct: ContentType, path: &str, unit: &str, cents: i64) -> InventoryItem {
    let path: CategoryPath = path.parse().unwrap();
    InventoryItem::new(name, ct, path, unit, Cents(cents))
}

/// A small catalog spanning two trades and three content types.
#[allow(dead_code)]
pub fn sample_items() -> Vec<InventoryItem> {
    vec![
        item(
            "Old work box",
            ContentType::Products,
            "Electrical / Rough-In / Boxes",
            "ea",
            250,
        ),
        item(
            "12/2 Romex",
            ContentType::Products,
            "Electrical / Rough-In / Wire",
            "ft",
            85,
        ),
        item(
            "Duplex receptacle",
            ContentType::Products,
            "Electrical / Finish / Devices",
            "ea",
            399,
        ),
        item(
            "Electrician",
            ContentType::Labor,
            "Electrical / Rough-In",
            "hr",
            9_500,
        ),
        item(
            "PEX 1/2in",
            ContentType::Products,
            "Plumbing / Supply / Pipe",
            "ft",
            60,
        ),
        item(
            "Fish tape",
            ContentType::Tools,
            "Electrical / Rough-In",
            "ea",
            0,
        ),
    ]
}
