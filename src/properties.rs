//! [crate::properties] contains the basic value types shared by every document kind: document
//! identifiers, the content-type enum that keys per-content state, and integer money.
pub use enumset::EnumSet;
use enumset::EnumSetType;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    ops::{Add, AddAssign, Deref, Sub},
    time::{SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

use crate::error::JobsiteError;

/// Namespace for ids derived from stable keys (category tabs, etc.)
pub const JOBSITE_NAMESPACE: Uuid = Uuid::from_u128(0x6a0b_5e1c_93d4_4b8f_a2c1_77e0_1d3f_9b42);

/// Identifier of a document within its collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocId(String);

impl DocId {
    pub fn new() -> DocId {
        DocId(Uuid::new_v4().simple().to_string())
    }

    /// Stable id for `key` within `namespace`. The same inputs always give the same id.
    pub fn derived(namespace: &str, key: &str) -> DocId {
        let ns = Uuid::new_v5(&JOBSITE_NAMESPACE, namespace.as_bytes());
        DocId(Uuid::new_v5(&ns, key.as_bytes()).simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DocId {
    fn default() -> Self {
        DocId::new()
    }
}

impl Display for DocId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for DocId {
    type Error = JobsiteError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.contains(['/', '"']) {
            return Err(JobsiteError::Validation(format!(
                "'{value}' is not a valid document id"
            )));
        }
        Ok(DocId(trimmed.to_string()))
    }
}

impl TryFrom<String> for DocId {
    type Error = JobsiteError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DocId::try_from(value.as_str())
    }
}

impl From<DocId> for String {
    fn from(id: DocId) -> String {
        id.0
    }
}

impl From<&DocId> for String {
    fn from(id: &DocId) -> String {
        id.0.clone()
    }
}

impl Deref for DocId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

/// The four kinds of things a contractor puts on a job.
#[derive(Debug, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumSetType)]
#[enumset(serialize_repr = "list")]
#[serde(rename_all = "camelCase")]
pub enum ContentType {
    Products,
    Labor,
    Tools,
    Equipment,
}

pub type ContentSet = EnumSet<ContentType>;

impl ContentType {
    pub fn all() -> ContentSet {
        EnumSet::all()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Products => "products",
            ContentType::Labor => "labor",
            ContentType::Tools => "tools",
            ContentType::Equipment => "equipment",
        }
    }
}

impl Display for ContentType {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ContentType {
    type Error = JobsiteError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_lowercase().as_str() {
            "products" | "product" => Ok(ContentType::Products),
            "labor" | "labour" => Ok(ContentType::Labor),
            "tools" | "tool" => Ok(ContentType::Tools),
            "equipment" => Ok(ContentType::Equipment),
            other => Err(JobsiteError::Validation(format!(
                "unknown content type '{other}'"
            ))),
        }
    }
}

/// Per-content-type state in a single map instead of four parallel fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentMap<T>(BTreeMap<ContentType, T>);

impl<T> Default for ContentMap<T> {
    fn default() -> Self {
        ContentMap(BTreeMap::new())
    }
}

impl<T> ContentMap<T> {
    pub fn get(&self, content_type: ContentType) -> Option<&T> {
        self.0.get(&content_type)
    }

    pub fn get_mut(&mut self, content_type: ContentType) -> Option<&mut T> {
        self.0.get_mut(&content_type)
    }

    pub fn insert(&mut self, content_type: ContentType, value: T) -> Option<T> {
        self.0.insert(content_type, value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ContentType, &T)> {
        self.0.iter().map(|(ct, v)| (*ct, v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T: Default> ContentMap<T> {
    pub fn entry_or_default(&mut self, content_type: ContentType) -> &mut T {
        self.0.entry(content_type).or_default()
    }
}

/// Money as an integer count of cents.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cents(pub i64);

/// 100% expressed in basis points.
pub const FULL_BPS: i64 = 10_000;

impl Cents {
    pub const ZERO: Cents = Cents(0);

    pub fn from_dollars(dollars: f64) -> Cents {
        Cents((dollars * 100.0).round() as i64)
    }

    /// Price of `quantity` units at this unit price, rounded half away from zero.
    pub fn scale(&self, quantity: f64) -> Cents {
        Cents((self.0 as f64 * quantity).round() as i64)
    }

    /// `bps` basis points of this amount, rounded half away from zero.
    pub fn percent_bps(&self, bps: i64) -> Cents {
        let numerator = self.0 as i128 * bps as i128;
        let denom = FULL_BPS as i128;
        let half = denom / 2;
        let rounded = if numerator >= 0 {
            (numerator + half) / denom
        } else {
            (numerator - half) / denom
        };
        Cents(rounded as i64)
    }

    pub fn checked_add(self, other: Cents) -> Option<Cents> {
        self.0.checked_add(other.0).map(Cents)
    }

    pub fn checked_sub(self, other: Cents) -> Option<Cents> {
        self.0.checked_sub(other.0).map(Cents)
    }

    pub fn min(self, other: Cents) -> Cents {
        Cents(self.0.min(other.0))
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }
}

// Operators saturate. Totals go through the checked methods instead.
impl Add for Cents {
    type Output = Cents;
    fn add(self, rhs: Cents) -> Cents {
        Cents(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Cents {
    fn add_assign(&mut self, rhs: Cents) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for Cents {
    type Output = Cents;
    fn sub(self, rhs: Cents) -> Cents {
        Cents(self.0.saturating_sub(rhs.0))
    }
}

impl std::iter::Sum for Cents {
    fn sum<I: Iterator<Item = Cents>>(iter: I) -> Cents {
        iter.fold(Cents::ZERO, |acc, c| acc + c)
    }
}

impl Display for Cents {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let dollars = (abs / 100).to_string();
        let mut grouped = String::with_capacity(dollars.len() + dollars.len() / 3);
        for (idx, ch) in dollars.chars().enumerate() {
            if idx > 0 && (dollars.len() - idx) % 3 == 0 {
                grouped.push(',');
            }
            grouped.push(ch);
        }
        write!(f, "{sign}${grouped}.{:02}", abs % 100)
    }
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// UTC (year, month, day) of a unix millisecond timestamp.
pub fn civil_date(millis: i64) -> (i64, u32, u32) {
    // Howard Hinnant's days-to-civil
    let z = millis.div_euclid(MILLIS_PER_DAY) + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (yoe + era * 400 + i64::from(month <= 2), month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_derived_ids_are_stable() {
        let a = DocId::derived("tab", "products/framing/lumber");
        let b = DocId::derived("tab", "products/framing/lumber");
        let c = DocId::derived("tab", "products/framing/fasteners");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(DocId::new(), DocId::new());
    }

    #[test]
    fn test_doc_id_rejects_blank_and_slash() {
        assert!(DocId::try_from("  ").is_err());
        assert!(DocId::try_from("a/b").is_err());
        assert_eq!(DocId::try_from(" abc ").unwrap().as_str(), "abc");
    }

    #[test]
    fn test_doc_id_deserialize_is_validated() {
        let id: DocId = serde_json::from_str("\"abc123\"").unwrap();
        assert_eq!(id.as_str(), "abc123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc123\"");
        assert!(serde_json::from_str::<DocId>("\"a\\\"b\"").is_err());
        assert!(serde_json::from_str::<DocId>("\"a/b\"").is_err());
        assert!(serde_json::from_str::<DocId>("\"\"").is_err());

        let keyed: BTreeMap<DocId, u8> = serde_json::from_str(r#"{"x1": 1}"#).unwrap();
        assert_eq!(keyed.get(&DocId::try_from("x1").unwrap()), Some(&1));
    }

    #[test]
    fn test_cents_rounding_and_display() {
        assert_eq!(Cents(1999).scale(3.0), Cents(5997));
        assert_eq!(Cents(1000).scale(0.333), Cents(333));
        assert_eq!(Cents(10_000).percent_bps(825), Cents(825));
        assert_eq!(Cents(1234).percent_bps(5000), Cents(617));
        assert_eq!(Cents(123_456_789).to_string(), "$1,234,567.89");
        assert_eq!(Cents(-5).to_string(), "-$0.05");
        assert_eq!(Cents(100_000).to_string(), "$1,000.00");
    }

    #[test]
    fn test_cents_arithmetic_never_wraps() {
        assert_eq!(Cents(i64::MAX).checked_add(Cents(1)), None);
        assert_eq!(Cents(i64::MIN).checked_sub(Cents(1)), None);
        assert_eq!(Cents(i64::MAX) + Cents(1), Cents(i64::MAX));
        assert_eq!(Cents(i64::MIN) - Cents(1), Cents(i64::MIN));
        let mut total = Cents(i64::MAX - 1);
        total += Cents(10);
        assert_eq!(total, Cents(i64::MAX));
        assert_eq!(Cents(1).scale(1e30), Cents(i64::MAX));
    }

    #[test]
    fn test_content_map_keyed_by_enum() {
        let mut map = ContentMap::<Vec<u8>>::default();
        map.entry_or_default(ContentType::Labor).push(1);
        map.entry_or_default(ContentType::Labor).push(2);
        assert_eq!(map.get(ContentType::Labor), Some(&vec![1, 2]));
        assert!(map.get(ContentType::Tools).is_none());
        assert_eq!(
            ContentType::try_from("Labour").unwrap(),
            ContentType::Labor
        );
    }
}
