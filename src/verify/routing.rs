//! Tenant data routing checks on the recipient.
//!
//! A collection in a database owned by the migrating tenant must arrive on
//! the recipient intact; any other database must not arrive at all.

use std::collections::BTreeMap;

use serde_json::{Number, Value};
use tracing::{debug, instrument};

use crate::cluster::NodeHandle;
use crate::cluster::types::{MigrationDescriptor, is_tenant_database};
use crate::error::{Error, Result};

/// Difference between the recipient's collection and the expected documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingReport {
    /// Whether the database belongs to the migrating tenant.
    pub should_have_migrated: bool,
    /// Documents found on the recipient.
    pub found: usize,
    /// Expected documents missing on the recipient.
    pub missing: usize,
    /// Recipient documents that were not expected.
    pub unexpected: usize,
}

impl RoutingReport {
    /// Check if the recipient holds exactly what it should.
    pub fn is_ok(&self) -> bool {
        self.missing == 0 && self.unexpected == 0
    }
}

/// Verifies that tenant data, and only tenant data, reached the recipient.
#[derive(Debug, Clone, Copy, Default)]
pub struct TenantRoutingVerifier;

impl TenantRoutingVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Compare `db_name.coll_name` on `recipient` against `expected`.
    ///
    /// For a tenant database the collections must be equal as multisets.
    /// For any other database the recipient collection must be empty.
    #[instrument(skip_all, fields(tenant_id = %descriptor.tenant_id, db = %db_name, coll = %coll_name))]
    pub async fn verify_recipient_data<N: NodeHandle>(
        &self,
        recipient: &N,
        descriptor: &MigrationDescriptor,
        db_name: &str,
        coll_name: &str,
        expected: &[Value],
    ) -> Result<RoutingReport> {
        let should_have_migrated = is_tenant_database(&descriptor.tenant_id, db_name);
        let found = recipient.find_documents(db_name, coll_name).await?;

        let report = if should_have_migrated {
            compare_multisets(expected, &found)
        } else {
            RoutingReport {
                should_have_migrated: false,
                found: found.len(),
                missing: 0,
                unexpected: found.len(),
            }
        };
        debug!(?report, "Recipient data compared");

        if report.is_ok() {
            return Ok(report);
        }
        let message = if should_have_migrated {
            format!(
                "{}.{} on {} does not match donor data: {} missing, {} unexpected",
                db_name,
                coll_name,
                recipient.host(),
                report.missing,
                report.unexpected
            )
        } else {
            format!(
                "{}.{} does not belong to tenant {} but {} document(s) reached {}",
                db_name,
                coll_name,
                descriptor.tenant_id,
                report.unexpected,
                recipient.host()
            )
        };
        Err(Error::Routing(message))
    }
}

fn compare_multisets(expected: &[Value], found: &[Value]) -> RoutingReport {
    let mut counts: BTreeMap<String, i64> = BTreeMap::new();
    for doc in expected {
        *counts.entry(canonical(doc)).or_default() += 1;
    }
    for doc in found {
        *counts.entry(canonical(doc)).or_default() -= 1;
    }

    let mut missing = 0usize;
    let mut unexpected = 0usize;
    for count in counts.values() {
        if *count > 0 {
            missing += count.unsigned_abs() as usize;
        } else if *count < 0 {
            unexpected += count.unsigned_abs() as usize;
        }
    }

    RoutingReport {
        should_have_migrated: true,
        found: found.len(),
        missing,
        unexpected,
    }
}

/// Encoding of a document that ignores key order and the integer/float
/// distinction for integral numbers, so `{"x": 1}` and `{"x": 1.0}` match.
fn canonical(doc: &Value) -> String {
    normalize(doc).to_string()
}

/// Largest magnitude below which every integral `f64` is exact.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            // Sorted explicitly: with `preserve_order` the map keeps insertion order.
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), normalize(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Number(number) => normalize_number(number),
        other => other.clone(),
    }
}

fn normalize_number(number: &Number) -> Value {
    if number.is_f64()
        && let Some(f) = number.as_f64()
        && f.fract() == 0.0
        && f.abs() < MAX_EXACT_INTEGER
    {
        return Value::from(f as i64);
    }
    Value::Number(number.clone())
}
