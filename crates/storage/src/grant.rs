//! Persisted grant records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The stored form of an active grant.
///
/// Caveats are kept as their JSON wire shape; interpreting them is the
/// permission layer's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantRecord {
    pub id: Uuid,
    pub subject: String,
    pub target: String,
    pub caveats: Value,
    pub granted_at: DateTime<Utc>,
}
