//! Granted permissions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Caveat, CaveatType, SubjectId};

/// Unique identifier of a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantId(pub Uuid);

impl GrantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GrantId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GrantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An active grant of one target to one subject.
///
/// Serializes to the wire shape consumed by permission UIs:
/// `{ id, targetName, caveats, invoker, dateApproved }`, with
/// `dateApproved` in milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub id: GrantId,
    pub target_name: String,
    pub caveats: Vec<Caveat>,
    pub invoker: SubjectId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub date_approved: DateTime<Utc>,
}

impl Permission {
    pub fn new(invoker: SubjectId, target_name: impl Into<String>, caveats: Vec<Caveat>) -> Self {
        Self {
            id: GrantId::new(),
            target_name: target_name.into(),
            caveats,
            invoker,
            date_approved: Utc::now(),
        }
    }

    pub fn caveat(&self, ty: &CaveatType) -> Option<&Caveat> {
        self.caveats.iter().find(|c| &c.caveat_type() == ty)
    }

    /// Accounts listed by a `restrictReturnedAccounts` caveat, if any.
    pub fn permitted_accounts(&self) -> &[String] {
        match self.caveat(&CaveatType::RestrictReturnedAccounts) {
            Some(Caveat::RestrictReturnedAccounts(accounts)) => accounts,
            _ => &[],
        }
    }
}
