//! Permission history entries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable approval and usage record for one (subject, target) pair.
///
/// Survives revocation. Timestamps only ever move forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub subject: String,
    pub target: String,
    pub last_approved: DateTime<Utc>,
    /// Every account ever exposed to the subject through this target, with
    /// the last time it was.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub accounts: BTreeMap<String, DateTime<Utc>>,
}

impl HistoryEntry {
    pub fn new(
        subject: impl Into<String>,
        target: impl Into<String>,
        at: DateTime<Utc>,
        accounts: &[String],
    ) -> Self {
        let mut entry = Self {
            subject: subject.into(),
            target: target.into(),
            last_approved: at,
            accounts: BTreeMap::new(),
        };
        entry.observe(at, accounts);
        entry
    }

    /// Fold an observation made at `at` into this entry.
    ///
    /// Accounts accumulate; each timestamp keeps its maximum, so an
    /// out-of-order observation never moves anything backward.
    pub fn observe(&mut self, at: DateTime<Utc>, accounts: &[String]) {
        self.last_approved = self.last_approved.max(at);
        for account in accounts {
            self.accounts
                .entry(account.clone())
                .and_modify(|seen| *seen = (*seen).max(at))
                .or_insert(at);
        }
    }
}
