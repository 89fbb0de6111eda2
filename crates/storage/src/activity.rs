//! Activity log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One restricted-method invocation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: Uuid,
    pub subject: String,
    pub method: String,
    pub request_time: DateTime<Utc>,
    pub response_time: Option<DateTime<Utc>>,
    pub success: bool,
}

impl ActivityEntry {
    /// Start an entry for a request made now.
    pub fn begin(subject: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            method: method.into(),
            request_time: Utc::now(),
            response_time: None,
            success: false,
        }
    }

    /// Mark the entry answered.
    pub fn finish(mut self, success: bool) -> Self {
        self.response_time = Some(Utc::now());
        self.success = success;
        self
    }
}
