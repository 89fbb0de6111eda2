//! Pending permission requests awaiting a user decision.

use std::fmt;

use chrono::{DateTime, Utc};
use permissions::{Caveat, Permission, SubjectId};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::controller::events;
use crate::{Error, PermissionController, Result};

/// Identifier of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request in the `Requested` state. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: RequestId,
    pub subject: SubjectId,
    pub target: String,
    pub caveats: Vec<Caveat>,
    pub requested_at: DateTime<Utc>,
}

pub(crate) struct Parked {
    request: PendingRequest,
    reply: oneshot::Sender<permissions::Result<Permission>>,
}

/// Unparks a request when its requester stops waiting.
struct ParkedGuard<'a> {
    controller: &'a PermissionController,
    id: RequestId,
}

impl Drop for ParkedGuard<'_> {
    fn drop(&mut self) {
        if self.controller.pending.lock().remove(&self.id).is_some() {
            debug!(request = %self.id, "requester stopped waiting; request dropped");
        }
    }
}

impl PermissionController {
    /// Park a request until it is approved, rejected or abandoned.
    ///
    /// The target and caveats are validated up front, then
    /// `approvalRequested` is published with the pending request. Nothing is
    /// granted or recorded unless the request is approved.
    pub async fn request_with_approval(
        &self,
        subject: &SubjectId,
        target: &str,
        caveats: Vec<Caveat>,
    ) -> Result<Permission> {
        self.specifications.get(target)?.validate_caveats(&caveats)?;

        let request = PendingRequest {
            id: RequestId::new(),
            subject: subject.clone(),
            target: target.to_string(),
            caveats,
            requested_at: Utc::now(),
        };
        let id = request.id;
        let payload = serde_json::to_value(&request)?;
        let (reply, decision) = oneshot::channel();
        self.pending.lock().insert(id, Parked { request, reply });
        let _parked = ParkedGuard { controller: self, id };

        debug!(request = %id, subject = %subject, target, "awaiting approval");
        self.publish(events::APPROVAL_REQUESTED, payload);

        match decision.await {
            Ok(result) => Ok(result?),
            // Sender dropped with the controller.
            Err(_) => Err(permissions::Error::Abandoned(id.to_string()).into()),
        }
    }

    /// Approve a pending request, optionally with different caveats.
    ///
    /// If granting fails (for instance the override carries a caveat the
    /// target does not accept) the request stays pending. The pending table
    /// stays locked while granting, so a concurrent disconnect abandons the
    /// request either before the grant or after it is stored.
    pub fn approve_request(&self, id: &RequestId, caveats: Option<Vec<Caveat>>) -> Result<Permission> {
        let mut pending = self.pending.lock();
        let parked = pending.remove(id).ok_or_else(|| unknown_request(id))?;
        if parked.reply.is_closed() {
            drop(pending);
            warn!(request = %id, "requester went away before approval");
            return Err(permissions::Error::Abandoned(id.to_string()).into());
        }

        let caveats = caveats.unwrap_or_else(|| parked.request.caveats.clone());
        let permission = match self.grant(&parked.request.subject, &parked.request.target, caveats) {
            Ok(permission) => permission,
            Err(e) => {
                pending.insert(*id, parked);
                return Err(e);
            }
        };
        drop(pending);

        info!(request = %id, "permission request approved");
        if parked.reply.send(Ok(permission.clone())).is_err() {
            debug!(request = %id, "requester dropped before receiving approval");
        }
        self.publish(events::PERMISSION_GRANTED, serde_json::to_value(&permission)?);
        Ok(permission)
    }

    /// Reject a pending request; the requester receives `Rejected`.
    pub fn reject_request(&self, id: &RequestId) -> Result<()> {
        let parked = self.take_pending(id)?;
        info!(request = %id, subject = %parked.request.subject, "permission request rejected");
        // A requester that already went away needs no answer.
        let _ = parked
            .reply
            .send(Err(permissions::Error::Rejected(id.to_string())));
        Ok(())
    }

    /// Requests awaiting a decision, oldest first.
    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        let mut requests: Vec<_> = self
            .pending
            .lock()
            .values()
            .map(|parked| parked.request.clone())
            .collect();
        requests.sort_by_key(|request| request.requested_at);
        requests
    }

    /// Abandon every pending request of `subject`. Returns how many.
    pub(crate) fn abandon_requests(&self, subject: &SubjectId) -> usize {
        let mut pending = self.pending.lock();
        let ids: Vec<RequestId> = pending
            .iter()
            .filter(|(_, parked)| &parked.request.subject == subject)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(parked) = pending.remove(id) {
                let _ = parked
                    .reply
                    .send(Err(permissions::Error::Abandoned(id.to_string())));
            }
        }
        ids.len()
    }

    fn take_pending(&self, id: &RequestId) -> Result<Parked> {
        self.pending.lock().remove(id).ok_or_else(|| unknown_request(id))
    }
}

fn unknown_request(id: &RequestId) -> Error {
    permissions::Error::NotFound {
        target: id.to_string(),
        reason: Some("no such pending permission request".into()),
    }
    .into()
}
