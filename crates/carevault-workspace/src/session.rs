//! The active sign-in session, shared between the orchestrator and the record
//! repository.

use carevault_core::types::Session;
use parking_lot::RwLock;

use crate::error::{WorkspaceError, WorkspaceResult};

/// Signed-in user, workspace, and role, resolved from the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceIdentity {
    pub user_id: Option<String>,
    pub workspace_id: String,
    pub is_owner: bool,
}

#[derive(Debug)]
pub struct SessionCell {
    inner: RwLock<Session>,
}

impl SessionCell {
    pub fn new(session: Session) -> Self {
        Self {
            inner: RwLock::new(session),
        }
    }

    pub fn get(&self) -> Session {
        self.inner.read().clone()
    }

    pub(crate) fn set(&self, session: Session) {
        *self.inner.write() = session;
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.read().is_authenticated()
    }

    pub fn workspace_id(&self) -> Option<String> {
        self.inner.read().workspace_id.clone()
    }

    /// Require a signed-in session with an active workspace.
    pub fn require_workspace(&self) -> WorkspaceResult<WorkspaceIdentity> {
        let session = self.inner.read();
        if !session.is_authenticated() {
            return Err(WorkspaceError::SignInRequired);
        }
        let workspace_id = session
            .workspace_id
            .clone()
            .ok_or(WorkspaceError::NoWorkspace)?;
        Ok(WorkspaceIdentity {
            user_id: session.user_id.clone(),
            workspace_id,
            is_owner: session.is_owner(),
        })
    }
}
