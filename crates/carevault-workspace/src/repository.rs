//! Workspace record repository: patient and assessment CRUD for the active
//! workspace, routed through the record codec.
//!
//! Every call resolves the key from the lock at call time. Nothing decrypted
//! is cached here.

use std::sync::Arc;

use async_trait::async_trait;
use carevault_core::types::{
    default_patient_alias, Assessment, AssessmentDraft, Patient, PatientInput, PatientProfile,
    UnprotectedCounts,
};
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::codec;
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::lock::{CryptoContext, CryptoLock};
use crate::session::{SessionCell, WorkspaceIdentity};
use crate::store::{AssessmentRow, PatientRow, RecordStore, RowStore};

pub struct WorkspaceRepository {
    rows: Arc<dyn RowStore>,
    lock: Arc<CryptoLock>,
    session: Arc<SessionCell>,
}

impl WorkspaceRepository {
    pub fn new(rows: Arc<dyn RowStore>, lock: Arc<CryptoLock>, session: Arc<SessionCell>) -> Self {
        Self {
            rows,
            lock,
            session,
        }
    }

    fn context(&self) -> WorkspaceResult<(WorkspaceIdentity, CryptoContext)> {
        let identity = self.session.require_workspace()?;
        let ctx = self.lock.context(&identity.workspace_id);
        Ok((identity, ctx))
    }

    // ── Patients ─────────────────────────────────────────────────────────────

    /// Patients of the active workspace, most recently assessed first.
    ///
    /// With encryption on, the backend cannot search ciphertext, so every row
    /// is decrypted and filtered here. This is linear in workspace size.
    pub async fn list_patients(&self, search: Option<&str>) -> WorkspaceResult<Vec<Patient>> {
        let (identity, ctx) = self.context()?;
        let term = search.map(str::trim).filter(|s| !s.is_empty());

        if ctx.enabled {
            let rows = self.rows.list_patient_rows(&identity.workspace_id, None).await?;
            let mut out = Vec::with_capacity(rows.len());
            for row in &rows {
                let patient = codec::open_patient(&ctx, row)?;
                if term.map_or(true, |t| patient.profile.matches_search(t)) {
                    out.push(patient);
                }
            }
            Ok(out)
        } else {
            let rows = self.rows.list_patient_rows(&identity.workspace_id, term).await?;
            rows.iter().map(|row| codec::open_patient(&ctx, row)).collect()
        }
    }

    pub async fn get_patient(&self, id: &str) -> WorkspaceResult<Patient> {
        let (identity, ctx) = self.context()?;
        let row = self.patient_row(&identity.workspace_id, id).await?;
        codec::open_patient(&ctx, &row)
    }

    pub async fn create_patient(&self, input: &PatientInput) -> WorkspaceResult<Patient> {
        let (identity, ctx) = self.context()?;
        let now = Utc::now();
        let profile = PatientProfile::from_input(input, || default_patient_alias(now));

        let mut row = PatientRow {
            id: Uuid::new_v4().to_string(),
            workspace_id: identity.workspace_id.clone(),
            alias: String::new(),
            external_id: None,
            country: None,
            inpatient_status: None,
            age_months: None,
            sex: None,
            weight_value: None,
            weight_unit: None,
            secure_payload: None,
            created_by: identity.user_id.clone(),
            created_at: now,
            updated_at: now,
            last_assessment_at: None,
        };
        codec::seal_patient(&ctx, &mut row, &profile)?;
        self.write_patient(row, profile).await
    }

    /// Partial update. Re-encodes the row in the current mode, so a legacy
    /// plaintext row written while unlocked comes out protected.
    pub async fn update_patient(&self, id: &str, input: &PatientInput) -> WorkspaceResult<Patient> {
        let (identity, ctx) = self.context()?;
        let mut row = self.patient_row(&identity.workspace_id, id).await?;
        let mut profile = codec::open_patient(&ctx, &row)?.profile;
        profile.apply(input);

        row.updated_at = Utc::now();
        codec::seal_patient(&ctx, &mut row, &profile)?;
        self.write_patient(row, profile).await
    }

    /// Delete a patient and its assessments.
    pub async fn delete_patient(&self, id: &str) -> WorkspaceResult<()> {
        let identity = self.session.require_workspace()?;
        if !self.rows.delete_patient_row(&identity.workspace_id, id).await? {
            return Err(WorkspaceError::RecordNotFound {
                kind: "patient",
                id: id.to_string(),
            });
        }
        tracing::debug!(workspace_id = %identity.workspace_id, id, "patient deleted");
        Ok(())
    }

    async fn patient_row(&self, workspace_id: &str, id: &str) -> WorkspaceResult<PatientRow> {
        self.rows
            .get_patient_row(workspace_id, id)
            .await?
            .ok_or_else(|| WorkspaceError::RecordNotFound {
                kind: "patient",
                id: id.to_string(),
            })
    }

    async fn write_patient(
        &self,
        row: PatientRow,
        profile: PatientProfile,
    ) -> WorkspaceResult<Patient> {
        let patient = Patient {
            id: row.id.clone(),
            profile,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_assessment_at: row.last_assessment_at,
        };
        tracing::debug!(
            workspace_id = %row.workspace_id,
            id = %row.id,
            protected = row.is_protected(),
            "patient written"
        );
        self.rows.put_patient_row(row).await?;
        Ok(patient)
    }

    // ── Assessments ──────────────────────────────────────────────────────────

    pub async fn list_assessments_by_patient(
        &self,
        patient_id: &str,
    ) -> WorkspaceResult<Vec<Assessment>> {
        let (identity, ctx) = self.context()?;
        let rows = self
            .rows
            .list_assessment_rows(&identity.workspace_id, Some(patient_id))
            .await?;
        rows.iter().map(|row| codec::open_assessment(&ctx, row)).collect()
    }

    pub async fn get_all_assessments(&self) -> WorkspaceResult<Vec<Assessment>> {
        let (identity, ctx) = self.context()?;
        let rows = self
            .rows
            .list_assessment_rows(&identity.workspace_id, None)
            .await?;
        rows.iter().map(|row| codec::open_assessment(&ctx, row)).collect()
    }

    /// Insert or replace an assessment and mark its patient as just assessed.
    ///
    /// `created_at`/`created_by` come from the draft, else from the stored
    /// row, else now and the signed-in user.
    pub async fn upsert_assessment(&self, draft: AssessmentDraft) -> WorkspaceResult<Assessment> {
        let (identity, ctx) = self.context()?;
        let now = Utc::now();
        let id = draft.id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let existing = self
            .rows
            .get_assessment_row(&identity.workspace_id, &id)
            .await?;
        let created_at = draft
            .created_at
            .or(existing.as_ref().map(|r| r.created_at))
            .unwrap_or(now);
        let created_by = draft
            .created_by
            .or_else(|| existing.and_then(|r| r.created_by))
            .or_else(|| identity.user_id.clone());

        let mut row = AssessmentRow {
            id,
            workspace_id: identity.workspace_id.clone(),
            patient_id: draft.patient_id,
            status: None,
            environment: None,
            orchestrator_base_url: None,
            baseline_inputs: Value::Null,
            day1_outputs: Value::Null,
            day2_carry_forward_edited: Value::Null,
            day2_outputs: Value::Null,
            strata: Value::Null,
            summary_48h: Value::Null,
            model_metadata: Value::Null,
            secure_payload: None,
            created_by,
            created_at,
            updated_at: now,
        };
        codec::seal_assessment(&ctx, &mut row, &draft.content)?;

        let assessment = Assessment {
            id: row.id.clone(),
            patient_id: row.patient_id.clone(),
            content: draft.content,
            created_by: row.created_by.clone(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        };
        tracing::debug!(
            workspace_id = %row.workspace_id,
            id = %row.id,
            protected = row.is_protected(),
            "assessment written"
        );
        self.rows.put_assessment_row(row).await?;
        self.rows
            .touch_patient(&identity.workspace_id, &assessment.patient_id, now)
            .await?;
        Ok(assessment)
    }
}

#[async_trait]
impl RecordStore for WorkspaceRepository {
    async fn count_unprotected_records(&self) -> WorkspaceResult<UnprotectedCounts> {
        let identity = self.session.require_workspace()?;
        let ws = &identity.workspace_id;
        let patients = self.rows.list_patient_rows(ws, None).await?;
        let assessments = self.rows.list_assessment_rows(ws, None).await?;
        Ok(UnprotectedCounts {
            patients: patients.iter().filter(|r| !r.is_protected()).count(),
            assessments: assessments.iter().filter(|r| !r.is_protected()).count(),
        })
    }

    async fn list_legacy_plaintext_patients(&self) -> WorkspaceResult<Vec<Patient>> {
        let (identity, ctx) = self.context()?;
        let rows = self.rows.list_patient_rows(&identity.workspace_id, None).await?;
        rows.iter()
            .filter(|r| !r.is_protected())
            .map(|r| codec::open_patient(&ctx, r))
            .collect()
    }

    async fn list_legacy_plaintext_assessments(&self) -> WorkspaceResult<Vec<Assessment>> {
        let (identity, ctx) = self.context()?;
        let rows = self
            .rows
            .list_assessment_rows(&identity.workspace_id, None)
            .await?;
        rows.iter()
            .filter(|r| !r.is_protected())
            .map(|r| codec::open_assessment(&ctx, r))
            .collect()
    }

    async fn update_patient(&self, id: &str, input: &PatientInput) -> WorkspaceResult<Patient> {
        WorkspaceRepository::update_patient(self, id, input).await
    }

    async fn upsert_assessment(&self, draft: AssessmentDraft) -> WorkspaceResult<Assessment> {
        WorkspaceRepository::upsert_assessment(self, draft).await
    }

    async fn reset_workspace_data(&self) -> WorkspaceResult<()> {
        let identity = self.session.require_workspace()?;
        self.rows.delete_workspace_rows(&identity.workspace_id).await?;
        tracing::info!(workspace_id = %identity.workspace_id, "workspace records deleted");
        Ok(())
    }
}

impl std::fmt::Debug for WorkspaceRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceRepository")
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}
