//! Collaborator seams: the settings blob store, the raw row store, and the
//! logical record store the orchestrator drives.
//!
//! `SettingsStore` and `RowStore` are implemented by a backend (see
//! [`crate::backend::LocalBackend`]). `RecordStore` is implemented by
//! [`crate::repository::WorkspaceRepository`], which layers the record codec
//! over a `RowStore`.

use async_trait::async_trait;
use carevault_core::types::{
    Assessment, AssessmentDraft, MigrationProgress, Patient, PatientInput, UnprotectedCounts,
};
use carevault_crypto::EncryptedEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkspaceResult;

/// Called after every migrated record.
pub type ProgressFn = Box<dyn Fn(MigrationProgress) + Send + Sync>;

/// A patient as the backend stores it. When `secure_payload` is set, the
/// profile columns hold placeholders only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRow {
    pub id: String,
    pub workspace_id: String,
    pub alias: String,
    pub external_id: Option<String>,
    pub country: Option<String>,
    pub inpatient_status: Option<String>,
    pub age_months: Option<f64>,
    pub sex: Option<u8>,
    pub weight_value: Option<f64>,
    pub weight_unit: Option<String>,
    #[serde(default)]
    pub secure_payload: Option<EncryptedEnvelope>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_assessment_at: Option<DateTime<Utc>>,
}

impl PatientRow {
    pub fn is_protected(&self) -> bool {
        self.secure_payload.is_some()
    }
}

/// An assessment as the backend stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentRow {
    pub id: String,
    pub workspace_id: String,
    pub patient_id: String,
    pub status: Option<String>,
    pub environment: Option<String>,
    pub orchestrator_base_url: Option<String>,
    #[serde(default)]
    pub baseline_inputs: Value,
    #[serde(default)]
    pub day1_outputs: Value,
    #[serde(default)]
    pub day2_carry_forward_edited: Value,
    #[serde(default)]
    pub day2_outputs: Value,
    #[serde(default)]
    pub strata: Value,
    #[serde(default)]
    pub summary_48h: Value,
    #[serde(default)]
    pub model_metadata: Value,
    #[serde(default)]
    pub secure_payload: Option<EncryptedEnvelope>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AssessmentRow {
    pub fn is_protected(&self) -> bool {
        self.secure_payload.is_some()
    }
}

/// Named JSON blobs scoped to a workspace.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, workspace_id: &str, key: &str) -> anyhow::Result<Option<Value>>;

    async fn upsert_setting(&self, workspace_id: &str, key: &str, value: Value)
        -> anyhow::Result<()>;

    async fn delete_setting(&self, workspace_id: &str, key: &str) -> anyhow::Result<()>;
}

/// Raw, codec-unaware row access. Rows are opaque to the backend: it never
/// inspects `secure_payload`.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Patients ordered by `last_assessment_at` desc (nulls last), then
    /// `created_at` desc. `search` filters the plaintext alias and external id
    /// columns, case-insensitively.
    async fn list_patient_rows(
        &self,
        workspace_id: &str,
        search: Option<&str>,
    ) -> anyhow::Result<Vec<PatientRow>>;

    async fn get_patient_row(&self, workspace_id: &str, id: &str)
        -> anyhow::Result<Option<PatientRow>>;

    /// Insert or replace by id.
    async fn put_patient_row(&self, row: PatientRow) -> anyhow::Result<()>;

    /// Deletes the patient and its assessments. Returns whether a row existed.
    async fn delete_patient_row(&self, workspace_id: &str, id: &str) -> anyhow::Result<bool>;

    /// Assessments newest first, optionally restricted to one patient.
    async fn list_assessment_rows(
        &self,
        workspace_id: &str,
        patient_id: Option<&str>,
    ) -> anyhow::Result<Vec<AssessmentRow>>;

    async fn get_assessment_row(
        &self,
        workspace_id: &str,
        id: &str,
    ) -> anyhow::Result<Option<AssessmentRow>>;

    /// Insert or replace by id.
    async fn put_assessment_row(&self, row: AssessmentRow) -> anyhow::Result<()>;

    /// Set a patient's `last_assessment_at` and `updated_at` columns.
    async fn touch_patient(
        &self,
        workspace_id: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Drop every patient and assessment row in the workspace.
    async fn delete_workspace_rows(&self, workspace_id: &str) -> anyhow::Result<()>;
}

/// The record operations the orchestrator needs. Writes go through the record
/// codec, so they encrypt whenever a key is available at write time.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn count_unprotected_records(&self) -> WorkspaceResult<UnprotectedCounts>;

    async fn list_legacy_plaintext_patients(&self) -> WorkspaceResult<Vec<Patient>>;

    async fn list_legacy_plaintext_assessments(&self) -> WorkspaceResult<Vec<Assessment>>;

    async fn update_patient(&self, id: &str, input: &PatientInput) -> WorkspaceResult<Patient>;

    async fn upsert_assessment(&self, draft: AssessmentDraft) -> WorkspaceResult<Assessment>;

    /// Delete all patient and assessment rows of the current workspace.
    async fn reset_workspace_data(&self) -> WorkspaceResult<()>;
}
