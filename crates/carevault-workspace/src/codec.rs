//! Record codec: encrypt-before-write and decrypt-after-read for patient and
//! assessment rows.
//!
//! A protected row carries the whole logical record in `secure_payload`,
//! sealed under AAD `"<table>:<workspace_id>:<record_id>"`, and its profile
//! columns are scrubbed. A row is never partially protected.

use carevault_core::types::{
    Assessment, AssessmentContent, InpatientStatus, Patient, PatientProfile, WeightUnit,
};
use carevault_crypto::{decrypt_json, encrypt_json, WorkspaceKey};
use serde_json::Value;

use crate::error::{WorkspaceError, WorkspaceResult};
use crate::lock::CryptoContext;
use crate::store::{AssessmentRow, PatientRow};

pub const PATIENTS_TABLE: &str = "patients";
pub const ASSESSMENTS_TABLE: &str = "assessments";

/// Alias column value on protected patient rows
pub const SCRUBBED_ALIAS: &str = "[encrypted]";

pub fn record_aad(table: &str, workspace_id: &str, record_id: &str) -> String {
    format!("{table}:{workspace_id}:{record_id}")
}

/// The key to write with, if any. Fails when encryption is on but locked.
fn write_key(ctx: &CryptoContext) -> WorkspaceResult<Option<&WorkspaceKey>> {
    if !ctx.enabled {
        return Ok(None);
    }
    ctx.key.as_ref().map(Some).ok_or(WorkspaceError::Locked)
}

/// Any protected row needs a key to be read, even with encryption switched
/// off.
fn read_key(ctx: &CryptoContext) -> WorkspaceResult<&WorkspaceKey> {
    ctx.key.as_ref().ok_or(WorkspaceError::Locked)
}

// ── Patients ─────────────────────────────────────────────────────────────────

/// Store `profile` into `row` in the mode the context dictates.
pub fn seal_patient(
    ctx: &CryptoContext,
    row: &mut PatientRow,
    profile: &PatientProfile,
) -> WorkspaceResult<()> {
    match write_key(ctx)? {
        Some(key) => {
            let aad = record_aad(PATIENTS_TABLE, &row.workspace_id, &row.id);
            row.secure_payload = Some(encrypt_json(profile, key, &aad)?);
            row.alias = SCRUBBED_ALIAS.into();
            row.external_id = None;
            row.country = None;
            row.inpatient_status = None;
            row.age_months = None;
            row.sex = None;
            row.weight_value = None;
            row.weight_unit = None;
        }
        None => {
            row.secure_payload = None;
            row.alias = profile.alias.clone();
            row.external_id = profile.external_id.clone();
            row.country = profile.country.clone();
            row.inpatient_status = profile.inpatient_status.map(|s| s.as_str().to_string());
            row.age_months = profile.age_months;
            row.sex = profile.sex;
            row.weight_value = profile.weight_value;
            row.weight_unit = profile.weight_unit.map(|u| u.as_str().to_string());
        }
    }
    Ok(())
}

/// Decode a stored row. Any decryption failure is returned, never masked.
pub fn open_patient(ctx: &CryptoContext, row: &PatientRow) -> WorkspaceResult<Patient> {
    let profile = match &row.secure_payload {
        Some(envelope) => {
            let aad = record_aad(PATIENTS_TABLE, &row.workspace_id, &row.id);
            decrypt_json(envelope, read_key(ctx)?, Some(&aad))?
        }
        None => plaintext_profile(row),
    };
    Ok(Patient {
        id: row.id.clone(),
        profile,
        created_at: row.created_at,
        updated_at: row.updated_at,
        last_assessment_at: row.last_assessment_at,
    })
}

fn plaintext_profile(row: &PatientRow) -> PatientProfile {
    PatientProfile {
        alias: row.alias.clone(),
        external_id: row.external_id.clone(),
        country: row.country.clone(),
        inpatient_status: row.inpatient_status.as_deref().and_then(InpatientStatus::parse),
        age_months: row.age_months,
        sex: row.sex,
        weight_value: row.weight_value,
        weight_unit: row.weight_unit.as_deref().and_then(WeightUnit::parse),
    }
}

// ── Assessments ──────────────────────────────────────────────────────────────

pub fn seal_assessment(
    ctx: &CryptoContext,
    row: &mut AssessmentRow,
    content: &AssessmentContent,
) -> WorkspaceResult<()> {
    match write_key(ctx)? {
        Some(key) => {
            let aad = record_aad(ASSESSMENTS_TABLE, &row.workspace_id, &row.id);
            row.secure_payload = Some(encrypt_json(content, key, &aad)?);
            row.status = None;
            row.environment = None;
            row.orchestrator_base_url = None;
            row.baseline_inputs = Value::Null;
            row.day1_outputs = Value::Null;
            row.day2_carry_forward_edited = Value::Null;
            row.day2_outputs = Value::Null;
            row.strata = Value::Null;
            row.summary_48h = Value::Null;
            row.model_metadata = Value::Null;
        }
        None => {
            let c = content.clone();
            row.secure_payload = None;
            row.status = c.status;
            row.environment = c.environment;
            row.orchestrator_base_url = c.orchestrator_base_url;
            row.baseline_inputs = c.baseline_inputs;
            row.day1_outputs = c.day1_outputs;
            row.day2_carry_forward_edited = c.day2_carry_forward_edited;
            row.day2_outputs = c.day2_outputs;
            row.strata = c.strata;
            row.summary_48h = c.summary_48h;
            row.model_metadata = c.model_metadata;
        }
    }
    Ok(())
}

pub fn open_assessment(ctx: &CryptoContext, row: &AssessmentRow) -> WorkspaceResult<Assessment> {
    let content = match &row.secure_payload {
        Some(envelope) => {
            let aad = record_aad(ASSESSMENTS_TABLE, &row.workspace_id, &row.id);
            decrypt_json(envelope, read_key(ctx)?, Some(&aad))?
        }
        None => AssessmentContent {
            status: row.status.clone(),
            environment: row.environment.clone(),
            orchestrator_base_url: row.orchestrator_base_url.clone(),
            baseline_inputs: row.baseline_inputs.clone(),
            day1_outputs: row.day1_outputs.clone(),
            day2_carry_forward_edited: row.day2_carry_forward_edited.clone(),
            day2_outputs: row.day2_outputs.clone(),
            strata: row.strata.clone(),
            summary_48h: row.summary_48h.clone(),
            model_metadata: row.model_metadata.clone(),
        },
    };
    Ok(Assessment {
        id: row.id.clone(),
        patient_id: row.patient_id.clone(),
        content,
        created_by: row.created_by.clone(),
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}
