use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Session ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Local-only session; never enters the workspace encryption machine
    Guest,
    /// Signed in to a shared workspace
    Authenticated,
}

/// Membership role within a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Member,
}

/// The signed-in identity and active workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub mode: AuthMode,
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    pub role: Option<Role>,
}

impl Session {
    pub fn guest() -> Self {
        Self {
            mode: AuthMode::Guest,
            user_id: None,
            workspace_id: None,
            role: None,
        }
    }

    pub fn authenticated(
        user_id: impl Into<String>,
        workspace_id: Option<String>,
        role: Role,
    ) -> Self {
        Self {
            mode: AuthMode::Authenticated,
            user_id: Some(user_id.into()),
            workspace_id,
            role: Some(role),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.mode == AuthMode::Authenticated
    }

    pub fn is_owner(&self) -> bool {
        self.role == Some(Role::Owner)
    }
}

// ── Patients ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InpatientStatus {
    Inpatient,
    Outpatient,
}

impl InpatientStatus {
    /// Case-insensitive exact match; anything else is treated as unknown.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("inpatient") {
            Some(Self::Inpatient)
        } else if value.eq_ignore_ascii_case("outpatient") {
            Some(Self::Outpatient)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inpatient => "Inpatient",
            Self::Outpatient => "Outpatient",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightUnit {
    Kg,
    Lbs,
}

impl WeightUnit {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "kg" => Some(Self::Kg),
            "lbs" | "lb" => Some(Self::Lbs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kg => "kg",
            Self::Lbs => "lbs",
        }
    }
}

/// The identifying and clinical fields of a patient: the part that gets
/// sealed into `securePayload` when the workspace is encrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientProfile {
    pub alias: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub inpatient_status: Option<InpatientStatus>,
    #[serde(default)]
    pub age_months: Option<f64>,
    #[serde(default)]
    pub sex: Option<u8>,
    #[serde(default)]
    pub weight_value: Option<f64>,
    #[serde(default)]
    pub weight_unit: Option<WeightUnit>,
}

impl PatientProfile {
    /// Build a profile from user input, substituting `fallback_alias` when the
    /// alias is blank.
    pub fn from_input(input: &PatientInput, fallback_alias: impl FnOnce() -> String) -> Self {
        Self {
            alias: input
                .alias
                .as_deref()
                .and_then(normalize_text)
                .unwrap_or_else(fallback_alias),
            external_id: input.external_id.as_deref().and_then(normalize_text),
            country: input.country.as_deref().and_then(normalize_text),
            inpatient_status: input
                .inpatient_status
                .as_deref()
                .and_then(InpatientStatus::parse),
            age_months: input.age_months.and_then(finite),
            sex: input.sex.and_then(normalize_sex),
            weight_value: input.weight_value.and_then(finite),
            weight_unit: input.weight_unit.as_deref().and_then(WeightUnit::parse),
        }
    }

    /// Apply a partial update: only fields present in `input` are touched.
    /// A blank alias keeps the current one.
    pub fn apply(&mut self, input: &PatientInput) {
        if let Some(alias) = input.alias.as_deref().and_then(normalize_text) {
            self.alias = alias;
        }
        if let Some(v) = &input.external_id {
            self.external_id = normalize_text(v);
        }
        if let Some(v) = &input.country {
            self.country = normalize_text(v);
        }
        if let Some(v) = &input.inpatient_status {
            self.inpatient_status = InpatientStatus::parse(v);
        }
        if let Some(v) = input.age_months {
            self.age_months = finite(v);
        }
        if let Some(v) = input.sex {
            self.sex = normalize_sex(v);
        }
        if let Some(v) = input.weight_value {
            self.weight_value = finite(v);
        }
        if let Some(v) = &input.weight_unit {
            self.weight_unit = WeightUnit::parse(v);
        }
    }

    /// Case-insensitive substring match on alias and external id.
    pub fn matches_search(&self, term: &str) -> bool {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return true;
        }
        self.alias.to_lowercase().contains(&term)
            || self
                .external_id
                .as_deref()
                .is_some_and(|id| id.to_lowercase().contains(&term))
    }
}

/// Loosely-typed patient fields as entered by a user. `None` means "not
/// supplied"; a supplied blank string clears the field on update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PatientInput {
    pub alias: Option<String>,
    pub external_id: Option<String>,
    pub country: Option<String>,
    pub inpatient_status: Option<String>,
    pub age_months: Option<f64>,
    pub sex: Option<f64>,
    pub weight_value: Option<f64>,
    pub weight_unit: Option<String>,
}

impl From<&PatientProfile> for PatientInput {
    fn from(profile: &PatientProfile) -> Self {
        Self {
            alias: Some(profile.alias.clone()),
            external_id: Some(profile.external_id.clone().unwrap_or_default()),
            country: Some(profile.country.clone().unwrap_or_default()),
            inpatient_status: Some(
                profile
                    .inpatient_status
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_default(),
            ),
            age_months: profile.age_months,
            sex: profile.sex.map(f64::from),
            weight_value: profile.weight_value,
            weight_unit: Some(
                profile
                    .weight_unit
                    .map(|u| u.as_str().to_string())
                    .unwrap_or_default(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: String,
    #[serde(flatten)]
    pub profile: PatientProfile,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_assessment_at: Option<DateTime<Utc>>,
}

// ── Assessments ──────────────────────────────────────────────────────────────

/// The clinical content of an assessment: sealed as a unit when encrypted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssessmentContent {
    pub status: Option<String>,
    pub environment: Option<String>,
    pub orchestrator_base_url: Option<String>,
    pub baseline_inputs: Value,
    pub day1_outputs: Value,
    pub day2_carry_forward_edited: Value,
    pub day2_outputs: Value,
    pub strata: Value,
    #[serde(rename = "summary48h")]
    pub summary_48h: Value,
    pub model_metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub id: String,
    pub patient_id: String,
    #[serde(flatten)]
    pub content: AssessmentContent,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An assessment to insert or replace. Missing id/creation fields are filled
/// in by the repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssessmentDraft {
    pub id: Option<String>,
    pub patient_id: String,
    #[serde(flatten)]
    pub content: AssessmentContent,
    pub created_by: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<Assessment> for AssessmentDraft {
    fn from(a: Assessment) -> Self {
        Self {
            id: Some(a.id),
            patient_id: a.patient_id,
            content: a.content,
            created_by: a.created_by,
            created_at: Some(a.created_at),
        }
    }
}

// ── Migration bookkeeping ────────────────────────────────────────────────────

/// Rows that still hold plaintext columns (no `securePayload`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnprotectedCounts {
    pub patients: usize,
    pub assessments: usize,
}

impl UnprotectedCounts {
    pub fn total(&self) -> usize {
        self.patients + self.assessments
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Patients,
    Assessments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub done: usize,
    pub total: usize,
    pub phase: MigrationPhase,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub migrated_patients: usize,
    pub migrated_assessments: usize,
}

// ── Normalisation helpers ────────────────────────────────────────────────────

/// Trim; blank becomes `None`.
pub fn normalize_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Coerce a numeric sex code to 0/1 (anything above 0.5 is 1).
pub fn normalize_sex(value: f64) -> Option<u8> {
    finite(value).map(|v| u8::from(v > 0.5))
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Alias used when a patient is created without one: `Patient-` plus the last
/// six digits of the creation time in milliseconds.
pub fn default_patient_alias(now: DateTime<Utc>) -> String {
    let millis = now.timestamp_millis().to_string();
    let tail = &millis[millis.len().saturating_sub(6)..];
    format!("Patient-{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> PatientInput {
        PatientInput {
            alias: Some("  Baby A ".into()),
            external_id: Some("MRN-001".into()),
            country: Some("   ".into()),
            inpatient_status: Some("INPATIENT".into()),
            age_months: Some(14.0),
            sex: Some(0.7),
            weight_value: Some(f64::NAN),
            weight_unit: Some("LB".into()),
        }
    }

    #[test]
    fn test_profile_normalisation() {
        let profile = PatientProfile::from_input(&input(), || "unused".into());

        assert_eq!(profile.alias, "Baby A");
        assert_eq!(profile.external_id.as_deref(), Some("MRN-001"));
        assert_eq!(profile.country, None);
        assert_eq!(profile.inpatient_status, Some(InpatientStatus::Inpatient));
        assert_eq!(profile.sex, Some(1));
        assert_eq!(profile.weight_value, None);
        assert_eq!(profile.weight_unit, Some(WeightUnit::Lbs));
    }

    #[test]
    fn test_blank_alias_uses_fallback() {
        let input = PatientInput {
            alias: Some(" ".into()),
            ..Default::default()
        };
        let profile = PatientProfile::from_input(&input, || "Patient-123456".into());
        assert_eq!(profile.alias, "Patient-123456");
    }

    #[test]
    fn test_partial_update_touches_supplied_fields_only() {
        let mut profile = PatientProfile::from_input(&input(), || "unused".into());
        profile.apply(&PatientInput {
            alias: Some("".into()),
            external_id: Some("".into()),
            sex: Some(0.2),
            ..Default::default()
        });

        assert_eq!(profile.alias, "Baby A", "blank alias keeps the existing one");
        assert_eq!(profile.external_id, None, "blank string clears");
        assert_eq!(profile.sex, Some(0));
        assert_eq!(profile.age_months, Some(14.0), "untouched");
    }

    #[test]
    fn test_profile_to_input_reproduces_profile() {
        let profile = PatientProfile::from_input(&input(), || "unused".into());
        let mut rebuilt = PatientProfile::from_input(&PatientInput::default(), || "x".into());
        rebuilt.apply(&PatientInput::from(&profile));
        assert_eq!(rebuilt, profile);
    }

    #[test]
    fn test_search_matches_alias_and_external_id() {
        let profile = PatientProfile::from_input(&input(), || "unused".into());
        assert!(profile.matches_search("baby"));
        assert!(profile.matches_search("mrn-0"));
        assert!(profile.matches_search("  "));
        assert!(!profile.matches_search("zzz"));
    }

    #[test]
    fn test_unrecognised_enums_are_dropped() {
        assert_eq!(InpatientStatus::parse("day-case"), None);
        assert_eq!(WeightUnit::parse("stone"), None);
    }

    #[test]
    fn test_default_alias_uses_last_six_millis_digits() {
        let now = DateTime::from_timestamp_millis(1_700_000_123_456).unwrap();
        assert_eq!(default_patient_alias(now), "Patient-123456");
    }

    #[test]
    fn test_assessment_wire_names() {
        let content = AssessmentContent {
            summary_48h: serde_json::json!({"ok": true}),
            ..Default::default()
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["summary48h"]["ok"], true);
        assert!(json.get("day2CarryForwardEdited").is_some());
    }

    #[test]
    fn test_counts_total() {
        let counts = UnprotectedCounts {
            patients: 3,
            assessments: 5,
        };
        assert_eq!(counts.total(), 8);
    }
}
