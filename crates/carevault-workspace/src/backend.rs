//! Local reference backend: settings blobs and record rows for any number of
//! workspaces, held in memory and optionally persisted as one JSON file.
//!
//! Writes are flushed atomically (write to a temp file, then rename), so a
//! crash mid-flush leaves the previous file intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{AssessmentRow, PatientRow, RowStore, SettingsStore};

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackendData {
    /// workspace id → setting key → value
    #[serde(default)]
    settings: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    patients: Vec<PatientRow>,
    #[serde(default)]
    assessments: Vec<AssessmentRow>,
}

pub struct LocalBackend {
    path: Option<PathBuf>,
    data: Mutex<BackendData>,
}

impl LocalBackend {
    /// A backend that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(BackendData::default()),
        }
    }

    /// Load or create a file-backed store. A missing file starts empty.
    pub fn open(path: &Path) -> Result<Self> {
        let data = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading workspace store: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing workspace store: {}", path.display()))?
        } else {
            BackendData::default()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Apply `f` to the data and persist the result before releasing the lock.
    fn mutate<T>(&self, f: impl FnOnce(&mut BackendData) -> T) -> Result<T> {
        let mut data = self.data.lock();
        let out = f(&mut data);
        if let Some(path) = &self.path {
            flush(path, &data)?;
        }
        Ok(out)
    }
}

fn flush(path: &Path, data: &BackendData) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating store dir: {}", parent.display()))?;
        }
    }

    let json = serde_json::to_string_pretty(data).context("serializing workspace store")?;

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, &json)
        .with_context(|| format!("writing workspace store temp: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming workspace store: {}", path.display()))?;

    tracing::debug!(
        path = %path.display(),
        patients = data.patients.len(),
        assessments = data.assessments.len(),
        "workspace store flushed"
    );
    Ok(())
}

fn patient_order(a: &PatientRow, b: &PatientRow) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let by_last = match (a.last_assessment_at, b.last_assessment_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_last.then_with(|| b.created_at.cmp(&a.created_at))
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

#[async_trait]
impl SettingsStore for LocalBackend {
    async fn get_setting(&self, workspace_id: &str, key: &str) -> Result<Option<Value>> {
        let data = self.data.lock();
        Ok(data
            .settings
            .get(workspace_id)
            .and_then(|s| s.get(key))
            .cloned())
    }

    async fn upsert_setting(&self, workspace_id: &str, key: &str, value: Value) -> Result<()> {
        self.mutate(|data| {
            data.settings
                .entry(workspace_id.to_string())
                .or_default()
                .insert(key.to_string(), value);
        })
    }

    async fn delete_setting(&self, workspace_id: &str, key: &str) -> Result<()> {
        self.mutate(|data| {
            if let Some(settings) = data.settings.get_mut(workspace_id) {
                settings.remove(key);
                if settings.is_empty() {
                    data.settings.remove(workspace_id);
                }
            }
        })
    }
}

#[async_trait]
impl RowStore for LocalBackend {
    async fn list_patient_rows(
        &self,
        workspace_id: &str,
        search: Option<&str>,
    ) -> Result<Vec<PatientRow>> {
        let term = search
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());
        let data = self.data.lock();
        let mut rows: Vec<PatientRow> = data
            .patients
            .iter()
            .filter(|r| r.workspace_id == workspace_id)
            .filter(|r| match &term {
                Some(t) => {
                    contains_ci(&r.alias, t)
                        || r.external_id.as_deref().is_some_and(|e| contains_ci(e, t))
                }
                None => true,
            })
            .cloned()
            .collect();
        rows.sort_by(patient_order);
        Ok(rows)
    }

    async fn get_patient_row(&self, workspace_id: &str, id: &str) -> Result<Option<PatientRow>> {
        let data = self.data.lock();
        Ok(data
            .patients
            .iter()
            .find(|r| r.workspace_id == workspace_id && r.id == id)
            .cloned())
    }

    async fn put_patient_row(&self, row: PatientRow) -> Result<()> {
        self.mutate(|data| {
            match data
                .patients
                .iter_mut()
                .find(|r| r.workspace_id == row.workspace_id && r.id == row.id)
            {
                Some(existing) => *existing = row,
                None => data.patients.push(row),
            }
        })
    }

    async fn delete_patient_row(&self, workspace_id: &str, id: &str) -> Result<bool> {
        self.mutate(|data| {
            let before = data.patients.len();
            data.patients
                .retain(|r| !(r.workspace_id == workspace_id && r.id == id));
            data.assessments
                .retain(|r| !(r.workspace_id == workspace_id && r.patient_id == id));
            data.patients.len() != before
        })
    }

    async fn list_assessment_rows(
        &self,
        workspace_id: &str,
        patient_id: Option<&str>,
    ) -> Result<Vec<AssessmentRow>> {
        let data = self.data.lock();
        let mut rows: Vec<AssessmentRow> = data
            .assessments
            .iter()
            .filter(|r| r.workspace_id == workspace_id)
            .filter(|r| patient_id.map_or(true, |p| r.patient_id == p))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn get_assessment_row(
        &self,
        workspace_id: &str,
        id: &str,
    ) -> Result<Option<AssessmentRow>> {
        let data = self.data.lock();
        Ok(data
            .assessments
            .iter()
            .find(|r| r.workspace_id == workspace_id && r.id == id)
            .cloned())
    }

    async fn put_assessment_row(&self, row: AssessmentRow) -> Result<()> {
        self.mutate(|data| {
            match data
                .assessments
                .iter_mut()
                .find(|r| r.workspace_id == row.workspace_id && r.id == row.id)
            {
                Some(existing) => *existing = row,
                None => data.assessments.push(row),
            }
        })
    }

    async fn touch_patient(&self, workspace_id: &str, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.mutate(|data| {
            if let Some(row) = data
                .patients
                .iter_mut()
                .find(|r| r.workspace_id == workspace_id && r.id == id)
            {
                row.last_assessment_at = Some(at);
                row.updated_at = at;
            }
        })
    }

    async fn delete_workspace_rows(&self, workspace_id: &str) -> Result<()> {
        self.mutate(|data| {
            data.patients.retain(|r| r.workspace_id != workspace_id);
            data.assessments.retain(|r| r.workspace_id != workspace_id);
        })
    }
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn patient(ws: &str, id: &str, alias: &str, created_offset: i64) -> PatientRow {
        let created = Utc::now() - Duration::minutes(created_offset);
        PatientRow {
            id: id.into(),
            workspace_id: ws.into(),
            alias: alias.into(),
            external_id: None,
            country: None,
            inpatient_status: None,
            age_months: None,
            sex: None,
            weight_value: None,
            weight_unit: None,
            secure_payload: None,
            created_by: None,
            created_at: created,
            updated_at: created,
            last_assessment_at: None,
        }
    }

    fn assessment(ws: &str, id: &str, patient_id: &str, created_offset: i64) -> AssessmentRow {
        let created = Utc::now() - Duration::minutes(created_offset);
        AssessmentRow {
            id: id.into(),
            workspace_id: ws.into(),
            patient_id: patient_id.into(),
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
            created_by: None,
            created_at: created,
            updated_at: created,
        }
    }

    #[tokio::test]
    async fn test_settings_scoped_per_workspace() {
        let backend = LocalBackend::in_memory();
        backend.upsert_setting("w1", "k", json!({"a": 1})).await.unwrap();

        assert_eq!(backend.get_setting("w1", "k").await.unwrap(), Some(json!({"a": 1})));
        assert_eq!(backend.get_setting("w2", "k").await.unwrap(), None);

        backend.delete_setting("w1", "k").await.unwrap();
        assert_eq!(backend.get_setting("w1", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_patient_ordering() {
        let backend = LocalBackend::in_memory();
        backend.put_patient_row(patient("w1", "old", "Old", 30)).await.unwrap();
        backend.put_patient_row(patient("w1", "new", "New", 10)).await.unwrap();
        backend.put_patient_row(patient("w1", "seen", "Seen", 60)).await.unwrap();
        backend.touch_patient("w1", "seen", Utc::now()).await.unwrap();

        let ids: Vec<String> = backend
            .list_patient_rows("w1", None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["seen", "new", "old"]);
    }

    #[tokio::test]
    async fn test_plaintext_search() {
        let backend = LocalBackend::in_memory();
        let mut row = patient("w1", "p1", "Baby Amani", 1);
        row.external_id = Some("MRN-42".into());
        backend.put_patient_row(row).await.unwrap();
        backend.put_patient_row(patient("w1", "p2", "Other", 2)).await.unwrap();

        let hits = backend.list_patient_rows("w1", Some("amani")).await.unwrap();
        assert_eq!(hits.len(), 1);
        let hits = backend.list_patient_rows("w1", Some(" mrn-4 ")).await.unwrap();
        assert_eq!(hits[0].id, "p1");
        let hits = backend.list_patient_rows("w1", Some("  ")).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_patient_cascades() {
        let backend = LocalBackend::in_memory();
        backend.put_patient_row(patient("w1", "p1", "A", 1)).await.unwrap();
        backend.put_assessment_row(assessment("w1", "a1", "p1", 1)).await.unwrap();
        backend.put_assessment_row(assessment("w1", "a2", "p2", 1)).await.unwrap();

        assert!(backend.delete_patient_row("w1", "p1").await.unwrap());
        assert!(!backend.delete_patient_row("w1", "p1").await.unwrap());

        let left = backend.list_assessment_rows("w1", None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "a2");
    }

    #[tokio::test]
    async fn test_assessments_newest_first_and_filtered() {
        let backend = LocalBackend::in_memory();
        backend.put_assessment_row(assessment("w1", "a-old", "p1", 20)).await.unwrap();
        backend.put_assessment_row(assessment("w1", "a-new", "p1", 5)).await.unwrap();
        backend.put_assessment_row(assessment("w1", "a-other", "p2", 1)).await.unwrap();

        let ids: Vec<String> = backend
            .list_assessment_rows("w1", Some("p1"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["a-new", "a-old"]);
    }

    #[tokio::test]
    async fn test_workspace_rows_isolated() {
        let backend = LocalBackend::in_memory();
        backend.put_patient_row(patient("w1", "p1", "A", 1)).await.unwrap();
        backend.put_patient_row(patient("w2", "p1", "B", 1)).await.unwrap();

        backend.delete_workspace_rows("w1").await.unwrap();
        assert!(backend.list_patient_rows("w1", None).await.unwrap().is_empty());
        let w2 = backend.get_patient_row("w2", "p1").await.unwrap().unwrap();
        assert_eq!(w2.alias, "B");
    }

    #[tokio::test]
    async fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("workspace.json");

        {
            let backend = LocalBackend::open(&path).unwrap();
            backend.put_patient_row(patient("w1", "p1", "Persisted", 1)).await.unwrap();
            backend.upsert_setting("w1", "k", json!("v")).await.unwrap();
        }

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists(), "temp file renamed away");

        let reopened = LocalBackend::open(&path).unwrap();
        let row = reopened.get_patient_row("w1", "p1").await.unwrap().unwrap();
        assert_eq!(row.alias, "Persisted");
        assert_eq!(reopened.get_setting("w1", "k").await.unwrap(), Some(json!("v")));
    }

    #[test]
    fn test_open_nonexistent_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(&dir.path().join("missing.json")).unwrap();
        assert!(backend.data.lock().patients.is_empty());
        assert!(!dir.path().join("missing.json").exists(), "open alone never writes");

        let settings = tokio_test::block_on(backend.get_setting("w1", "k")).unwrap();
        assert_eq!(settings, None);
    }

    #[test]
    fn test_open_corrupt_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = LocalBackend::open(&path).unwrap_err();
        assert!(err.to_string().contains("parsing workspace store"));
    }
}
