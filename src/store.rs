//! Persistence capabilities. The core depends on the `ProjectStore` and
//! `TestRunStore` traits only; `JsonFileStore` is the JSON-file realization
//! used by the CLI. Writes are write-temp-then-rename, so concurrent
//! writers resolve last-writer-wins and readers always see one consistent
//! record (though not a consistent snapshot across records).

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SCHEMA_VERSION;
use crate::error::StoreError;
use crate::model::Mode;
use crate::result::TestRun;

/// A project descriptor as the core sees it. The configuration blob belongs
/// to external collaborators and is carried opaquely.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub project_id: String,
    pub name: String,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub description: String,
    pub configuration: serde_json::Value,
    pub test_run_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tab: Option<String>,
}

/// Metadata row returned by test-run listings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestRunSummary {
    pub test_run_id: String,
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub block_type: Mode,
}

pub trait ProjectStore {
    fn list_projects(&self) -> Result<Vec<ProjectRecord>, StoreError>;
    fn get_project(&self, name: &str) -> Result<ProjectRecord, StoreError>;
    fn create_project(&self, name: &str) -> Result<ProjectRecord, StoreError>;
    fn rename_project(&self, name: &str, new_name: &str) -> Result<ProjectRecord, StoreError>;
    fn delete_project(&self, name: &str) -> Result<(), StoreError>;
    /// Persists a configuration change (auto-save path for collaborators).
    fn update_configuration(
        &self,
        name: &str,
        configuration: serde_json::Value,
    ) -> Result<ProjectRecord, StoreError>;
    /// Associates a saved test run with the project.
    fn attach_test_run(&self, name: &str, test_run_id: &str) -> Result<(), StoreError>;
}

pub trait TestRunStore {
    fn save_test_run(&self, run: &TestRun) -> Result<(), StoreError>;
    fn list_test_runs(&self, project_id: Option<&str>) -> Result<Vec<TestRunSummary>, StoreError>;
    fn get_test_run(&self, id: &str) -> Result<TestRun, StoreError>;
    /// Idempotent: deleting an absent run succeeds.
    fn delete_test_run(&self, id: &str) -> Result<(), StoreError>;
}

// ──────────────────────────────────────────────────────────────────────────────
// On-disk formats
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct ProjectMetadata {
    project_id: String,
    name: String,
    created: DateTime<Utc>,
    last_modified: DateTime<Utc>,
    description: String,
}

#[derive(Serialize, Deserialize)]
struct ProjectResults {
    test_runs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_tab: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ProjectFile {
    version: u32,
    metadata: ProjectMetadata,
    configuration: serde_json::Value,
    results: ProjectResults,
}

#[derive(Serialize, Deserialize)]
struct TestRunFile {
    version: u32,
    #[serde(flatten)]
    run: TestRun,
}

impl From<ProjectFile> for ProjectRecord {
    fn from(file: ProjectFile) -> Self {
        ProjectRecord {
            project_id: file.metadata.project_id,
            name: file.metadata.name,
            created: file.metadata.created,
            last_modified: file.metadata.last_modified,
            description: file.metadata.description,
            configuration: file.configuration,
            test_run_ids: file.results.test_runs,
            current_tab: file.results.current_tab,
        }
    }
}

impl From<&ProjectRecord> for ProjectFile {
    fn from(record: &ProjectRecord) -> Self {
        ProjectFile {
            version: SCHEMA_VERSION,
            metadata: ProjectMetadata {
                project_id: record.project_id.clone(),
                name: record.name.clone(),
                created: record.created,
                last_modified: record.last_modified,
                description: record.description.clone(),
            },
            configuration: record.configuration.clone(),
            results: ProjectResults {
                test_runs: record.test_run_ids.clone(),
                current_tab: record.current_tab.clone(),
            },
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// JSON file store
// ──────────────────────────────────────────────────────────────────────────────

pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("projects"))?;
        fs::create_dir_all(root.join("test_runs"))?;
        Ok(Self { root })
    }

    fn project_path(&self, name: &str) -> PathBuf {
        self.root.join("projects").join(format!("{}.json", sanitize(name)))
    }

    fn test_run_path(&self, id: &str) -> PathBuf {
        self.root.join("test_runs").join(format!("{}.json", sanitize(id)))
    }

    fn read_project_file(&self, path: &Path) -> Result<ProjectFile, StoreError> {
        read_versioned(path)
    }

    fn write_project(&self, record: &ProjectRecord) -> Result<(), StoreError> {
        let file = ProjectFile::from(record);
        write_atomic(&self.project_path(&record.name), &file)
    }

    fn load_project(&self, name: &str) -> Result<ProjectRecord, StoreError> {
        let path = self.project_path(name);
        if !path.exists() {
            return Err(StoreError::NotFound {
                kind: "project",
                key: name.to_string(),
            });
        }
        Ok(self.read_project_file(&path)?.into())
    }
}

impl ProjectStore for JsonFileStore {
    fn list_projects(&self) -> Result<Vec<ProjectRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(self.root.join("projects"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            records.push(self.read_project_file(&path)?.into());
        }
        records.sort_by(|a: &ProjectRecord, b: &ProjectRecord| a.name.cmp(&b.name));
        Ok(records)
    }

    fn get_project(&self, name: &str) -> Result<ProjectRecord, StoreError> {
        self.load_project(name)
    }

    fn create_project(&self, name: &str) -> Result<ProjectRecord, StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::NotFound {
                kind: "project name",
                key: name.to_string(),
            });
        }
        if self.project_path(name).exists() {
            return Err(StoreError::Duplicate {
                kind: "project",
                key: name.to_string(),
            });
        }
        let now = Utc::now();
        let record = ProjectRecord {
            project_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created: now,
            last_modified: now,
            description: String::new(),
            configuration: serde_json::json!({}),
            test_run_ids: Vec::new(),
            current_tab: None,
        };
        self.write_project(&record)?;
        info!(project = name, id = %record.project_id, "project created");
        Ok(record)
    }

    fn rename_project(&self, name: &str, new_name: &str) -> Result<ProjectRecord, StoreError> {
        if self.project_path(new_name).exists() {
            return Err(StoreError::Duplicate {
                kind: "project",
                key: new_name.to_string(),
            });
        }
        let mut record = self.load_project(name)?;
        record.name = new_name.to_string();
        record.last_modified = Utc::now();
        self.write_project(&record)?;
        fs::remove_file(self.project_path(name))?;
        info!(from = name, to = new_name, "project renamed");
        Ok(record)
    }

    fn delete_project(&self, name: &str) -> Result<(), StoreError> {
        let path = self.project_path(name);
        if !path.exists() {
            return Err(StoreError::NotFound {
                kind: "project",
                key: name.to_string(),
            });
        }
        fs::remove_file(path)?;
        info!(project = name, "project deleted");
        Ok(())
    }

    fn update_configuration(
        &self,
        name: &str,
        configuration: serde_json::Value,
    ) -> Result<ProjectRecord, StoreError> {
        let mut record = self.load_project(name)?;
        record.configuration = configuration;
        record.last_modified = Utc::now();
        self.write_project(&record)?;
        Ok(record)
    }

    fn attach_test_run(&self, name: &str, test_run_id: &str) -> Result<(), StoreError> {
        let mut record = self.load_project(name)?;
        if !record.test_run_ids.iter().any(|id| id == test_run_id) {
            record.test_run_ids.push(test_run_id.to_string());
            record.last_modified = Utc::now();
            self.write_project(&record)?;
        }
        Ok(())
    }
}

impl TestRunStore for JsonFileStore {
    fn save_test_run(&self, run: &TestRun) -> Result<(), StoreError> {
        let file = TestRunFile {
            version: SCHEMA_VERSION,
            run: run.clone(),
        };
        write_atomic(&self.test_run_path(&run.test_run_id), &file)?;
        debug!(id = %run.test_run_id, "test run saved");
        Ok(())
    }

    fn list_test_runs(&self, project_id: Option<&str>) -> Result<Vec<TestRunSummary>, StoreError> {
        let mut summaries = Vec::new();
        for entry in fs::read_dir(self.root.join("test_runs"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let file: TestRunFile = read_versioned(&path)?;
            if let Some(filter) = project_id {
                if file.run.project_id != filter {
                    continue;
                }
            }
            summaries.push(TestRunSummary {
                test_run_id: file.run.test_run_id,
                timestamp: file.run.timestamp,
                project_id: file.run.project_id,
                block_type: file.run.block_type,
            });
        }
        summaries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(summaries)
    }

    fn get_test_run(&self, id: &str) -> Result<TestRun, StoreError> {
        let path = self.test_run_path(id);
        if !path.exists() {
            return Err(StoreError::NotFound {
                kind: "test run",
                key: id.to_string(),
            });
        }
        let file: TestRunFile = read_versioned(&path)?;
        Ok(file.run)
    }

    fn delete_test_run(&self, id: &str) -> Result<(), StoreError> {
        let path = self.test_run_path(id);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────────────────────────────────────

/// Keys become file names; keep them shell- and path-safe.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Parses a persisted record, rejecting files written by a newer schema.
fn read_versioned<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let raw = fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let found = value.get("version").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    if found > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedVersion {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    Ok(serde_json::from_value(value)?)
}

/// Write-temp-then-rename so readers never observe a torn record.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
