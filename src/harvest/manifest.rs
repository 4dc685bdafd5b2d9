//! Manifest state, the persisted manifest document and its writer.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::harvest::traits::{HarvestStage, ManifestError};
use crate::model::LabelRecord;

/// A record the aggregator refused to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub record: LabelRecord,
    pub reason: String,
}

/// Running totals over every applied label record.
///
/// Owned by the aggregator for the whole run. Counters and "seen" sets are
/// only changed together inside [`ManifestState::apply`], so after every call
/// `total_authors == |seen authors|`, `total_projects == |seen projects|` and
/// `total_files == |records|`.
#[derive(Debug, Default)]
pub struct ManifestState {
    total_files: usize,
    total_authors: usize,
    total_projects: usize,
    seen_author_ids: HashSet<u64>,
    seen_project_ids: HashSet<u64>,
    records: Vec<LabelRecord>,
}

impl ManifestState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks that a record can be persisted as-is.
    pub fn validate(record: &LabelRecord) -> Result<(), ManifestError> {
        if record.author_login.trim().is_empty() {
            return Err(ManifestError::InvalidRecord(format!(
                "author {} has an empty login",
                record.author_id
            )));
        }
        if record.project_name.trim().is_empty() {
            return Err(ManifestError::InvalidRecord(format!(
                "project {} has an empty name",
                record.project_id
            )));
        }
        if !record.file_ref.is_absolute() {
            return Err(ManifestError::InvalidRecord(format!(
                "file reference {} is not absolute",
                record.file_ref.display()
            )));
        }
        if record.file_ref.to_str().is_none() {
            return Err(ManifestError::InvalidRecord(format!(
                "file reference {} is not valid UTF-8",
                record.file_ref.display()
            )));
        }
        Ok(())
    }

    /// Validates and applies one record. A rejected record leaves the state untouched.
    pub fn apply(&mut self, record: LabelRecord) -> Result<(), RejectedRecord> {
        if let Err(e) = Self::validate(&record) {
            return Err(RejectedRecord {
                record,
                reason: e.to_string(),
            });
        }

        if self.seen_author_ids.insert(record.author_id) {
            self.total_authors += 1;
        }
        if self.seen_project_ids.insert(record.project_id) {
            self.total_projects += 1;
        }
        self.records.push(record);
        self.total_files += 1;
        Ok(())
    }

    pub fn total_files(&self) -> usize {
        self.total_files
    }

    pub fn total_authors(&self) -> usize {
        self.total_authors
    }

    pub fn total_projects(&self) -> usize {
        self.total_projects
    }

    pub fn into_manifest(self) -> Manifest {
        Manifest {
            total_files: self.total_files,
            total_authors: self.total_authors,
            total_projects: self.total_projects,
            author_projects: self.records,
        }
    }
}

/// The persisted manifest document.
///
/// `author_projects` order reflects the order records reached the
/// aggregator and differs between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "TotalFiles")]
    pub total_files: usize,
    #[serde(rename = "TotalAuthors")]
    pub total_authors: usize,
    #[serde(rename = "TotalProjects")]
    pub total_projects: usize,
    #[serde(rename = "AuthorProjects")]
    pub author_projects: Vec<LabelRecord>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let data = fs::read(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Whether the totals agree with the records.
    pub fn is_consistent(&self) -> bool {
        let authors: HashSet<u64> = self.author_projects.iter().map(|r| r.author_id).collect();
        let projects: HashSet<u64> = self.author_projects.iter().map(|r| r.project_id).collect();
        self.total_files == self.author_projects.len()
            && self.total_authors == authors.len()
            && self.total_projects == projects.len()
    }

    /// Points every file reference at `prefix`, keeping base file names.
    ///
    /// Used after the labeled-data directory is copied elsewhere, e.g. to
    /// `gs://bucket/data`.
    pub fn rebase(&mut self, prefix: &str) {
        let prefix = prefix.trim_end_matches('/');
        for record in &mut self.author_projects {
            let base = record
                .file_ref
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            record.file_ref = PathBuf::from(format!("{}/{}", prefix, base));
        }
    }
}

/// Persists a [`Manifest`] as JSON.
#[derive(Debug, Clone)]
pub struct ManifestWriter {
    path: PathBuf,
}

impl ManifestWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the output location and checks the manifest can be written there.
    ///
    /// The check creates and removes the temporary sibling [`ManifestWriter::write`]
    /// uses, so nothing is left at the manifest path and an existing manifest
    /// stays intact until it is replaced.
    pub fn prepare(&self) -> Result<(), ManifestError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| self.write_error(source))?;
        }
        if self.path.is_dir() {
            return Err(self.write_error(io::Error::new(
                io::ErrorKind::Other,
                "manifest path is a directory",
            )));
        }

        let tmp = self.temp_path();
        fs::File::create(&tmp).map_err(|source| self.write_error(source))?;
        fs::remove_file(&tmp).map_err(|source| self.write_error(source))?;
        Ok(())
    }

    /// Writes the manifest to a temporary sibling and renames it into place.
    pub fn write(&self, manifest: &Manifest) -> Result<PathBuf, ManifestError> {
        let tmp = self.temp_path();
        let file = fs::File::create(&tmp).map_err(|source| self.write_error(source))?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, manifest)?;
        out.flush().map_err(|source| self.write_error(source))?;
        drop(out);

        fs::rename(&tmp, &self.path).map_err(|source| self.write_error(source))?;

        info!(
            path = %self.path.display(),
            files = manifest.total_files,
            authors = manifest.total_authors,
            projects = manifest.total_projects,
            "Manifest written"
        );
        Ok(self.path.clone())
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "manifest.json".to_string());
        self.path.with_file_name(format!(".{}.tmp", file_name))
    }

    fn write_error(&self, source: io::Error) -> ManifestError {
        ManifestError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

impl HarvestStage for ManifestWriter {
    type Input = Manifest;
    type Output = PathBuf;
    type Error = ManifestError;

    fn execute(&self, input: Self::Input) -> Result<Self::Output, Self::Error> {
        self.write(&input)
    }

    fn stage_name(&self) -> &'static str {
        "manifest_writer"
    }
}
