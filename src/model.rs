use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One entry of a repository search response, as the hosting service reports it.
///
/// Entries arrive as raw JSON so that a single malformed item cannot fail the
/// whole response; the catalog decodes each one into this shape individually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchItem {
    pub id: u64,
    pub name: String,
    pub owner: SearchOwner,
    pub clone_url: String,
    #[serde(default)]
    pub language: Option<String>, // server-reported, unreliable
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOwner {
    pub id: u64,
    pub login: String,
}

/// Normalized identity and clone metadata for one repository.
///
/// Identity is `id`: two descriptors with the same `id` are the same
/// repository regardless of the other fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    pub id: u64,
    pub owner_id: u64,
    pub owner_login: String,
    pub name: String,
    pub clone_url: String,
}

impl RepositoryDescriptor {
    /// Directory name of this repository's working tree under the repository root.
    pub fn checkout_dir_name(&self) -> String {
        format!("{}_{}", self.owner_login, self.name)
    }

    /// Provenance shared by every file extracted from this repository.
    pub fn pending_label(&self) -> PendingLabel {
        PendingLabel {
            author_id: self.owner_id,
            author_login: self.owner_login.clone(),
            project_id: self.id,
            project_name: self.name.clone(),
        }
    }
}

impl From<SearchItem> for RepositoryDescriptor {
    fn from(item: SearchItem) -> Self {
        Self {
            id: item.id,
            owner_id: item.owner.id,
            owner_login: item.owner.login,
            name: item.name,
            clone_url: item.clone_url,
        }
    }
}

/// Provenance of a file whose destination is not known yet.
///
/// A [`LabelRecord`] can only be produced through [`PendingLabel::finish`],
/// so no record exists before its file reference is final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLabel {
    pub author_id: u64,
    pub author_login: String,
    pub project_id: u64,
    pub project_name: String,
}

impl PendingLabel {
    pub fn finish(&self, file_ref: PathBuf) -> LabelRecord {
        LabelRecord {
            author_id: self.author_id,
            author_login: self.author_login.clone(),
            project_name: self.project_name.clone(),
            project_id: self.project_id,
            file_ref,
        }
    }
}

/// Provenance tuple tying one extracted file back to its author and project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRecord {
    #[serde(rename = "AuthorId")]
    pub author_id: u64,
    #[serde(rename = "Author")]
    pub author_login: String,
    #[serde(rename = "Project")]
    pub project_name: String,
    #[serde(rename = "ProjectId")]
    pub project_id: u64,
    /// Absolute path of the copied file in the labeled-data directory
    #[serde(rename = "FileRef")]
    pub file_ref: PathBuf,
}
