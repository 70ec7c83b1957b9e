//! Subject entity boundary.
//!
//! A subject is the post or story event a pipeline run analyses. The engine
//! only ever reads a subject's metadata blob and writes back an updated blob
//! plus the `ai_status` summary field; persistence itself belongs to the
//! host application behind [`SubjectRepository`].
//!
//! Writes are compare-and-swap on the record's `version`, so several engine
//! processes sharing one database never overwrite each other's updates.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::errors::EngageflowError;

/// What kind of entity a subject is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    /// A feed post.
    #[default]
    Post,
    /// A story event.
    Event,
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Post => write!(f, "post"),
            Self::Event => write!(f, "event"),
        }
    }
}

/// The slice of a subject record visible to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectRecord {
    /// Subject identifier.
    pub id: String,
    /// Post or story event.
    pub kind: SubjectKind,
    /// Reference to already-fetched media (path or URL).
    #[serde(default)]
    pub media_ref: Option<String>,
    /// Caption text, if any.
    #[serde(default)]
    pub caption: Option<String>,
    /// Owning profile username.
    #[serde(default)]
    pub owner: Option<String>,
    /// The metadata blob holding pipeline state and anything else the host
    /// stores there.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Summary status mirrored from the latest run.
    #[serde(default)]
    pub ai_status: Option<String>,
    /// Bumped by the repository on every metadata write.
    #[serde(default)]
    pub version: u64,
}

impl SubjectRecord {
    /// Creates a record with an empty metadata blob.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: SubjectKind) -> Self {
        Self {
            id: id.into(),
            kind,
            media_ref: None,
            caption: None,
            owner: None,
            metadata: serde_json::json!({}),
            ai_status: None,
            version: 0,
        }
    }

    /// Sets the media reference.
    #[must_use]
    pub fn with_media(mut self, media_ref: impl Into<String>) -> Self {
        self.media_ref = Some(media_ref.into());
        self
    }

    /// Sets the caption.
    #[must_use]
    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    /// Sets the owner username.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Result of a conditional metadata write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The write was applied and the version bumped.
    Saved,
    /// Another writer got there first; reload and try again.
    Conflict,
    /// The subject disappeared in the meantime.
    Missing,
}

/// Persistence boundary for subject records.
#[async_trait]
pub trait SubjectRepository: Send + Sync {
    /// Loads a subject, or `None` if it no longer exists.
    async fn load(&self, subject_id: &str) -> Result<Option<SubjectRecord>, EngageflowError>;

    /// Writes back the metadata blob and optional `ai_status`, but only if
    /// the stored version still equals `expected_version`. A successful
    /// write must bump the version.
    async fn save_metadata(
        &self,
        subject_id: &str,
        expected_version: u64,
        metadata: serde_json::Value,
        ai_status: Option<String>,
    ) -> Result<SaveOutcome, EngageflowError>;
}

/// In-memory subject repository.
#[derive(Debug, Default)]
pub struct InMemorySubjectRepository {
    records: RwLock<HashMap<String, SubjectRecord>>,
}

impl InMemorySubjectRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record.
    pub fn insert(&self, record: SubjectRecord) {
        self.records.write().insert(record.id.clone(), record);
    }

    /// Removes a record, simulating deletion by the host application.
    pub fn remove(&self, subject_id: &str) -> Option<SubjectRecord> {
        self.records.write().remove(subject_id)
    }

    /// Returns a copy of a record.
    #[must_use]
    pub fn get(&self, subject_id: &str) -> Option<SubjectRecord> {
        self.records.read().get(subject_id).cloned()
    }

    /// Returns the number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl SubjectRepository for InMemorySubjectRepository {
    async fn load(&self, subject_id: &str) -> Result<Option<SubjectRecord>, EngageflowError> {
        Ok(self.get(subject_id))
    }

    async fn save_metadata(
        &self,
        subject_id: &str,
        expected_version: u64,
        metadata: serde_json::Value,
        ai_status: Option<String>,
    ) -> Result<SaveOutcome, EngageflowError> {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(subject_id) else {
            return Ok(SaveOutcome::Missing);
        };
        if record.version != expected_version {
            return Ok(SaveOutcome::Conflict);
        }
        record.metadata = metadata;
        if ai_status.is_some() {
            record.ai_status = ai_status;
        }
        record.version += 1;
        Ok(SaveOutcome::Saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_and_save() {
        let repo = InMemorySubjectRepository::new();
        repo.insert(SubjectRecord::new("post-1", SubjectKind::Post).with_caption("hi"));

        let record = repo.load("post-1").await.unwrap().unwrap();
        assert_eq!(record.caption.as_deref(), Some("hi"));
        assert_eq!(record.version, 0);

        let saved = repo
            .save_metadata("post-1", 0, serde_json::json!({"a": 1}), Some("running".into()))
            .await
            .unwrap();
        assert_eq!(saved, SaveOutcome::Saved);

        let record = repo.get("post-1").unwrap();
        assert_eq!(record.metadata["a"], 1);
        assert_eq!(record.ai_status.as_deref(), Some("running"));
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn test_save_missing_subject() {
        let repo = InMemorySubjectRepository::new();
        let saved = repo
            .save_metadata("gone", 0, serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(saved, SaveOutcome::Missing);
        assert!(repo.load("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let repo = InMemorySubjectRepository::new();
        repo.insert(SubjectRecord::new("post-1", SubjectKind::Post));

        let first = repo
            .save_metadata("post-1", 0, serde_json::json!({"writer": "a"}), None)
            .await
            .unwrap();
        let second = repo
            .save_metadata("post-1", 0, serde_json::json!({"writer": "b"}), None)
            .await
            .unwrap();

        assert_eq!(first, SaveOutcome::Saved);
        assert_eq!(second, SaveOutcome::Conflict);
        let record = repo.get("post-1").unwrap();
        assert_eq!(record.metadata["writer"], "a");
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn test_save_keeps_status_when_none() {
        let repo = InMemorySubjectRepository::new();
        let mut record = SubjectRecord::new("event-1", SubjectKind::Event);
        record.ai_status = Some("completed".into());
        repo.insert(record);

        repo.save_metadata("event-1", 0, serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(repo.get("event-1").unwrap().ai_status.as_deref(), Some("completed"));
    }
}
