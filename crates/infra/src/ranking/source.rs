//! Where the exporter reads source artifacts from.

use std::collections::BTreeMap;
use std::sync::RwLock;

use sluice_ranking::SourceArtifact;

use super::dataset::DatasetError;

/// Read access to uploaded symbol tables, paged by artifact id.
#[async_trait::async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Artifacts with `artifact_id > after`, ascending, at most `limit`.
    async fn list_artifacts(
        &self,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SourceArtifact>, DatasetError>;
}

/// In-memory artifact source for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryArtifactSource {
    artifacts: RwLock<BTreeMap<i64, SourceArtifact>>,
}

impl InMemoryArtifactSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an artifact.
    pub fn upsert(&self, artifact: SourceArtifact) {
        let mut artifacts = self.artifacts.write().unwrap_or_else(|p| p.into_inner());
        artifacts.insert(artifact.artifact_id, artifact);
    }

    pub fn remove(&self, artifact_id: i64) -> Option<SourceArtifact> {
        let mut artifacts = self.artifacts.write().unwrap_or_else(|p| p.into_inner());
        artifacts.remove(&artifact_id)
    }
}

impl FromIterator<SourceArtifact> for InMemoryArtifactSource {
    fn from_iter<I: IntoIterator<Item = SourceArtifact>>(iter: I) -> Self {
        Self {
            artifacts: RwLock::new(iter.into_iter().map(|a| (a.artifact_id, a)).collect()),
        }
    }
}

#[async_trait::async_trait]
impl ArtifactSource for InMemoryArtifactSource {
    async fn list_artifacts(
        &self,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SourceArtifact>, DatasetError> {
        let artifacts = self
            .artifacts
            .read()
            .map_err(|_| DatasetError::Storage("artifact source lock poisoned".to_string()))?;
        let start = after.map_or(i64::MIN, |a| a.saturating_add(1));
        Ok(artifacts
            .range(start..)
            .take(limit)
            .map(|(_, a)| a.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(id: i64) -> SourceArtifact {
        SourceArtifact {
            artifact_id: id,
            repository: format!("repo-{id}"),
            references: Vec::new(),
        }
    }

    #[tokio::test]
    async fn pages_by_artifact_id() {
        let source: InMemoryArtifactSource = [5, 1, 3].into_iter().map(artifact).collect();

        let page = source.list_artifacts(None, 2).await.unwrap();
        assert_eq!(page.iter().map(|a| a.artifact_id).collect::<Vec<_>>(), vec![1, 3]);

        let page = source.list_artifacts(Some(3), 2).await.unwrap();
        assert_eq!(page.iter().map(|a| a.artifact_id).collect::<Vec<_>>(), vec![5]);

        assert!(source.list_artifacts(Some(5), 2).await.unwrap().is_empty());
    }
}
