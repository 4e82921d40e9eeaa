//! Per-user project workspaces: `workspaces/<user_id>/<project_id>/` with a
//! `.meta` descriptor. Every path handed to the model is relative to the
//! project root.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const META_FILE: &str = ".meta";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub project_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn project_path(&self, user_id: u64, project_id: &str) -> PathBuf {
        self.root.join(user_id.to_string()).join(project_id)
    }

    pub async fn create_project(&self, user_id: u64, name: &str) -> anyhow::Result<ProjectMeta> {
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("project name must not be empty");
        }
        let project_id = Uuid::new_v4().to_string()[..8].to_string();
        let path = self.project_path(user_id, &project_id);
        tokio::fs::create_dir_all(&path).await?;

        let meta = ProjectMeta {
            project_id: project_id.clone(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        tokio::fs::write(path.join(META_FILE), serde_json::to_vec_pretty(&meta)?).await?;
        tracing::info!(user_id, project_id = %project_id, name, "project created");
        Ok(meta)
    }

    pub async fn get_project(
        &self,
        user_id: u64,
        project_id: &str,
    ) -> anyhow::Result<Option<ProjectMeta>> {
        let meta_path = self.project_path(user_id, project_id).join(META_FILE);
        match tokio::fs::read(&meta_path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_projects(&self, user_id: u64) -> anyhow::Result<Vec<ProjectMeta>> {
        let user_dir = self.root.join(user_id.to_string());
        let mut out = Vec::new();
        let mut rd = match tokio::fs::read_dir(&user_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let project_id = entry.file_name().to_string_lossy().to_string();
            if let Some(meta) = self.get_project(user_id, &project_id).await? {
                out.push(meta);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    /// Relative file listing, skipping hidden files and cache directories.
    pub async fn list_files(&self, user_id: u64, project_id: &str) -> anyhow::Result<Vec<String>> {
        let root = self.project_path(user_id, project_id);
        let mut stack = vec![root.clone()];
        let mut files = Vec::new();

        while let Some(dir) = stack.pop() {
            let mut rd = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(_) => continue,
            };
            while let Some(entry) = rd.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') || name == "__pycache__" {
                    continue;
                }
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(&root) {
                    files.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_reload_project_meta() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());

        let meta = manager.create_project(1, "rsi strategy").await.unwrap();
        let loaded = manager
            .get_project(1, &meta.project_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.name, "rsi strategy");

        let projects = manager.list_projects(1).await.unwrap();
        assert_eq!(projects.len(), 1);
        assert!(manager.list_projects(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_files_skips_hidden_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let meta = manager.create_project(1, "demo").await.unwrap();
        let root = manager.project_path(1, &meta.project_id);

        tokio::fs::create_dir_all(root.join("strategy/__pycache__"))
            .await
            .unwrap();
        tokio::fs::write(root.join("main.py"), "x").await.unwrap();
        tokio::fs::write(root.join("strategy/rsi.py"), "y").await.unwrap();
        tokio::fs::write(root.join("strategy/__pycache__/rsi.pyc"), "z")
            .await
            .unwrap();

        let files = manager.list_files(1, &meta.project_id).await.unwrap();
        assert_eq!(files, vec!["main.py", "strategy/rsi.py"]);
    }
}
