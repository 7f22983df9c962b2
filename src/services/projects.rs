//! Project lifecycle: slug generation, on-disk skeleton, activation and
//! cascade deletion.

use crate::config::ConfigStore;
use crate::db::{Db, Project};
use crate::errors::{GatewayError, GatewayResult};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

pub struct ProjectService {
    db: Arc<Db>,
    config: Arc<ConfigStore>,
}

impl ProjectService {
    pub fn new(db: Arc<Db>, config: Arc<ConfigStore>) -> Self {
        Self { db, config }
    }

    pub fn projects_root(&self) -> PathBuf {
        PathBuf::from(self.config.get_all(false).projects.root)
    }

    /// Lowercases, maps separators to hyphens and strips everything
    /// outside `[a-z0-9-]`.
    pub fn sanitize_name(name: &str) -> GatewayResult<String> {
        let lowered = name.to_lowercase();
        let mut out = String::with_capacity(lowered.len());
        let mut last_hyphen = true;
        for ch in lowered.chars() {
            let mapped = match ch {
                'a'..='z' | '0'..='9' => Some(ch),
                ' ' | '_' | '-' => Some('-'),
                _ => None,
            };
            if let Some(c) = mapped {
                if c == '-' {
                    if !last_hyphen {
                        out.push('-');
                        last_hyphen = true;
                    }
                } else {
                    out.push(c);
                    last_hyphen = false;
                }
            }
        }
        let trimmed = out.trim_matches('-').to_string();
        if trimmed.is_empty() {
            return Err(GatewayError::SchemaViolation(
                "Project name must contain at least one alphanumeric character".to_string(),
            ));
        }
        Ok(trimmed)
    }

    fn generate_project_id(&self, name: &str) -> GatewayResult<String> {
        let base = Self::sanitize_name(name)?;
        if self.db.get_project(&base)?.is_none() {
            return Ok(base);
        }
        let mut counter = 1;
        loop {
            let candidate = format!("{base}-{counter}");
            if self.db.get_project(&candidate)?.is_none() {
                return Ok(candidate);
            }
            counter += 1;
        }
    }

    fn create_skeleton(&self, project_id: &str, name: &str, settings: Option<&Value>) -> GatewayResult<PathBuf> {
        let project_dir = self.projects_root().join(project_id);
        let agp_dir = project_dir.join(".agp");
        std::fs::create_dir_all(&agp_dir)?;
        std::fs::create_dir_all(project_dir.join("context"))?;
        std::fs::create_dir_all(project_dir.join("logs"))?;

        let mut project_settings = json!({
            "version_schema": "1.0",
            "default_context_path": "context",
            "default_logs_path": "logs",
        });
        if let (Some(obj), Some(Value::Object(extra))) = (project_settings.as_object_mut(), settings) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        let now = crate::db::now_ts();
        let manifest = json!({
            "id": project_id,
            "name": name,
            "version": "1.0.0",
            "created_at": now,
            "updated_at": now,
            "type": "gamepipe-project",
            "settings": project_settings,
        });
        std::fs::write(
            agp_dir.join("project.json"),
            serde_json::to_string_pretty(&manifest)?,
        )?;
        Ok(project_dir)
    }

    /// Creates the disk skeleton and the database row. The directory is
    /// removed again if the row insert fails, so both exist or neither.
    pub fn create_project(&self, name: &str, settings: Option<&Value>) -> GatewayResult<Project> {
        let project_id = self.generate_project_id(name)?;
        let project_dir = self.create_skeleton(&project_id, name, settings)?;
        match self.db.create_project(&project_id, name, &project_id) {
            Ok(project) => Ok(project),
            Err(e) => {
                let _ = std::fs::remove_dir_all(&project_dir);
                Err(e)
            }
        }
    }

    pub fn list_projects(&self) -> GatewayResult<Vec<Project>> {
        self.db.list_projects()
    }

    pub fn get_project(&self, id: &str) -> GatewayResult<Option<Project>> {
        self.db.get_project(id)
    }

    pub fn get_active_project(&self) -> GatewayResult<Option<Project>> {
        self.db.get_active_project()
    }

    pub fn select_active_project(&self, id: &str) -> GatewayResult<()> {
        self.db.set_active_project(id)
    }

    /// Removes the project from the store (full cascade). The directory
    /// is only purged when asked.
    pub fn delete_project(&self, id: &str, purge: bool) -> GatewayResult<bool> {
        let deleted = self.db.delete_project(id)?;
        if deleted && purge {
            let dir = self.projects_root().join(id);
            if dir.is_dir() {
                std::fs::remove_dir_all(&dir)?;
            }
        }
        Ok(deleted)
    }

    pub fn project_dir(&self, id: &str) -> PathBuf {
        self.projects_root().join(id)
    }

    pub fn project_manifest(&self, id: &str) -> Option<Value> {
        let path = self.project_dir(id).join(".agp").join("project.json");
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn service(dir: &Path) -> ProjectService {
        let config = Arc::new(ConfigStore::open(dir.join("settings.toml")).unwrap());
        config
            .update(json!({"projects": {"root": dir.join("projects").to_string_lossy()}}))
            .unwrap();
        ProjectService::new(Arc::new(Db::open_in_memory().unwrap()), config)
    }

    #[test]
    fn slug_rules() {
        assert_eq!(ProjectService::sanitize_name("My Game!").unwrap(), "my-game");
        assert_eq!(
            ProjectService::sanitize_name("  Space__Raiders 2 ").unwrap(),
            "space-raiders-2"
        );
        assert!(ProjectService::sanitize_name("!!!").is_err());
    }

    #[test]
    fn collision_appends_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let first = svc.create_project("Alpha", None).unwrap();
        let second = svc.create_project("Alpha", None).unwrap();
        let third = svc.create_project("Alpha", None).unwrap();
        assert_eq!(first.id, "alpha");
        assert_eq!(second.id, "alpha-1");
        assert_eq!(third.id, "alpha-2");
    }

    #[test]
    fn skeleton_created_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let project = svc.create_project("Demo", None).unwrap();
        let pdir = svc.project_dir(&project.id);
        assert!(pdir.join(".agp").join("project.json").is_file());
        assert!(pdir.join("context").is_dir());
        assert!(pdir.join("logs").is_dir());
        let manifest = svc.project_manifest(&project.id).unwrap();
        assert_eq!(manifest["name"], "Demo");
    }

    #[test]
    fn select_active_switches_exclusively() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.create_project("alpha", None).unwrap();
        svc.create_project("beta", None).unwrap();
        svc.select_active_project("alpha").unwrap();
        assert_eq!(svc.get_active_project().unwrap().unwrap().id, "alpha");
        svc.select_active_project("beta").unwrap();
        assert_eq!(svc.get_active_project().unwrap().unwrap().id, "beta");
        assert!(!svc.get_project("alpha").unwrap().unwrap().active);
    }

    #[test]
    fn delete_without_purge_keeps_directory() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let project = svc.create_project("keeper", None).unwrap();
        assert!(svc.delete_project(&project.id, false).unwrap());
        assert!(svc.get_project(&project.id).unwrap().is_none());
        assert!(svc.project_dir(&project.id).is_dir());
    }

    #[test]
    fn delete_with_purge_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let project = svc.create_project("gone", None).unwrap();
        assert!(svc.delete_project(&project.id, true).unwrap());
        assert!(!svc.project_dir(&project.id).exists());
    }
}
