//! Artifact registry: register generated files against tasks, organize
//! them under the project tree, and validate their presence and format.

use crate::config::ConfigStore;
use crate::db::{Artifact, Db};
use crate::errors::{GatewayError, GatewayResult};
use crate::ws::{Broker, Envelope, EventType};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

pub struct ArtifactService {
    db: Arc<Db>,
    broker: Arc<Broker>,
    config: Arc<ConfigStore>,
}

impl ArtifactService {
    pub fn new(db: Arc<Db>, broker: Arc<Broker>, config: Arc<ConfigStore>) -> Self {
        Self { db, broker, config }
    }

    /// Registers an artifact for a task, linking it to the latest session
    /// and copying it under `artifacts/<taskCode>/` when it exists.
    pub async fn register(
        &self,
        task_id: i64,
        artifact_type: &str,
        path: &str,
        meta: Option<&Value>,
        category: Option<&str>,
    ) -> GatewayResult<Artifact> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| GatewayError::NotFound(format!("task {task_id}")))?;
        let session_id = self.db.get_last_session(&task.project_id)?.map(|s| s.id);

        let size_bytes = std::fs::metadata(path).ok().map(|m| m.len() as i64);
        let category = category
            .map(str::to_string)
            .unwrap_or_else(|| infer_category(artifact_type).to_string());
        let meta_json = meta.map(|m| m.to_string());

        let artifact = self.db.add_artifact(
            session_id,
            Some(task_id),
            artifact_type,
            path,
            Some(&category),
            meta_json.as_deref(),
            size_bytes,
        )?;

        if let Err(e) = self.organize(&task.project_id, &task.code, path) {
            warn!("artifact organize failed for {path}: {e}");
        }

        let envelope = Envelope::new(
            EventType::ArtifactCreated,
            Some(task.project_id.clone()),
            json!({
                "artifactId": artifact.id,
                "taskCode": task.code,
                "type": artifact_type,
                "category": category,
                "path": path,
            }),
            None,
        );
        self.broker
            .broadcast_project(&task.project_id, &envelope)
            .await;
        Ok(artifact)
    }

    pub fn list_task_artifacts(&self, task_id: i64) -> GatewayResult<Vec<Artifact>> {
        self.db.list_task_artifacts(task_id)
    }

    /// Checks the file still exists and passes the per-type format check,
    /// then flips validation_status accordingly.
    pub async fn validate(&self, artifact_id: i64) -> GatewayResult<bool> {
        let artifact = self
            .db
            .get_artifact(artifact_id)?
            .ok_or_else(|| GatewayError::NotFound(format!("artifact {artifact_id}")))?;

        let path = Path::new(&artifact.path);
        let valid = path.exists() && validate_format(&artifact.kind, path);
        self.db
            .set_artifact_validation(artifact_id, if valid { "valid" } else { "invalid" })?;

        if let Some(task_id) = artifact.task_id {
            if let Some(task) = self.db.get_task(task_id)? {
                let envelope = Envelope::new(
                    EventType::ArtifactValidated,
                    Some(task.project_id.clone()),
                    json!({"artifactId": artifact_id, "valid": valid}),
                    None,
                );
                self.broker
                    .broadcast_project(&task.project_id, &envelope)
                    .await;
            }
        }
        Ok(valid)
    }

    fn organize(&self, project_id: &str, task_code: &str, path: &str) -> GatewayResult<()> {
        let source = Path::new(path);
        if !source.is_file() {
            return Ok(());
        }
        let root = self.config.get_all(false).projects.root;
        let target_dir = Path::new(&root)
            .join(project_id)
            .join("artifacts")
            .join(task_code);
        std::fs::create_dir_all(&target_dir)?;
        if let Some(file_name) = source.file_name() {
            let target = target_dir.join(file_name);
            if target != source {
                std::fs::copy(source, &target)?;
            }
        }
        Ok(())
    }
}

fn infer_category(artifact_type: &str) -> &'static str {
    match artifact_type {
        "image" | "png" | "jpg" | "screenshot" => "screenshot",
        "fbx" | "obj" | "blend" | "prefab" | "mesh" => "asset",
        "md" | "txt" | "doc" | "report" => "document",
        _ => "code",
    }
}

fn validate_format(artifact_type: &str, path: &Path) -> bool {
    let non_empty = std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    match artifact_type {
        // Binary formats must at least be non-empty.
        "image" | "png" | "jpg" | "fbx" | "blend" => non_empty,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        svc: ArtifactService,
        db: Arc<Db>,
        dir: tempfile::TempDir,
        task_id: i64,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            ConfigStore::open(dir.path().join("settings.toml")).unwrap(),
        );
        config
            .update(json!({"projects": {"root": dir.path().join("projects").to_string_lossy()}}))
            .unwrap();
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.create_project("p", "P", "p").unwrap();
        db.create_session("p", "gemini_cli").unwrap();
        let task_id = db
            .add_task("p", None, 0, "T-001", "Make cube", "", "", "[]", "[]", "[]", "{}", 1)
            .unwrap();
        Fixture {
            svc: ArtifactService::new(db.clone(), Arc::new(Broker::new()), config),
            db,
            dir,
            task_id,
        }
    }

    #[tokio::test]
    async fn register_links_session_and_organizes() {
        let fx = fixture();
        let file = fx.dir.path().join("cube.fbx");
        std::fs::write(&file, b"fbx-bytes").unwrap();

        let artifact = fx
            .svc
            .register(fx.task_id, "fbx", &file.to_string_lossy(), None, None)
            .await
            .unwrap();
        assert_eq!(artifact.category.as_deref(), Some("asset"));
        assert_eq!(artifact.size_bytes, Some(9));
        assert!(artifact.session_id.is_some());
        assert_eq!(artifact.validation_status, "pending");

        // Copied under the project artifact tree.
        assert!(fx
            .dir
            .path()
            .join("projects")
            .join("p")
            .join("artifacts")
            .join("T-001")
            .join("cube.fbx")
            .is_file());
    }

    #[tokio::test]
    async fn validate_flips_status() {
        let fx = fixture();
        let file = fx.dir.path().join("shot.png");
        std::fs::write(&file, b"png-bytes").unwrap();
        let artifact = fx
            .svc
            .register(fx.task_id, "image", &file.to_string_lossy(), None, None)
            .await
            .unwrap();

        assert!(fx.svc.validate(artifact.id).await.unwrap());
        assert_eq!(
            fx.db.get_artifact(artifact.id).unwrap().unwrap().validation_status,
            "valid"
        );

        std::fs::remove_file(&file).unwrap();
        assert!(!fx.svc.validate(artifact.id).await.unwrap());
        assert_eq!(
            fx.db.get_artifact(artifact.id).unwrap().unwrap().validation_status,
            "invalid"
        );
    }

    #[tokio::test]
    async fn register_against_missing_task_fails() {
        let fx = fixture();
        let err = fx
            .svc
            .register(999, "image", "nowhere.png", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[test]
    fn category_inference() {
        assert_eq!(infer_category("image"), "screenshot");
        assert_eq!(infer_category("fbx"), "asset");
        assert_eq!(infer_category("md"), "document");
        assert_eq!(infer_category("cs"), "code");
    }
}
