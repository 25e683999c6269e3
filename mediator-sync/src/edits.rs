//! Apply an agent-proposed filesystem edit at approval time.
//!
//! Grounded on the teacher's `apply_patch` crate: read-current-content,
//! detect staleness against what the agent believed the file contained,
//! then write. Unlike the teacher's unified-diff hunks, filesystem
//! requests here carry only a whole-file write or a single old/new
//! string replacement, so the stale check is a substring search rather
//! than a context-line seek.

use std::path::Path;
use std::path::PathBuf;

use mediator_protocol::PermissionRequest;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("request has no targetFile in metadata")]
    MissingTargetFile,
    #[error("request has no toolName in metadata")]
    MissingToolName,
    #[error("unsupported tool `{0}`")]
    UnsupportedTool(String),
    #[error("{path}: file is missing, edit is stale")]
    StaleMissing { path: PathBuf },
    #[error("{path}: old_string not found in current content, edit is stale")]
    StaleMismatch { path: PathBuf },
    #[error("edit request is missing old_string/new_string")]
    MissingEditContext,
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Apply the edit described by `request.metadata` to `workspace_root`.
/// Called once, at approval time, never at request-creation time: the
/// content the agent is editing may have changed in the window between
/// submission and human decision.
pub async fn apply_filesystem_request(
    request: &PermissionRequest,
    workspace_root: &Path,
) -> Result<(), ApplyError> {
    let target_file = request
        .target_file()
        .ok_or(ApplyError::MissingTargetFile)?;
    let tool_name = request.tool_name().ok_or(ApplyError::MissingToolName)?;
    let path = workspace_root.join(target_file);

    match tool_name {
        "Write" => {
            let content = request
                .metadata
                .get("writeContent")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| ApplyError::Write {
                        path: path.clone(),
                        source,
                    })?;
            }
            tokio::fs::write(&path, content)
                .await
                .map_err(|source| ApplyError::Write {
                    path: path.clone(),
                    source,
                })
        }
        "Edit" => {
            let edit_context = request
                .metadata
                .get("editContext")
                .ok_or(ApplyError::MissingEditContext)?;
            let old_string = edit_context
                .get("old_string")
                .and_then(|v| v.as_str())
                .ok_or(ApplyError::MissingEditContext)?;
            let new_string = edit_context
                .get("new_string")
                .and_then(|v| v.as_str())
                .ok_or(ApplyError::MissingEditContext)?;

            let current = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ApplyError::StaleMissing { path });
                }
                Err(source) => return Err(ApplyError::Read { path, source }),
            };

            let Some(pos) = current.find(old_string) else {
                return Err(ApplyError::StaleMismatch { path });
            };
            let mut updated = String::with_capacity(current.len());
            updated.push_str(&current[..pos]);
            updated.push_str(new_string);
            updated.push_str(&current[pos + old_string.len()..]);

            tokio::fs::write(&path, updated)
                .await
                .map_err(|source| ApplyError::Write {
                    path: path.clone(),
                    source,
                })
        }
        other => Err(ApplyError::UnsupportedTool(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_protocol::Category;
    use mediator_protocol::Metadata;
    use mediator_protocol::RequestStatus;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    fn request(tool_name: &str, target_file: &str, extra: &[(&str, serde_json::Value)]) -> PermissionRequest {
        let mut metadata = Metadata::new();
        metadata.insert("toolName".to_string(), json!(tool_name));
        metadata.insert("targetFile".to_string(), json!(target_file));
        for (k, v) in extra {
            metadata.insert(k.to_string(), v.clone());
        }
        PermissionRequest {
            id: "req-1".to_string(),
            category: Category::Filesystem,
            action: format!("{tool_name} {target_file}"),
            description: String::new(),
            reason: None,
            status: RequestStatus::Pending,
            metadata,
            created_at: 0,
            resolved_at: None,
            resolved_by: None,
        }
    }

    #[tokio::test]
    async fn write_creates_parent_dirs_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let req = request(
            "Write",
            "src/new/file.ts",
            &[("writeContent", json!("hello"))],
        );
        apply_filesystem_request(&req, dir.path()).await.unwrap();
        apply_filesystem_request(&req, dir.path()).await.unwrap();
        let content = tokio::fs::read_to_string(dir.path().join("src/new/file.ts"))
            .await
            .unwrap();
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn edit_replaces_first_occurrence() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.ts"), "const x = 1;\nconst x = 1;\n")
            .await
            .unwrap();
        let req = request(
            "Edit",
            "a.ts",
            &[(
                "editContext",
                json!({"old_string": "const x = 1;", "new_string": "const x = 2;"}),
            )],
        );
        apply_filesystem_request(&req, dir.path()).await.unwrap();
        let content = tokio::fs::read_to_string(dir.path().join("a.ts"))
            .await
            .unwrap();
        assert_eq!(content, "const x = 2;\nconst x = 1;\n");
    }

    #[tokio::test]
    async fn edit_on_missing_file_is_stale() {
        let dir = tempdir().unwrap();
        let req = request(
            "Edit",
            "missing.ts",
            &[("editContext", json!({"old_string": "x", "new_string": "y"}))],
        );
        let err = apply_filesystem_request(&req, dir.path()).await.unwrap_err();
        assert!(matches!(err, ApplyError::StaleMissing { .. }));
    }

    #[tokio::test]
    async fn edit_with_mismatched_old_string_is_stale() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.ts"), "unrelated content\n")
            .await
            .unwrap();
        let req = request(
            "Edit",
            "a.ts",
            &[(
                "editContext",
                json!({"old_string": "not present", "new_string": "y"}),
            )],
        );
        let err = apply_filesystem_request(&req, dir.path()).await.unwrap_err();
        assert!(matches!(err, ApplyError::StaleMismatch { .. }));
    }

    #[tokio::test]
    async fn unsupported_tool_name_is_rejected() {
        let dir = tempdir().unwrap();
        let req = request("Delete", "a.ts", &[]);
        let err = apply_filesystem_request(&req, dir.path()).await.unwrap_err();
        assert!(matches!(err, ApplyError::UnsupportedTool(_)));
    }
}
