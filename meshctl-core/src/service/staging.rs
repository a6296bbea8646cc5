// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Staging pipeline run before a service's first start (§4.7): materialize
//! template directories, fetch remote inclusions, and, after a stop, push
//! matching files out to a deployment target via include/exclude globs.

use std::path::Path;

use glob::Pattern;

use crate::config::{ServiceDeployment, ServiceRemoteInclusion};

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error fetching inclusion: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed glob pattern {0}: {1}")]
    Glob(String, glob::PatternError),
    #[error("template {0} not found under the template storage directory")]
    TemplateNotFound(String),
}

/// Copies every template directory, then fetches every remote inclusion,
/// into `working_dir`. Templates are applied in order, so a later template
/// may overwrite files from an earlier one. Takes the template/inclusion
/// lists directly (rather than a whole `ServiceTask`) so a `ServiceConfiguration`
/// snapshot, not just the live task definition, can drive staging.
pub async fn stage_service(templates: &[String], inclusions: &[ServiceRemoteInclusion], template_storage_dir: &Path, working_dir: &Path) -> Result<(), StagingError> {
    tokio::fs::create_dir_all(working_dir).await?;
    for template in templates {
        let src = template_storage_dir.join(template);
        if !tokio::fs::try_exists(&src).await? {
            return Err(StagingError::TemplateNotFound(template.clone()));
        }
        copy_dir_recursive(&src, working_dir).await?;
    }
    for inclusion in inclusions {
        fetch_inclusion(inclusion, working_dir).await?;
    }
    Ok(())
}

async fn fetch_inclusion(inclusion: &ServiceRemoteInclusion, working_dir: &Path) -> Result<(), StagingError> {
    let dest = working_dir.join(&inclusion.dest_path);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = reqwest::get(&inclusion.url).await?.bytes().await?;
    tokio::fs::write(&dest, &bytes).await?;
    Ok(())
}

fn copy_dir_recursive<'a>(src: &'a Path, dst: &'a Path) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), StagingError>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(dst).await?;
        let mut entries = tokio::fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let target = dst.join(entry.file_name());
            if file_type.is_dir() {
                copy_dir_recursive(&entry.path(), &target).await?;
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
        Ok(())
    })
}

/// After a service stops, copies files matching `deployment`'s include
/// globs (and not its exclude globs) from `working_dir` into
/// `deployment_target_dir/template_path`.
pub async fn deploy_service(deployment: &ServiceDeployment, working_dir: &Path, deployment_target_dir: &Path) -> Result<Vec<std::path::PathBuf>, StagingError> {
    let includes = compile_patterns(&deployment.includes)?;
    let excludes = compile_patterns(&deployment.excludes)?;
    let match_options = glob::MatchOptions { case_sensitive: deployment.case_sensitive, require_literal_separator: false, require_literal_leading_dot: false };
    let target_root = deployment_target_dir.join(&deployment.template_path);
    tokio::fs::create_dir_all(&target_root).await?;

    let mut deployed = Vec::new();
    let mut stack = vec![working_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                stack.push(path);
                continue;
            }
            let relative = path.strip_prefix(working_dir).unwrap_or(&path);
            let relative_str = relative.to_string_lossy();
            let matches_include = includes.iter().any(|p| p.matches_with(&relative_str, match_options));
            let matches_exclude = excludes.iter().any(|p| p.matches_with(&relative_str, match_options));
            if matches_include && !matches_exclude {
                let dest = target_root.join(relative);
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(&path, &dest).await?;
                deployed.push(dest);
            }
        }
    }
    Ok(deployed)
}

fn compile_patterns(globs: &[String]) -> Result<Vec<Pattern>, StagingError> {
    globs.iter().map(|g| Pattern::new(g).map_err(|e| StagingError::Glob(g.clone(), e))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceTask;

    #[tokio::test]
    async fn templates_are_copied_into_the_working_dir() {
        let storage = tempfile::tempdir().unwrap();
        let working = tempfile::tempdir().unwrap();
        let template_dir = storage.path().join("base");
        tokio::fs::create_dir_all(template_dir.join("plugins")).await.unwrap();
        tokio::fs::write(template_dir.join("plugins/a.jar"), b"jar-bytes").await.unwrap();

        let task = ServiceTask {
            name: "lobby".into(),
            groups: vec![],
            templates: vec!["base".into()],
            inclusions: vec![],
            deployments: vec![],
            max_memory_mib: 512,
            start_port: 25565,
            min_service_count: 1,
            properties: serde_json::json!({}),
        };
        stage_service(&task.templates, &task.inclusions, storage.path(), working.path()).await.unwrap();
        let copied = tokio::fs::read(working.path().join("plugins/a.jar")).await.unwrap();
        assert_eq!(copied, b"jar-bytes");
    }

    #[tokio::test]
    async fn missing_template_is_reported() {
        let storage = tempfile::tempdir().unwrap();
        let working = tempfile::tempdir().unwrap();
        let task = ServiceTask {
            name: "lobby".into(),
            groups: vec![],
            templates: vec!["missing".into()],
            inclusions: vec![],
            deployments: vec![],
            max_memory_mib: 512,
            start_port: 25565,
            min_service_count: 1,
            properties: serde_json::json!({}),
        };
        let result = stage_service(&task.templates, &task.inclusions, storage.path(), working.path()).await;
        assert!(matches!(result, Err(StagingError::TemplateNotFound(_))));
    }

    #[tokio::test]
    async fn deployment_copies_only_included_non_excluded_files() {
        let working = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(working.path().join("world")).await.unwrap();
        tokio::fs::write(working.path().join("world/level.dat"), b"level").await.unwrap();
        tokio::fs::write(working.path().join("server.log"), b"log").await.unwrap();

        let deployment = ServiceDeployment {
            template_storage: "local".into(),
            template_path: "lobby-backup".into(),
            includes: vec!["world/**".into()],
            excludes: vec!["**/*.log".into()],
            case_sensitive: true,
        };
        let deployed = deploy_service(&deployment, working.path(), target.path()).await.unwrap();
        assert_eq!(deployed.len(), 1);
        assert!(tokio::fs::try_exists(target.path().join("lobby-backup/world/level.dat")).await.unwrap());
        assert!(!tokio::fs::try_exists(target.path().join("lobby-backup/server.log")).await.unwrap());
    }
}
