// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! `template [list|create|delete|copy]` (§6). Templates live as directories
//! under `<home>/templates/<name>`, matching the teacher's template-storage
//! convention referenced by `ServiceDeployment::template_storage` (§4.7).

use std::path::{Path, PathBuf};

use crate::cli::TemplateAction;

fn templates_dir(home: &Path) -> PathBuf {
    home.join("templates")
}

pub async fn run(home: &Path, action: TemplateAction) -> anyhow::Result<()> {
    match action {
        TemplateAction::List => {
            let dir = templates_dir(home);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    println!("no templates");
                    return Ok(());
                },
                Err(e) => return Err(e.into()),
            };
            let mut names = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            names.sort();
            for name in names {
                println!("{name}");
            }
        },
        TemplateAction::Create { name } => {
            let path = templates_dir(home).join(&name);
            tokio::fs::create_dir_all(&path).await?;
            println!("created template {name}");
        },
        TemplateAction::Delete { name } => {
            let path = templates_dir(home).join(&name);
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => println!("deleted template {name}"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => anyhow::bail!("no such template '{name}'"),
                Err(e) => return Err(e.into()),
            }
        },
        TemplateAction::Copy { name, destination } => {
            let source = templates_dir(home).join(&name);
            if !source.is_dir() {
                anyhow::bail!("no such template '{name}'");
            }
            let dest = templates_dir(home).join(&destination);
            copy_dir_recursive(&source, &dest).await?;
            println!("copied template {name} to {destination}");
        },
    }
    Ok(())
}

fn copy_dir_recursive<'a>(from: &'a Path, to: &'a Path) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(to).await?;
        let mut entries = tokio::fs::read_dir(from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let dest_path = to.join(entry.file_name());
            if file_type.is_dir() {
                copy_dir_recursive(&entry.path(), &dest_path).await?;
            } else {
                tokio::fs::copy(entry.path(), &dest_path).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_list_then_delete_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), TemplateAction::Create { name: "lobby-base".into() }).await.unwrap();
        assert!(templates_dir(dir.path()).join("lobby-base").is_dir());
        run(dir.path(), TemplateAction::Delete { name: "lobby-base".into() }).await.unwrap();
        assert!(!templates_dir(dir.path()).join("lobby-base").exists());
    }

    #[tokio::test]
    async fn deleting_a_missing_template_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(dir.path(), TemplateAction::Delete { name: "nope".into() }).await.is_err());
    }

    #[tokio::test]
    async fn copy_duplicates_the_template_tree() {
        let dir = tempfile::tempdir().unwrap();
        let source = templates_dir(dir.path()).join("lobby-base");
        tokio::fs::create_dir_all(&source).await.unwrap();
        tokio::fs::write(source.join("server.properties"), b"motd=hi").await.unwrap();

        run(dir.path(), TemplateAction::Copy { name: "lobby-base".into(), destination: "lobby-copy".into() }).await.unwrap();

        let copied = templates_dir(dir.path()).join("lobby-copy").join("server.properties");
        assert_eq!(tokio::fs::read(copied).await.unwrap(), b"motd=hi");
    }
}
