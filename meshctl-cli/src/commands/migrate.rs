// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! `migrate database <from> <to> [--chunk-size N]` (§6, §8 scenario 5).

use meshctl_core::store::{self, JsonLinesStore};

use crate::{cli::MigrateTarget, error::usage_bail};

pub async fn run(target: MigrateTarget) -> anyhow::Result<()> {
    let MigrateTarget::Database { from, to, chunk_size } = target;
    if chunk_size == 0 {
        usage_bail!("--chunk-size must be at least 1");
    }
    let source = JsonLinesStore::new(&from);
    let destination = JsonLinesStore::new(&to);
    let migrated = store::migrate(&source, &destination, chunk_size).await?;
    println!("migrated {migrated} document(s) from {} to {}", from.display(), to.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use meshctl_core::store::DocumentStore;

    #[tokio::test]
    async fn zero_chunk_size_is_a_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = MigrateTarget::Database { from: dir.path().join("a.jsonl"), to: dir.path().join("b.jsonl"), chunk_size: 0 };
        let err = run(target).await.unwrap_err();
        assert!(err.downcast_ref::<crate::error::UsageError>().is_some());
    }

    #[tokio::test]
    async fn migrates_every_document_between_two_files() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("src.jsonl");
        {
            let source = JsonLinesStore::new(&source_path);
            for i in 0..5 {
                source.insert(&format!("doc-{i}"), serde_json::json!(i)).await.unwrap();
            }
        }
        let dest_path = dir.path().join("dst.jsonl");
        run(MigrateTarget::Database { from: source_path, to: dest_path.clone(), chunk_size: 2 }).await.unwrap();

        let destination = JsonLinesStore::new(&dest_path);
        assert_eq!(destination.len().await.unwrap(), 5);
    }
}
