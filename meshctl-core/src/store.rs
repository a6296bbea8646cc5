// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! C8a — Document Store.
//!
//! A minimal key-value contract persisted entities can live behind, plus
//! two adapters (in-memory, JSON-lines file) and a chunked `migrate`
//! helper that copies every document from one store to another (§6
//! `migrate database <from> <to> [--chunk-size N]`). Mongo/S3/SQL-backed
//! stores are out of scope; any real backend only needs to implement
//! [`DocumentStore`].

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed document at line {0}: {1}")]
    Malformed(usize, serde_json::Error),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert(&self, key: &str, value: Value) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
    /// Returns up to `chunk_size` documents starting at `offset`, in a
    /// stable order, so repeated calls with an advancing offset page
    /// through the whole store without loading it all into memory at once.
    async fn iterate(&self, offset: usize, chunk_size: usize) -> Result<Vec<(String, Value)>, StoreError>;
    async fn len(&self) -> Result<usize, StoreError>;
}

/// The simplest possible backend: a `BTreeMap` guarded by a blocking mutex.
/// Used for tests and as the default when no persistence is configured.
#[derive(Default)]
pub struct InMemoryStore {
    documents: Mutex<BTreeMap<String, Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn insert(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.documents.lock().expect("store lock poisoned").insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.documents.lock().expect("store lock poisoned").get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.documents.lock().expect("store lock poisoned").remove(key).is_some())
    }

    async fn iterate(&self, offset: usize, chunk_size: usize) -> Result<Vec<(String, Value)>, StoreError> {
        let documents = self.documents.lock().expect("store lock poisoned");
        Ok(documents.iter().skip(offset).take(chunk_size.max(1)).map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.documents.lock().expect("store lock poisoned").len())
    }
}

/// One JSON object per line, `{"key": ..., "value": ...}`; append-only with
/// the whole file rewritten on delete, which is acceptable for the
/// small entity counts this store holds (tasks, groups, templates).
pub struct JsonLinesStore {
    path: PathBuf,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Record {
    key: String,
    value: Value,
}

impl JsonLinesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_all(&self) -> Result<Vec<Record>, StoreError> {
        let Ok(file) = tokio::fs::File::open(&self.path).await else {
            return Ok(Vec::new());
        };
        let mut lines = BufReader::new(file).lines();
        let mut out = Vec::new();
        let mut lineno = 0usize;
        while let Some(line) = lines.next_line().await? {
            lineno += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(&line).map_err(|e| StoreError::Malformed(lineno, e))?;
            out.push(record);
        }
        Ok(out)
    }

    async fn write_all(&self, records: &[Record]) -> Result<(), StoreError> {
        let tmp = {
            let mut tmp = self.path.as_os_str().to_owned();
            tmp.push(".tmp");
            PathBuf::from(tmp)
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&tmp).await?;
        for record in records {
            let line = serde_json::to_string(record).expect("json-lines records always serialize");
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for JsonLinesStore {
    async fn insert(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut records = self.read_all().await?;
        if let Some(existing) = records.iter_mut().find(|r| r.key == key) {
            existing.value = value;
        } else {
            records.push(Record { key: key.to_string(), value });
        }
        self.write_all(&records).await
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.read_all().await?.into_iter().find(|r| r.key == key).map(|r| r.value))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut records = self.read_all().await?;
        let before = records.len();
        records.retain(|r| r.key != key);
        let removed = records.len() != before;
        if removed {
            self.write_all(&records).await?;
        }
        Ok(removed)
    }

    async fn iterate(&self, offset: usize, chunk_size: usize) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(self.read_all().await?.into_iter().skip(offset).take(chunk_size.max(1)).map(|r| (r.key, r.value)).collect())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read_all().await?.len())
    }
}

/// Copies every document from `source` into `destination`, `chunk_size` at
/// a time, returning the total number migrated. Matches the `migrate
/// database <from> <to> [--chunk-size N]` CLI contract (§6).
pub async fn migrate(source: &dyn DocumentStore, destination: &dyn DocumentStore, chunk_size: usize) -> Result<usize, StoreError> {
    let mut migrated = 0;
    loop {
        let batch = source.iterate(migrated, chunk_size).await?;
        if batch.is_empty() {
            break;
        }
        for (key, value) in &batch {
            destination.insert(key, value.clone()).await?;
        }
        migrated += batch.len();
        if batch.len() < chunk_size {
            break;
        }
    }
    Ok(migrated)
}
