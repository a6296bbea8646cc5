// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Marks a command failure as a bad invocation (§6 exit code 2) rather than
//! a runtime failure (exit code 1). `main` downcasts for this type to pick
//! the exit code; every other error surfaced through `anyhow` is generic.

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct UsageError(pub String);

macro_rules! usage_bail {
    ($($arg:tt)*) => {
        return Err(anyhow::Error::new($crate::error::UsageError(format!($($arg)*))))
    };
}

pub(crate) use usage_bail;
