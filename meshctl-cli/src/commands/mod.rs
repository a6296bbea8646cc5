// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

pub mod config;
pub mod create;
pub mod migrate;
pub mod service;
pub mod shutdown;
pub mod template;
