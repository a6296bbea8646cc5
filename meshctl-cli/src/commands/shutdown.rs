// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! `shutdown` (§6, §4.8, §9 8-step ordered sequence).

use meshctl_core::Runtime;

pub async fn run(runtime: &Runtime) -> anyhow::Result<()> {
    println!("running shutdown sequence...");
    runtime.shutdown.trigger().await;
    runtime.cluster.request_shutdown();
    runtime.tick.stop();
    println!("shutdown complete");
    Ok(())
}
