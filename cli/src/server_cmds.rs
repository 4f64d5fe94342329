// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// `server start <config>`/`server stop` (spec.md §6 CLI surface). There is
// no daemon-manager crate in this stack, so `stop` tracks the running
// server's pid in a fixed file and signals it; grounded in the common
// pidfile convention rather than any one example repo.

use std::path::{Path, PathBuf};

fn pidfile_path() -> PathBuf {
    std::env::temp_dir().join("buildgrid-server.pid")
}

pub async fn start(config: &Path, verbose: u8) -> Result<(), String> {
    let pidfile = pidfile_path();
    std::fs::write(&pidfile, std::process::id().to_string()).map_err(|err| format!("writing {pidfile:?}: {err}"))?;
    buildgrid_logging::init(buildgrid_server::level_filter(verbose));
    let result = buildgrid_server::serve(config).await;
    let _ = std::fs::remove_file(&pidfile);
    result
}

pub fn stop() -> Result<(), String> {
    let pidfile = pidfile_path();
    let pid = std::fs::read_to_string(&pidfile).map_err(|err| format!("reading {pidfile:?}: {err} (is a server running?)"))?;
    let pid = pid.trim();
    let status = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(pid)
        .status()
        .map_err(|err| format!("signalling pid {pid}: {err}"))?;
    if !status.success() {
        return Err(format!("kill -TERM {pid} exited with {status}"));
    }
    let _ = std::fs::remove_file(&pidfile);
    Ok(())
}
