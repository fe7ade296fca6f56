//! `es3 cp`: single-file transfer through the agenda.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use es3_core::agenda::Agenda;
use es3_core::download::FileDownloader;
use es3_core::path::RemotePath;
use es3_core::remote::Context;
use es3_core::sync::run_schedule_rounds;
use es3_core::upload::FileUploader;

use super::helpers::{outcome_code, parse_remote};

pub fn run(
    ctx: &Arc<Context>,
    agenda: &Arc<Agenda>,
    source: &str,
    destination: &str,
) -> Result<i32> {
    let source_remote = RemotePath::is_remote(source);
    let dest_remote = RemotePath::is_remote(destination);
    if source_remote == dest_remote {
        eprintln!("ERR: exactly one of <SOURCE> and <DESTINATION> must be an s3:// path");
        return Ok(2);
    }

    if dest_remote {
        let local = PathBuf::from(source);
        if !local.is_file() {
            eprintln!("ERR: non-existing path {}", source);
            return Ok(3);
        }
        let mut remote = parse_remote(ctx, destination)?;
        if remote.key.ends_with('/') {
            let name = local.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            remote = remote.join(&name);
        }
        let outcome = run_schedule_rounds(agenda, || {
            agenda.schedule(Box::new(FileUploader::new(ctx, local.clone(), remote.clone())));
            Ok(true)
        })?;
        return Ok(outcome_code(outcome));
    }

    let remote = parse_remote(ctx, source)?;
    let mut target = PathBuf::from(destination);
    if destination.ends_with('/') || target.is_dir() {
        target = target.join(remote.file_name());
    }
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            eprintln!("ERR: non-existing path {}", parent.display());
            return Ok(3);
        }
    }
    let outcome = run_schedule_rounds(agenda, || {
        agenda.schedule(Box::new(FileDownloader::new(ctx, target.clone(), remote.clone())));
        Ok(true)
    })?;
    Ok(outcome_code(outcome))
}
