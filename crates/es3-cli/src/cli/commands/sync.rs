//! `es3 sync`: tree synchronization in either direction.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use es3_core::agenda::Agenda;
use es3_core::path::RemotePath;
use es3_core::remote::Context;
use es3_core::sync::{run_schedule_rounds, Direction, PatternFilter, Synchronizer};

use super::helpers::{outcome_code, parse_remote};

pub fn run(
    ctx: &Arc<Context>,
    agenda: &Arc<Agenda>,
    mut paths: Vec<String>,
    delete_missing: bool,
    included: &[String],
    excluded: &[String],
) -> Result<i32> {
    let destination = paths.pop().expect("clap enforces two paths");
    let sources = paths;

    let filter = Arc::new(PatternFilter::new(included, excluded)?);
    let (direction, remotes, locals) = if RemotePath::is_remote(&destination) {
        if sources.iter().any(|s| RemotePath::is_remote(s)) {
            eprintln!("ERR: upload sources must be local paths");
            return Ok(2);
        }
        for source in &sources {
            if !std::path::Path::new(source).exists() {
                eprintln!("ERR: non-existing path {}", source);
                return Ok(3);
            }
        }
        let remote = parse_remote(ctx, &destination)?;
        (Direction::Upload, vec![remote], sources.iter().map(PathBuf::from).collect())
    } else {
        if sources.iter().any(|s| !RemotePath::is_remote(s)) {
            eprintln!("ERR: download sources must be s3:// paths");
            return Ok(2);
        }
        let target = PathBuf::from(&destination);
        if !target.exists() {
            std::fs::create_dir_all(&target)?;
        }
        let mut remotes = Vec::new();
        for source in &sources {
            remotes.push(parse_remote(ctx, source)?);
        }
        (Direction::Download, remotes, vec![target])
    };

    let synchronizer = Synchronizer::new(
        agenda,
        ctx,
        remotes,
        locals,
        direction,
        delete_missing,
        filter,
    );
    let outcome = run_schedule_rounds(agenda, || synchronizer.create_schedule())?;
    if outcome_code(outcome) == 2 {
        eprintln!("ERR: <SOURCE> not found.");
    }
    Ok(outcome_code(outcome))
}
