//! `es3 du`: recursive size and count of a remote prefix.

use anyhow::Result;
use std::sync::Arc;

use es3_core::agenda::Agenda;
use es3_core::remote::{listing, Context, RemoteDirectory, WalkAction};

use super::helpers::{finish_run, parse_remote};

#[derive(Default)]
struct TreeStats {
    size: u64,
    files: u64,
    dirs: u64,
    recent_timestamp: String,
}

fn accumulate(dir: &Arc<RemoteDirectory>, out: &mut TreeStats) {
    for file in dir.files() {
        out.size += file.size;
        out.files += 1;
        if file.mtime_str > out.recent_timestamp {
            out.recent_timestamp = file.mtime_str.clone();
        }
    }
    for subdir in dir.subdirs() {
        out.dirs += 1;
        accumulate(&subdir, out);
    }
}

pub fn run(ctx: &Arc<Context>, agenda: &Arc<Agenda>, path: &str) -> Result<i32> {
    let remote = parse_remote(ctx, path)?;
    let root = listing::schedule_recursive_walk(&remote, ctx, agenda, WalkAction::Collect);

    let code = finish_run(agenda);
    if code != 0 {
        return Ok(code);
    }

    let mut stats = TreeStats::default();
    accumulate(&root, &mut stats);
    println!("Total files: {}", stats.files);
    println!("Total directories: {}", stats.dirs);
    println!("Total size: {}", stats.size);
    println!("Most recent timestamp: {}", stats.recent_timestamp);
    Ok(0)
}
