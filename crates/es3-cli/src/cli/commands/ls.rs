//! `es3 ls`: shallow listing with per-file metadata.

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use es3_core::agenda::{Agenda, Segment, Task};
use es3_core::error::TaskResult;
use es3_core::path::RemotePath;
use es3_core::remote::{Connection, Context, FileDescriptor};

use super::helpers::{finish_run, parse_remote};

/// Above this many files the HEADs go through the agenda in parallel.
const PARALLEL_HEAD_THRESHOLD: usize = 10;

struct HeadTask {
    ctx: Arc<Context>,
    path: RemotePath,
    results: Arc<Mutex<BTreeMap<RemotePath, FileDescriptor>>>,
}

impl Task for HeadTask {
    fn execute(&self, _agenda: &Arc<Agenda>, _segments: &mut Vec<Segment>) -> TaskResult<()> {
        let conn = Connection::new(&self.ctx);
        let desc = conn.head(&self.path)?;
        self.results.lock().unwrap().insert(self.path.clone(), desc);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("Get info about {}", self.path)
    }
}

pub fn run(ctx: &Arc<Context>, agenda: &Arc<Agenda>, path: &str) -> Result<i32> {
    let remote = parse_remote(ctx, path)?;
    let conn = Connection::new(ctx);
    let dir = conn.list_shallow(&remote, true)?;

    let mut dirs = 0usize;
    for subdir in dir.subdirs() {
        println!("\t\tDIR\t{}", subdir.path);
        dirs += 1;
    }

    let files = dir.files();
    let mut descs: BTreeMap<RemotePath, FileDescriptor> = BTreeMap::new();
    if files.len() > PARALLEL_HEAD_THRESHOLD {
        let results = Arc::new(Mutex::new(BTreeMap::new()));
        for file in &files {
            agenda.schedule(Box::new(HeadTask {
                ctx: Arc::clone(ctx),
                path: file.path.clone(),
                results: Arc::clone(&results),
            }));
        }
        let code = finish_run(agenda);
        if code != 0 {
            return Ok(code);
        }
        descs = std::mem::take(&mut *results.lock().unwrap());
    } else {
        for file in &files {
            descs.insert(file.path.clone(), conn.head(&file.path)?);
        }
    }

    let mut total = 0u64;
    for file in &files {
        let desc = descs.get(&file.path).cloned().unwrap_or_default();
        println!("{}\t{}\t{}", desc.mtime, desc.raw_size, file.path);
        total += file.size;
    }

    println!("Total files: {}", files.len());
    println!("Total directories: {}", dirs);
    println!("Total size: {}", total);
    Ok(0)
}
