//! `es3 cat`: stream remote objects to stdout.
//!
//! Each object is first downloaded to a scratch file through the agenda so
//! segmented fetch and decompression apply, then streamed out. Progress and
//! stats are forced off because stdout belongs to the payload.

use anyhow::Result;
use std::io::{Read, Write};
use std::sync::Arc;

use es3_core::agenda::Agenda;
use es3_core::compress;
use es3_core::download::FileDownloader;
use es3_core::remote::Context;

use super::helpers::parse_remote;

const DOWNLOAD_ATTEMPTS: usize = 6;

pub fn run(ctx: &Arc<Context>, agenda: &Arc<Agenda>, paths: Vec<String>) -> Result<i32> {
    for path in &paths {
        let remote = parse_remote(ctx, path)?;
        let temp = compress::scratch_path(ctx.scratch_dir(), 4, "-cat");

        let mut failed = 0;
        for _attempt in 0..DOWNLOAD_ATTEMPTS {
            agenda.schedule(Box::new(FileDownloader::new(ctx, temp.clone(), remote.clone())));
            failed = agenda.run();
            if failed == 0 {
                break;
            }
        }
        if agenda.tasks_count() > 0 {
            eprintln!("ERR: tasks still pending:");
            for line in agenda.queued_descriptions() {
                eprintln!("  {}", line);
            }
            let _ = std::fs::remove_file(&temp);
            return Ok(4);
        }
        if failed > 0 {
            let _ = std::fs::remove_file(&temp);
            return Ok(6);
        }

        let mut file = std::fs::File::open(&temp)?;
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            if out.write_all(&buf[..n]).is_err() {
                eprintln!("ERR: failed to write to stdout");
                let _ = std::fs::remove_file(&temp);
                return Ok(5);
            }
        }
        let _ = out.flush();
        let _ = std::fs::remove_file(&temp);
    }
    Ok(0)
}
