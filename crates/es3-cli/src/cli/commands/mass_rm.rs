//! `es3 mass_rm`: delete the paths read from stdin, one per line.
//!
//! Streams arbitrarily long lists without building a schedule; the region
//! of the first bucket is reused for the following lines.

use anyhow::Result;
use std::io::BufRead;
use std::sync::Arc;

use es3_core::error::Severity;
use es3_core::path::RemotePath;
use es3_core::remote::{Connection, Context, Headers};

const DELETE_ATTEMPTS: u32 = 3;

pub fn run(ctx: &Arc<Context>) -> Result<i32> {
    let conn = Connection::new(ctx);
    let stdin = std::io::stdin();
    let mut zone = String::new();

    for line in stdin.lock().lines() {
        let line = line?;
        let spec = line.trim();
        if spec.is_empty() {
            continue;
        }
        let mut remote = RemotePath::parse(spec)?;
        if zone.is_empty() {
            conn.resolve_zone(&mut remote)?;
            zone = remote.zone.clone();
        } else {
            remote.zone = zone.clone();
        }

        let mut fail = true;
        for _attempt in 0..DELETE_ATTEMPTS {
            match conn.read_fully("DELETE", &remote, "", &Headers::new()) {
                Ok(_) => {
                    fail = false;
                    break;
                }
                Err(err) => match err.severity() {
                    Severity::Info => {
                        tracing::debug!("INFO: {}", err);
                        std::thread::sleep(std::time::Duration::from_secs(5));
                    }
                    Severity::Warn => {
                        tracing::warn!("WARN: {}", err);
                        std::thread::sleep(std::time::Duration::from_secs(5));
                    }
                    Severity::Fatal => {
                        tracing::error!("{}", err);
                        break;
                    }
                },
            }
        }
        if fail {
            return Ok(2);
        }
        println!("Deleted {}", spec);
    }
    Ok(0)
}
