//! `es3 touch`: create an empty object (or local file) when absent.

use anyhow::Result;
use std::sync::Arc;

use es3_core::path::RemotePath;
use es3_core::remote::{Connection, Context, Headers};
use es3_core::storage;

use super::helpers::parse_remote;

pub fn run(ctx: &Arc<Context>, path: &str) -> Result<i32> {
    if !RemotePath::is_remote(path) {
        let target = std::path::Path::new(path);
        if !target.exists() {
            std::fs::File::create(target)?;
        }
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        storage::apply_mtime(target, now)?;
        return Ok(0);
    }

    let remote = parse_remote(ctx, path)?;
    let conn = Connection::new(ctx);
    let dir = conn.list_shallow(&remote, true)?;
    if dir.is_empty() {
        conn.upload_part(&remote, "", 0, &[], &Headers::new())?;
    }
    Ok(0)
}
