//! `es3 test`: existence probe for a local or remote path.

use anyhow::Result;
use std::sync::Arc;

use es3_core::path::RemotePath;
use es3_core::remote::{Connection, Context};

use super::helpers::parse_remote;

pub fn run(ctx: &Arc<Context>, path: &str) -> Result<i32> {
    if !RemotePath::is_remote(path) {
        return Ok(if std::path::Path::new(path).exists() { 0 } else { 1 });
    }
    let remote = parse_remote(ctx, path)?;
    let conn = Connection::new(ctx);
    let dir = conn.list_shallow(&remote, true)?;
    Ok(if dir.is_empty() { 1 } else { 0 })
}
