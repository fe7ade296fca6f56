pub mod fake_s3;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use es3_core::agenda::{Agenda, RetryPolicy};
use es3_core::config::Es3Config;
use es3_core::remote::Context;

/// Engine context wired to a stub server, with a private scratch dir.
pub fn test_context(server: &fake_s3::FakeS3, scratch: &Path, compression: bool) -> Arc<Context> {
    let mut cfg = Es3Config {
        access_key: "AKTEST".to_string(),
        secret_key: "SKTEST".to_string(),
        endpoint: server.addr.clone(),
        compression,
        scratch_dir: scratch.to_path_buf(),
        thread_num: 4,
        reader_threads: 2,
        compressor_threads: 4,
        segment_size: 6 * 1024 * 1024,
        segments_in_flight: 8,
        ..Default::default()
    };
    cfg.normalize();
    Context::new(cfg)
}

/// Small agenda matching `test_context`, with fast retries.
pub fn test_agenda(ctx: &Arc<Context>) -> Arc<Agenda> {
    Agenda::from_config(&ctx.cfg, true, true)
        .with_retry_policy(RetryPolicy { max_attempts: 10, delay: Duration::from_millis(20) })
}
