//! Block-parallel GZIP compression and the matching decompressor.
//!
//! A file above the block threshold is split into up to
//! `compressor_threads` equal blocks; each block becomes a CPUBound task
//! that gzips its range into a scratch file. Because gzip permits member
//! concatenation, the receiver reconstructs the original by decompressing
//! the scratch files back to back, which is exactly what the multipart
//! upload of those files produces remotely.

use flate2::write::GzEncoder;
use flate2::Compression;
use rand::Rng;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::agenda::{Agenda, Segment, Task, TaskClass};
use crate::error::{TaskError, TaskResult};
use crate::mime;
use crate::remote::Context;
use crate::storage;

/// Files at or below this size are passed through uncompressed.
pub const MIN_COMPRESS_BLOCK: u64 = 1024 * 1024;

const GZIP_LEVEL: u32 = 8;

/// Whether an upload of `path` (`size` bytes) should go through the
/// compressor at all.
pub fn should_compress(ctx: &Context, path: &Path, size: u64) -> bool {
    ctx.cfg.compression && size > MIN_COMPRESS_BLOCK && !mime::is_precompressed(path)
}

/// Random scratch file path: `scratchy-ab12-cd34<suffix>`.
pub fn scratch_path(dir: &Path, groups: usize, suffix: &str) -> PathBuf {
    let mut rng = rand::thread_rng();
    let mut name = String::from("scratchy");
    for _ in 0..groups {
        name.push('-');
        for _ in 0..4 {
            name.push(char::from_digit(rng.gen_range(0..16), 16).unwrap());
        }
    }
    name.push_str(suffix);
    dir.join(name)
}

/// Ordered compressor output: one scratch file per block, or the original
/// path when the file was small enough to pass through. Scratch outputs are
/// deleted when the record drops.
pub struct ScatteredFiles {
    pub files: Vec<PathBuf>,
    pub sizes: Vec<u64>,
    pub was_compressed: bool,
}

impl ScatteredFiles {
    /// Wraps an uncompressed file as a one-entry result. Nothing is deleted
    /// on drop.
    pub fn pass_through(path: PathBuf, size: u64) -> Self {
        Self { files: vec![path], sizes: vec![size], was_compressed: false }
    }
}

impl Drop for ScatteredFiles {
    fn drop(&mut self) {
        if self.was_compressed {
            for path in &self.files {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

/// Invoked once, by whichever block task finishes last.
pub type CompressDone = Box<dyn FnOnce(&Arc<Agenda>, Arc<ScatteredFiles>) + Send>;

struct CompressorState {
    files: Vec<PathBuf>,
    sizes: Vec<u64>,
    pending: usize,
    on_finish: Option<CompressDone>,
}

struct CompressorInner {
    ctx: Arc<Context>,
    path: PathBuf,
    state: Mutex<CompressorState>,
}

impl CompressorInner {
    fn on_block_done(&self, agenda: &Arc<Agenda>, block: usize, path: PathBuf, size: u64) {
        let finished = {
            let mut state = self.state.lock().unwrap();
            state.files[block] = path;
            state.sizes[block] = size;
            state.pending -= 1;
            if state.pending == 0 {
                state.on_finish.take()
            } else {
                None
            }
        };
        if let Some(on_finish) = finished {
            let state = self.state.lock().unwrap();
            let result = Arc::new(ScatteredFiles {
                files: state.files.clone(),
                sizes: state.sizes.clone(),
                was_compressed: true,
            });
            drop(state);
            on_finish(agenda, result);
        }
    }
}

/// Fans a file out into per-block compression tasks and hands the ordered
/// results to `on_finish` when the last block lands.
pub struct FileCompressor {
    inner: Arc<CompressorInner>,
}

impl FileCompressor {
    pub fn new(ctx: &Arc<Context>, path: PathBuf, on_finish: CompressDone) -> Self {
        Self {
            inner: Arc::new(CompressorInner {
                ctx: Arc::clone(ctx),
                path,
                state: Mutex::new(CompressorState {
                    files: Vec::new(),
                    sizes: Vec::new(),
                    pending: 0,
                    on_finish: Some(on_finish),
                }),
            }),
        }
    }
}

impl Task for FileCompressor {
    fn execute(&self, agenda: &Arc<Agenda>, _segments: &mut Vec<Segment>) -> TaskResult<()> {
        let inner = &self.inner;
        let size = std::fs::metadata(&inner.path)
            .map_err(|e| TaskError::io(format!("failed to stat {}", inner.path.display()), e))?
            .len();

        if size <= MIN_COMPRESS_BLOCK {
            let on_finish = inner.state.lock().unwrap().on_finish.take();
            if let Some(on_finish) = on_finish {
                let result = Arc::new(ScatteredFiles::pass_through(inner.path.clone(), size));
                on_finish(agenda, result);
            }
            return Ok(());
        }

        let max_blocks = inner.ctx.cfg.compressor_threads.max(1) as u64;
        let block_count = (size / MIN_COMPRESS_BLOCK).min(max_blocks).max(1);
        let block_size = size / block_count;
        let num_blocks = (size / block_size + u64::from(size % block_size != 0)) as usize;

        {
            let mut state = inner.state.lock().unwrap();
            state.files = vec![PathBuf::new(); num_blocks];
            state.sizes = vec![0; num_blocks];
            state.pending = num_blocks;
        }

        for block in 0..num_blocks {
            let offset = block_size * block as u64;
            let len = (size - offset).min(block_size);
            agenda.schedule(Box::new(CompressBlockTask {
                parent: Arc::clone(inner),
                block,
                total: num_blocks,
                offset,
                len,
            }));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("Compress {}", self.inner.path.display())
    }
}

struct CompressBlockTask {
    parent: Arc<CompressorInner>,
    block: usize,
    total: usize,
    offset: u64,
    len: u64,
}

impl CompressBlockTask {
    fn compress_block(&self) -> TaskResult<(PathBuf, u64)> {
        let source = &self.parent.path;
        let mut src = File::open(source)
            .map_err(|e| TaskError::io(format!("failed to open {}", source.display()), e))?;
        src.seek(SeekFrom::Start(self.offset))
            .map_err(|e| TaskError::io(format!("failed to seek {}", source.display()), e))?;

        let out_path = scratch_path(self.parent.ctx.scratch_dir(), 2, "");
        let out = File::create(&out_path)
            .map_err(|e| TaskError::io(format!("failed to create {}", out_path.display()), e))?;
        let mut encoder =
            GzEncoder::new(BufWriter::new(out), Compression::new(GZIP_LEVEL));

        tracing::debug!(
            "compressing block {} of {} of {}",
            self.block,
            self.total,
            source.display()
        );

        let mut buf = vec![0u8; 256 * 1024];
        let mut consumed = 0u64;
        while consumed < self.len {
            let want = buf.len().min((self.len - consumed) as usize);
            let n = src
                .read(&mut buf[..want])
                .map_err(|e| TaskError::io(format!("failed to read {}", source.display()), e))?;
            if n == 0 {
                return Err(TaskError::fatal(format!(
                    "{} truncated while compressing block {}",
                    source.display(),
                    self.block
                )));
            }
            encoder
                .write_all(&buf[..n])
                .map_err(|e| TaskError::fatal(format!("failed to compress {}: {}", source.display(), e)))?;
            consumed += n as u64;
        }
        encoder
            .finish()
            .map_err(|e| TaskError::fatal(format!("failed to finish compression of {}: {}", source.display(), e)))?
            .flush()
            .map_err(|e| TaskError::io(format!("failed to flush {}", out_path.display()), e))?;

        let compressed = std::fs::metadata(&out_path)
            .map_err(|e| TaskError::io(format!("failed to stat {}", out_path.display()), e))?
            .len();
        Ok((out_path, compressed))
    }
}

impl Task for CompressBlockTask {
    fn class(&self) -> TaskClass {
        TaskClass::CpuBound
    }

    fn ordinal(&self) -> i64 {
        self.block as i64
    }

    fn execute(&self, agenda: &Arc<Agenda>, _segments: &mut Vec<Segment>) -> TaskResult<()> {
        let (path, size) = self.compress_block()?;
        self.parent.on_block_done(agenda, self.block, path, size);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("Compress block {} of {}", self.block, self.parent.path.display())
    }
}

/// Streams a concatenated-gzip scratch file back into the target path, then
/// restores mtime and mode. Deletes its source when dropped.
pub struct FileDecompressor {
    source: PathBuf,
    target: PathBuf,
    mtime: i64,
    mode: u32,
    delete_source: bool,
}

impl FileDecompressor {
    pub fn new(source: PathBuf, target: PathBuf, mtime: i64, mode: u32, delete_source: bool) -> Self {
        Self { source, target, mtime, mode, delete_source }
    }
}

impl Drop for FileDecompressor {
    fn drop(&mut self) {
        if self.delete_source {
            let _ = std::fs::remove_file(&self.source);
        }
    }
}

impl Task for FileDecompressor {
    fn class(&self) -> TaskClass {
        TaskClass::CpuBound
    }

    fn execute(&self, _agenda: &Arc<Agenda>, _segments: &mut Vec<Segment>) -> TaskResult<()> {
        let src = File::open(&self.source)
            .map_err(|e| TaskError::io(format!("failed to open {}", self.source.display()), e))?;
        let mut decoder = flate2::read::MultiGzDecoder::new(std::io::BufReader::new(src));
        let mut out = File::create(&self.target)
            .map_err(|e| TaskError::io(format!("failed to create {}", self.target.display()), e))?;
        std::io::copy(&mut decoder, &mut out).map_err(|e| {
            TaskError::fatal(format!("failed to decompress {}: {}", self.source.display(), e))
        })?;
        out.sync_all()
            .map_err(|e| TaskError::io(format!("failed to sync {}", self.target.display()), e))?;
        drop(out);

        storage::apply_mtime(&self.target, self.mtime)
            .map_err(|e| TaskError::io(format!("failed to set mtime on {}", self.target.display()), e))?;
        storage::apply_mode(&self.target, self.mode)
            .map_err(|e| TaskError::io(format!("failed to set mode on {}", self.target.display()), e))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("Decompress {} to {}", self.source.display(), self.target.display())
    }
}
