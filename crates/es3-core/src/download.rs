//! File download tasks: HEAD short-circuit, preallocation, segment fetch
//! and write-back fan-out, finalization, and local deletion.
//!
//! Segment fetches are Unbound and each reserves one pool segment; the
//! follow-on write task carries no segment need of its own: it receives
//! the already-filled segment by value, and the pool slot frees when the
//! write drops it. The last write to land finalizes the file (decompress,
//! or set mtime/mode and rename into place).

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::agenda::{Agenda, Segment, Task, TaskClass};
use crate::compress::{self, FileDecompressor};
use crate::error::{TaskError, TaskResult};
use crate::path::RemotePath;
use crate::remote::{Connection, Context, Headers, MAX_PARTS};
use crate::storage::{self, PreallocatedFile};

/// Downloads one remote object to one local path.
pub struct FileDownloader {
    ctx: Arc<Context>,
    path: PathBuf,
    remote: RemotePath,
    delete_dir: bool,
}

impl FileDownloader {
    pub fn new(ctx: &Arc<Context>, path: PathBuf, remote: RemotePath) -> Self {
        Self { ctx: Arc::clone(ctx), path, remote, delete_dir: false }
    }

    /// Variant for type conflicts: removes the local directory standing in
    /// the way before downloading the file over it.
    pub fn replacing_dir(ctx: &Arc<Context>, path: PathBuf, remote: RemotePath) -> Self {
        Self { ctx: Arc::clone(ctx), path, remote, delete_dir: true }
    }
}

impl Task for FileDownloader {
    fn execute(&self, agenda: &Arc<Agenda>, _segments: &mut Vec<Segment>) -> TaskResult<()> {
        if self.delete_dir {
            let _ = std::fs::remove_dir_all(&self.path);
        }
        tracing::debug!("checking download of {} from {}", self.path.display(), self.remote);

        let (local_size, local_mtime) = match std::fs::metadata(&self.path) {
            Ok(meta) => (meta.len(), storage::local_mtime(&meta)),
            Err(_) => (0, 0),
        };

        let conn = Connection::new(&self.ctx);
        let desc = conn.head(&self.remote)?;
        if !desc.found {
            return Err(TaskError::fatal(format!("document not found at {}", self.remote)));
        }
        if desc.mtime != 0 && desc.mtime == local_mtime && desc.raw_size == local_size {
            return Ok(());
        }

        let segment_size = agenda.segment_size();
        let mut seg_num =
            (desc.remote_size / segment_size + u64::from(desc.remote_size % segment_size != 0)) as usize;
        if seg_num > MAX_PARTS {
            return Err(TaskError::fatal(format!(
                "segment size too small for {}: {} segments needed",
                self.remote, seg_num
            )));
        }
        if seg_num == 0 {
            seg_num = 1;
        }

        let temp = if desc.compressed {
            compress::scratch_path(self.ctx.scratch_dir(), 4, "-dl")
        } else {
            // Alongside the target so the final rename stays on one
            // filesystem.
            let suffix: u32 = rand::thread_rng().gen();
            let mut name = self.path.as_os_str().to_owned();
            name.push(format!("-{:08x}-es3tmp", suffix));
            PathBuf::from(name)
        };
        let store = PreallocatedFile::create(&temp, desc.remote_size)
            .map_err(|e| TaskError::io(format!("failed to create {}", temp.display()), e))?;

        tracing::debug!("downloading {} from {}", self.path.display(), self.remote);
        let content = Arc::new(DownloadContent {
            ctx: Arc::clone(&self.ctx),
            remote: self.remote.clone(),
            target: self.path.clone(),
            store,
            mtime: desc.mtime,
            mode: desc.mode,
            compressed: desc.compressed,
            remote_size: desc.remote_size,
            num_segments: seg_num,
            state: Mutex::new(ContentState { written: 0, handed_off: false }),
        });
        for index in 0..seg_num {
            agenda.schedule(Box::new(SegmentDownloadTask {
                content: Arc::clone(&content),
                index,
            }));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("Download {} from {}", self.path.display(), self.remote)
    }
}

struct ContentState {
    written: usize,
    /// The temp file has been renamed away or adopted by the decompressor.
    handed_off: bool,
}

/// Shared record of one segmented download.
struct DownloadContent {
    ctx: Arc<Context>,
    remote: RemotePath,
    target: PathBuf,
    store: PreallocatedFile,
    mtime: i64,
    mode: u32,
    compressed: bool,
    remote_size: u64,
    num_segments: usize,
    state: Mutex<ContentState>,
}

impl Drop for DownloadContent {
    fn drop(&mut self) {
        // An abandoned download must not leave a half-written temp file.
        if !self.state.lock().unwrap().handed_off {
            let _ = std::fs::remove_file(self.store.path());
        }
    }
}

impl DownloadContent {
    fn segment_span(&self, index: usize, segment_size: u64) -> (u64, u64) {
        let offset = segment_size * index as u64;
        let len = self.remote_size.saturating_sub(offset).min(segment_size);
        (offset, len)
    }

    /// Runs after the last segment write. Either hands the body to the
    /// decompressor or stamps metadata and renames into place.
    fn finalize(self: &Arc<Self>, agenda: &Arc<Agenda>) -> TaskResult<()> {
        self.store
            .sync()
            .map_err(|e| TaskError::io(format!("failed to sync {}", self.store.path().display()), e))?;
        if self.compressed {
            self.state.lock().unwrap().handed_off = true;
            agenda.schedule(Box::new(FileDecompressor::new(
                self.store.path().to_path_buf(),
                self.target.clone(),
                self.mtime,
                self.mode,
                true,
            )));
            return Ok(());
        }

        let temp = self.store.path();
        storage::apply_mtime(temp, self.mtime)
            .map_err(|e| TaskError::io(format!("failed to set mtime on {}", temp.display()), e))?;
        storage::apply_mode(temp, self.mode)
            .map_err(|e| TaskError::io(format!("failed to set mode on {}", temp.display()), e))?;
        std::fs::rename(temp, &self.target)
            .map_err(|e| TaskError::io(format!("failed to replace {}", self.target.display()), e))?;
        self.state.lock().unwrap().handed_off = true;
        Ok(())
    }
}

/// Fetches one segment into a pool buffer, then chains the write task that
/// takes the buffer over.
struct SegmentDownloadTask {
    content: Arc<DownloadContent>,
    index: usize,
}

impl Task for SegmentDownloadTask {
    fn ordinal(&self) -> i64 {
        self.index as i64
    }

    fn segments_needed(&self) -> usize {
        1
    }

    fn execute(&self, agenda: &Arc<Agenda>, segments: &mut Vec<Segment>) -> TaskResult<()> {
        let content = &self.content;
        let (offset, len) = content.segment_span(self.index, agenda.segment_size());
        tracing::debug!(
            "downloading segment {} of {} of {}",
            self.index,
            content.num_segments,
            content.remote
        );
        let conn = Connection::new(&content.ctx);
        conn.download_range(&content.remote, offset, len, &Headers::new(), segments[0].buffer())?;
        agenda.add_stat_counter("downloaded", len);

        // Hand the filled buffer to the writer; its pool slot travels with
        // it and frees once the write task drops it.
        let segment = segments.pop().expect("segment reserved at dispatch");
        agenda.schedule(Box::new(SegmentWriteTask {
            content: Arc::clone(content),
            index: self.index,
            segment: Mutex::new(Some(segment)),
        }));
        Ok(())
    }

    fn describe(&self) -> String {
        format!("Download segment {} of {}", self.index, self.content.target.display())
    }
}

/// Writes one fetched segment at its offset; the last writer finalizes.
struct SegmentWriteTask {
    content: Arc<DownloadContent>,
    index: usize,
    segment: Mutex<Option<Segment>>,
}

impl Task for SegmentWriteTask {
    fn class(&self) -> TaskClass {
        TaskClass::IoBound
    }

    fn ordinal(&self) -> i64 {
        self.index as i64
    }

    fn execute(&self, agenda: &Arc<Agenda>, _segments: &mut Vec<Segment>) -> TaskResult<()> {
        let content = &self.content;
        let segment = self
            .segment
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TaskError::fatal("segment buffer already consumed"))?;
        let offset = agenda.segment_size() * self.index as u64;
        content
            .store
            .write_at(offset, segment.bytes())
            .map_err(|e| {
                TaskError::io(format!("failed to write {}", content.store.path().display()), e)
            })?;
        drop(segment);

        let last = {
            let mut state = content.state.lock().unwrap();
            state.written += 1;
            state.written == content.num_segments
        };
        if last {
            content.finalize(agenda)?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("Write segment {} of {}", self.index, self.content.target.display())
    }
}

/// Deletes one local file or directory tree.
pub struct LocalDeleter {
    path: PathBuf,
}

impl LocalDeleter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Task for LocalDeleter {
    fn execute(&self, _agenda: &Arc<Agenda>, _segments: &mut Vec<Segment>) -> TaskResult<()> {
        tracing::info!("removing {}", self.path.display());
        let result = match std::fs::metadata(&self.path) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&self.path),
            Ok(_) => std::fs::remove_file(&self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => Err(e),
        };
        result.map_err(|e| TaskError::io(format!("failed to remove {}", self.path.display()), e))
    }

    fn describe(&self) -> String {
        format!("Delete {}", self.path.display())
    }
}
