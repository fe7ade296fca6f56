//! File upload tasks: HEAD short-circuit, simple PUT, compressor-fed
//! multipart, and remote deletion.
//!
//! A multipart upload is a composite: the uploader initiates, fans out one
//! IOBound part task per scratch file (or byte range), and the part that
//! reports in last completes the upload with the collected etags.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::agenda::{Agenda, Segment, Task, TaskClass};
use crate::compress::{self, FileCompressor, ScatteredFiles};
use crate::error::{TaskError, TaskResult};
use crate::mime;
use crate::path::RemotePath;
use crate::remote::{Connection, Context, Headers, MAX_PARTS};
use crate::storage;

/// Uploads one local file to one remote object.
pub struct FileUploader {
    ctx: Arc<Context>,
    path: PathBuf,
    remote: RemotePath,
}

impl FileUploader {
    pub fn new(ctx: &Arc<Context>, path: PathBuf, remote: RemotePath) -> Self {
        Self { ctx: Arc::clone(ctx), path, remote }
    }

    fn metadata_headers(&self, mtime: i64, mode: u32, raw_size: Option<u64>) -> Headers {
        let mut headers = Headers::new();
        headers.insert("x-amz-meta-mtime".to_string(), mtime.to_string());
        headers.insert("x-amz-meta-mode".to_string(), format!("{:o}", mode));
        if let Some(raw) = raw_size {
            headers.insert("x-amz-meta-raw-size".to_string(), raw.to_string());
            headers.insert("x-amz-meta-compressed".to_string(), "true".to_string());
        }
        headers.insert(
            "Content-Type".to_string(),
            mime::content_type_for(&self.path).to_string(),
        );
        headers
    }

    fn simple_put(
        &self,
        agenda: &Arc<Agenda>,
        conn: &Connection,
        headers: &Headers,
        size: u64,
    ) -> TaskResult<()> {
        if size == 0 {
            conn.upload_part(&self.remote, "", 0, &[], headers)?;
            return Ok(());
        }
        // Bound peak memory the same way segment transfers do; the slot is
        // held until the PUT went out.
        let mut segments = agenda.acquire_segments(1);
        {
            let buf = segments[0].buffer();
            buf.clear();
            let mut src = File::open(&self.path)
                .map_err(|e| TaskError::io(format!("failed to open {}", self.path.display()), e))?;
            src.read_to_end(buf)
                .map_err(|e| TaskError::io(format!("failed to read {}", self.path.display()), e))?;
        }
        conn.upload_part(&self.remote, "", 0, segments[0].bytes(), headers)?;
        agenda.add_stat_counter("uploaded", size);
        Ok(())
    }
}

impl Task for FileUploader {
    fn execute(&self, agenda: &Arc<Agenda>, _segments: &mut Vec<Segment>) -> TaskResult<()> {
        tracing::debug!("checking upload of {} to {}", self.path.display(), self.remote);
        let meta = std::fs::metadata(&self.path)
            .map_err(|e| TaskError::io(format!("failed to stat {}", self.path.display()), e))?;
        let size = meta.len();
        let mtime = storage::local_mtime(&meta);
        let mode = storage::local_mode(&meta);

        let conn = Connection::new(&self.ctx);
        let desc = conn.head(&self.remote)?;
        if desc.found && desc.mtime == mtime && desc.raw_size == size {
            return Ok(());
        }

        let compress = compress::should_compress(&self.ctx, &self.path, size);
        if !compress && size <= agenda.segment_size() {
            let headers = self.metadata_headers(mtime, mode, None);
            return self.simple_put(agenda, &conn, &headers, size);
        }

        tracing::debug!("uploading {} to {}", self.path.display(), self.remote);
        if compress {
            let ctx = Arc::clone(&self.ctx);
            let remote = self.remote.clone();
            let compressed_headers = self.metadata_headers(mtime, mode, Some(size));
            let plain_headers = self.metadata_headers(mtime, mode, None);
            let description = self.path.display().to_string();
            agenda.schedule(Box::new(FileCompressor::new(
                &self.ctx,
                self.path.clone(),
                Box::new(move |agenda, files| {
                    // The small-file short-circuit carries the original
                    // path; only real compressor output is marked as such.
                    let headers =
                        if files.was_compressed { compressed_headers } else { plain_headers };
                    agenda.schedule(Box::new(MultipartStartTask {
                        ctx,
                        remote,
                        headers,
                        files,
                        description,
                    }));
                }),
            )));
            return Ok(());
        }

        let files = Arc::new(ScatteredFiles::pass_through(self.path.clone(), size));
        let start = MultipartStartTask {
            ctx: Arc::clone(&self.ctx),
            remote: self.remote.clone(),
            headers: self.metadata_headers(mtime, mode, None),
            files,
            description: self.path.display().to_string(),
        };
        start.execute(agenda, &mut Vec::new())
    }

    fn describe(&self) -> String {
        format!("Upload {} to {}", self.path.display(), self.remote)
    }
}

/// Initiates the multipart protocol and fans out the part tasks. Runs as a
/// task of its own so a failed initiation goes through the normal retry and
/// failure accounting.
struct MultipartStartTask {
    ctx: Arc<Context>,
    remote: RemotePath,
    headers: Headers,
    files: Arc<ScatteredFiles>,
    description: String,
}

impl Task for MultipartStartTask {
    fn execute(&self, agenda: &Arc<Agenda>, _segments: &mut Vec<Segment>) -> TaskResult<()> {
        let parts: Vec<PartSource> = if self.files.was_compressed {
            self.files
                .files
                .iter()
                .zip(self.files.sizes.iter())
                .map(|(path, &size)| PartSource { path: path.clone(), offset: 0, len: size })
                .collect()
        } else {
            let path = self.files.files[0].clone();
            let size = self.files.sizes[0];
            let segment = agenda.segment_size();
            let count = (size / segment + u64::from(size % segment != 0)).max(1);
            (0..count)
                .map(|idx| {
                    let offset = idx * segment;
                    PartSource { path: path.clone(), offset, len: (size - offset).min(segment) }
                })
                .collect()
        };
        if parts.len() > MAX_PARTS {
            return Err(TaskError::fatal(format!(
                "segment size too small for {}: {} parts needed",
                self.description,
                parts.len()
            )));
        }

        let conn = Connection::new(&self.ctx);
        let upload_id = conn.initiate_multipart(&self.remote, &self.headers)?;
        let content = Arc::new(UploadContent {
            ctx: Arc::clone(&self.ctx),
            remote: self.remote.clone(),
            upload_id,
            description: self.description.clone(),
            slots: Mutex::new(UploadSlots {
                etags: vec![None; parts.len()],
                pending: parts.len(),
                completer: None,
                completed: false,
            }),
            files: Arc::clone(&self.files),
        });
        for (idx, source) in parts.into_iter().enumerate() {
            agenda.schedule(Box::new(PartUploadTask {
                content: Arc::clone(&content),
                part_num: idx + 1,
                source,
            }));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("Initiate multipart upload of {}", self.description)
    }
}

struct UploadSlots {
    etags: Vec<Option<String>>,
    pending: usize,
    /// Part number that owns the completion step; claimed atomically with
    /// the final decrement so exactly one task ever issues the complete.
    completer: Option<usize>,
    completed: bool,
}

/// Shared record of one multipart upload. Keeps the scattered scratch files
/// alive until every part has been sent.
struct UploadContent {
    ctx: Arc<Context>,
    remote: RemotePath,
    upload_id: String,
    description: String,
    slots: Mutex<UploadSlots>,
    files: Arc<ScatteredFiles>,
}

struct PartSource {
    path: PathBuf,
    offset: u64,
    len: u64,
}

/// Reads one part into a pool segment and PUTs it. The last part to report
/// in owns finalization and issues the multipart completion.
struct PartUploadTask {
    content: Arc<UploadContent>,
    part_num: usize,
    source: PartSource,
}

impl Task for PartUploadTask {
    fn class(&self) -> TaskClass {
        TaskClass::IoBound
    }

    fn ordinal(&self) -> i64 {
        self.part_num as i64
    }

    fn segments_needed(&self) -> usize {
        1
    }

    fn execute(&self, agenda: &Arc<Agenda>, segments: &mut Vec<Segment>) -> TaskResult<()> {
        let content = &self.content;
        let already_sent = content.slots.lock().unwrap().etags[self.part_num - 1].is_some();
        let conn = Connection::new(&content.ctx);
        let mut sent_etag = None;
        if !already_sent {
            let buf = segments[0].buffer();
            buf.clear();
            buf.resize(self.source.len as usize, 0);
            let mut src = File::open(&self.source.path).map_err(|e| {
                TaskError::io(format!("failed to open {}", self.source.path.display()), e)
            })?;
            src.seek(SeekFrom::Start(self.source.offset)).map_err(|e| {
                TaskError::io(format!("failed to seek {}", self.source.path.display()), e)
            })?;
            src.read_exact(buf).map_err(|e| {
                TaskError::io(format!("failed to read {}", self.source.path.display()), e)
            })?;

            sent_etag = Some(conn.upload_part(
                &content.remote,
                &content.upload_id,
                self.part_num,
                segments[0].bytes(),
                &Headers::new(),
            )?);
            agenda.add_stat_counter("uploaded", self.source.len);
        }

        let etags = {
            let mut slots = content.slots.lock().unwrap();
            if let Some(etag) = sent_etag {
                if slots.etags[self.part_num - 1].is_none() {
                    slots.etags[self.part_num - 1] = Some(etag);
                    slots.pending -= 1;
                }
            }
            let owns_completion =
                slots.completer.map_or(true, |owner| owner == self.part_num);
            if slots.pending == 0 && !slots.completed && owns_completion {
                slots.completer = Some(self.part_num);
                Some(slots.etags.iter().flatten().cloned().collect::<Vec<_>>())
            } else {
                None
            }
        };
        if let Some(etags) = etags {
            conn.complete_multipart(&content.remote, &content.upload_id, &etags)?;
            content.slots.lock().unwrap().completed = true;
            tracing::debug!("completed multipart upload of {}", content.remote);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("Upload part {} of {}", self.part_num, self.content.description)
    }
}

/// Deletes one remote object.
pub struct RemoteDeleter {
    ctx: Arc<Context>,
    remote: RemotePath,
}

impl RemoteDeleter {
    pub fn new(ctx: &Arc<Context>, remote: RemotePath) -> Self {
        Self { ctx: Arc::clone(ctx), remote }
    }
}

impl Task for RemoteDeleter {
    fn execute(&self, _agenda: &Arc<Agenda>, _segments: &mut Vec<Segment>) -> TaskResult<()> {
        tracing::info!("removing {}", self.remote);
        let conn = Connection::new(&self.ctx);
        conn.read_fully("DELETE", &self.remote, "", &Headers::new())?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("Delete {}", self.remote)
    }
}
