//! Tree synchronization: lockstep diff of a local directory tree against a
//! remote prefix, emitting transfer/delete tasks into the agenda.
//!
//! `create_schedule` runs single-threaded and finishes before `run`; the
//! emitted uploaders/downloaders re-check mtime and size themselves, so a
//! second pass over an unchanged tree schedules only no-op tasks.

use anyhow::{Context as AnyhowContext, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::agenda::Agenda;
use crate::download::{FileDownloader, LocalDeleter};
use crate::path::RemotePath;
use crate::remote::{Connection, Context, RemoteDirectory};
use crate::upload::{FileUploader, RemoteDeleter};

/// Include/exclude name filter with shell-style globs.
///
/// A name passes iff it matches no excluded pattern, and the include list
/// is empty or matches it. Exclusion dominates inclusion.
pub struct PatternFilter {
    included: Option<GlobSet>,
    excluded: Option<GlobSet>,
}

impl PatternFilter {
    pub fn new(included: &[String], excluded: &[String]) -> Result<Self> {
        Ok(Self {
            included: Self::compile(included)?,
            excluded: Self::compile(excluded)?,
        })
    }

    pub fn pass_all() -> Self {
        Self { included: None, excluded: None }
    }

    fn compile(patterns: &[String]) -> Result<Option<GlobSet>> {
        if patterns.is_empty() {
            return Ok(None);
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("bad pattern: {}", pattern))?,
            );
        }
        Ok(Some(builder.build()?))
    }

    /// Filter for file names.
    pub fn matches(&self, name: &str) -> bool {
        if let Some(excluded) = &self.excluded {
            if excluded.is_match(name) {
                return false;
            }
        }
        match &self.included {
            Some(included) => included.is_match(name),
            None => true,
        }
    }

    /// Filter for directory names: only exclusion applies, so an include
    /// list of `*.log` still descends into subdirectories.
    pub fn allows_dir(&self, name: &str) -> bool {
        match &self.excluded {
            Some(excluded) => !excluded.is_match(name),
            None => true,
        }
    }
}

/// Transfer direction of one synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Walks local and remote trees in lockstep and schedules the work.
pub struct Synchronizer {
    agenda: Arc<Agenda>,
    ctx: Arc<Context>,
    remotes: Vec<RemotePath>,
    locals: Vec<PathBuf>,
    direction: Direction,
    delete_missing: bool,
    filter: Arc<PatternFilter>,
}

impl Synchronizer {
    pub fn new(
        agenda: &Arc<Agenda>,
        ctx: &Arc<Context>,
        remotes: Vec<RemotePath>,
        locals: Vec<PathBuf>,
        direction: Direction,
        delete_missing: bool,
        filter: Arc<PatternFilter>,
    ) -> Self {
        Self {
            agenda: Arc::clone(agenda),
            ctx: Arc::clone(ctx),
            remotes,
            locals,
            direction,
            delete_missing,
            filter,
        }
    }

    /// Builds the task schedule for one round. Returns false when a source
    /// does not exist.
    pub fn create_schedule(&self) -> Result<bool> {
        let conn = Connection::new(&self.ctx);
        match self.direction {
            Direction::Upload => {
                let root_path = self.remotes[0].as_dir();
                let remote_root = conn
                    .list_shallow(&root_path, false)
                    .map_err(|e| anyhow::anyhow!("failed to list {}: {}", root_path, e))?;
                for local in &self.locals {
                    let meta = match std::fs::metadata(local) {
                        Ok(meta) => meta,
                        Err(_) => return Ok(false),
                    };
                    if meta.is_dir() {
                        self.process_upload_dir(&conn, local, Some(&remote_root), &root_path)?;
                    } else {
                        let name = local
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_default();
                        if self.filter.matches(&name) {
                            self.agenda.schedule(Box::new(FileUploader::new(
                                &self.ctx,
                                local.clone(),
                                root_path.join(&name),
                            )));
                        }
                    }
                }
            }
            Direction::Download => {
                let local_root = &self.locals[0];
                for remote in &self.remotes {
                    let root_path = remote.as_dir();
                    let remote_root = conn
                        .list_shallow(&root_path, false)
                        .map_err(|e| anyhow::anyhow!("failed to list {}: {}", root_path, e))?;
                    if remote_root.is_empty() {
                        // Not a prefix; maybe a single object.
                        let desc = conn
                            .head(remote)
                            .map_err(|e| anyhow::anyhow!("failed to probe {}: {}", remote, e))?;
                        if !desc.found {
                            return Ok(false);
                        }
                        let target = local_root.join(remote.file_name());
                        self.agenda.schedule(Box::new(FileDownloader::new(
                            &self.ctx,
                            target,
                            remote.clone(),
                        )));
                        continue;
                    }
                    self.process_download_dir(&conn, &remote_root, local_root)?;
                }
            }
        }
        Ok(true)
    }

    /// Delete-only schedule (the `rm` command): synchronize against an
    /// empty local side. Returns false when nothing matched the paths.
    pub fn create_delete_schedule(&self, recursive: bool) -> Result<bool> {
        let conn = Connection::new(&self.ctx);
        let mut found = false;
        for remote in &self.remotes {
            let dir = conn
                .list_shallow(&remote.as_dir(), false)
                .map_err(|e| anyhow::anyhow!("failed to list {}: {}", remote, e))?;
            if !dir.is_empty() {
                found = true;
                self.schedule_remote_delete(&conn, &dir, recursive)?;
                continue;
            }
            // Maybe an exact object rather than a prefix.
            let desc = conn
                .head(remote)
                .map_err(|e| anyhow::anyhow!("failed to probe {}: {}", remote, e))?;
            if desc.found {
                found = true;
                if self.filter.matches(remote.file_name()) {
                    self.agenda.schedule(Box::new(RemoteDeleter::new(&self.ctx, remote.clone())));
                }
            }
        }
        Ok(found)
    }

    fn schedule_remote_delete(
        &self,
        conn: &Connection,
        dir: &Arc<RemoteDirectory>,
        recursive: bool,
    ) -> Result<()> {
        for file in dir.files() {
            if self.filter.matches(&file.name) {
                self.agenda
                    .schedule(Box::new(RemoteDeleter::new(&self.ctx, file.path.clone())));
            }
        }
        for subdir in dir.subdirs() {
            if !self.filter.allows_dir(&subdir.name) {
                continue;
            }
            if !recursive {
                tracing::warn!("skipping directory {} (use recursive delete)", subdir.path);
                continue;
            }
            conn.list_into(&subdir, false)
                .map_err(|e| anyhow::anyhow!("failed to list {}: {}", subdir.path, e))?;
            self.schedule_remote_delete(conn, &subdir, recursive)?;
        }
        Ok(())
    }

    fn process_upload_dir(
        &self,
        conn: &Connection,
        local_dir: &Path,
        remote_dir: Option<&Arc<RemoteDirectory>>,
        remote_path: &RemotePath,
    ) -> Result<()> {
        let mut remote_files = BTreeMap::new();
        let mut remote_subdirs = BTreeMap::new();
        if let Some(dir) = remote_dir {
            for file in dir.files() {
                remote_files.insert(file.name.clone(), file);
            }
            for subdir in dir.subdirs() {
                remote_subdirs.insert(subdir.name.clone(), subdir);
            }
        }

        let entries = std::fs::read_dir(local_dir)
            .with_context(|| format!("failed to read {}", local_dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", local_dir.display()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let local_path = entry.path();
            let file_type =
                entry.file_type().with_context(|| format!("failed to stat {}", local_path.display()))?;
            let child_remote = remote_path.join(&name);

            if file_type.is_dir() {
                if !self.filter.allows_dir(&name) {
                    remote_files.remove(&name);
                    remote_subdirs.remove(&name);
                    continue;
                }
                if let Some(conflicting) = remote_files.remove(&name) {
                    // A file sits where we need a directory prefix.
                    if self.delete_missing {
                        self.agenda.schedule(Box::new(RemoteDeleter::new(
                            &self.ctx,
                            conflicting.path.clone(),
                        )));
                        self.process_upload_dir(conn, &local_path, None, &child_remote.as_dir())?;
                    } else {
                        tracing::warn!(
                            "local directory {} is a file on the remote side; not allowed to remove it",
                            local_path.display()
                        );
                    }
                    remote_subdirs.remove(&name);
                    continue;
                }
                match remote_subdirs.remove(&name) {
                    Some(subdir) => {
                        conn.list_into(&subdir, false)
                            .map_err(|e| anyhow::anyhow!("failed to list {}: {}", subdir.path, e))?;
                        self.process_upload_dir(conn, &local_path, Some(&subdir), &child_remote.as_dir())?;
                    }
                    None => {
                        self.process_upload_dir(conn, &local_path, None, &child_remote.as_dir())?;
                    }
                }
            } else if file_type.is_file() {
                if !self.filter.matches(&name) {
                    remote_files.remove(&name);
                    remote_subdirs.remove(&name);
                    continue;
                }
                if let Some(conflicting) = remote_subdirs.remove(&name) {
                    // A directory prefix sits where we need a file.
                    if self.delete_missing {
                        conn.list_into(&conflicting, false)
                            .map_err(|e| anyhow::anyhow!("failed to list {}: {}", conflicting.path, e))?;
                        self.schedule_remote_delete(conn, &conflicting, true)?;
                    } else {
                        tracing::warn!(
                            "local file {} is a directory on the remote side; not allowed to remove it",
                            local_path.display()
                        );
                        remote_files.remove(&name);
                        continue;
                    }
                }
                remote_files.remove(&name);
                self.agenda.schedule(Box::new(FileUploader::new(
                    &self.ctx,
                    local_path,
                    child_remote,
                )));
            } else {
                tracing::warn!("unknown local file type: {}", local_path.display());
                remote_files.remove(&name);
                remote_subdirs.remove(&name);
            }
        }

        if self.delete_missing {
            // Entries present remotely with no local counterpart.
            for (name, file) in remote_files {
                if self.filter.matches(&name) {
                    self.agenda
                        .schedule(Box::new(RemoteDeleter::new(&self.ctx, file.path.clone())));
                }
            }
            for (name, subdir) in remote_subdirs {
                if self.filter.allows_dir(&name) {
                    conn.list_into(&subdir, false)
                        .map_err(|e| anyhow::anyhow!("failed to list {}: {}", subdir.path, e))?;
                    self.schedule_remote_delete(conn, &subdir, true)?;
                }
            }
        }
        Ok(())
    }

    fn process_download_dir(
        &self,
        conn: &Connection,
        remote_dir: &Arc<RemoteDirectory>,
        local_dir: &Path,
    ) -> Result<()> {
        let mut remote_files = BTreeMap::new();
        let mut remote_subdirs = BTreeMap::new();
        for file in remote_dir.files() {
            remote_files.insert(file.name.clone(), file);
        }
        for subdir in remote_dir.subdirs() {
            remote_subdirs.insert(subdir.name.clone(), subdir);
        }

        let entries = std::fs::read_dir(local_dir)
            .with_context(|| format!("failed to read {}", local_dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", local_dir.display()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let local_path = entry.path();
            let file_type =
                entry.file_type().with_context(|| format!("failed to stat {}", local_path.display()))?;

            if file_type.is_dir() {
                if !self.filter.allows_dir(&name) {
                    remote_files.remove(&name);
                    remote_subdirs.remove(&name);
                    continue;
                }
                if let Some(conflicting) = remote_files.remove(&name) {
                    // Remote file where a local directory sits.
                    if self.delete_missing {
                        self.agenda.schedule(Box::new(FileDownloader::replacing_dir(
                            &self.ctx,
                            local_path.clone(),
                            conflicting.path.clone(),
                        )));
                    } else {
                        tracing::warn!(
                            "remote file {} is a directory locally; not allowed to remove it",
                            conflicting.path
                        );
                    }
                    remote_subdirs.remove(&name);
                    continue;
                }
                match remote_subdirs.remove(&name) {
                    Some(subdir) => {
                        conn.list_into(&subdir, false)
                            .map_err(|e| anyhow::anyhow!("failed to list {}: {}", subdir.path, e))?;
                        self.process_download_dir(conn, &subdir, &local_path)?;
                    }
                    None => {
                        if self.delete_missing {
                            self.agenda.schedule(Box::new(LocalDeleter::new(local_path)));
                        }
                    }
                }
            } else if file_type.is_file() {
                if !self.filter.matches(&name) {
                    remote_files.remove(&name);
                    remote_subdirs.remove(&name);
                    continue;
                }
                if let Some(file) = remote_files.remove(&name) {
                    remote_subdirs.remove(&name);
                    self.agenda.schedule(Box::new(FileDownloader::new(
                        &self.ctx,
                        local_path,
                        file.path.clone(),
                    )));
                } else if let Some(subdir) = remote_subdirs.remove(&name) {
                    // Remote directory where a local file sits.
                    if self.delete_missing {
                        std::fs::remove_file(&local_path).with_context(|| {
                            format!("failed to remove {}", local_path.display())
                        })?;
                        std::fs::create_dir(&local_path).with_context(|| {
                            format!("failed to create {}", local_path.display())
                        })?;
                        conn.list_into(&subdir, false)
                            .map_err(|e| anyhow::anyhow!("failed to list {}: {}", subdir.path, e))?;
                        self.process_download_dir(conn, &subdir, &local_path)?;
                    } else {
                        tracing::warn!(
                            "remote directory {} is a file locally; not allowed to remove it",
                            subdir.path
                        );
                    }
                } else if self.delete_missing {
                    self.agenda.schedule(Box::new(LocalDeleter::new(local_path)));
                }
            } else {
                tracing::warn!("unknown local file type: {}", local_path.display());
            }
        }

        // Entries present remotely with no local counterpart: download them.
        for (name, file) in remote_files {
            if self.filter.matches(&name) {
                self.agenda.schedule(Box::new(FileDownloader::new(
                    &self.ctx,
                    local_dir.join(&name),
                    file.path.clone(),
                )));
            }
        }
        for (name, subdir) in remote_subdirs {
            if !self.filter.allows_dir(&name) {
                continue;
            }
            let local_path = local_dir.join(&name);
            std::fs::create_dir_all(&local_path)
                .with_context(|| format!("failed to create {}", local_path.display()))?;
            conn.list_into(&subdir, false)
                .map_err(|e| anyhow::anyhow!("failed to list {}: {}", subdir.path, e))?;
            self.process_download_dir(conn, &subdir, &local_path)?;
        }
        Ok(())
    }
}

/// Outcome of a schedule-and-run driver loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Everything drained, nothing failed.
    Clean,
    /// A source path did not exist.
    SourceMissing,
    /// Tasks exhausted their retries.
    TransferFailed(usize),
    /// The queue still held work after the retry rounds.
    WorkRemains,
}

/// Runs `create_schedule` followed by `agenda.run` up to three times. A run
/// that leaves queued tasks behind means completing tasks scheduled
/// follow-up work after the pool drained; the next round picks it up.
pub fn run_schedule_rounds(
    agenda: &Arc<Agenda>,
    mut schedule: impl FnMut() -> Result<bool>,
) -> Result<RunOutcome> {
    for _round in 0..3 {
        if !schedule()? {
            return Ok(RunOutcome::SourceMissing);
        }
        let failed = agenda.run();
        if failed > 0 {
            return Ok(RunOutcome::TransferFailed(failed));
        }
        if agenda.tasks_count() == 0 {
            return Ok(RunOutcome::Clean);
        }
        // Still pending work; go around again.
    }
    if agenda.tasks_count() > 0 {
        for line in agenda.queued_descriptions() {
            tracing::error!("still pending: {}", line);
        }
        return Ok(RunOutcome::WorkRemains);
    }
    Ok(RunOutcome::Clean)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_passes_everything() {
        let filter = PatternFilter::pass_all();
        assert!(filter.matches("anything.txt"));
        assert!(filter.allows_dir("dir"));
    }

    #[test]
    fn include_list_restricts_files() {
        let filter = PatternFilter::new(&["*.log".to_string()], &[]).unwrap();
        assert!(filter.matches("app.log"));
        assert!(!filter.matches("notes.txt"));
        // Directories still allowed so the walk can descend.
        assert!(filter.allows_dir("subdir"));
    }

    #[test]
    fn exclusion_dominates_inclusion() {
        let filter =
            PatternFilter::new(&["*.log".to_string()], &["debug-*.log".to_string()]).unwrap();
        assert!(filter.matches("app.log"));
        assert!(!filter.matches("debug-1.log"));
        assert!(!filter.matches("notes.txt"));
    }

    #[test]
    fn excluded_directories_are_skipped() {
        let filter = PatternFilter::new(&[], &["node_modules".to_string()]).unwrap();
        assert!(!filter.allows_dir("node_modules"));
        assert!(filter.allows_dir("src"));
    }

    #[test]
    fn bad_patterns_are_rejected() {
        assert!(PatternFilter::new(&["[".to_string()], &[]).is_err());
    }
}
