//! Remote namespace trees and the parallel recursive walk.
//!
//! A tree lives for the span of one listing operation. Parents own their
//! children; the child-to-parent link is weak so teardown stays top-down.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::agenda::{Agenda, Segment, Task};
use crate::error::TaskResult;
use crate::path::RemotePath;
use crate::remote::xml::ListPage;
use crate::remote::{Connection, Context};
use crate::sync::PatternFilter;

/// A file row of a shallow listing.
#[derive(Debug)]
pub struct RemoteFile {
    pub name: String,
    pub path: RemotePath,
    pub mtime_str: String,
    pub size: u64,
    pub parent: Weak<RemoteDirectory>,
}

#[derive(Default)]
pub struct DirEntries {
    pub files: BTreeMap<String, Arc<RemoteFile>>,
    pub subdirs: BTreeMap<String, Arc<RemoteDirectory>>,
}

/// A directory node. `entries` is mutated by whichever task lists this
/// level; sibling levels list concurrently during recursive walks.
pub struct RemoteDirectory {
    pub name: String,
    pub path: RemotePath,
    pub entries: Mutex<DirEntries>,
    pub parent: Weak<RemoteDirectory>,
}

impl RemoteDirectory {
    pub fn root(path: RemotePath) -> Arc<Self> {
        let name = path.file_name().to_string();
        Arc::new(Self {
            name,
            path,
            entries: Mutex::new(DirEntries::default()),
            parent: Weak::new(),
        })
    }

    pub fn is_empty(&self) -> bool {
        let entries = self.entries.lock().unwrap();
        entries.files.is_empty() && entries.subdirs.is_empty()
    }

    /// Snapshot of the subdirectory list.
    pub fn subdirs(&self) -> Vec<Arc<RemoteDirectory>> {
        self.entries.lock().unwrap().subdirs.values().cloned().collect()
    }

    /// Snapshot of the file list.
    pub fn files(&self) -> Vec<Arc<RemoteFile>> {
        self.entries.lock().unwrap().files.values().cloned().collect()
    }
}

/// Merges one listing page into `dir`. `prefix` is the key prefix the page
/// was requested with (no leading slash).
pub(super) fn attach_page(dir: &Arc<RemoteDirectory>, prefix: &str, page: &ListPage) {
    // A trailing-slash (or empty) prefix lists a directory level; anything
    // else is a try_root probe that only accepts the exact key.
    let dir_mode = prefix.is_empty() || prefix.ends_with('/');
    let mut entries = dir.entries.lock().unwrap();
    for entry in &page.contents {
        let name = match entry.key.strip_prefix(prefix) {
            // The directory marker object itself.
            Some("") if dir_mode => continue,
            // try_root probe hit an exact file key.
            Some("") => dir.path.file_name().to_string(),
            Some(rest) if dir_mode && !rest.contains('/') => rest.to_string(),
            _ => continue,
        };
        let path = RemotePath {
            zone: dir.path.zone.clone(),
            bucket: dir.path.bucket.clone(),
            key: format!("/{}", entry.key),
        };
        entries.files.insert(
            name.clone(),
            Arc::new(RemoteFile {
                name,
                path,
                mtime_str: entry.last_modified.clone(),
                size: entry.size,
                parent: Arc::downgrade(dir),
            }),
        );
    }
    for common in &page.common_prefixes {
        let Some(rest) = common.strip_prefix(prefix) else { continue };
        let name = if dir_mode {
            let trimmed = rest.trim_end_matches('/');
            if trimmed.is_empty() || trimmed.contains('/') {
                continue;
            }
            trimmed.to_string()
        } else if rest == "/" {
            // try_root probe: the key itself names a directory.
            dir.path.file_name().to_string()
        } else {
            continue;
        };
        let path = RemotePath {
            zone: dir.path.zone.clone(),
            bucket: dir.path.bucket.clone(),
            key: format!("/{}", common),
        };
        entries.subdirs.insert(
            name.clone(),
            Arc::new(RemoteDirectory {
                name,
                path,
                entries: Mutex::new(DirEntries::default()),
                parent: Arc::downgrade(dir),
            }),
        );
    }
}

/// What a recursive walk does with each listed level.
#[derive(Clone)]
pub enum WalkAction {
    /// Just build the tree (du, rm, sync pre-listing).
    Collect,
    /// Apply `public-read` to every file passing the filter.
    Publish { filter: Arc<PatternFilter>, published: Arc<AtomicUsize> },
    /// Print every file passing the filter.
    Print { filter: Arc<PatternFilter>, listed: Arc<AtomicUsize> },
}

/// Schedules a parallel recursive walk rooted at `path` and returns the
/// tree being built; it is complete once the agenda drains.
pub fn schedule_recursive_walk(
    path: &RemotePath,
    ctx: &Arc<Context>,
    agenda: &Arc<Agenda>,
    action: WalkAction,
) -> Arc<RemoteDirectory> {
    let root = RemoteDirectory::root(path.as_dir());
    agenda.schedule(Box::new(WalkDirTask {
        ctx: Arc::clone(ctx),
        dir: Arc::clone(&root),
        action,
    }));
    root
}

/// Lists one directory level, applies the walk action to its files, then
/// fans out one task per subdirectory.
struct WalkDirTask {
    ctx: Arc<Context>,
    dir: Arc<RemoteDirectory>,
    action: WalkAction,
}

impl Task for WalkDirTask {
    fn execute(&self, agenda: &Arc<Agenda>, _segments: &mut Vec<Segment>) -> TaskResult<()> {
        let conn = Connection::new(&self.ctx);
        conn.list_into(&self.dir, false)?;

        match &self.action {
            WalkAction::Collect => {}
            WalkAction::Publish { filter, published } => {
                for file in self.dir.files() {
                    if filter.matches(&file.name) {
                        published.fetch_add(1, Ordering::SeqCst);
                        agenda.schedule(Box::new(SetAclTask {
                            ctx: Arc::clone(&self.ctx),
                            path: file.path.clone(),
                        }));
                    }
                }
            }
            WalkAction::Print { filter, listed } => {
                for file in self.dir.files() {
                    if filter.matches(&file.name) {
                        listed.fetch_add(1, Ordering::SeqCst);
                        println!("{}\t{}\t{}", file.mtime_str, file.size, file.path);
                    }
                }
            }
        }

        for subdir in self.dir.subdirs() {
            agenda.schedule(Box::new(WalkDirTask {
                ctx: Arc::clone(&self.ctx),
                dir: subdir,
                action: self.action.clone(),
            }));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("List {}", self.dir.path)
    }
}

/// Applies the publication ACL to one object.
pub struct SetAclTask {
    pub ctx: Arc<Context>,
    pub path: RemotePath,
}

impl Task for SetAclTask {
    fn execute(&self, _agenda: &Arc<Agenda>, _segments: &mut Vec<Segment>) -> TaskResult<()> {
        let conn = Connection::new(&self.ctx);
        conn.set_acl(&self.path, "public-read")
    }

    fn describe(&self) -> String {
        format!("Publish {}", self.path)
    }
}
