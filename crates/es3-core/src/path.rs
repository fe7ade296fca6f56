//! Remote path model: `s3://bucket/key` addressing.

use anyhow::{bail, Result};
use std::fmt;

/// A remote object or prefix. Keys use `/` separators and always start with
/// `/`; a trailing `/` denotes a directory prefix. Ordering is
/// lexicographic by (zone, bucket, key).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemotePath {
    pub zone: String,
    pub bucket: String,
    pub key: String,
}

impl RemotePath {
    /// Parses `s3://bucket/key`. The zone is resolved later via
    /// `find_region`; an empty key becomes `/`.
    pub fn parse(url: &str) -> Result<Self> {
        let Some(rest) = url.strip_prefix("s3://") else {
            bail!("not an s3:// path: {}", url);
        };
        let (bucket, key) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if bucket.is_empty() {
            bail!("missing bucket name in {}", url);
        }
        Ok(Self { zone: String::new(), bucket: bucket.to_string(), key: key.to_string() })
    }

    /// True for any string that addresses remote storage.
    pub fn is_remote(spec: &str) -> bool {
        spec.starts_with("s3://")
    }

    /// Appends a child name, inserting a separator when needed.
    pub fn join(&self, name: &str) -> Self {
        let mut res = self.clone();
        if name.is_empty() {
            return res;
        }
        if !res.key.ends_with('/') && !name.starts_with('/') {
            res.key.push('/');
        }
        res.key.push_str(name);
        res
    }

    /// Key as a directory prefix (trailing `/` guaranteed).
    pub fn as_dir(&self) -> Self {
        let mut res = self.clone();
        if !res.key.ends_with('/') {
            res.key.push('/');
        }
        res
    }

    /// Last component of the key, without any trailing `/`.
    pub fn file_name(&self) -> &str {
        self.key.trim_end_matches('/').rsplit('/').next().unwrap_or("")
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}{}", self.bucket, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bucket_and_key() {
        let p = RemotePath::parse("s3://data/some/dir/file.bin").unwrap();
        assert_eq!(p.bucket, "data");
        assert_eq!(p.key, "/some/dir/file.bin");
        assert_eq!(p.to_string(), "s3://data/some/dir/file.bin");
    }

    #[test]
    fn parse_bare_bucket() {
        let p = RemotePath::parse("s3://data").unwrap();
        assert_eq!(p.bucket, "data");
        assert_eq!(p.key, "/");
    }

    #[test]
    fn parse_rejects_non_remote() {
        assert!(RemotePath::parse("/local/path").is_err());
        assert!(RemotePath::parse("s3://").is_err());
        assert!(!RemotePath::is_remote("/local/path"));
        assert!(RemotePath::is_remote("s3://b/k"));
    }

    #[test]
    fn join_inserts_separator() {
        let p = RemotePath::parse("s3://b/dir").unwrap();
        assert_eq!(p.join("child").key, "/dir/child");
        let d = RemotePath::parse("s3://b/dir/").unwrap();
        assert_eq!(d.join("child").key, "/dir/child");
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = RemotePath { zone: "r1".into(), bucket: "a".into(), key: "/x".into() };
        let b = RemotePath { zone: "r1".into(), bucket: "b".into(), key: "/a".into() };
        assert!(a < b);
    }

    #[test]
    fn file_name_strips_dir_slash() {
        let p = RemotePath::parse("s3://b/a/sub/").unwrap();
        assert_eq!(p.file_name(), "sub");
        let f = RemotePath::parse("s3://b/a/file").unwrap();
        assert_eq!(f.file_name(), "file");
    }
}
