//! Remote operations: request composition, signing and the S3 REST
//! primitives (list / get / put / multipart / head / acl).
//!
//! Every request borrows a pooled curl handle for its zone/bucket, signs
//! with signature v2 and classifies failures for the retry loop: 5xx and
//! connection trouble are retryable, 4xx other than 404 is fatal, and 404 on
//! HEAD is the `found = false` sentinel rather than an error.

pub mod listing;
mod pool;
mod sign;
mod xml;

pub use listing::{RemoteDirectory, RemoteFile, WalkAction};
pub use pool::{ConnectionPool, PooledClient};
pub use xml::ListEntry;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Es3Config;
use crate::error::{classify_http_status, TaskError, TaskResult};
use crate::path::RemotePath;

/// Part numbers are 1-based and capped by the protocol.
pub const MAX_PARTS: usize = 9999;

/// Header map. Sorted so canonicalized amz headers sign deterministically.
pub type Headers = BTreeMap<String, String>;

/// Metadata of a remote object as stored by es3 uploads.
/// `raw_size != remote_size` only for compressed objects. `found = false`
/// is a sentinel for a missing object, not a failure.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub mtime: i64,
    pub raw_size: u64,
    pub remote_size: u64,
    pub mode: u32,
    pub compressed: bool,
    pub found: bool,
}

impl Default for FileDescriptor {
    fn default() -> Self {
        Self { mtime: 0, raw_size: 0, remote_size: 0, mode: 0o664, compressed: false, found: false }
    }
}

/// Shared engine state: configuration, the connection pool and the
/// per-bucket region cache.
pub struct Context {
    pub cfg: Es3Config,
    pool: Arc<ConnectionPool>,
    regions: Mutex<HashMap<String, String>>,
}

impl Context {
    pub fn new(cfg: Es3Config) -> Arc<Self> {
        Arc::new(Self { cfg, pool: ConnectionPool::new(), regions: Mutex::new(HashMap::new()) })
    }

    pub fn scratch_dir(&self) -> &std::path::Path {
        &self.cfg.scratch_dir
    }
}

struct Response {
    status: u32,
    headers: Vec<String>,
}

/// One logical S3 connection. Cheap to construct; the underlying curl
/// handles come from the context's pool.
pub struct Connection {
    ctx: Arc<Context>,
}

impl Connection {
    pub fn new(ctx: &Arc<Context>) -> Self {
        Self { ctx: Arc::clone(ctx) }
    }

    /// Resolves and caches the bucket's region, storing it into `path.zone`.
    pub fn resolve_zone(&self, path: &mut RemotePath) -> TaskResult<()> {
        if !path.zone.is_empty() {
            return Ok(());
        }
        {
            let regions = self.ctx.regions.lock().unwrap();
            if let Some(zone) = regions.get(&path.bucket) {
                path.zone = zone.clone();
                return Ok(());
            }
        }
        let zone = self.find_region(&path.bucket)?;
        self.ctx.regions.lock().unwrap().insert(path.bucket.clone(), zone.clone());
        path.zone = zone;
        Ok(())
    }

    /// Looks up the bucket's region code and maps it to a request zone.
    pub fn find_region(&self, bucket: &str) -> TaskResult<String> {
        let probe = RemotePath { zone: "s3".into(), bucket: bucket.into(), key: "/".into() };
        let mut body = Vec::new();
        let resp = self.transact("GET", &probe, "location", &Headers::new(), &[], &mut body)?;
        self.check_status(&resp, &probe, "GET")?;
        let constraint = xml::parse_location_constraint(&body)
            .map_err(|e| TaskError::fatal(format!("bad location response for {}: {}", bucket, e)))?;
        Ok(match constraint.as_str() {
            "" => "s3".to_string(),
            "EU" => "s3-eu-west-1".to_string(),
            code => format!("s3-{}", code),
        })
    }

    /// Issues a request and returns the whole response body.
    pub fn read_fully(
        &self,
        verb: &str,
        path: &RemotePath,
        query: &str,
        headers: &Headers,
    ) -> TaskResult<Vec<u8>> {
        let mut body = Vec::new();
        let resp = self.transact(verb, path, query, headers, &[], &mut body)?;
        self.check_status(&resp, path, verb)?;
        Ok(body)
    }

    /// Uploads one multipart part, or the whole object when `upload_id` is
    /// empty and `part_num` is 0. Returns the part's etag.
    ///
    /// After a retryable failure the part list is consulted: when the part
    /// already landed with the right number, the upload counts as done.
    pub fn upload_part(
        &self,
        path: &RemotePath,
        upload_id: &str,
        part_num: usize,
        data: &[u8],
        headers: &Headers,
    ) -> TaskResult<String> {
        let query = if upload_id.is_empty() {
            String::new()
        } else {
            format!("partNumber={}&uploadId={}", part_num, upload_id)
        };
        let mut body = Vec::new();
        let attempt = self
            .transact("PUT", path, &query, headers, data, &mut body)
            .and_then(|resp| self.check_status(&resp, path, "PUT").map(|_| resp));
        match attempt {
            Ok(resp) => Ok(find_header(&resp.headers, "ETag")
                .map(|v| v.trim_matches('"').to_string())
                .unwrap_or_default()),
            Err(err) => {
                if !upload_id.is_empty() {
                    // The PUT may have completed before the connection died.
                    let query = format!("uploadId={}", upload_id);
                    if let Ok(listing) = self.read_fully("GET", path, &query, &Headers::new()) {
                        if let Ok(Some(etag)) = xml::find_uploaded_part(&listing, part_num) {
                            tracing::debug!(
                                "part {} of {} already present, skipping",
                                part_num,
                                path
                            );
                            return Ok(etag);
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// Fetches `len` bytes at `offset` into `buf` (replacing its contents).
    pub fn download_range(
        &self,
        path: &RemotePath,
        offset: u64,
        len: u64,
        headers: &Headers,
        buf: &mut Vec<u8>,
    ) -> TaskResult<()> {
        buf.clear();
        if len == 0 {
            return Ok(());
        }
        let mut with_range = headers.clone();
        with_range.insert("Range".to_string(), format!("bytes={}-{}", offset, offset + len - 1));
        let resp = self.transact("GET", path, "", &with_range, &[], buf)?;
        self.check_status(&resp, path, "GET")?;
        if buf.len() as u64 != len {
            return Err(TaskError::warn(format!(
                "short read from {}: wanted {} bytes at {}, got {}",
                path,
                len,
                offset,
                buf.len()
            )));
        }
        Ok(())
    }

    /// HEADs the object, decoding the custom metadata es3 stores at upload
    /// time. A 404 yields `found = false`.
    pub fn head(&self, path: &RemotePath) -> TaskResult<FileDescriptor> {
        let mut body = Vec::new();
        let resp = self.transact("HEAD", path, "", &Headers::new(), &[], &mut body)?;
        if resp.status == 404 {
            return Ok(FileDescriptor::default());
        }
        self.check_status(&resp, path, "HEAD")?;

        let mut desc = FileDescriptor { found: true, ..Default::default() };
        desc.remote_size = find_header(&resp.headers, "Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        desc.raw_size = desc.remote_size;
        if let Some(v) = find_header(&resp.headers, "x-amz-meta-mtime") {
            desc.mtime = v.parse().unwrap_or(0);
        }
        if let Some(v) = find_header(&resp.headers, "x-amz-meta-mode") {
            desc.mode = u32::from_str_radix(&v, 8).unwrap_or(0o664);
        }
        if let Some(v) = find_header(&resp.headers, "x-amz-meta-raw-size") {
            desc.raw_size = v.parse().unwrap_or(desc.remote_size);
        }
        if find_header(&resp.headers, "x-amz-meta-compressed").is_some() {
            desc.compressed = true;
        }
        Ok(desc)
    }

    /// Starts a multipart upload and returns its upload id.
    pub fn initiate_multipart(&self, path: &RemotePath, headers: &Headers) -> TaskResult<String> {
        let mut body = Vec::new();
        let resp = self.transact("POST", path, "uploads", headers, &[], &mut body)?;
        self.check_status(&resp, path, "POST")?;
        xml::parse_upload_id(&body)
            .map_err(|e| TaskError::fatal(format!("multipart initiation for {}: {}", path, e)))
    }

    /// Completes a multipart upload. `etags` must be ordered by part number.
    pub fn complete_multipart(
        &self,
        path: &RemotePath,
        upload_id: &str,
        etags: &[String],
    ) -> TaskResult<String> {
        let payload = xml::emit_complete_body(etags);
        let mut headers = Headers::new();
        headers.insert("Content-Type".to_string(), "application/xml".to_string());
        let query = format!("uploadId={}", upload_id);
        let mut body = Vec::new();
        let resp = self.transact("POST", path, &query, &headers, payload.as_bytes(), &mut body)?;
        self.check_status(&resp, path, "POST")?;
        xml::parse_complete_location(&body)
            .map_err(|e| TaskError::fatal(format!("multipart completion for {}: {}", path, e)))
    }

    /// Applies a canned ACL to one object.
    pub fn set_acl(&self, path: &RemotePath, acl: &str) -> TaskResult<()> {
        let mut headers = Headers::new();
        headers.insert("x-amz-acl".to_string(), acl.to_string());
        let mut body = Vec::new();
        let resp = self.transact("PUT", path, "acl", &headers, &[], &mut body)?;
        self.check_status(&resp, path, "PUT")
    }

    /// Shallow listing of `path` with delimiter `/`. With `try_root` the key
    /// is probed as-is, so a file path resolves to a one-file directory.
    pub fn list_shallow(&self, path: &RemotePath, try_root: bool) -> TaskResult<Arc<RemoteDirectory>> {
        let dir = RemoteDirectory::root(path.clone());
        self.list_into(&dir, try_root)?;
        Ok(dir)
    }

    /// Populates `dir` with its direct children.
    pub fn list_into(&self, dir: &Arc<RemoteDirectory>, try_root: bool) -> TaskResult<()> {
        let path = dir.path.clone();
        let mut prefix = path.key.trim_start_matches('/').to_string();
        if !prefix.is_empty() && !prefix.ends_with('/') && !try_root {
            prefix.push('/');
        }
        let bucket_root = RemotePath { zone: path.zone.clone(), bucket: path.bucket.clone(), key: "/".into() };

        let mut marker = String::new();
        loop {
            let mut query = format!("delimiter=%2F&prefix={}", percent_encode(&prefix));
            if !marker.is_empty() {
                query.push_str(&format!("&marker={}", percent_encode(&marker)));
            }
            let body = self.read_fully("GET", &bucket_root, &query, &Headers::new())?;
            let page = xml::parse_list_page(&body)
                .map_err(|e| TaskError::fatal(format!("bad listing for {}: {}", path, e)))?;
            listing::attach_page(dir, &prefix, &page);
            match (page.truncated, page.next_marker) {
                (true, Some(next)) => marker = next,
                _ => break,
            }
        }
        Ok(())
    }

    fn check_status(&self, resp: &Response, path: &RemotePath, verb: &str) -> TaskResult<()> {
        if (200..300).contains(&resp.status) {
            return Ok(());
        }
        let msg = format!("{} {} returned HTTP {}", verb, path, resp.status);
        Err(match classify_http_status(resp.status) {
            crate::error::Severity::Warn => TaskError::warn(msg),
            _ => TaskError::fatal(msg),
        })
    }

    fn url_for(&self, path: &RemotePath, query: &str) -> String {
        let scheme = if self.ctx.cfg.use_ssl { "https" } else { "http" };
        let host = if self.ctx.cfg.endpoint.is_empty() {
            let zone = if path.zone.is_empty() { "s3" } else { path.zone.as_str() };
            format!("{}.amazonaws.com", zone)
        } else {
            self.ctx.cfg.endpoint.clone()
        };
        let mut url = format!("{}://{}/{}{}", scheme, host, path.bucket, percent_encode_key(&path.key));
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    /// Single request/response exchange. The body (if any) is streamed from
    /// `upload`; the response body lands in `sink`.
    fn transact(
        &self,
        verb: &str,
        path: &RemotePath,
        query: &str,
        headers: &Headers,
        upload: &[u8],
        sink: &mut Vec<u8>,
    ) -> TaskResult<Response> {
        let url = self.url_for(path, query);
        let date = sign::http_date();
        let content_type = headers.get("Content-Type").cloned().unwrap_or_default();
        let resource = sign::canonical_resource(&path.bucket, &path.key, query);
        let auth = sign::authorization(
            &self.ctx.cfg.access_key,
            &self.ctx.cfg.secret_key,
            verb,
            &content_type,
            &date,
            headers,
            &resource,
        );

        let mut client = self.ctx.pool.acquire(&path.zone, &path.bucket);
        let mut resp_headers: Vec<String> = Vec::new();
        let result: Result<(), curl::Error> = (|| {
            let easy = client.easy();
            easy.reset();
            easy.url(&url)?;
            match verb {
                "GET" => {}
                "HEAD" => easy.nobody(true)?,
                "PUT" => {
                    easy.upload(true)?;
                    easy.in_filesize(upload.len() as u64)?;
                }
                "POST" => {
                    easy.post(true)?;
                    easy.post_field_size(upload.len() as u64)?;
                }
                other => easy.custom_request(other)?,
            }
            easy.connect_timeout(Duration::from_secs(30))?;
            // Abort on a stalled link rather than a hard wall clock, so big
            // parts on slow links are not killed mid-transfer.
            easy.low_speed_limit(1024)?;
            easy.low_speed_time(Duration::from_secs(60))?;

            let mut list = curl::easy::List::new();
            list.append(&format!("Date: {}", date))?;
            list.append(&format!("Authorization: {}", auth))?;
            for (name, value) in headers {
                list.append(&format!("{}: {}", name, value))?;
            }
            // Suppress 100-continue handshakes on PUT/POST.
            list.append("Expect:")?;
            easy.http_headers(list)?;

            let mut sent = 0usize;
            let mut transfer = easy.transfer();
            // Always installed: without it curl falls back to reading the
            // process stdin for PUT/POST bodies.
            transfer.read_function(move |into| {
                let n = (upload.len() - sent).min(into.len());
                into[..n].copy_from_slice(&upload[sent..sent + n]);
                sent += n;
                Ok(n)
            })?;
            transfer.header_function(|line| {
                if let Ok(text) = std::str::from_utf8(line) {
                    resp_headers.push(text.trim_end().to_string());
                }
                true
            })?;
            transfer.write_function(|data| {
                sink.extend_from_slice(data);
                Ok(data.len())
            })?;
            transfer.perform()
        })();

        if let Err(e) = result {
            client.taint();
            return Err(TaskError::from(e));
        }
        let status = client.easy().response_code().map_err(TaskError::from)?;
        if status >= 500 {
            // Keep server-error responses off the reuse stack; the
            // connection state after a 5xx is suspect. A 404 HEAD probe is
            // a normal answer, not an error.
            client.taint();
        }
        Ok(Response { status, headers: resp_headers })
    }
}

/// First matching response header value, case-insensitive.
fn find_header(headers: &[String], name: &str) -> Option<String> {
    for line in headers {
        if let Some((header, value)) = line.split_once(':') {
            if header.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

fn percent_encode(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Like `percent_encode` but keeps `/` separators.
fn percent_encode_key(key: &str) -> String {
    key.split('/').map(percent_encode).collect::<Vec<_>>().join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_header_is_case_insensitive() {
        let headers = vec![
            "HTTP/1.1 200 OK".to_string(),
            "Content-Length: 42".to_string(),
            "ETag: \"abc\"".to_string(),
        ];
        assert_eq!(find_header(&headers, "content-length").as_deref(), Some("42"));
        assert_eq!(find_header(&headers, "etag").as_deref(), Some("\"abc\""));
        assert_eq!(find_header(&headers, "x-amz-meta-mtime"), None);
    }

    #[test]
    fn key_encoding_preserves_separators() {
        assert_eq!(percent_encode_key("/a/b c.txt"), "/a/b%20c.txt");
        assert_eq!(percent_encode("dir/"), "dir%2F");
    }

    #[test]
    fn urls_use_zone_host_or_endpoint() {
        let mut cfg = Es3Config::default();
        let ctx = Context::new(cfg.clone());
        let conn = Connection::new(&ctx);
        let path = RemotePath { zone: "s3-eu-west-1".into(), bucket: "b".into(), key: "/k".into() };
        assert_eq!(conn.url_for(&path, ""), "http://s3-eu-west-1.amazonaws.com/b/k");

        cfg.endpoint = "127.0.0.1:9999".into();
        let ctx = Context::new(cfg);
        let conn = Connection::new(&ctx);
        assert_eq!(conn.url_for(&path, "uploads"), "http://127.0.0.1:9999/b/k?uploads");
    }
}
