//! Minimal threaded S3 stub for integration tests.
//!
//! Speaks just enough of the REST surface: HEAD / GET (with Range) / PUT /
//! DELETE on objects, `?uploads` / `?uploadId` / `?partNumber` multipart,
//! `?delimiter`+`?prefix` listing, `?location`, `?acl`, and `x-amz-meta-*`
//! round-tripping. Connections are served keep-alive since the client pools
//! its handles. Failures can be injected to exercise the retry loop.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Debug, Clone, Default)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub meta: BTreeMap<String, String>,
    pub content_type: String,
}

#[derive(Debug, Default)]
struct MultipartUpload {
    key: String,
    parts: BTreeMap<usize, (Vec<u8>, String)>,
    meta: BTreeMap<String, String>,
    content_type: String,
}

#[derive(Default)]
struct Store {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, MultipartUpload>,
    acls: HashMap<String, String>,
    next_upload_id: usize,
    /// Remaining count of PUT-with-body requests to fail with a 500.
    fail_puts: usize,
}

/// Handle to a running stub server.
pub struct FakeS3 {
    pub addr: String,
    store: Arc<Mutex<Store>>,
    body_gets: Arc<AtomicUsize>,
    put_attempts: Arc<AtomicUsize>,
}

impl FakeS3 {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let store: Arc<Mutex<Store>> = Arc::new(Mutex::new(Store::default()));
        let body_gets = Arc::new(AtomicUsize::new(0));
        let put_attempts = Arc::new(AtomicUsize::new(0));

        {
            let store = Arc::clone(&store);
            let body_gets = Arc::clone(&body_gets);
            let put_attempts = Arc::clone(&put_attempts);
            thread::spawn(move || {
                for stream in listener.incoming().flatten() {
                    let store = Arc::clone(&store);
                    let body_gets = Arc::clone(&body_gets);
                    let put_attempts = Arc::clone(&put_attempts);
                    thread::spawn(move || serve(stream, store, body_gets, put_attempts));
                }
            });
        }

        Self { addr, store, body_gets, put_attempts }
    }

    /// Key (without bucket) -> object map snapshot of one bucket.
    pub fn objects(&self, bucket: &str) -> BTreeMap<String, StoredObject> {
        let prefix = format!("{}/", bucket);
        let store = self.store.lock().unwrap();
        store
            .objects
            .iter()
            .filter_map(|(full, obj)| {
                full.strip_prefix(&prefix).map(|key| (key.to_string(), obj.clone()))
            })
            .collect()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.store.lock().unwrap().objects.get(&format!("{}/{}", bucket, key)).cloned()
    }

    pub fn insert_object(&self, bucket: &str, key: &str, obj: StoredObject) {
        self.store
            .lock()
            .unwrap()
            .objects
            .insert(format!("{}/{}", bucket, key), obj);
    }

    pub fn acl_of(&self, bucket: &str, key: &str) -> Option<String> {
        self.store.lock().unwrap().acls.get(&format!("{}/{}", bucket, key)).cloned()
    }

    /// Fails the next `count` body PUTs with HTTP 500.
    pub fn inject_put_failures(&self, count: usize) {
        self.store.lock().unwrap().fail_puts = count;
    }

    /// Number of GETs that returned object bytes.
    pub fn body_get_count(&self) -> usize {
        self.body_gets.load(Ordering::SeqCst)
    }

    /// Number of PUT attempts carrying object/part bytes.
    pub fn put_attempt_count(&self) -> usize {
        self.put_attempts.load(Ordering::SeqCst)
    }
}

struct Request {
    method: String,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

fn serve(
    mut stream: TcpStream,
    store: Arc<Mutex<Store>>,
    body_gets: Arc<AtomicUsize>,
    put_attempts: Arc<AtomicUsize>,
) {
    let _ = stream.set_read_timeout(Some(std::time::Duration::from_secs(10)));
    let _ = stream.set_write_timeout(Some(std::time::Duration::from_secs(10)));
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let Some(request) = read_request(&mut stream, &mut pending) else { return };
        let response = route(&request, &store, &body_gets, &put_attempts);
        if stream.write_all(&response).is_err() {
            return;
        }
    }
}

/// Reads one full request (head + body) from the stream. `pending` carries
/// bytes read past the previous request on a keep-alive connection.
fn read_request(stream: &mut TcpStream, pending: &mut Vec<u8>) -> Option<Request> {
    let mut buf = [0u8; 16 * 1024];
    let head_end = loop {
        if let Some(pos) = find_head_end(pending) {
            break pos;
        }
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => return None,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
        }
    };

    let head = String::from_utf8_lossy(&pending[..head_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize =
        headers.get("content-length").and_then(|v| v.parse().ok()).unwrap_or(0);
    let body_start = head_end + 4;
    while pending.len() < body_start + content_length {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => return None,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
        }
    }
    let body = pending[body_start..body_start + content_length].to_vec();
    pending.drain(..body_start + content_length);

    let (path, query_text) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target, String::new()),
    };
    let mut query = HashMap::new();
    for pair in query_text.split('&').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((name, value)) => query.insert(name.to_string(), url_decode(value)),
            None => query.insert(pair.to_string(), String::new()),
        };
    }

    Some(Request { method, path: url_decode(&path), query, headers, body })
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn url_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&text[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

fn response(status: &str, headers: &[(String, String)], body: &[u8]) -> Vec<u8> {
    let mut text = format!("HTTP/1.1 {}\r\nContent-Length: {}\r\n", status, body.len());
    for (name, value) in headers {
        text.push_str(&format!("{}: {}\r\n", name, value));
    }
    text.push_str("\r\n");
    let mut out = text.into_bytes();
    out.extend_from_slice(body);
    out
}

fn simple(status: &str) -> Vec<u8> {
    response(status, &[], b"")
}

fn route(
    req: &Request,
    store: &Arc<Mutex<Store>>,
    body_gets: &Arc<AtomicUsize>,
    put_attempts: &Arc<AtomicUsize>,
) -> Vec<u8> {
    // Path is /bucket[/key...].
    let trimmed = req.path.trim_start_matches('/');
    let (bucket, key) = match trimmed.split_once('/') {
        Some((bucket, key)) => (bucket.to_string(), key.to_string()),
        None => (trimmed.to_string(), String::new()),
    };
    let full_key = format!("{}/{}", bucket, key);

    match req.method.as_str() {
        "GET" if req.query.contains_key("location") => {
            response(
                "200 OK",
                &[],
                b"<?xml version=\"1.0\"?><LocationConstraint></LocationConstraint>",
            )
        }
        "GET" if req.query.contains_key("uploadId") => {
            let store = store.lock().unwrap();
            let Some(upload) = store.uploads.get(&req.query["uploadId"]) else {
                return simple("404 Not Found");
            };
            let mut body = String::from("<ListPartsResult>");
            for (num, (data, etag)) in &upload.parts {
                body.push_str(&format!(
                    "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag><Size>{}</Size></Part>",
                    num,
                    etag,
                    data.len()
                ));
            }
            body.push_str("</ListPartsResult>");
            response("200 OK", &[], body.as_bytes())
        }
        "GET" if req.query.contains_key("prefix") || req.query.contains_key("delimiter") => {
            list_bucket(req, &bucket, store)
        }
        "GET" => {
            let store = store.lock().unwrap();
            let Some(object) = store.objects.get(&full_key) else {
                return simple("404 Not Found");
            };
            body_gets.fetch_add(1, Ordering::SeqCst);
            let total = object.data.len() as u64;
            match req.headers.get("range").and_then(|r| parse_range(r)) {
                Some((start, end_incl)) => {
                    let start = start.min(total);
                    let end_excl = (end_incl + 1).min(total);
                    let slice = &object.data[start as usize..end_excl as usize];
                    response(
                        "206 Partial Content",
                        &[(
                            "Content-Range".to_string(),
                            format!("bytes {}-{}/{}", start, end_excl.saturating_sub(1), total),
                        )],
                        slice,
                    )
                }
                None => response("200 OK", &[], &object.data),
            }
        }
        "HEAD" => {
            let store = store.lock().unwrap();
            let Some(object) = store.objects.get(&full_key) else {
                return simple("404 Not Found");
            };
            let mut headers: Vec<(String, String)> = object
                .meta
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            if !object.content_type.is_empty() {
                headers.push(("Content-Type".to_string(), object.content_type.clone()));
            }
            // Careful: our Content-Length states the body size a GET would
            // return, but this response itself has no body.
            response_head_only(&headers, object.data.len())
        }
        "PUT" if req.query.contains_key("acl") => {
            store.lock().unwrap().acls.insert(full_key, "public-read".to_string());
            simple("200 OK")
        }
        "PUT" if req.query.contains_key("partNumber") => {
            put_attempts.fetch_add(1, Ordering::SeqCst);
            let mut store = store.lock().unwrap();
            if store.fail_puts > 0 {
                store.fail_puts -= 1;
                return simple("500 Internal Server Error");
            }
            let part_num: usize = req.query["partNumber"].parse().unwrap_or(0);
            let Some(upload) = store.uploads.get_mut(&req.query["uploadId"]) else {
                return simple("404 Not Found");
            };
            let etag = format!("part-{}-{}", part_num, req.body.len());
            upload.parts.insert(part_num, (req.body.clone(), etag.clone()));
            response("200 OK", &[("ETag".to_string(), format!("\"{}\"", etag))], b"")
        }
        "PUT" => {
            put_attempts.fetch_add(1, Ordering::SeqCst);
            let mut store = store.lock().unwrap();
            if store.fail_puts > 0 {
                store.fail_puts -= 1;
                return simple("500 Internal Server Error");
            }
            let object = StoredObject {
                data: req.body.clone(),
                meta: amz_meta(&req.headers),
                content_type: req.headers.get("content-type").cloned().unwrap_or_default(),
            };
            store.objects.insert(full_key, object);
            response("200 OK", &[("ETag".to_string(), "\"simple\"".to_string())], b"")
        }
        "POST" if req.query.contains_key("uploads") => {
            let mut store = store.lock().unwrap();
            store.next_upload_id += 1;
            let id = format!("upload-{}", store.next_upload_id);
            store.uploads.insert(
                id.clone(),
                MultipartUpload {
                    key: full_key,
                    parts: BTreeMap::new(),
                    meta: amz_meta(&req.headers),
                    content_type: req.headers.get("content-type").cloned().unwrap_or_default(),
                },
            );
            let body = format!(
                "<InitiateMultipartUploadResult><UploadId>{}</UploadId></InitiateMultipartUploadResult>",
                id
            );
            response("200 OK", &[], body.as_bytes())
        }
        "POST" if req.query.contains_key("uploadId") => {
            let mut store = store.lock().unwrap();
            let Some(upload) = store.uploads.remove(&req.query["uploadId"]) else {
                return simple("404 Not Found");
            };
            let mut data = Vec::new();
            for (_num, (part, _etag)) in upload.parts.iter() {
                data.extend_from_slice(part);
            }
            let object = StoredObject {
                data,
                meta: upload.meta.clone(),
                content_type: upload.content_type.clone(),
            };
            store.objects.insert(upload.key.clone(), object);
            let body = format!(
                "<CompleteMultipartUploadResult><Location>/{}</Location></CompleteMultipartUploadResult>",
                upload.key
            );
            response("200 OK", &[], body.as_bytes())
        }
        "DELETE" => {
            let mut store = store.lock().unwrap();
            if store.objects.remove(&full_key).is_some() {
                simple("204 No Content")
            } else {
                simple("404 Not Found")
            }
        }
        _ => simple("405 Method Not Allowed"),
    }
}

/// HEAD responses advertise the object length without carrying a body.
fn response_head_only(headers: &[(String, String)], content_length: usize) -> Vec<u8> {
    let mut text = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n", content_length);
    for (name, value) in headers {
        text.push_str(&format!("{}: {}\r\n", name, value));
    }
    text.push_str("\r\n");
    text.into_bytes()
}

fn amz_meta(headers: &HashMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| name.starts_with("x-amz-meta-"))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().unwrap_or(u64::MAX)))
}

fn list_bucket(req: &Request, bucket: &str, store: &Arc<Mutex<Store>>) -> Vec<u8> {
    let prefix = req.query.get("prefix").cloned().unwrap_or_default();
    let store = store.lock().unwrap();
    let bucket_prefix = format!("{}/", bucket);

    let mut contents = String::new();
    let mut common: Vec<String> = Vec::new();
    for (full, object) in store.objects.iter() {
        let Some(key) = full.strip_prefix(&bucket_prefix) else { continue };
        let Some(rest) = key.strip_prefix(prefix.as_str()) else { continue };
        match rest.find('/') {
            Some(pos) => {
                let dir = format!("{}{}", prefix, &rest[..pos + 1]);
                if common.last() != Some(&dir) {
                    common.push(dir);
                }
            }
            None => {
                contents.push_str(&format!(
                    "<Contents><Key>{}</Key><LastModified>2024-01-01T00:00:00.000Z</LastModified><Size>{}</Size></Contents>",
                    key,
                    object.data.len()
                ));
            }
        }
    }
    common.dedup();

    let mut body = String::from("<?xml version=\"1.0\"?><ListBucketResult><IsTruncated>false</IsTruncated>");
    body.push_str(&contents);
    for dir in common {
        body.push_str(&format!("<CommonPrefixes><Prefix>{}</Prefix></CommonPrefixes>", dir));
    }
    body.push_str("</ListBucketResult>");
    response("200 OK", &[], body.as_bytes())
}
