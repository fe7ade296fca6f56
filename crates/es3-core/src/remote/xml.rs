//! Parse/emit helpers for the S3 XML bodies the core touches.
//!
//! The wire schema is treated as opaque: we pull out the handful of elements
//! we need with a streaming reader and emit the one body we produce
//! (CompleteMultipartUpload) with plain formatting.

use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;

/// One object row from a ListBucketResult.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub key: String,
    pub last_modified: String,
    pub size: u64,
}

/// Decoded ListBucketResult page.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub contents: Vec<ListEntry>,
    pub common_prefixes: Vec<String>,
    pub truncated: bool,
    pub next_marker: Option<String>,
}

fn text_events(body: &[u8], mut visit: impl FnMut(&[String], &str)) -> Result<()> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);
    let mut stack: Vec<String> = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).context("malformed XML response")? {
            Event::Start(e) => {
                stack.push(String::from_utf8_lossy(e.name().as_ref()).to_string());
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Text(t) => {
                let text = t.unescape().context("malformed XML text")?;
                visit(&stack, &text);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn leaf_is(stack: &[String], parent: &str, name: &str) -> bool {
    stack.len() >= 2
        && stack[stack.len() - 1] == name
        && stack[stack.len() - 2] == parent
}

/// Parses one page of a `?delimiter=/` listing.
pub fn parse_list_page(body: &[u8]) -> Result<ListPage> {
    let mut page = ListPage::default();
    let mut entry: Option<ListEntry> = None;
    text_events(body, |stack, text| {
        if leaf_is(stack, "Contents", "Key") {
            entry = Some(ListEntry {
                key: text.to_string(),
                last_modified: String::new(),
                size: 0,
            });
        } else if leaf_is(stack, "Contents", "LastModified") {
            if let Some(e) = entry.as_mut() {
                e.last_modified = text.to_string();
            }
        } else if leaf_is(stack, "Contents", "Size") {
            if let Some(mut e) = entry.take() {
                e.size = text.parse().unwrap_or(0);
                page.contents.push(e);
            }
        } else if leaf_is(stack, "CommonPrefixes", "Prefix") {
            page.common_prefixes.push(text.to_string());
        } else if stack.last().map(String::as_str) == Some("IsTruncated") {
            page.truncated = text == "true";
        } else if stack.last().map(String::as_str) == Some("NextMarker") {
            page.next_marker = Some(text.to_string());
        }
    })?;
    // Servers may omit NextMarker; the last key of the page then carries the
    // cursor.
    if page.truncated && page.next_marker.is_none() {
        page.next_marker = page.contents.last().map(|e| e.key.clone());
    }
    Ok(page)
}

/// UploadId from an InitiateMultipartUploadResult.
pub fn parse_upload_id(body: &[u8]) -> Result<String> {
    let mut id = None;
    text_events(body, |stack, text| {
        if stack.last().map(String::as_str) == Some("UploadId") {
            id = Some(text.to_string());
        }
    })?;
    id.context("no UploadId in multipart initiation response")
}

/// LocationConstraint body; an empty element means the classic region.
pub fn parse_location_constraint(body: &[u8]) -> Result<String> {
    let mut location = String::new();
    text_events(body, |stack, text| {
        if stack.last().map(String::as_str) == Some("LocationConstraint") {
            location = text.to_string();
        }
    })?;
    Ok(location)
}

/// Location from a CompleteMultipartUploadResult.
pub fn parse_complete_location(body: &[u8]) -> Result<String> {
    let mut location = String::new();
    text_events(body, |stack, text| {
        if stack.last().map(String::as_str) == Some("Location") {
            location = text.to_string();
        }
    })?;
    Ok(location)
}

/// Finds `part_num` in a ListParts document; returns its ETag when present.
/// Used to verify whether a part PUT that died mid-flight actually landed.
pub fn find_uploaded_part(body: &[u8], part_num: usize) -> Result<Option<String>> {
    let mut current: Option<usize> = None;
    let mut found = None;
    text_events(body, |stack, text| {
        if leaf_is(stack, "Part", "PartNumber") {
            current = text.parse().ok();
        } else if leaf_is(stack, "Part", "ETag") {
            if current == Some(part_num) {
                found = Some(text.trim_matches('"').to_string());
            }
        }
    })?;
    Ok(found)
}

/// CompleteMultipartUpload body; `etags` must already be ordered by part
/// number (1-based).
pub fn emit_complete_body(etags: &[String]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for (idx, etag) in etags.iter().enumerate() {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
            idx + 1,
            etag.trim_matches('"')
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_BODY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <Name>data</Name>
  <Prefix>dir/</Prefix>
  <IsTruncated>false</IsTruncated>
  <Contents>
    <Key>dir/a.txt</Key>
    <LastModified>2023-01-02T03:04:05.000Z</LastModified>
    <Size>42</Size>
  </Contents>
  <Contents>
    <Key>dir/b.bin</Key>
    <LastModified>2023-02-02T03:04:05.000Z</LastModified>
    <Size>1000</Size>
  </Contents>
  <CommonPrefixes><Prefix>dir/sub/</Prefix></CommonPrefixes>
</ListBucketResult>"#;

    #[test]
    fn list_page_contents_and_prefixes() {
        let page = parse_list_page(LIST_BODY.as_bytes()).unwrap();
        assert_eq!(page.contents.len(), 2);
        assert_eq!(page.contents[0].key, "dir/a.txt");
        assert_eq!(page.contents[0].size, 42);
        assert_eq!(page.contents[1].last_modified, "2023-02-02T03:04:05.000Z");
        assert_eq!(page.common_prefixes, vec!["dir/sub/".to_string()]);
        assert!(!page.truncated);
        assert!(page.next_marker.is_none());
    }

    #[test]
    fn truncated_page_falls_back_to_last_key() {
        let body = LIST_BODY.replace(
            "<IsTruncated>false</IsTruncated>",
            "<IsTruncated>true</IsTruncated>",
        );
        let page = parse_list_page(body.as_bytes()).unwrap();
        assert!(page.truncated);
        assert_eq!(page.next_marker.as_deref(), Some("dir/b.bin"));
    }

    #[test]
    fn upload_id_extraction() {
        let body = r#"<InitiateMultipartUploadResult>
            <Bucket>b</Bucket><Key>k</Key><UploadId>abc-123</UploadId>
        </InitiateMultipartUploadResult>"#;
        assert_eq!(parse_upload_id(body.as_bytes()).unwrap(), "abc-123");
        assert!(parse_upload_id(b"<Empty/>").is_err());
    }

    #[test]
    fn location_constraint_empty_and_named() {
        let named = b"<LocationConstraint>eu-west-1</LocationConstraint>";
        assert_eq!(parse_location_constraint(named).unwrap(), "eu-west-1");
        let empty = b"<LocationConstraint></LocationConstraint>";
        assert_eq!(parse_location_constraint(empty).unwrap(), "");
    }

    #[test]
    fn finds_existing_part() {
        let body = r#"<ListPartsResult>
            <Part><PartNumber>1</PartNumber><ETag>"e1"</ETag></Part>
            <Part><PartNumber>2</PartNumber><ETag>"e2"</ETag></Part>
        </ListPartsResult>"#;
        assert_eq!(find_uploaded_part(body.as_bytes(), 2).unwrap().as_deref(), Some("e2"));
        assert_eq!(find_uploaded_part(body.as_bytes(), 3).unwrap(), None);
    }

    #[test]
    fn complete_body_is_ordered() {
        let body = emit_complete_body(&["e1".to_string(), "\"e2\"".to_string()]);
        assert_eq!(
            body,
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>\"e1\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"e2\"</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }
}
