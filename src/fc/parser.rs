//! Scanning helpers for the in-band `<function_calls>` XML convention.
//!
//! The input is model output, so nothing here assumes well-formed XML:
//! every function tolerates truncation and returns what it could read.
use std::borrow::Cow;

use memchr::memmem;

use crate::util::partial_suffix_len;

pub(crate) const FUNCTION_CALLS_OPEN: &[u8] = b"<function_calls>";
pub(crate) const FUNCTION_CALLS_CLOSE: &[u8] = b"</function_calls>";
pub(crate) const INVOKE_CLOSE: &[u8] = b"</invoke>";
const INVOKE_OPEN: &[u8] = b"<invoke";
const CDATA_OPEN: &[u8] = b"<![CDATA[";
const CDATA_CLOSE: &[u8] = b"]]>";

/// Fields read from one `<invoke>` body.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct InvokeFields {
    pub name: Option<String>,
    pub id: Option<String>,
    pub params: Vec<(String, String)>,
}

/// Find `needle` at or after `from`, skipping CDATA sections.
///
/// An unterminated CDATA section hides the rest of the text.
pub(crate) fn find_outside_cdata(text: &str, from: usize, needle: &[u8]) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut cursor = from;
    loop {
        let rest = bytes.get(cursor..)?;
        let hit = memmem::find(rest, needle).map(|rel| cursor + rel);
        let cdata = memmem::find(rest, CDATA_OPEN).map(|rel| cursor + rel);
        match (hit, cdata) {
            (Some(h), Some(c)) if c < h => {
                let body = c + CDATA_OPEN.len();
                let close = memmem::find(&bytes[body..], CDATA_CLOSE)?;
                cursor = body + close + CDATA_CLOSE.len();
            }
            (hit, _) => return hit,
        }
    }
}

/// Locate the next `<invoke>` open tag at or after `from`.
///
/// Returns `(tag_start, body_start)`; `body_start` is `None` while the tag
/// itself is still incomplete.
pub(crate) fn find_invoke_open(text: &str, from: usize) -> Option<(usize, Option<usize>)> {
    let bytes = text.as_bytes();
    let mut cursor = from;
    loop {
        let start = find_outside_cdata(text, cursor, INVOKE_OPEN)?;
        let after = start + INVOKE_OPEN.len();
        match bytes.get(after) {
            None => return Some((start, None)),
            Some(b'>') => return Some((start, Some(after + 1))),
            Some(b) if b.is_ascii_whitespace() => {
                let end = memchr::memchr(b'>', &bytes[after..]).map(|rel| after + rel + 1);
                return Some((start, end));
            }
            Some(_) => cursor = after,
        }
    }
}

/// Read the name, id and parameters of an invoke body.
///
/// While streaming (`at_end == false`) the tool name counts only once its
/// close tag arrived. Parameter values are reported as far as they are
/// known, the last one possibly in progress.
pub(crate) fn parse_invoke_body(body: &str, at_end: bool) -> InvokeFields {
    let mut fields = InvokeFields {
        name: read_simple_tag(body, "tool_name", at_end),
        id: read_simple_tag(body, "tool_id", false),
        params: Vec::new(),
    };
    if let Some(open) = find_outside_cdata(body, 0, b"<parameters>") {
        read_parameters(body, open + "<parameters>".len(), &mut fields.params);
    }
    fields
}

fn read_simple_tag(body: &str, tag: &str, accept_unterminated: bool) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = find_outside_cdata(body, 0, open.as_bytes())? + open.len();
    let raw = match memmem::find(&body.as_bytes()[start..], close.as_bytes()) {
        Some(rel) => &body[start..start + rel],
        None if accept_unterminated => {
            let rest = &body[start..];
            &rest[..rest.len() - partial_suffix_len(rest.as_bytes(), close.as_bytes())]
        }
        None => return None,
    };
    let value = decode_value(raw);
    (!value.is_empty()).then_some(value)
}

fn read_parameters(body: &str, mut i: usize, out: &mut Vec<(String, String)>) {
    let bytes = body.as_bytes();
    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'<' || bytes[i..].starts_with(b"</") {
            return;
        }
        let Some(gt_rel) = memchr::memchr(b'>', &bytes[i..]) else {
            return;
        };
        let tag_end = i + gt_rel;
        let inner = &body[i + 1..tag_end];
        if inner.starts_with('!') || inner.starts_with('?') {
            i = tag_end + 1;
            continue;
        }
        let self_closing = inner.ends_with('/');
        let name = inner
            .trim_end_matches('/')
            .split(|c: char| c.is_ascii_whitespace())
            .next()
            .unwrap_or_default();
        if name.is_empty() {
            return;
        }
        if self_closing {
            out.push((name.to_owned(), String::new()));
            i = tag_end + 1;
            continue;
        }

        let value_start = tag_end + 1;
        let close = format!("</{name}>");
        match find_outside_cdata(body, value_start, close.as_bytes()) {
            Some(close_at) => {
                out.push((name.to_owned(), decode_value(&body[value_start..close_at])));
                i = close_at + close.len();
            }
            None => {
                out.push((name.to_owned(), in_progress_value(&body[value_start..], &close)));
                return;
            }
        }
    }
}

/// Best-effort value of an element whose close tag has not arrived.
fn in_progress_value(raw: &str, close: &str) -> String {
    let trimmed = raw.trim_start();
    if trimmed.len() < CDATA_OPEN.len() && CDATA_OPEN.starts_with(trimmed.as_bytes()) {
        return String::new();
    }
    if let Some(rest) = trimmed.strip_prefix("<![CDATA[") {
        return match memmem::find(rest.as_bytes(), CDATA_CLOSE) {
            Some(end) => rest[..end].to_owned(),
            None => {
                let held = partial_suffix_len(rest.as_bytes(), CDATA_CLOSE);
                rest[..rest.len() - held].to_owned()
            }
        };
    }
    let mut visible = &raw[..raw.len() - partial_suffix_len(raw.as_bytes(), close.as_bytes())];
    if let Some(amp) = visible.rfind('&') {
        if !visible[amp..].contains(';') {
            visible = &visible[..amp];
        }
    }
    decode_value(visible)
}

/// Decode an element's text: CDATA verbatim, otherwise trimmed and unescaped.
pub(crate) fn decode_value(raw: &str) -> String {
    if let Some(cdata) = unwrap_cdata(raw) {
        return cdata;
    }
    let trimmed = raw.trim();
    match quick_xml::escape::unescape(trimmed) {
        Ok(Cow::Borrowed(s)) => s.to_owned(),
        Ok(Cow::Owned(s)) => s,
        Err(_) => trimmed.to_owned(),
    }
}

/// Concatenated content of the CDATA sections in `text`, if any.
fn unwrap_cdata(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut out: Option<String> = None;
    let mut cursor = 0usize;
    while let Some(open_rel) = memmem::find(&bytes[cursor..], CDATA_OPEN) {
        let content_start = cursor + open_rel + CDATA_OPEN.len();
        let buf = out.get_or_insert_with(|| String::with_capacity(text.len()));
        match memmem::find(&bytes[content_start..], CDATA_CLOSE) {
            Some(close_rel) => {
                buf.push_str(&text[content_start..content_start + close_rel]);
                cursor = content_start + close_rel + CDATA_CLOSE.len();
            }
            None => {
                buf.push_str(&text[content_start..]);
                break;
            }
        }
    }
    out
}
