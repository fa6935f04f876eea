//! Byte-level JSON scanners for documents that are still arriving.
//!
//! Every scanner distinguishes input that is merely cut short
//! ([`ScanError::Incomplete`]) from input that can never become valid
//! ([`ScanError::Invalid`]).

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanError {
    Incomplete,
    Invalid,
}

pub(crate) type ScanResult = Result<usize, ScanError>;

#[inline]
pub(crate) fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    let len = bytes.len();
    while i < len {
        match bytes[i] {
            b' ' | b'\n' | b'\r' | b'\t' => i += 1,
            _ => break,
        }
    }
    i
}

#[inline]
pub(crate) fn parse_json_string_end(bytes: &[u8], start: usize) -> ScanResult {
    let len = bytes.len();
    if start >= len {
        return Err(ScanError::Incomplete);
    }
    if bytes[start] != b'"' {
        return Err(ScanError::Invalid);
    }
    let mut i = start + 1;
    while i < len {
        match bytes[i] {
            b'"' => return Ok(i + 1),
            b'\\' => {
                i += 2;
            }
            0x00..=0x1F => return Err(ScanError::Invalid),
            _ => i += 1,
        }
    }
    Err(ScanError::Incomplete)
}

#[inline]
pub(crate) fn parse_json_value_end(bytes: &[u8], start: usize) -> ScanResult {
    let i = skip_ws(bytes, start);
    if i >= bytes.len() {
        return Err(ScanError::Incomplete);
    }

    match bytes[i] {
        b'"' => parse_json_string_end(bytes, i),
        b'{' => parse_json_object_end(bytes, i),
        b'[' => parse_json_array_end(bytes, i),
        b't' => consume_literal(bytes, i, b"true"),
        b'f' => consume_literal(bytes, i, b"false"),
        b'n' => consume_literal(bytes, i, b"null"),
        b'-' | b'0'..=b'9' => parse_json_number_end(bytes, i),
        _ => Err(ScanError::Invalid),
    }
}

#[inline]
fn byte_at(bytes: &[u8], i: usize) -> Result<u8, ScanError> {
    bytes.get(i).copied().ok_or(ScanError::Incomplete)
}

fn parse_json_object_end(bytes: &[u8], start: usize) -> ScanResult {
    let mut i = start + 1;
    loop {
        i = skip_ws(bytes, i);
        match byte_at(bytes, i)? {
            b'}' => return Ok(i + 1),
            b'"' => {}
            _ => return Err(ScanError::Invalid),
        }

        i = parse_json_string_end(bytes, i)?;
        i = skip_ws(bytes, i);
        if byte_at(bytes, i)? != b':' {
            return Err(ScanError::Invalid);
        }
        i = parse_json_value_end(bytes, i + 1)?;
        i = skip_ws(bytes, i);
        match byte_at(bytes, i)? {
            b',' => i += 1,
            b'}' => return Ok(i + 1),
            _ => return Err(ScanError::Invalid),
        }
    }
}

fn parse_json_array_end(bytes: &[u8], start: usize) -> ScanResult {
    let mut i = start + 1;
    loop {
        i = skip_ws(bytes, i);
        if byte_at(bytes, i)? == b']' {
            return Ok(i + 1);
        }

        i = parse_json_value_end(bytes, i)?;
        i = skip_ws(bytes, i);
        match byte_at(bytes, i)? {
            b',' => i += 1,
            b']' => return Ok(i + 1),
            _ => return Err(ScanError::Invalid),
        }
    }
}

#[inline]
fn consume_literal(bytes: &[u8], start: usize, lit: &[u8]) -> ScanResult {
    let available = &bytes[start..];
    if available.len() >= lit.len() {
        if &available[..lit.len()] == lit {
            Ok(start + lit.len())
        } else {
            Err(ScanError::Invalid)
        }
    } else if lit.starts_with(available) {
        Err(ScanError::Incomplete)
    } else {
        Err(ScanError::Invalid)
    }
}

/// Scan a number. A number running into the end of input is reported as
/// complete; callers that need a delimiter check for one themselves.
fn parse_json_number_end(bytes: &[u8], start: usize) -> ScanResult {
    let len = bytes.len();
    let mut i = start;
    if i < len && bytes[i] == b'-' {
        i += 1;
    }

    match byte_at(bytes, i)? {
        b'0' => i += 1,
        b'1'..=b'9' => {
            i += 1;
            while i < len && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
        _ => return Err(ScanError::Invalid),
    }

    if i < len && bytes[i] == b'.' {
        i += 1;
        if !byte_at(bytes, i)?.is_ascii_digit() {
            return Err(ScanError::Invalid);
        }
        while i < len && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }

    if i < len && matches!(bytes[i], b'e' | b'E') {
        i += 1;
        if i < len && matches!(bytes[i], b'+' | b'-') {
            i += 1;
        }
        if !byte_at(bytes, i)?.is_ascii_digit() {
            return Err(ScanError::Invalid);
        }
        while i < len && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }

    Ok(i)
}

// ---------------------------------------------------------------------------
// Partial string decoding
// ---------------------------------------------------------------------------

/// A string literal decoded as far as the input allows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PartialString {
    pub text: String,
    /// Position after the closing quote, once seen.
    pub end: Option<usize>,
}

fn hex4(bytes: &[u8], at: usize) -> Result<u32, ScanError> {
    let digits = bytes.get(at..at + 4).ok_or(ScanError::Incomplete)?;
    let mut out = 0u32;
    for &d in digits {
        let v = (d as char).to_digit(16).ok_or(ScanError::Invalid)?;
        out = out * 16 + v;
    }
    Ok(out)
}

/// Decode the string starting at `start` (which must hold `"`).
///
/// Escapes cut off by the end of input are left undecoded so that the
/// decoded text only ever grows.
pub(crate) fn decode_string_prefix(text: &str, start: usize) -> Result<PartialString, ScanError> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'"') {
        return Err(ScanError::Invalid);
    }
    let mut out = String::new();
    let mut i = start + 1;
    let mut run_start = i;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                out.push_str(&text[run_start..i]);
                return Ok(PartialString {
                    text: out,
                    end: Some(i + 1),
                });
            }
            b'\\' => {
                out.push_str(&text[run_start..i]);
                let Some(&esc) = bytes.get(i + 1) else {
                    return Ok(PartialString { text: out, end: None });
                };
                let consumed = match esc {
                    b'"' => {
                        out.push('"');
                        2
                    }
                    b'\\' => {
                        out.push('\\');
                        2
                    }
                    b'/' => {
                        out.push('/');
                        2
                    }
                    b'b' => {
                        out.push('\u{08}');
                        2
                    }
                    b'f' => {
                        out.push('\u{0c}');
                        2
                    }
                    b'n' => {
                        out.push('\n');
                        2
                    }
                    b'r' => {
                        out.push('\r');
                        2
                    }
                    b't' => {
                        out.push('\t');
                        2
                    }
                    b'u' => match decode_unicode_escape(bytes, i) {
                        Ok((ch, consumed)) => {
                            out.push(ch);
                            consumed
                        }
                        Err(ScanError::Incomplete) => {
                            return Ok(PartialString { text: out, end: None });
                        }
                        Err(ScanError::Invalid) => return Err(ScanError::Invalid),
                    },
                    _ => return Err(ScanError::Invalid),
                };
                i += consumed;
                run_start = i;
            }
            0x00..=0x1F => return Err(ScanError::Invalid),
            _ => i += 1,
        }
    }
    out.push_str(&text[run_start..]);
    Ok(PartialString { text: out, end: None })
}

/// Decode `\uXXXX` (and a following low surrogate) at `at`, returning the
/// char and the number of bytes consumed.
fn decode_unicode_escape(bytes: &[u8], at: usize) -> Result<(char, usize), ScanError> {
    let hi = hex4(bytes, at + 2)?;
    if (0xD800..0xDC00).contains(&hi) {
        match bytes.get(at + 6..at + 8) {
            None => return Err(ScanError::Incomplete),
            Some(b"\\u") => {}
            Some(_) => return Ok(('\u{fffd}', 6)),
        }
        let lo = hex4(bytes, at + 8)?;
        if !(0xDC00..0xE000).contains(&lo) {
            return Ok(('\u{fffd}', 6));
        }
        let code = 0x10000 + ((hi - 0xD800) << 10) + (lo - 0xDC00);
        return Ok((char::from_u32(code).unwrap_or('\u{fffd}'), 12));
    }
    Ok((char::from_u32(hi).unwrap_or('\u{fffd}'), 6))
}

// ---------------------------------------------------------------------------
// Partial object projection
// ---------------------------------------------------------------------------

/// The state of one top-level member of an object that is still arriving.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PartialValue {
    Str(PartialString),
    Array { items: Vec<Value>, complete: bool },
    Complete(Value),
    /// Seen but not yet provably complete.
    Pending,
}

#[derive(Debug, Default)]
pub(crate) struct PartialObject {
    pub fields: Vec<(String, PartialValue)>,
    pub closed: bool,
    pub invalid: bool,
}

/// Project the top-level members of the object beginning at `start`.
pub(crate) fn scan_partial_object(text: &str, start: usize) -> PartialObject {
    let mut out = PartialObject::default();
    if let Err(ScanError::Invalid) = scan_members(text, start, &mut out) {
        out.invalid = true;
    }
    out
}

fn scan_members(text: &str, start: usize, out: &mut PartialObject) -> Result<(), ScanError> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'{') {
        return Err(ScanError::Invalid);
    }
    let mut i = start + 1;
    loop {
        i = skip_ws(bytes, i);
        match byte_at(bytes, i)? {
            b'}' => {
                out.closed = true;
                return Ok(());
            }
            b'"' => {}
            _ => return Err(ScanError::Invalid),
        }
        let key = decode_string_prefix(text, i)?;
        let Some(key_end) = key.end else {
            return Ok(());
        };
        i = skip_ws(bytes, key_end);
        if byte_at(bytes, i)? != b':' {
            return Err(ScanError::Invalid);
        }
        i = skip_ws(bytes, i + 1);
        if i >= bytes.len() {
            return Ok(());
        }

        let (value, value_end) = scan_member_value(text, i)?;
        out.fields.push((key.text, value));
        let Some(value_end) = value_end else {
            return Ok(());
        };

        i = skip_ws(bytes, value_end);
        match byte_at(bytes, i)? {
            b',' => i += 1,
            b'}' => {
                out.closed = true;
                return Ok(());
            }
            _ => return Err(ScanError::Invalid),
        }
    }
}

fn scan_member_value(text: &str, i: usize) -> Result<(PartialValue, Option<usize>), ScanError> {
    let bytes = text.as_bytes();
    match bytes[i] {
        b'"' => {
            let s = decode_string_prefix(text, i)?;
            let end = s.end;
            Ok((PartialValue::Str(s), end))
        }
        b'[' => {
            let (items, end) = scan_partial_array(text, i)?;
            Ok((
                PartialValue::Array {
                    items,
                    complete: end.is_some(),
                },
                end,
            ))
        }
        b'{' => match parse_json_value_end(bytes, i) {
            Ok(end) => Ok((complete_value(&bytes[i..end])?, Some(end))),
            Err(ScanError::Incomplete) => Ok((PartialValue::Pending, None)),
            Err(ScanError::Invalid) => Err(ScanError::Invalid),
        },
        _ => match parse_json_value_end(bytes, i) {
            Ok(end) => {
                let next = skip_ws(bytes, end);
                match bytes.get(next) {
                    None => Ok((PartialValue::Pending, None)),
                    Some(b',' | b'}') => Ok((complete_value(&bytes[i..end])?, Some(end))),
                    Some(_) => Err(ScanError::Invalid),
                }
            }
            Err(ScanError::Incomplete) => Ok((PartialValue::Pending, None)),
            Err(ScanError::Invalid) => Err(ScanError::Invalid),
        },
    }
}

fn complete_value(slice: &[u8]) -> Result<PartialValue, ScanError> {
    serde_json::from_slice(slice)
        .map(PartialValue::Complete)
        .map_err(|_| ScanError::Invalid)
}

/// Scan an array whose last element may be a partial string.
///
/// Scalars at the very end are omitted until a delimiter proves them complete.
pub(crate) fn scan_partial_array(
    text: &str,
    start: usize,
) -> Result<(Vec<Value>, Option<usize>), ScanError> {
    let bytes = text.as_bytes();
    let mut items = Vec::new();
    let mut i = start + 1;
    loop {
        i = skip_ws(bytes, i);
        let Some(&b) = bytes.get(i) else {
            return Ok((items, None));
        };
        if b == b']' {
            return Ok((items, Some(i + 1)));
        }
        if b == b'"' {
            let s = decode_string_prefix(text, i)?;
            items.push(Value::String(s.text));
            let Some(end) = s.end else {
                return Ok((items, None));
            };
            i = end;
        } else {
            match parse_json_value_end(bytes, i) {
                Ok(end) => {
                    let next = skip_ws(bytes, end);
                    if next >= bytes.len() {
                        return Ok((items, None));
                    }
                    let value =
                        serde_json::from_slice(&bytes[i..end]).map_err(|_| ScanError::Invalid)?;
                    items.push(value);
                    i = end;
                }
                Err(ScanError::Incomplete) => return Ok((items, None)),
                Err(ScanError::Invalid) => return Err(ScanError::Invalid),
            }
        }
        i = skip_ws(bytes, i);
        match bytes.get(i) {
            None => return Ok((items, None)),
            Some(b',') => i += 1,
            Some(b']') => return Ok((items, Some(i + 1))),
            Some(_) => return Err(ScanError::Invalid),
        }
    }
}

// ---------------------------------------------------------------------------
// Lenient repair of truncated documents
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Expect {
    Value,
    Key,
    Colon,
    Separator,
}

/// Best-effort parse of a JSON document that may be cut off anywhere.
///
/// Unterminated string values are closed, dangling keys and separators are
/// dropped, and open containers are closed in order.
#[must_use]
pub(crate) fn repair_partial_json(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }

    let bytes = text.as_bytes();
    let mut stack: Vec<u8> = Vec::new();
    let mut expect = Expect::Value;
    // Truncation point that yields valid JSON, with the closers needed there.
    let mut safe: Option<(usize, Vec<u8>)> = None;
    let mut i = 0usize;

    let after_value = |stack: &Vec<u8>| {
        if stack.is_empty() {
            Expect::Value
        } else {
            Expect::Separator
        }
    };

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b' ' | b'\n' | b'\r' | b'\t' => i += 1,
            b'{' | b'[' if matches!(expect, Expect::Value) => {
                stack.push(if b == b'{' { b'}' } else { b']' });
                i += 1;
                expect = if b == b'{' { Expect::Key } else { Expect::Value };
                safe = Some((i, stack.clone()));
            }
            b'}' | b']' => {
                if stack.last() != Some(&b) {
                    break;
                }
                stack.pop();
                i += 1;
                expect = after_value(&stack);
                safe = Some((i, stack.clone()));
            }
            b',' if matches!(expect, Expect::Separator) => {
                i += 1;
                expect = if stack.last() == Some(&b'}') {
                    Expect::Key
                } else {
                    Expect::Value
                };
            }
            b':' if matches!(expect, Expect::Colon) => {
                i += 1;
                expect = Expect::Value;
            }
            b'"' => {
                let is_key = matches!(expect, Expect::Key);
                match parse_json_string_end(bytes, i) {
                    Ok(end) => {
                        i = end;
                        if is_key {
                            expect = Expect::Colon;
                        } else {
                            expect = after_value(&stack);
                            safe = Some((i, stack.clone()));
                        }
                    }
                    Err(_) if !is_key => {
                        let cut = trim_dangling_escape(text, i);
                        let mut candidate = String::with_capacity(cut.len() + stack.len() + 1);
                        candidate.push_str(cut);
                        candidate.push('"');
                        candidate.extend(stack.iter().rev().map(|&c| char::from(c)));
                        if let Ok(value) = serde_json::from_str(&candidate) {
                            return Some(value);
                        }
                        break;
                    }
                    Err(_) => break,
                }
            }
            _ if matches!(expect, Expect::Value) => {
                let start = i;
                while i < bytes.len()
                    && matches!(bytes[i], b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'+' | b'-' | b'.')
                {
                    i += 1;
                }
                if i == start {
                    break;
                }
                if i == bytes.len() {
                    let mut candidate = text.to_owned();
                    candidate.extend(stack.iter().rev().map(|&c| char::from(c)));
                    if let Ok(value) = serde_json::from_str(&candidate) {
                        return Some(value);
                    }
                    break;
                }
                expect = after_value(&stack);
                safe = Some((i, stack.clone()));
            }
            _ => break,
        }
    }

    let (pos, closers) = safe?;
    let mut candidate = text[..pos].to_owned();
    candidate.extend(closers.iter().rev().map(|&c| char::from(c)));
    serde_json::from_str(&candidate).ok()
}

/// Trim an escape sequence cut off at the end of an unterminated string.
fn trim_dangling_escape(text: &str, string_start: usize) -> &str {
    let bytes = text.as_bytes();
    let mut i = string_start + 1;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let needed = match bytes.get(i + 1) {
                Some(b'u') => 6,
                _ => 2,
            };
            if i + needed > bytes.len() {
                return &text[..i];
            }
            i += needed;
        } else {
            i += 1;
        }
    }
    text
}
