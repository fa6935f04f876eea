use std::sync::LazyLock;

use regex_lite::Regex;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

use crate::json_scan::{repair_partial_json, scan_partial_object, skip_ws, PartialValue};

static UNQUOTED_KEY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*):").ok());
static TRAILING_COMMA: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").ok());

const CODE_FENCE: &str = "```";

/// Shape of a declared top-level property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    /// Streamed as newly decoded tails.
    String,
    /// Returned whole on every read, last element possibly partial.
    Array,
    /// Numbers, booleans, null and nested objects: revealed once complete.
    Scalar,
}

impl PropertyKind {
    fn from_schema_type(ty: Option<&str>) -> Self {
        match ty {
            Some("string") => PropertyKind::String,
            Some("array") => PropertyKind::Array,
            _ => PropertyKind::Scalar,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Undetermined,
    Json { start: usize },
    NonJson,
}

/// Incremental reader for one JSON object that arrives in fragments.
///
/// Structured-output responses are streamed as text; this exposes the
/// top-level properties before the document is complete.
#[derive(Debug, Clone)]
pub struct StructuredOutput {
    properties: Vec<(String, PropertyKind)>,
    buffer: String,
    cursors: FxHashMap<String, usize>,
    mode: Mode,
    finished: bool,
    recovered: Option<Map<String, Value>>,
}

impl StructuredOutput {
    #[must_use]
    pub fn new<I, S>(properties: I) -> Self
    where
        I: IntoIterator<Item = (S, PropertyKind)>,
        S: Into<String>,
    {
        Self {
            properties: properties
                .into_iter()
                .map(|(name, kind)| (name.into(), kind))
                .collect(),
            buffer: String::new(),
            cursors: FxHashMap::default(),
            mode: Mode::Undetermined,
            finished: false,
            recovered: None,
        }
    }

    /// Build from a JSON schema, reading the kinds from its `properties`.
    ///
    /// Accepts either a bare schema or an OpenAI-style
    /// `{"json_schema": {"schema": ...}}` response format.
    #[must_use]
    pub fn from_schema(schema: &Value) -> Self {
        let schema = schema
            .pointer("/json_schema/schema")
            .unwrap_or(schema);
        let properties = schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, prop)| {
                        let ty = prop.get("type").and_then(Value::as_str);
                        (name.clone(), PropertyKind::from_schema_type(ty))
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Self::new(properties)
    }

    pub fn append(&mut self, text: &str) {
        if self.finished {
            return;
        }
        self.buffer.push_str(text);
        self.detect_mode();
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.buffer
    }

    /// False once the content is known not to be a JSON object.
    #[must_use]
    pub fn is_json(&self) -> bool {
        !matches!(self.mode, Mode::NonJson)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Read the current projection of a top-level property.
    ///
    /// Strings return only the text decoded since the previous read and
    /// `""` once exhausted. `None` means the property has not appeared
    /// yet, or cannot resolve because the content is not JSON.
    pub fn read_buffered_property(&mut self, name: &str) -> Option<Value> {
        let Mode::Json { start } = self.mode else {
            return None;
        };
        let declared = self
            .properties
            .iter()
            .find(|(prop, _)| prop == name)
            .map(|(_, kind)| *kind);

        let (text, complete) = if let Some(doc) = &self.recovered {
            match doc.get(name)? {
                Value::String(s) => (s.clone(), true),
                other => return Some(other.clone()),
            }
        } else if self.finished {
            return None;
        } else {
            let scan = scan_partial_object(&self.buffer, start);
            let (_, value) = scan.fields.into_iter().rev().find(|(key, _)| key == name)?;
            match value {
                PartialValue::Str(s) => {
                    let complete = s.end.is_some();
                    (s.text, complete)
                }
                PartialValue::Array { items, .. } => return Some(Value::Array(items)),
                PartialValue::Complete(Value::String(s)) => (s, true),
                PartialValue::Complete(other) => return Some(other),
                PartialValue::Pending => return None,
            }
        };

        if matches!(declared, Some(PropertyKind::Array | PropertyKind::Scalar)) {
            return complete.then_some(Value::String(text));
        }
        let cursor = self.cursors.entry(name.to_owned()).or_insert(0);
        let tail = text.get(*cursor..).unwrap_or_default().to_owned();
        *cursor = (*cursor).max(text.len());
        Some(Value::String(tail))
    }

    /// Mark the document complete and recover what a lenient parse allows.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Mode::Json { start } = self.mode {
            self.recovered = lenient_parse(&self.buffer[start..]);
            if self.recovered.is_none() {
                tracing::debug!(
                    bytes = self.buffer.len(),
                    "structured output could not be recovered"
                );
            }
        }
    }

    fn detect_mode(&mut self) {
        if self.mode != Mode::Undetermined {
            return;
        }
        let bytes = self.buffer.as_bytes();
        let i = skip_ws(bytes, 0);
        let Some(&first) = bytes.get(i) else {
            return;
        };
        if first == b'{' {
            self.mode = Mode::Json { start: i };
            return;
        }
        let rest = &self.buffer[i..];
        if rest.len() < CODE_FENCE.len() {
            if !CODE_FENCE.starts_with(rest) {
                self.mode = Mode::NonJson;
            }
            return;
        }
        if !rest.starts_with(CODE_FENCE) {
            self.mode = Mode::NonJson;
            return;
        }

        let after_fence = i + CODE_FENCE.len();
        let mut j = after_fence;
        while j < bytes.len() && bytes[j].is_ascii_alphanumeric() {
            j += 1;
        }
        if j == bytes.len() {
            return;
        }
        let lang = &self.buffer[after_fence..j];
        if !lang.is_empty() && !lang.eq_ignore_ascii_case("json") {
            self.mode = Mode::NonJson;
            return;
        }
        let j = skip_ws(bytes, j);
        match bytes.get(j) {
            None => {}
            Some(b'{') => self.mode = Mode::Json { start: j },
            Some(_) => self.mode = Mode::NonJson,
        }
    }
}

/// Parse `text` as an object, repairing the common ways models break JSON.
fn lenient_parse(text: &str) -> Option<Map<String, Value>> {
    let mut body = text.trim();
    if let Some(idx) = body.rfind(CODE_FENCE) {
        if body[idx + CODE_FENCE.len()..].trim().is_empty() {
            body = body[..idx].trim_end();
        }
    }
    if let Ok(Value::Object(map)) = serde_json::from_str(body) {
        return Some(map);
    }

    let repaired = repair_outside_strings(body);
    match repair_partial_json(&repaired) {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Quote bare keys and drop trailing commas, leaving string literals intact.
fn repair_outside_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut segment_start = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
                out.push_str(&text[segment_start..=i]);
                segment_start = i + 1;
            }
        } else if ch == '"' {
            out.push_str(&repair_segment(&text[segment_start..i]));
            in_string = true;
            segment_start = i;
        }
    }
    if in_string {
        out.push_str(&text[segment_start..]);
    } else {
        out.push_str(&repair_segment(&text[segment_start..]));
    }
    out
}

fn repair_segment(segment: &str) -> String {
    let mut repaired = segment.to_owned();
    if let Some(re) = UNQUOTED_KEY.as_ref() {
        repaired = re.replace_all(&repaired, "$1\"$2\"$3:").into_owned();
    }
    if let Some(re) = TRAILING_COMMA.as_ref() {
        repaired = re.replace_all(&repaired, "$1").into_owned();
    }
    repaired
}
