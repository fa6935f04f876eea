use completion_stream::fc::{XmlOutput, XmlToolProcessor};
use completion_stream::stream::{PropertyKind, StructuredOutput};
use serde_json::{json, Value};

const DOCUMENT: &str = r#"{"title": "Ca\"ts é", "count": 42, "ok": false, "tags": ["a", "b\nc"], "meta": {"k": [1, 2]}, "note": null}"#;

fn properties() -> [(&'static str, PropertyKind); 6] {
    [
        ("title", PropertyKind::String),
        ("count", PropertyKind::Scalar),
        ("ok", PropertyKind::Scalar),
        ("tags", PropertyKind::Array),
        ("meta", PropertyKind::Scalar),
        ("note", PropertyKind::Scalar),
    ]
}

/// Feed `pieces`, reading every property after each piece; string tails are
/// concatenated, everything else keeps its latest value.
fn resolve(pieces: &[&str]) -> Vec<(String, Value)> {
    let mut output = StructuredOutput::new(properties());
    let mut strings = vec![String::new(); properties().len()];
    let mut latest: Vec<Option<Value>> = vec![None; properties().len()];

    let mut read_all = |output: &mut StructuredOutput| {
        for (i, (name, kind)) in properties().iter().enumerate() {
            let Some(value) = output.read_buffered_property(name) else {
                continue;
            };
            match (kind, value) {
                (PropertyKind::String, Value::String(tail)) => strings[i].push_str(&tail),
                (_, value) => latest[i] = Some(value),
            }
        }
    };
    for piece in pieces {
        output.append(piece);
        read_all(&mut output);
    }
    output.finish();
    read_all(&mut output);

    properties()
        .iter()
        .enumerate()
        .map(|(i, (name, kind))| {
            let value = match kind {
                PropertyKind::String => Value::String(strings[i].clone()),
                _ => latest[i].clone().unwrap_or(Value::Null),
            };
            ((*name).to_string(), value)
        })
        .collect()
}

#[test]
fn test_structured_output_matches_direct_parse_for_every_split() {
    let direct: Value = serde_json::from_str(DOCUMENT).expect("valid document");
    let expected: Vec<(String, Value)> = properties()
        .iter()
        .map(|(name, _)| ((*name).to_string(), direct[*name].clone()))
        .collect();

    assert_eq!(resolve(&[DOCUMENT]), expected);
    for split in 1..DOCUMENT.len() {
        if !DOCUMENT.is_char_boundary(split) {
            continue;
        }
        let (a, b) = DOCUMENT.split_at(split);
        assert_eq!(resolve(&[a, b]), expected, "split at {split}");
    }
    let chars: Vec<String> = DOCUMENT.chars().map(String::from).collect();
    let pieces: Vec<&str> = chars.iter().map(String::as_str).collect();
    assert_eq!(resolve(&pieces), expected, "one char per piece");
}

#[test]
fn test_number_waits_for_delimiter() {
    let mut output = StructuredOutput::new([("number", PropertyKind::Scalar)]);
    output.append("{\"message\": \"Line 1\\n");
    output.append("Line 2\\n");
    output.append("Line 3\", \"bool\": true,\"number\": 4");
    assert_eq!(output.read_buffered_property("number"), None);
    output.append("2,");
    assert_eq!(output.read_buffered_property("number"), Some(json!(42)));
}

#[test]
fn test_xml_processor_passes_plain_text_through() {
    let text = "Compare a < b and x<y. The tag <functions> is not special, nor is <function_call> \
                or a lone <func at the end";
    for size in 1..=text.len() {
        let mut processor = XmlToolProcessor::new(true, None);
        let mut out = Vec::new();
        for piece in text.as_bytes().chunks(size) {
            out.extend(processor.feed(std::str::from_utf8(piece).expect("ascii")));
        }
        out.extend(processor.finish());

        let joined: String = out
            .iter()
            .map(|o| match o {
                XmlOutput::Text(t) => t.as_str(),
                XmlOutput::ToolCall(_) => panic!("no tool calls expected"),
            })
            .collect();
        assert_eq!(joined, text, "chunk size {size}");
        assert!(!processor.should_cancel());
    }
}

#[test]
fn test_xml_processor_whole_text_is_one_output() {
    let mut processor = XmlToolProcessor::new(false, None);
    assert_eq!(
        processor.feed("no markup here"),
        vec![XmlOutput::Text("no markup here".into())]
    );
    assert!(processor.finish().is_empty());
}
