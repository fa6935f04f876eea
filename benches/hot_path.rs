use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use completion_stream::fc::{render_tool_call_xml, XmlToolProcessor};
use completion_stream::stream::{ChunkDecoder, PropertyKind, StructuredOutput, TagStripper};
use completion_stream::{Dialect, ParameterDefinition, ParameterType, ToolDefinition};

fn openai_body(deltas: usize) -> String {
    let mut body = String::with_capacity(deltas * 96);
    for i in 0..deltas {
        let chunk = json!({"choices": [{"index": 0, "delta": {"content": format!("token{i} ")}}]});
        body.push_str("data: ");
        body.push_str(&chunk.to_string());
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn xml_payload() -> String {
    let args = json!({"query": "rust streaming parsers", "limit": 10});
    let xml = render_tool_call_xml(
        "call_1",
        "search",
        args.as_object().expect("object literal"),
    );
    format!("{}\n{xml}", "Let me search for that. ".repeat(20))
}

fn search_tool() -> ToolDefinition {
    ToolDefinition::new(
        "search",
        "Search",
        vec![
            ParameterDefinition::new("query", "Terms", ParameterType::String).required(),
            ParameterDefinition::new("limit", "Max", ParameterType::Integer),
        ],
    )
    .expect("valid tool")
}

fn bench_decode_and_process(c: &mut Criterion) {
    let body = openai_body(256);
    let small_chunks: Vec<&[u8]> = body.as_bytes().chunks(17).collect();
    let large_chunks: Vec<&[u8]> = body.as_bytes().chunks(4096).collect();

    for (name, chunks) in [
        ("openai_stream_256_deltas_17b_chunks", &small_chunks),
        ("openai_stream_256_deltas_4k_chunks", &large_chunks),
    ] {
        c.bench_function(name, |b| {
            b.iter(|| {
                let mut decoder = ChunkDecoder::new();
                let mut processor = Dialect::OpenAi.processor(false, None);
                let mut messages = Vec::new();
                let mut events = Vec::new();
                for chunk in chunks {
                    decoder.feed_bytes_into(black_box(chunk), &mut messages);
                    for message in messages.drain(..) {
                        processor.process_into(&message, &mut events);
                    }
                }
                processor.finish_into(&mut events);
                black_box(events.len())
            });
        });
    }
}

fn bench_xml_tool_processor(c: &mut Criterion) {
    let payload = xml_payload();
    let tools = vec![search_tool()];
    let pieces: Vec<&str> = payload
        .as_bytes()
        .chunks(12)
        .map(|piece| std::str::from_utf8(piece).expect("ascii payload"))
        .collect();

    c.bench_function("xml_tool_processor_12b_chunks", |b| {
        b.iter(|| {
            let mut processor = XmlToolProcessor::new(false, Some(tools.clone()));
            let mut out = Vec::new();
            for piece in &pieces {
                processor.feed_into(black_box(piece), &mut out);
            }
            out.extend(processor.finish());
            black_box(out.len())
        });
    });

    c.bench_function("xml_tool_processor_partial_12b_chunks", |b| {
        b.iter(|| {
            let mut processor = XmlToolProcessor::new(true, Some(tools.clone()));
            let mut out = Vec::new();
            for piece in &pieces {
                processor.feed_into(black_box(piece), &mut out);
            }
            black_box(out.len())
        });
    });
}

fn bench_tag_stripper(c: &mut Criterion) {
    let text = "visible text <scratchpad>hidden reasoning</scratchpad> more text ".repeat(64);
    let pieces: Vec<&str> = text
        .as_bytes()
        .chunks(9)
        .map(|piece| std::str::from_utf8(piece).expect("ascii text"))
        .collect();

    c.bench_function("tag_stripper_9b_chunks", |b| {
        b.iter(|| {
            let mut stripper = TagStripper::new(["scratchpad"]);
            let mut visible = 0;
            for piece in &pieces {
                visible += stripper.filter(black_box(piece)).len();
            }
            black_box(visible)
        });
    });
}

fn bench_structured_output(c: &mut Criterion) {
    let doc = json!({"message": "word ".repeat(200), "tags": ["a", "b", "c"]}).to_string();
    let pieces: Vec<&str> = doc
        .as_bytes()
        .chunks(16)
        .map(|piece| std::str::from_utf8(piece).expect("ascii doc"))
        .collect();

    c.bench_function("structured_output_read_per_chunk", |b| {
        b.iter(|| {
            let mut output = StructuredOutput::new([
                ("message", PropertyKind::String),
                ("tags", PropertyKind::Array),
            ]);
            for piece in &pieces {
                output.append(black_box(piece));
                black_box(output.read_buffered_property("message"));
            }
            output.finish();
            black_box(output.read_buffered_property("tags"))
        });
    });
}

criterion_group!(
    benches,
    bench_decode_and_process,
    bench_xml_tool_processor,
    bench_tag_stripper,
    bench_structured_output
);
criterion_main!(benches);
