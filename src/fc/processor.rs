use memchr::memmem;
use serde_json::{Map, Value};

use crate::fc::parser::{
    find_invoke_open, find_outside_cdata, parse_invoke_body, InvokeFields, FUNCTION_CALLS_CLOSE,
    FUNCTION_CALLS_OPEN, INVOKE_CLOSE,
};
use crate::protocol::canonical::ToolCall;
use crate::tool::{find_tool, ToolDefinition};
use crate::util::partial_suffix_len;

/// One item produced by [`XmlToolProcessor`].
#[derive(Debug, Clone, PartialEq)]
pub enum XmlOutput {
    Text(String),
    ToolCall(ToolCall),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Passing text through, watching for `<function_calls>`.
    Text,
    /// Inside a block; `block` holds everything after the open tag.
    InBlock,
    /// A block closed. Later input in this turn is discarded.
    Closed,
}

#[derive(Debug, Default)]
struct InvokeState {
    last_emitted: Option<(String, Map<String, Value>)>,
    finalized: bool,
}

/// Streaming extractor of tool calls written as in-band XML.
///
/// Text outside `<function_calls>` passes through unchanged. Each `<invoke>`
/// becomes a [`ToolCall`]; with `partial_tool_calls` the call is also
/// emitted as it grows.
pub struct XmlToolProcessor {
    partial_tool_calls: bool,
    tool_definitions: Option<Vec<ToolDefinition>>,
    phase: Phase,
    held: String,
    block: String,
    /// Offset in `block` after the last finalized invoke.
    settled: usize,
    invokes: Vec<InvokeState>,
    should_cancel: bool,
}

impl XmlToolProcessor {
    #[must_use]
    pub fn new(partial_tool_calls: bool, tool_definitions: Option<Vec<ToolDefinition>>) -> Self {
        Self {
            partial_tool_calls,
            tool_definitions,
            phase: Phase::Text,
            held: String::new(),
            block: String::new(),
            settled: 0,
            invokes: Vec::new(),
            should_cancel: false,
        }
    }

    /// True once a complete `<function_calls>` block was consumed.
    #[must_use]
    pub fn should_cancel(&self) -> bool {
        self.should_cancel
    }

    pub fn feed(&mut self, text: &str) -> Vec<XmlOutput> {
        let mut out = Vec::new();
        self.feed_into(text, &mut out);
        out
    }

    pub fn feed_into(&mut self, text: &str, out: &mut Vec<XmlOutput>) {
        match self.phase {
            Phase::Closed => {}
            Phase::InBlock => {
                self.block.push_str(text);
                self.scan_block(false, out);
            }
            Phase::Text => self.feed_text(text, out),
        }
    }

    /// Finalize named invokes that never closed, or flush held text.
    pub fn finish(&mut self) -> Vec<XmlOutput> {
        let mut out = Vec::new();
        match self.phase {
            Phase::Closed => {}
            Phase::Text => {
                if !self.held.is_empty() {
                    out.push(XmlOutput::Text(std::mem::take(&mut self.held)));
                }
            }
            Phase::InBlock => {
                self.scan_block(true, &mut out);
                self.phase = Phase::Closed;
            }
        }
        out
    }

    fn feed_text(&mut self, text: &str, out: &mut Vec<XmlOutput>) {
        let input = if self.held.is_empty() {
            text.to_owned()
        } else {
            let mut held = std::mem::take(&mut self.held);
            held.push_str(text);
            held
        };

        if let Some(pos) = memmem::find(input.as_bytes(), FUNCTION_CALLS_OPEN) {
            let before = input[..pos].trim_end();
            if !before.is_empty() {
                out.push(XmlOutput::Text(before.to_owned()));
            }
            self.phase = Phase::InBlock;
            self.block = input[pos + FUNCTION_CALLS_OPEN.len()..].to_owned();
            self.scan_block(false, out);
            return;
        }

        // Trailing whitespace is held with any partial open tag; it is
        // trimmed if the block follows.
        let hold = partial_suffix_len(input.as_bytes(), FUNCTION_CALLS_OPEN);
        let emit_len = input[..input.len() - hold].trim_end().len();
        if emit_len > 0 {
            out.push(XmlOutput::Text(input[..emit_len].to_owned()));
        }
        self.held = input[emit_len..].to_owned();
    }

    /// Walk the invokes after the settled offset and emit what changed.
    fn scan_block(&mut self, at_end: bool, out: &mut Vec<XmlOutput>) {
        let block = std::mem::take(&mut self.block);
        let mut cursor = self.settled;
        let mut idx = self.invokes.iter().filter(|s| s.finalized).count();
        loop {
            let invoke = find_invoke_open(&block, cursor);
            let close = find_outside_cdata(&block, cursor, FUNCTION_CALLS_CLOSE);
            let invoke_first = match (invoke, close) {
                (Some((start, _)), Some(close_at)) => start < close_at,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !invoke_first {
                if close.is_some() {
                    self.phase = Phase::Closed;
                    self.should_cancel = true;
                }
                break;
            }
            let Some((_, Some(body_start))) = invoke else {
                break;
            };
            match find_outside_cdata(&block, body_start, INVOKE_CLOSE) {
                Some(end) => {
                    let fields = parse_invoke_body(&block[body_start..end], true);
                    self.emit(idx, fields, false, out);
                    cursor = end + INVOKE_CLOSE.len();
                    self.settled = cursor;
                    idx += 1;
                }
                None => {
                    let body = &block[body_start..];
                    // A block close with no matching </invoke> ends the open call too.
                    let (body, ends_block) =
                        match find_outside_cdata(&block, body_start, FUNCTION_CALLS_CLOSE) {
                            Some(close_at) => (&block[body_start..close_at], true),
                            None => (body, false),
                        };
                    let fields = parse_invoke_body(body, at_end || ends_block);
                    self.emit(idx, fields, !(at_end || ends_block), out);
                    if ends_block {
                        self.phase = Phase::Closed;
                        self.should_cancel = true;
                    }
                    break;
                }
            }
        }
        self.block = block;
    }

    fn emit(&mut self, idx: usize, fields: InvokeFields, partial: bool, out: &mut Vec<XmlOutput>) {
        while self.invokes.len() <= idx {
            self.invokes.push(InvokeState::default());
        }
        let Some(name) = fields.name else {
            if !partial {
                tracing::debug!(index = idx, "dropping xml invoke without a tool name");
                self.invokes[idx].finalized = true;
            }
            return;
        };
        let state = &mut self.invokes[idx];
        if state.finalized || (partial && !self.partial_tool_calls) {
            return;
        }

        let raw: Map<String, Value> = fields
            .params
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        let parameters = match self
            .tool_definitions
            .as_deref()
            .and_then(|defs| find_tool(defs, &name))
        {
            Some(def) => def.coerce_parameters(&raw),
            None => raw,
        };

        if partial {
            let snapshot = (name.clone(), parameters.clone());
            if state.last_emitted.as_ref() == Some(&snapshot) {
                return;
            }
            state.last_emitted = Some(snapshot);
        } else {
            state.finalized = true;
        }
        out.push(XmlOutput::ToolCall(ToolCall {
            id: fields.id.unwrap_or_else(|| format!("tool_{idx}")),
            name,
            parameters,
            partial,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{ParameterDefinition, ParameterType};
    use serde_json::json;

    fn tool_calls(outputs: &[XmlOutput]) -> Vec<&ToolCall> {
        outputs
            .iter()
            .filter_map(|o| match o {
                XmlOutput::ToolCall(call) => Some(call),
                XmlOutput::Text(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_empty_block_cancels_and_discards() {
        let mut processor = XmlToolProcessor::new(false, None);
        let first = processor.feed("start<function_calls></function_calls>");
        let second = processor.feed("more text");
        let last = processor.finish();
        assert_eq!(first, vec![XmlOutput::Text("start".into())]);
        assert!(second.is_empty());
        assert!(last.is_empty());
        assert!(processor.should_cancel());
    }

    #[test]
    fn test_single_invoke() {
        let mut processor = XmlToolProcessor::new(false, None);
        let out = processor.feed(
            "hello\n<function_calls><invoke><tool_name>search</tool_name>\
             <parameters><query>cats</query></parameters></invoke>",
        );
        assert_eq!(out[0], XmlOutput::Text("hello".into()));
        let calls = tool_calls(&out);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "tool_0");
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].parameters.get("query"), Some(&json!("cats")));
        assert!(!calls[0].partial);
        assert!(!processor.should_cancel());
        assert!(processor.finish().is_empty());
    }

    #[test]
    fn test_tool_id_is_used() {
        let mut processor = XmlToolProcessor::new(false, None);
        let out = processor.feed(
            "<function_calls><invoke><tool_name>a</tool_name><tool_id>xyz</tool_id></invoke>\
             <invoke><tool_name>b</tool_name></invoke></function_calls>",
        );
        let calls = tool_calls(&out);
        assert_eq!(calls[0].id, "xyz");
        assert_eq!(calls[1].id, "tool_1");
        assert!(processor.should_cancel());
    }

    #[test]
    fn test_partial_emissions_then_final() {
        let mut processor = XmlToolProcessor::new(true, None);
        let mut all = Vec::new();
        for chunk in [
            "<function_calls><invoke><tool_na",
            "me>search</tool_name><parameters><query>ca",
            "ts</query>",
            "</parameters></invoke>",
        ] {
            all.extend(processor.feed(chunk));
        }
        let calls = tool_calls(&all);
        assert_eq!(calls.len(), 3);
        assert!(calls[..calls.len() - 1].iter().all(|c| c.partial));
        assert_eq!(calls[0].parameters.get("query"), Some(&json!("ca")));
        assert_eq!(calls[1].parameters.get("query"), Some(&json!("cats")));
        let last = calls[calls.len() - 1];
        assert!(!last.partial);
        assert_eq!(last.parameters.get("query"), Some(&json!("cats")));
    }

    #[test]
    fn test_no_partials_without_flag() {
        let mut processor = XmlToolProcessor::new(false, None);
        let out = processor.feed("<function_calls><invoke><tool_name>x</tool_name><parameters><a>1");
        assert!(tool_calls(&out).is_empty());
    }

    #[test]
    fn test_finish_finalizes_unterminated_invoke() {
        let mut processor = XmlToolProcessor::new(false, None);
        assert!(processor
            .feed("<function_calls><invoke><tool_name>search</tool_name><parameters><q>hi")
            .is_empty());
        let out = processor.finish();
        let calls = tool_calls(&out);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].parameters.get("q"), Some(&json!("hi")));
        assert!(!calls[0].partial);
    }

    #[test]
    fn test_held_prefix_flushed_on_finish() {
        let mut processor = XmlToolProcessor::new(false, None);
        assert_eq!(processor.feed("a <func"), vec![XmlOutput::Text("a".into())]);
        assert_eq!(processor.finish(), vec![XmlOutput::Text(" <func".into())]);
    }

    #[test]
    fn test_whitespace_before_block_trimmed_at_any_split() {
        let input = "hi \n<function_calls><invoke><tool_name>t</tool_name></invoke></function_calls>";
        for split in 0..=input.len() {
            let mut processor = XmlToolProcessor::new(false, None);
            let mut out = processor.feed(&input[..split]);
            out.extend(processor.feed(&input[split..]));
            out.extend(processor.finish());
            let text: String = out
                .iter()
                .filter_map(|o| match o {
                    XmlOutput::Text(t) => Some(t.as_str()),
                    XmlOutput::ToolCall(_) => None,
                })
                .collect();
            assert_eq!(text, "hi", "split at {split}");
            assert_eq!(tool_calls(&out).len(), 1, "split at {split}");
        }
    }

    #[test]
    fn test_held_whitespace_released_by_later_text() {
        let mut processor = XmlToolProcessor::new(false, None);
        assert_eq!(processor.feed("one \n"), vec![XmlOutput::Text("one".into())]);
        assert_eq!(processor.feed("two"), vec![XmlOutput::Text(" \ntwo".into())]);
    }

    #[test]
    fn test_parameters_are_coerced() {
        let tool = ToolDefinition::new(
            "count",
            "Count things",
            vec![
                ParameterDefinition::new("n", "how many", ParameterType::Integer).required(),
                ParameterDefinition::new("ok", "flag", ParameterType::Boolean),
            ],
        )
        .unwrap();
        let mut processor = XmlToolProcessor::new(false, Some(vec![tool]));
        let out = processor.feed(
            "<function_calls><invoke><tool_name>count</tool_name>\
             <parameters><n>12</n><ok>True</ok><junk>z</junk></parameters></invoke>\
             <invoke><tool_name>other</tool_name><parameters><n>12</n></parameters></invoke>",
        );
        let calls = tool_calls(&out);
        assert_eq!(calls[0].parameters, json!({"n": 12, "ok": true}).as_object().cloned().unwrap());
        assert_eq!(calls[1].parameters.get("n"), Some(&json!("12")));
    }

    #[test]
    fn test_close_without_invoke_close_finalizes() {
        let mut processor = XmlToolProcessor::new(false, None);
        let out = processor.feed(
            "<function_calls><invoke><tool_name>a</tool_name><parameters><x>1</x></function_calls>tail",
        );
        let calls = tool_calls(&out);
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].partial);
        assert!(processor.should_cancel());
        assert!(!out.iter().any(|o| matches!(o, XmlOutput::Text(t) if t.contains("tail"))));
    }
}
