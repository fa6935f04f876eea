use quick_xml::escape::escape;
use serde_json::{Map, Value};

use crate::prompt::ToolChoice;
use crate::tool::ToolDefinition;

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

const INSTRUCTIONS_HEADER: &str = "\
In this environment you have access to a set of tools you can use to answer the user's question.
You may call them like this.

<function_calls>
<invoke>
<tool_name>$TOOL_NAME</tool_name>
<parameters>
<$PARAMETER_NAME>$PARAMETER_VALUE</$PARAMETER_NAME>
...
</parameters>
</invoke>
</function_calls>

If parameter values contain markup, wrap them in <![CDATA[...]]>.
Array values are written as JSON arrays.
Tool results are returned to you inside <function_results> blocks.
Do not write anything after </function_calls>; wait for the results.

Here are the tools available:
";

/// System-prompt section describing `tools` in the XML convention.
///
/// Returns an empty string when there are no tools or the choice is `none`.
#[must_use]
pub fn tool_instructions(tools: &[ToolDefinition], choice: Option<&ToolChoice>) -> String {
    if tools.is_empty() || matches!(choice, Some(ToolChoice::None)) {
        return String::new();
    }
    let mut out = String::with_capacity(INSTRUCTIONS_HEADER.len() + tools.len() * 256);
    out.push_str(INSTRUCTIONS_HEADER);
    out.push_str("\n<tools>\n");
    for tool in tools {
        push_tool_description(&mut out, tool);
    }
    out.push_str("</tools>");

    match choice {
        Some(ToolChoice::Required) => {
            out.push_str("\n\nYou MUST call at least one tool.");
        }
        Some(ToolChoice::Tool(name)) => {
            out.push_str("\n\nYou MUST call the tool: ");
            out.push_str(name);
        }
        Some(ToolChoice::Auto | ToolChoice::None) | None => {}
    }
    out
}

fn push_tool_description(out: &mut String, tool: &ToolDefinition) {
    out.push_str("<tool_description>\n");
    push_element(out, "tool_name", tool.name());
    push_element(out, "description", tool.description());
    if !tool.parameters().is_empty() {
        out.push_str("<parameters>\n");
        for param in tool.parameters() {
            out.push_str("<parameter>\n");
            push_element(out, "name", param.name());
            push_element(out, "type", param.param_type().as_str());
            push_element(out, "description", param.description());
            if param.is_required() {
                push_element(out, "required", "true");
            }
            if let Some(values) = param.enum_values() {
                let options = values
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                push_element(out, "options", &options);
            }
            if let Some(item_type) = param.item_type() {
                push_element(out, "item_type", item_type.as_str());
            }
            out.push_str("</parameter>\n");
        }
        out.push_str("</parameters>\n");
    }
    out.push_str("</tool_description>\n");
}

#[inline]
fn push_element(out: &mut String, tag: &str, text: &str) {
    out.push('<');
    out.push_str(tag);
    out.push('>');
    out.push_str(&escape(text));
    out.push_str("</");
    out.push_str(tag);
    out.push_str(">\n");
}

// ---------------------------------------------------------------------------
// Turn rendering
// ---------------------------------------------------------------------------

/// Render a past tool call the way the model is asked to write one.
#[must_use]
pub fn render_tool_call_xml(id: &str, name: &str, arguments: &Map<String, Value>) -> String {
    let mut out = String::from("<function_calls>\n<invoke>\n");
    push_element(&mut out, "tool_name", name);
    push_element(&mut out, "tool_id", id);
    out.push_str("<parameters>\n");
    for (key, value) in arguments {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        push_element(&mut out, key, &text);
    }
    out.push_str("</parameters>\n</invoke>\n</function_calls>");
    out
}

#[must_use]
pub fn render_tool_result_xml(id: &str, name: &str, content: &str) -> String {
    let mut out = String::from("<function_results>\n<result>\n");
    push_element(&mut out, "tool_name", name);
    push_element(&mut out, "tool_id", id);
    push_element(&mut out, "json", content);
    out.push_str("</result>\n</function_results>");
    out
}
