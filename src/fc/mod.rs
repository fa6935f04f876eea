pub mod prompt;

mod parser;
mod processor;

pub use processor::{XmlOutput, XmlToolProcessor};
pub use prompt::{render_tool_call_xml, render_tool_result_xml, tool_instructions};
