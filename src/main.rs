use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use completion_stream::config::load_config;
use completion_stream::fc::{XmlOutput, XmlToolProcessor};
use completion_stream::observability::init_tracing;
use completion_stream::stream::ChunkDecoder;
use completion_stream::transport::HttpTransport;
use completion_stream::{
    Dialect, DialectRegistry, GenerateOptions, Llm, Prompt, ToolDefinition, UnifiedEvent,
};

#[derive(Debug, Parser)]
#[command(
    name = "completion-stream",
    about = "Normalize streamed LLM completions from several vendor dialects"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Feed a captured response body through a dialect's stream processor
    Replay {
        /// openai, anthropic, gemini or ollama
        dialect: String,
        /// Raw response body as received from the vendor
        capture: PathBuf,
        /// Bytes per simulated network chunk
        #[arg(long, default_value_t = 64)]
        chunk_size: usize,
        /// Extract XML tool calls from the text
        #[arg(long)]
        xml_tools: bool,
        /// JSON array of tool definitions used for argument coercion
        #[arg(long)]
        tools: Option<PathBuf>,
        /// Print growing tool calls and thinking
        #[arg(long)]
        partial: bool,
        #[arg(long, default_value = "WARNING")]
        log_level: String,
    },
    /// Stream one generation to stdout
    Generate {
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
        #[arg(long)]
        model: String,
        /// Prompt JSON: {"system", "messages", "tools", "tool_choice"}
        #[arg(long)]
        prompt: PathBuf,
        #[arg(long)]
        partial: bool,
        #[arg(long)]
        thinking: bool,
    },
}

fn main() {
    let args = Args::parse();
    let result = match args.command {
        Command::Replay {
            dialect,
            capture,
            chunk_size,
            xml_tools,
            tools,
            partial,
            log_level,
        } => {
            init_tracing(&log_level);
            replay(&dialect, &capture, chunk_size, xml_tools, tools.as_deref(), partial)
        }
        Command::Generate {
            config,
            model,
            prompt,
            partial,
            thinking,
        } => generate(&config, &model, &prompt, partial, thinking),
    };
    if let Err(message) = result {
        eprintln!("{message}");
        std::process::exit(1);
    }
}

fn read_json(path: &Path) -> Result<serde_json::Value, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| format!("Invalid JSON in {}: {e}", path.display()))
}

fn print_event(out: &mut impl Write, event: &UnifiedEvent) {
    match serde_json::to_string(event) {
        Ok(line) => {
            let _ = writeln!(out, "{line}");
        }
        Err(err) => tracing::warn!(error = %err, "event could not be printed"),
    }
}

fn replay(
    dialect: &str,
    capture: &Path,
    chunk_size: usize,
    xml_tools: bool,
    tools: Option<&Path>,
    partial: bool,
) -> Result<(), String> {
    let dialect = Dialect::from_name(dialect).ok_or_else(|| {
        let known: Vec<&str> = Dialect::ALL.iter().map(|d| d.name()).collect();
        format!("Unknown dialect '{dialect}'; expected one of {}", known.join(", "))
    })?;
    let body = std::fs::read(capture)
        .map_err(|e| format!("Failed to read {}: {e}", capture.display()))?;
    let definitions = match tools {
        Some(path) => {
            let value = read_json(path)?;
            let hashes = value.as_array().cloned().unwrap_or_default();
            let defs = hashes
                .iter()
                .map(ToolDefinition::from_hash)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            Some(defs)
        }
        None => None,
    };

    let mut decoder = ChunkDecoder::with_framing(dialect.spec().framing);
    let mut processor = dialect.processor(partial, definitions.clone());
    let mut xml = xml_tools.then(|| XmlToolProcessor::new(partial, definitions));
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    for chunk in body.chunks(chunk_size.max(1)) {
        for message in decoder.feed_bytes(chunk) {
            emit_events(processor.process_streamed_message(&message), &mut xml, &mut out);
        }
        if xml.as_ref().is_some_and(XmlToolProcessor::should_cancel) {
            break;
        }
    }
    for message in decoder.finish() {
        emit_events(processor.process_streamed_message(&message), &mut xml, &mut out);
    }
    emit_events(processor.finish(), &mut xml, &mut out);
    if let Some(xml) = xml.as_mut() {
        for output in xml.finish() {
            print_event(&mut out, &xml_event(output));
        }
    }

    let usage = processor.usage();
    if !usage.is_empty() {
        eprintln!(
            "usage: input={} output={} cached={}",
            usage.input_tokens.unwrap_or(0),
            usage.output_tokens.unwrap_or(0),
            usage.cached_tokens.unwrap_or(0)
        );
    }
    Ok(())
}

fn emit_events(events: Vec<UnifiedEvent>, xml: &mut Option<XmlToolProcessor>, out: &mut impl Write) {
    for event in events {
        match (event, xml.as_mut()) {
            (UnifiedEvent::TextDelta(text), Some(xml)) => {
                for output in xml.feed(&text) {
                    print_event(out, &xml_event(output));
                }
            }
            (event, _) => print_event(out, &event),
        }
    }
}

fn xml_event(output: XmlOutput) -> UnifiedEvent {
    match output {
        XmlOutput::Text(text) => UnifiedEvent::TextDelta(text),
        XmlOutput::ToolCall(call) => UnifiedEvent::ToolCall(call),
    }
}

fn generate(
    config_path: &str,
    model: &str,
    prompt_path: &Path,
    partial: bool,
    thinking: bool,
) -> Result<(), String> {
    let config = load_config(config_path).map_err(|e| {
        format!(
            "Failed to load configuration: {e}\n\
             Please copy 'config.example.yaml' to 'config.yaml' and modify as needed."
        )
    })?;
    init_tracing(&config.features.log_level);

    let registry = DialectRegistry::from_config(&config).map_err(|e| e.to_string())?;
    let transport = HttpTransport::new(&config.transport).map_err(|e| e.to_string())?;
    let prompt = Prompt::from_json(&read_json(prompt_path)?).map_err(|e| e.to_string())?;

    let mut options = GenerateOptions::from_features(&config.features);
    options.partial_tool_calls |= partial;
    options.output_thinking |= thinking;
    options.feature_name = Some("cli".into());

    let stdout = std::io::stdout();
    let mut on_event = |event: &UnifiedEvent| {
        let mut out = stdout.lock();
        match event {
            UnifiedEvent::TextDelta(text) => {
                let _ = write!(out, "{text}");
            }
            other => {
                let _ = writeln!(out);
                print_event(&mut out, other);
            }
        }
        let _ = out.flush();
    };

    let llm = Llm::new(&registry, &transport);
    let completion = llm
        .generate(&prompt, model, &options, None, Some(&mut on_event))
        .map_err(|e| e.to_string())?;
    println!();
    match completion {
        Some(completion) => {
            tracing::info!(
                tool_calls = completion.tool_calls.len(),
                input_tokens = completion.usage.input_tokens.unwrap_or(0),
                output_tokens = completion.usage.output_tokens.unwrap_or(0),
                "generation complete"
            );
            Ok(())
        }
        None => Err("Generation did not complete; see the log for details.".into()),
    }
}
