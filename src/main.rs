//! novel-llm demo
//!
//! Loads the configured model, then answers a prompt the way a game's UI
//! would: start a background generation and poll the sink once per frame.
//!
//! ```text
//! novel-llm [--scripted] [prompt...]
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use novel_llm::inference::{Backend, GenerationEngine, ModelRegistry, ScriptedBackend, StreamingTextSink};
use novel_llm::storage::init_storage;
use novel_llm::storage::settings::{load_settings, LlmSettings};

const FRAME: Duration = Duration::from_millis(16);

fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("novel_llm=info".parse().expect("valid directive")))
        .init();

    info!("Starting novel-llm v{}", env!("CARGO_PKG_VERSION"));

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let scripted = args.first().map(String::as_str) == Some("--scripted");
    if scripted {
        args.remove(0);
    }
    let prompt = if args.is_empty() {
        "Describe the harbour at dawn in one sentence.".to_string()
    } else {
        args.join(" ")
    };

    if let Err(e) = init_storage() {
        tracing::warn!("Failed to initialize storage: {}", e);
    }
    let settings = load_settings();
    let result = if scripted {
        let backend = ScriptedBackend::new(["The", " harbour", " wakes", " in", " grey", " light", "."])
            .with_decode_delay(Duration::from_millis(40));
        run(ModelRegistry::new(backend), PathBuf::from("scripted.gguf"), &settings, prompt)
    } else {
        run_llama(&settings, prompt)
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

#[cfg(feature = "llama")]
fn run_llama(settings: &LlmSettings, prompt: String) -> Result<(), String> {
    use novel_llm::storage::models::scan_models_directory;

    let backend = novel_llm::inference::LlamaCppBackend::new().map_err(|e| e.to_string())?;
    let model_path = match &settings.model_path {
        Some(path) => path.clone(),
        None => {
            let info = scan_models_directory(&settings.models_directory)
                .map_err(|e| e.to_string())?
                .into_iter()
                .next()
                .ok_or_else(|| format!("no .gguf files in {}", settings.models_directory.display()))?;
            info!("Using {} ({})", info.filename, info.size_string());
            info.path
        }
    };
    run(ModelRegistry::new(backend), model_path, settings, prompt)
}

#[cfg(not(feature = "llama"))]
fn run_llama(_settings: &LlmSettings, _prompt: String) -> Result<(), String> {
    Err("built without the `llama` feature; use --scripted".to_string())
}

fn run<B: Backend>(
    registry: ModelRegistry<B>,
    model_path: PathBuf,
    settings: &LlmSettings,
    prompt: String,
) -> Result<(), String> {
    let key = model_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("model")
        .to_string();

    registry
        .initialize_model(&key, &settings.model_config(&model_path))
        .map_err(|e| e.to_string())?;
    let model = registry
        .get_model(&key)
        .ok_or_else(|| format!("model '{key}' missing after initialization"))?;

    let engine = GenerationEngine::new();
    engine
        .initialize_with_model(
            model,
            &settings.context_config(),
            &settings.sampling_config(),
            settings.system_prompt.as_str(),
        )
        .map_err(|e| e.to_string())?;

    // The engine holds its own reference; the weights stay loaded.
    registry.release_model(&key);

    let sink = StreamingTextSink::new();
    sink.start_generation(&engine, settings.request(prompt))
        .map_err(|e| e.to_string())?;

    let mut shown = 0;
    let mut stdout = std::io::stdout();
    loop {
        let complete = sink.is_generation_complete();
        let text = sink.text();
        if text.len() > shown {
            // Ignoring write errors: a closed stdout just ends the demo output.
            let _ = write!(stdout, "{}", &text[shown..]);
            let _ = stdout.flush();
            shown = text.len();
        }
        if complete {
            break;
        }
        thread::sleep(FRAME);
    }
    println!();

    engine.wait_all_tasks();
    if let Some(e) = sink.last_error() {
        return Err(e.to_string());
    }

    info!("Conversation now holds {} messages", engine.chat_history().len());
    Ok(())
}
