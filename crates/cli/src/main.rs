use book_adapters::{create_generator, list_models, AdapterError};
use book_core::{
    count_words, install_log_bridge, normalize_language, realign, recover_titles, BackendConfig,
    ChapterOrchestrator, ChapterStore, ChapterTitle, ConfigError, ConfigStore, EnhanceError,
    Enhancer, FsChapterStore, GenerationError, GenerationRequest, GenerationState, LogLevel,
    LogRecord, LogSink, ModelTranslator, Payloads, Plan, PlanError, ProjectConfig, PromptError,
    PromptRegistry, SamplingParams, ScriptDetector, StateError, StdoutLogSink, StepOutcome,
    StoreError, TextGenerator,
};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

const TEST_PROMPT: &str = "Please reply 'OK'";

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let min_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let sink = StdoutLogSink::with_min_level(min_level);
    install_log_bridge(Arc::new(sink), log::LevelFilter::Debug);

    match cli.command {
        Command::Config(command) => handle_config(&cli.config, command, &sink),
        Command::Generate(command) => handle_generate(&cli.config, command, &sink),
        Command::Enhance(args) => run_enhance(&cli.config, args, &sink),
        Command::Fix(command) => handle_fix(&cli.config, command, &sink),
    }
}

fn handle_config(
    config_path: &Path,
    command: ConfigCommand,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    match command {
        ConfigCommand::Show => run_show_config(config_path),
        ConfigCommand::SetBackend(args) => run_set_backend(config_path, args, sink),
        ConfigCommand::RemoveBackend(args) => run_remove_backend(config_path, args, sink),
        ConfigCommand::TestBackend(args) => run_test_backend(config_path, args, sink),
        ConfigCommand::ListModels(args) => run_list_models(config_path, args, sink),
    }
}

fn handle_generate(
    config_path: &Path,
    command: GenerateCommand,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    match command {
        GenerateCommand::Next(args) => run_generate_next(config_path, args, sink),
        GenerateCommand::Reset => run_generate_reset(config_path, sink),
        GenerateCommand::Status => run_generate_status(config_path),
    }
}

fn handle_fix(config_path: &Path, command: FixCommand, sink: &dyn LogSink) -> Result<(), CliError> {
    match command {
        FixCommand::Language(args) => run_fix_language(config_path, args, sink),
        FixCommand::Align(args) => run_fix_align(args, sink),
    }
}

fn run_show_config(config_path: &Path) -> Result<(), CliError> {
    let store = ConfigStore::open(config_path.to_path_buf())?;
    let rendered = serde_json::to_string_pretty(store.config()).map_err(CliError::Render)?;
    println!("{rendered}");
    Ok(())
}

fn run_set_backend(
    config_path: &Path,
    args: SetBackendArgs,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    let mut profile = store
        .config()
        .get_backend_profile(&args.name)
        .cloned()
        .unwrap_or_else(|| BackendConfig::ollama(""));

    if let Some(format) = args.format {
        profile.interface_format = format;
    }
    if let Some(model) = args.model {
        profile.model_name = model;
    }
    if let Some(base_url) = args.base_url {
        profile.base_url = base_url;
    }
    if let Some(api_key) = args.api_key {
        profile.api_key = api_key;
    }
    if let Some(temperature) = args.temperature {
        profile.temperature = temperature;
    }
    if let Some(top_p) = args.top_p {
        profile.top_p = top_p;
    }
    if let Some(timeout) = args.timeout {
        profile.timeout = timeout;
    }
    if profile.model_name.trim().is_empty() {
        return Err(CliError::MissingModel(args.name));
    }

    store.config_mut().upsert_backend_profile(args.name.clone(), profile);
    store.touch_backend(args.name.clone());
    store.save()?;
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "backend profile `{}` saved to {}",
            args.name,
            store.path().display()
        ),
    ));
    Ok(())
}

fn run_remove_backend(
    config_path: &Path,
    args: RemoveBackendArgs,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    if store.remove_backend(&args.name).is_none() {
        return Err(CliError::UnknownBackend(args.name));
    }
    store.save()?;
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("backend profile `{}` removed", args.name),
    ));
    Ok(())
}

fn run_test_backend(
    config_path: &Path,
    args: BackendArgs,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    store.ensure_recent_defaults();
    let (name, profile) = select_backend(&store, args.backend.as_deref())?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("testing backend `{name}`"),
    ));
    sink.log(LogRecord::new(
        LogLevel::Debug,
        format!(
            "model: {} | interface: {} | base url: {}",
            profile.model_name, profile.interface_format, profile.base_url
        ),
    ));

    let generator = create_generator(store.config(), &name)?;
    let sampling = SamplingParams {
        max_tokens: 16,
        ..SamplingParams::for_backend(&profile)
    };
    let response = generator
        .generate(&GenerationRequest::new(TEST_PROMPT, sampling))
        .map_err(CliError::Generation)?;
    if response.trim().is_empty() {
        return Err(CliError::TestFailed(format!(
            "backend `{name}` returned no text"
        )));
    }

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("backend `{name}` replied: {}", response.trim()),
    ));
    store.touch_backend(name);
    store.save()?;
    Ok(())
}

fn run_list_models(
    config_path: &Path,
    args: BackendArgs,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    store.ensure_recent_defaults();
    let (name, profile) = select_backend(&store, args.backend.as_deref())?;

    let models = list_models(&profile)?;
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("backend `{name}` serves {} model(s)", models.len()),
    ));
    for model in models {
        println!("{model}");
    }
    Ok(())
}

fn run_generate_next(
    config_path: &Path,
    args: GenerateNextArgs,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    store.ensure_recent_defaults();
    let project = store.config().project.clone();
    let generation = store.config().generation.clone();

    let plan = load_plan(&project, args.inputs.plan.as_deref())?;
    let payloads = load_payloads(&project, &args.inputs)?;
    let (name, profile) = select_backend(&store, args.backend.as_deref())?;
    let mut prompts = PromptRegistry::from_prompt_config(&store.config().prompts)?;
    let generator = create_generator(store.config(), &name)?;
    let chapters = FsChapterStore::new(project.chapters_dir());

    let state_path = project.state_path();
    let mut state = if args.resume {
        GenerationState::resume(&plan, &generation, &chapters)?
    } else {
        GenerationState::load_or_default(&state_path)?
    };

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "using backend `{name}` ({}), writing to {}",
            profile.model_name,
            project.output_dir.display()
        ),
    ));

    let sampling = SamplingParams::for_backend(&profile);
    let outcomes = if args.all && prompts.hot_reload_enabled() {
        // Edited fragments take effect from the next chapter on.
        let mut outcomes = Vec::new();
        loop {
            prompts.refresh()?;
            let outcome = ChapterOrchestrator::new(&prompts, &generation, sink)
                .with_payloads(payloads.clone())
                .with_sampling(sampling)
                .step(&mut state, Some(&plan), generator.as_ref(), &chapters);
            let done = outcome.is_terminal();
            outcomes.push(outcome);
            if done {
                break outcomes;
            }
        }
    } else {
        let orchestrator = ChapterOrchestrator::new(&prompts, &generation, sink)
            .with_payloads(payloads)
            .with_sampling(sampling);
        if args.all {
            orchestrator.run_to_completion(&mut state, Some(&plan), generator.as_ref(), &chapters)
        } else {
            vec![orchestrator.step(&mut state, Some(&plan), generator.as_ref(), &chapters)]
        }
    };
    state.save_to_path(&state_path)?;
    store.touch_backend(name);
    store.save()?;

    for outcome in &outcomes {
        println!("{outcome}");
    }
    match outcomes.last() {
        Some(StepOutcome::Error(message)) => Err(CliError::Step(message.clone())),
        Some(StepOutcome::AllComplete { .. }) => {
            sink.log(LogRecord::new(
                LogLevel::Info,
                format!(
                    "manuscript written to {}",
                    chapters.manuscript_path().display()
                ),
            ));
            Ok(())
        }
        _ => Ok(()),
    }
}

fn run_generate_reset(config_path: &Path, sink: &dyn LogSink) -> Result<(), CliError> {
    let store = ConfigStore::open(config_path.to_path_buf())?;
    let prompts = PromptRegistry::from_prompt_config(&store.config().prompts)?;
    let project = &store.config().project;
    let state_path = project.state_path();

    let mut state = GenerationState::load_or_default(&state_path)?;
    ChapterOrchestrator::new(&prompts, &store.config().generation, sink).reset(&mut state);
    state.save_to_path(&state_path)?;
    Ok(())
}

fn run_generate_status(config_path: &Path) -> Result<(), CliError> {
    let store = ConfigStore::open(config_path.to_path_buf())?;
    let state = GenerationState::load_or_default(&store.config().project.state_path())?;
    println!("phase: {:?}", state.phase);
    println!("next chapter index: {}", state.cursor);
    println!("manuscript words: {}", count_words(&state.manuscript));
    if let Some(error) = &state.last_error {
        println!("last error: {error}");
    }
    Ok(())
}

fn run_enhance(config_path: &Path, args: EnhanceArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    store.ensure_recent_defaults();
    let project = store.config().project.clone();

    let plan = load_plan(&project, args.plan.as_deref())?;
    let (name, profile) = select_backend(&store, args.backend.as_deref())?;
    let prompts = PromptRegistry::from_prompt_config(&store.config().prompts)?;
    let generator = create_generator(store.config(), &name)?;

    let originals = FsChapterStore::new(project.chapters_dir());
    let manuscript = match &args.manuscript {
        Some(path) => read_text(path)?,
        None => originals
            .manuscript()?
            .ok_or_else(|| CliError::MissingManuscript(originals.manuscript_path()))?,
    };
    let enhanced = FsChapterStore::new(project.enhanced_dir());

    let sampling = SamplingParams::for_backend(&profile);
    let report = Enhancer::new(
        &prompts,
        &store.config().enhancement,
        &store.config().generation,
        sink,
    )
    .with_sampling(sampling)
    .enhance(&plan, &manuscript, &originals, generator.as_ref(), &enhanced)?;

    for chapter in &report.chapters {
        println!(
            "chapter {}: {} -> {} words (band {}..={})",
            chapter.number,
            chapter.original_words,
            chapter.word_count,
            chapter.band.lower,
            chapter.band.upper
        );
    }
    println!(
        "enhanced manuscript: {} words (band {}..={}) at {}",
        report.word_count,
        report.band.lower,
        report.band.upper,
        enhanced.manuscript_path().display()
    );

    store.touch_backend(name);
    store.save()?;
    Ok(())
}

fn run_fix_language(
    config_path: &Path,
    args: FixLanguageArgs,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    store.ensure_recent_defaults();
    let (name, _) = select_backend(&store, args.backend.as_deref())?;
    let prompts = PromptRegistry::from_prompt_config(&store.config().prompts)?;
    let generator = create_generator(store.config(), &name)?;

    let text = read_text(&args.input)?;
    let translator = ModelTranslator::new(generator.as_ref(), &prompts);
    let report = normalize_language(&text, &ScriptDetector::default(), &translator);

    let output = args.output.unwrap_or(args.input);
    write_text(&output, &report.text)?;
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "{} line(s) translated, {} kept after failures; written to {}",
            report.translated_lines,
            report.failed_lines,
            output.display()
        ),
    ));
    store.touch_backend(name);
    store.save()?;
    Ok(())
}

fn run_fix_align(args: FixAlignArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let text = read_text(&args.input)?;
    let storyboard = read_text(&args.storyboard)?;
    let titles = titles_from_storyboard(&storyboard);
    if titles.is_empty() {
        return Err(CliError::NoChapterTitles(args.storyboard));
    }

    let report = realign(&text, &titles);
    let output = args.output.unwrap_or(args.input);
    write_text(&output, &report.text)?;
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "{} header(s) rewritten, {} line(s) tagged; written to {}",
            report.headers_rewritten,
            report.excess_lines,
            output.display()
        ),
    ));
    Ok(())
}

/// Titles from a JSON plan, or from `--- Chapter N: Title ---` markers when
/// the storyboard is plain text.
fn titles_from_storyboard(storyboard: &str) -> Vec<ChapterTitle> {
    match Plan::from_json_str(storyboard) {
        Ok(plan) => plan.titles(),
        Err(_) => recover_titles(storyboard),
    }
}

fn load_plan(project: &ProjectConfig, explicit: Option<&Path>) -> Result<Plan, CliError> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(|| project.plan.clone())
        .ok_or(CliError::MissingPlan)?;
    let raw = read_text(&path)?;
    Plan::from_json_str(&raw).map_err(|source| CliError::Plan { path, source })
}

fn load_payloads(project: &ProjectConfig, inputs: &InputArgs) -> Result<Payloads, CliError> {
    let load = |explicit: &Option<PathBuf>, configured: &Option<PathBuf>| {
        explicit
            .as_ref()
            .or(configured.as_ref())
            .map(|path| read_text(path))
            .transpose()
            .map(|text| text.and_then(|text| Payloads::parse_text(&text)))
    };
    Ok(Payloads {
        characters: load(&inputs.characters, &project.characters)?,
        instructions: load(&inputs.instructions, &project.instructions)?,
        other_info: load(&inputs.other_info, &project.other_info)?,
    })
}

fn select_backend(
    store: &ConfigStore,
    preferred: Option<&str>,
) -> Result<(String, BackendConfig), CliError> {
    let preferred = preferred.map(str::trim).filter(|name| !name.is_empty());
    match store.resolve_backend(preferred) {
        Some(selected) => Ok(selected),
        None => match preferred {
            Some(name) => Err(CliError::UnknownBackend(name.to_string())),
            None => Err(CliError::MissingBackendProfile),
        },
    }
}

fn read_text(path: &Path) -> Result<String, CliError> {
    fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_text(path: &Path, text: &str) -> Result<(), CliError> {
    fs::write(path, text).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("no backend profile configured; add one with `bookctl config set-backend`")]
    MissingBackendProfile,
    #[error("no backend profile named `{0}`")]
    UnknownBackend(String),
    #[error("backend profile `{0}` needs a model name")]
    MissingModel(String),
    #[error("no storyboard given; pass --plan or set project.plan in config.json")]
    MissingPlan,
    #[error("invalid storyboard `{path}`: {source}")]
    Plan {
        path: PathBuf,
        #[source]
        source: PlanError,
    },
    #[error("no manuscript found at {0}; finish generation first")]
    MissingManuscript(PathBuf),
    #[error("no chapter titles found in {0}")]
    NoChapterTitles(PathBuf),
    #[error("failed to access `{path}`: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to render configuration: {0}")]
    Render(#[source] serde_json::Error),
    #[error("backend adapter failed: {0}")]
    Adapter(#[from] AdapterError),
    #[error("generation failed: {0}")]
    Generation(#[source] GenerationError),
    #[error("prompt templates failed to load: {0}")]
    Prompt(#[from] PromptError),
    #[error("generation state error: {0}")]
    State(#[from] StateError),
    #[error("chapter store error: {0}")]
    Store(#[from] StoreError),
    #[error("enhancement failed: {0}")]
    Enhance(#[from] EnhanceError),
    #[error("{0}")]
    Step(String),
    #[error("{0}")]
    TestFailed(String),
}

#[derive(Parser)]
#[command(
    name = "bookctl",
    version,
    about = "Storyboard-driven book generation against a local or hosted model"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// Show debug output
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Backend profiles and configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Chapter-by-chapter generation
    #[command(subcommand)]
    Generate(GenerateCommand),
    /// Expand a finished manuscript to twice its length
    Enhance(EnhanceArgs),
    /// Post-process flat text
    #[command(subcommand)]
    Fix(FixCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Create or update a backend profile
    SetBackend(SetBackendArgs),
    /// Delete a backend profile
    RemoveBackend(RemoveBackendArgs),
    /// Send a short prompt to a backend
    TestBackend(BackendArgs),
    /// List the models a backend serves
    ListModels(BackendArgs),
}

#[derive(Subcommand)]
enum GenerateCommand {
    /// Generate the next chapter, or every remaining one with --all
    Next(GenerateNextArgs),
    /// Start over from the first chapter; stored chapters are kept
    Reset,
    /// Show saved progress
    Status,
}

#[derive(Subcommand)]
enum FixCommand {
    /// Translate non-English lines in place
    Language(FixLanguageArgs),
    /// Rewrite chapter headers to match a storyboard
    Align(FixAlignArgs),
}

#[derive(Args)]
struct BackendArgs {
    /// Backend profile name; defaults to the most recently used one
    #[arg(long)]
    backend: Option<String>,
}

#[derive(Args)]
struct SetBackendArgs {
    /// Profile name
    #[arg(long)]
    name: String,
    /// Interface format, e.g. ollama, openai, deepseek
    #[arg(long)]
    format: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    top_p: Option<f32>,
    /// Request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Args)]
struct RemoveBackendArgs {
    #[arg(long)]
    name: String,
}

#[derive(Args)]
struct InputArgs {
    /// Storyboard JSON; overrides project.plan
    #[arg(long, value_name = "FILE")]
    plan: Option<PathBuf>,
    /// Main characters (text or JSON)
    #[arg(long, value_name = "FILE")]
    characters: Option<PathBuf>,
    /// Writing instructions (text or JSON)
    #[arg(long, value_name = "FILE")]
    instructions: Option<PathBuf>,
    /// Other important information (text or JSON)
    #[arg(long, value_name = "FILE")]
    other_info: Option<PathBuf>,
}

#[derive(Args)]
struct GenerateNextArgs {
    #[command(flatten)]
    inputs: InputArgs,
    #[arg(long)]
    backend: Option<String>,
    /// Keep stepping until every chapter is done or a step fails
    #[arg(long)]
    all: bool,
    /// Rebuild progress from stored chapters instead of the saved state
    #[arg(long)]
    resume: bool,
}

#[derive(Args)]
struct EnhanceArgs {
    #[arg(long, value_name = "FILE")]
    plan: Option<PathBuf>,
    /// Manuscript to expand; defaults to the generated one
    #[arg(long, value_name = "FILE")]
    manuscript: Option<PathBuf>,
    #[arg(long)]
    backend: Option<String>,
}

#[derive(Args)]
struct FixLanguageArgs {
    #[arg(long, value_name = "FILE")]
    input: PathBuf,
    /// Defaults to overwriting the input
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
    #[arg(long)]
    backend: Option<String>,
}

#[derive(Args)]
struct FixAlignArgs {
    #[arg(long, value_name = "FILE")]
    input: PathBuf,
    /// Storyboard as plan JSON or text with `--- Chapter N: Title ---` markers
    #[arg(long, value_name = "FILE")]
    storyboard: PathBuf,
    /// Defaults to overwriting the input
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}
