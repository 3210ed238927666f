use anyhow::Context;
use chatflow::{
    config::{EngineConfig, EnvFile, SettingsSource, SETTINGS},
    flow::{EngineRuntime, FileThreadStore, FlowEngine, FlowRegistry},
    flow_commands::{
        deploy_flow_file, list_executors, parse_vars, run_chat, settings_report, show_setting, validate_flow_file,
    },
    logger::init_tracing,
    ports::{OpenAiClassifier, Ports},
    schema::write_schema,
};
use clap::{Args, Parser, Subcommand};
use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "chatflow",
    about = "Run WhatsApp conversation flows",
    version = "0.1.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a flow file for structural problems and unknown node types
    Validate { file: PathBuf },

    /// Validate a flow and copy it into `<root>/flows`
    Deploy { file: PathBuf },

    /// Talk to a flow in the terminal
    Chat(ChatArgs),

    /// Emit JSON-Schema for flow and thread files into `<root>/schemas`
    Schema {
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// List registered node types
    Executors,

    /// Show or change engine settings in `<root>/config/.env`
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Every engine setting and its effective value
    List,
    Get { key: String },
    Set { key: String, value: String },
    Unset { key: String },
}

#[derive(Args, Debug)]
struct ChatArgs {
    file: PathBuf,

    #[arg(long, default_value = "console")]
    user: String,

    #[arg(long, default_value = "+10000000000")]
    address: String,

    /// Initial variable, `key=value` (value parsed as JSON when possible)
    #[arg(long = "var")]
    vars: Vec<String>,

    /// Log level directive (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Resolve the chatflow root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("CHATFLOW_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./chatflow")
    }
}

fn settings_path(root: &Path) -> PathBuf {
    root.join("config").join(".env")
}

async fn load_config(root: &Path) -> anyhow::Result<EngineConfig> {
    let path = settings_path(root);
    let file = EnvFile::open(&path).with_context(|| format!("reading {}", path.display()))?;
    Ok(EngineConfig::from_source(&file).await)
}

fn ports_for(config: &EngineConfig) -> Ports {
    let classifier = config.openai_key.as_ref().map(|key| {
        Arc::new(
            OpenAiClassifier::new(key.clone())
                .with_base_url(config.openai_url.clone())
                .with_model(config.openai_model.clone()),
        ) as Arc<dyn chatflow::ports::Classifier>
    });
    Ports::local().with_classifier(classifier)
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();

    match cli.command {
        Commands::Validate { file } => {
            let config = load_config(&root).await?;
            let runtime = EngineRuntime::with_builtins(&ports_for(&config), &config);
            let flow = validate_flow_file(&file, &runtime.executors)?;
            println!("✅ Flow `{}` is valid.", flow.id);
            Ok(())
        }
        Commands::Deploy { file } => {
            let config = load_config(&root).await?;
            let runtime = EngineRuntime::with_builtins(&ports_for(&config), &config);
            let dest = deploy_flow_file(&file, &root, &runtime.executors)?;
            println!("✅ Flow deployed to {}", dest.display());
            Ok(())
        }
        Commands::Schema { out } => {
            let out_dir = out.unwrap_or_else(|| root.join("schemas"));
            let written = write_schema(&out_dir)?;
            println!("{} schemas written to {}", written.len(), out_dir.display());
            Ok(())
        }
        Commands::Executors => {
            let config = load_config(&root).await?;
            let runtime = EngineRuntime::with_builtins(&ports_for(&config), &config);
            for (tag, name) in list_executors(&runtime.executors) {
                println!("{:<20} {}", tag, name);
            }
            Ok(())
        }
        Commands::Chat(args) => chat(root, args).await,
        Commands::Config { action } => config(&root, action).await,
    }
}

async fn chat(root: PathBuf, args: ChatArgs) -> anyhow::Result<()> {
    let _guards = init_tracing(&root, "logs/chatflow.log", "logs/chatflow_events.log", &args.log_level)?;
    info!("chatflow starting in {}", root.display());

    let config = load_config(&root).await?;
    let runtime = Arc::new(EngineRuntime::with_builtins(&ports_for(&config), &config));
    let flow = FlowRegistry::load_flow_from_file(&args.file)
        .with_context(|| format!("loading {}", args.file.display()))?;
    let flow = runtime.flows.register_flow(flow);

    let store = FileThreadStore::new(root.join("threads")).await?;
    let engine = Arc::new(FlowEngine::new(runtime, store).with_max_chain_steps(config.max_chain_steps));
    let sweeper = engine.spawn_sweeper(config.sweep_interval, config.sweep_max_age);

    let variables = parse_vars(&args.vars)?;
    let result = run_chat(&engine, &flow.id, &args.user, &args.address, variables).await;
    sweeper.abort();
    result.map(|_| ())
}

async fn config(root: &Path, action: ConfigAction) -> anyhow::Result<()> {
    let path = settings_path(root);
    let mut file = EnvFile::open(&path).with_context(|| format!("reading {}", path.display()))?;
    match action {
        ConfigAction::List => {
            for (key, value) in settings_report(&file).await {
                println!("{:<30} {}", key, value);
            }
        }
        ConfigAction::Get { key } => match file.get(&key).await {
            Some(value) => println!("{}", show_setting(&key, &value)),
            None => anyhow::bail!("`{}` is not set", key),
        },
        ConfigAction::Set { key, value } => {
            if !SETTINGS.iter().any(|(known, _)| *known == key) {
                eprintln!("⚠️  `{}` is not a setting chatflow reads", key);
            }
            file.set(&key, &value)?;
            println!("✅ {} saved to {}", key, file.path().display());
        }
        ConfigAction::Unset { key } => {
            if file.unset(&key)? {
                println!("✅ {} removed from {}", key, file.path().display());
            } else {
                println!("{} was not set in {}", key, file.path().display());
            }
        }
    }
    Ok(())
}
