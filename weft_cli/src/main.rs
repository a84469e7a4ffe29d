use weft_core::config::WeftConfig;
use weft_core::executor::{ProcessExecuter, ProcessExecuterConfig};
use weft_core::{
    CampaignSettings, FileFuzzer, FindingStore, FuzzServer, Script, TcpIpcListener, compile,
};

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[clap(short, long, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile a script and print its bytecode and template bytes
    Check { script: PathBuf },

    /// Run a network campaign: launch the target once per mutation and
    /// drive it with the script
    Run {
        script: PathBuf,
        #[clap(short, long, value_parser)]
        config_file: Option<PathBuf>,
        /// Port the target connects back to
        #[clap(short, long)]
        port: Option<u16>,
        /// Target command line, replaces `[target] command`
        #[clap(long, num_args = 1.., allow_hyphen_values = true)]
        target: Vec<String>,
    },

    /// Fuzz a file, or every file in a directory, passed to the target by
    /// path
    Files {
        path: PathBuf,
        #[clap(short, long, value_parser)]
        config_file: Option<PathBuf>,
        #[clap(long, num_args = 1.., allow_hyphen_values = true)]
        target: Vec<String>,
    },
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Check { script } => check(&script),
        Commands::Run {
            script,
            config_file,
            port,
            target,
        } => {
            let mut config = load_config(config_file)?;
            if let Some(port) = port {
                config.listener.port = port;
            }
            if !target.is_empty() {
                config.target.command = target;
            }
            run_campaign(&script, config)
        }
        Commands::Files {
            path,
            config_file,
            target,
        } => {
            let mut config = load_config(config_file)?;
            if !target.is_empty() {
                config.target.command = target;
            }
            fuzz_files(&path, config)
        }
    }
}

fn load_config(config_file: Option<PathBuf>) -> Result<WeftConfig, anyhow::Error> {
    match config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            WeftConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                info!("No config file specified, loading default: {default_config_path:?}");
                WeftConfig::load_from_file(&default_config_path)
            } else {
                info!("No config file specified and 'config.toml' not found, using defaults");
                Ok(WeftConfig::default())
            }
        }
    }
}

fn load_script(path: &Path) -> Result<Script, anyhow::Error> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read script {:?}: {}", path, e))?;
    compile(&source).map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
}

fn check(path: &Path) -> Result<(), anyhow::Error> {
    let script = load_script(path)?;
    print!("{}", script.disassemble());
    for (name, template) in &script.templates {
        let bytes = template
            .generate()
            .map_err(|e| anyhow::anyhow!("Failed to generate template {name}: {e}"))?;
        let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
        println!(
            "template {name} ({} byte(s), {} mutator(s)): {}",
            bytes.len(),
            template.mutators().len(),
            hex.join(" ")
        );
    }
    Ok(())
}

fn executer(config: &WeftConfig) -> Result<ProcessExecuter, anyhow::Error> {
    if config.target.command.is_empty() {
        anyhow::bail!("No target command: set [target] command or pass --target");
    }
    Ok(ProcessExecuter::new(ProcessExecuterConfig {
        command: config.target.command.clone(),
        working_dir: config.target.working_dir.clone(),
    }))
}

fn run_campaign(path: &Path, config: WeftConfig) -> Result<(), anyhow::Error> {
    let script = load_script(path)?;
    let app = executer(&config)?;
    let listener = TcpIpcListener::bind(
        &config.listener.interface,
        config.listener.port,
        config.campaign.io_timeout(),
        config.campaign.byte_order,
    )
    .map_err(|e| {
        anyhow::anyhow!(
            "Failed to listen on {}:{}: {}",
            config.listener.interface,
            config.listener.port,
            e
        )
    })?;
    let store = FindingStore::open(&config.campaign.findings_dir)?;
    info!(
        "Listening on {}:{}, findings go to {:?}",
        config.listener.interface, config.listener.port, config.campaign.findings_dir
    );

    let start_time = Instant::now();
    let mut server = FuzzServer::new(
        Box::new(listener),
        Box::new(app),
        CampaignSettings::from(&config.campaign),
    )
    .with_store(store);
    let report = server.run(&script);

    info!(
        "Campaign finished in {:.2?}: {} execution(s), {} failed launch(es), {} script failure(s), {} finding(s)",
        start_time.elapsed(),
        report.executions,
        report.failed_launches,
        report.script_failures.len(),
        report.findings.len()
    );
    for template in &report.abandoned_templates {
        warn!("Template {template} was abandoned");
    }
    for finding in &report.findings {
        println!(
            "{} {} [{}] {}",
            finding.input_hash, finding.template, finding.mutator_state, finding.description
        );
    }
    Ok(())
}

fn fuzz_files(path: &Path, config: WeftConfig) -> Result<(), anyhow::Error> {
    let app = executer(&config)?;
    let store = FindingStore::open(&config.campaign.findings_dir)?;

    let start_time = Instant::now();
    let mut fuzzer = FileFuzzer::new(Box::new(app), config.files.clone()).with_store(store);
    let report = fuzzer.run_path(path)?;

    info!(
        "File fuzzing finished in {:.2?}: {} file(s), {} execution(s), {} timeout(s), {} finding(s)",
        start_time.elapsed(),
        report.files,
        report.executions,
        report.timeouts,
        report.findings.len()
    );
    for finding in &report.findings {
        println!(
            "{} {} [{}] {}",
            finding.input_hash, finding.template, finding.mutator_state, finding.description
        );
    }
    Ok(())
}
