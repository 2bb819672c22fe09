//! wt-migrate CLI: operator interface for webtask migration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use webtask_migrate::analysis::{DependencyAnalyzer, WarningKind};
use webtask_migrate::config::{Config, EngineConfig};
use webtask_migrate::config::secrets::ExposeSecret;
use webtask_migrate::deployment::{Deployment, DownloadOptions};
use webtask_migrate::engine::Dispatcher;
use webtask_migrate::model::{Module, WebtaskInfo};
use webtask_migrate::remote::HttpTransport;
use webtask_migrate::telemetry::{TelemetryConfig, init_telemetry};
use webtask_migrate::token::{Token, TokenStore};

#[derive(Parser)]
#[command(name = "wt-migrate", about = "Enumerate, analyze and provision webtasks")]
struct Cli {
    /// Engine tuning file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List webtasks on the deployment
    List {
        /// Restrict to one tenant
        #[arg(long)]
        tenant: Option<String>,
        /// Only enumerate names; skip downloads
        #[arg(long)]
        names_only: bool,
        /// Download and report dependencies and warnings
        #[arg(long)]
        analyze: bool,
    },
    /// Make node modules available on the deployment
    Provision {
        /// Modules as NAME@VERSION
        #[arg(required = true)]
        modules: Vec<String>,
        /// Provision for one tenant
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Delete a webtask
    Delete {
        tenant: String,
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "wt-migrate".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let engine = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let deployment = connect(&config, &engine)?;

    match cli.command {
        Command::List {
            tenant,
            names_only,
            analyze,
        } => cmd_list(&deployment, &engine, tenant, names_only, analyze).await,
        Command::Provision { modules, tenant } => {
            cmd_provision(&deployment, &engine, modules, tenant).await
        }
        Command::Delete { tenant, name } => {
            deployment.delete_webtask(&tenant, &name).await?;
            println!("Deleted: {tenant}/{name}");
            Ok(())
        }
    }
}

fn connect(config: &Config, engine: &EngineConfig) -> anyhow::Result<Deployment> {
    let tokens = Arc::new(TokenStore::new());
    if let Some(master) = &config.master_token {
        tokens.add_token(Token::parse(master.expose_secret())?, None)?;
    }

    let transport = Arc::new(HttpTransport::new(&config.deployment_url)?);
    let dispatcher = Dispatcher::new(transport, engine.dispatch_config(config))?;
    Ok(Deployment::new(tokens, dispatcher))
}

async fn cmd_list(
    deployment: &Deployment,
    engine: &EngineConfig,
    tenant: Option<String>,
    names_only: bool,
    analyze: bool,
) -> anyhow::Result<()> {
    let mut options = deployment.downloader_options();
    options.tenant = tenant;
    options.names_only = names_only;
    options.page_size = engine.download.page_size;
    options.download = DownloadOptions {
        include_cron: analyze,
        ..DownloadOptions::default()
    };
    if analyze {
        options.analyzer = Some(Arc::new(DependencyAnalyzer));
    }

    let downloader = deployment.downloader(options)?;
    downloader.download()?;

    let interrupted = tokio::select! {
        () = downloader.wait() => false,
        _ = tokio::signal::ctrl_c() => {
            downloader.pause()?;
            true
        }
    };

    let mut webtasks = downloader.webtasks();
    webtasks.sort_by(|a, b| (&a.tenant, &a.name).cmp(&(&b.tenant, &b.name)));
    print_webtasks(&webtasks, analyze);
    print_errors(&downloader.errors());
    if interrupted {
        println!("Interrupted: listing paused before completion.");
    }
    Ok(())
}

fn print_webtasks(webtasks: &[WebtaskInfo], analyze: bool) {
    if webtasks.is_empty() {
        println!("No webtasks found.");
        return;
    }

    if analyze {
        println!("{:<24}  {:<32}  {:<5}  WARNINGS", "TENANT", "NAME", "DEPS");
    } else {
        println!("{:<24}  NAME", "TENANT");
    }
    println!("{}", "-".repeat(90));

    for info in webtasks {
        if !analyze {
            println!("{:<24}  {}", info.tenant, info.name);
            continue;
        }
        let (deps, warnings) = match &info.analysis {
            Some(analysis) => (
                analysis.dependencies.len().to_string(),
                warning_labels(&analysis.warnings.iter().map(|w| w.kind).collect::<Vec<_>>()),
            ),
            None => ("-".to_string(), "-".to_string()),
        };
        println!("{:<24}  {:<32}  {:<5}  {}", info.tenant, info.name, deps, warnings);
    }

    println!("\n{} webtask(s)", webtasks.len());
}

fn warning_labels(kinds: &[WarningKind]) -> String {
    if kinds.is_empty() {
        return "-".to_string();
    }
    kinds
        .iter()
        .map(|kind| match kind {
            WarningKind::ActiveCron => "active-cron",
            WarningKind::HostDetected => "host",
            WarningKind::UnknownCompiler => "compiler",
            WarningKind::UrlBased => "url",
        })
        .collect::<Vec<_>>()
        .join(",")
}

async fn cmd_provision(
    deployment: &Deployment,
    engine: &EngineConfig,
    modules: Vec<String>,
    tenant: Option<String>,
) -> anyhow::Result<()> {
    let modules = modules
        .iter()
        .map(|arg| arg.parse::<Module>())
        .collect::<Result<Vec<_>, _>>()?;

    let mut options = deployment.provisioner_options();
    options.tenant = tenant;
    options.batch_limit = engine.provision.batch_limit;
    options.per_item_delay = Duration::from_millis(engine.provision.per_item_delay_ms);

    let provisioner = deployment.provisioner(modules, options)?;
    provisioner.provision()?;

    let interrupted = tokio::select! {
        () = provisioner.wait() => false,
        _ = tokio::signal::ctrl_c() => {
            provisioner.pause()?;
            true
        }
    };

    println!("{:<40}  STATE", "MODULE");
    println!("{}", "-".repeat(60));
    for module in provisioner.available() {
        println!("{:<40}  available", module.to_string());
    }
    for module in provisioner.failed() {
        println!("{:<40}  failed", module.to_string());
    }
    for module in provisioner.still_queued() {
        println!("{:<40}  queued", module.to_string());
    }
    print_errors(&provisioner.errors());
    if interrupted {
        println!("Interrupted: provisioning paused before completion.");
    }
    Ok(())
}

fn print_errors(errors: &[String]) {
    if errors.is_empty() {
        return;
    }
    eprintln!("\n{} error(s):", errors.len());
    for error in errors {
        eprintln!("  {error}");
    }
}
