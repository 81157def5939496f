mod certs;
mod compose;
mod config;
mod container;
mod domain;
mod error;
mod lifecycle;
mod metadata;
mod ports;
mod probe;
mod proxy;
mod runtime;
mod scanner;
mod secrets;

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tabled::Tabled;

use crate::compose::render::{render, RenderContext};
use crate::compose::ComposeFile;
use crate::config::FleetConfig;
use crate::container::DockerRuntime;
use crate::domain::{DeploymentMode, InstanceName, Status};
use crate::lifecycle::{CreateOptions, Lifecycle, Marker, UpdateOptions};
use crate::ports::SocketProbe;
use crate::probe::Prober;
use crate::proxy::ProxyRegistrar;
use crate::scanner::Filter;

#[derive(Parser)]
#[command(name = "flotilla", about = "Manage a fleet of self-hosted container instances")]
struct Cli {
    /// Deployment mode (overrides config file and environment)
    #[arg(long, global = true)]
    mode: Option<DeploymentMode>,
    /// Config file (default: $XDG_CONFIG_HOME/flotilla/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List instances
    Ls {
        /// Regex matched against names and metadata
        pattern: Option<String>,
        /// Show port and version
        #[arg(short, long)]
        long: bool,
        /// Show the latest metadata entry
        #[arg(short, long)]
        metadata: bool,
        /// Show the app image
        #[arg(short, long)]
        image_info: bool,
        /// Only check that the port accepts connections
        #[arg(long)]
        fast: bool,
        #[arg(long, conflicts_with = "offline")]
        online: bool,
        #[arg(long, conflicts_with = "online")]
        offline: bool,
        /// Probe one instance at a time
        #[arg(long)]
        sequential: bool,
    },
    /// Create an instance
    Add {
        name: InstanceName,
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        /// Copy config, secrets and databases from an existing instance
        #[arg(long, value_name = "SOURCE")]
        clone_from: Option<InstanceName>,
        /// No certificate and no proxy route
        #[arg(long)]
        local_only: bool,
        /// Also serve www.<name>
        #[arg(long)]
        www: bool,
        /// Outgoing mail relay host
        #[arg(long, value_name = "HOST")]
        mailserver: Option<String>,
        /// Do not create the regular user account secret
        #[arg(long)]
        no_add_account: bool,
        /// Skip the DNS check
        #[arg(long)]
        force: bool,
        /// Start without asking
        #[arg(long)]
        start: bool,
    },
    /// Remove an instance and everything it owns
    Rm {
        name: InstanceName,
        /// Proceed without the marker file and past erase failures
        #[arg(long)]
        force: bool,
        /// Also release www.<name>
        #[arg(long)]
        www: bool,
    },
    /// Start an instance
    Start {
        name: InstanceName,
        /// Wait until the instance reports its version
        #[arg(long)]
        wait: bool,
    },
    /// Stop an instance
    Stop { name: InstanceName },
    /// Change the app image or tag and roll the instance
    Update {
        name: InstanceName,
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        /// Note recorded in the metadata log
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Delete containers and volumes, keep the directory and routing
    Erase {
        name: InstanceName,
        #[arg(long)]
        force: bool,
    },
    /// Show one instance
    Info { name: InstanceName },
    /// Check host setup
    Doctor,
}

#[tokio::main]
async fn main() -> ExitCode {
    runtime::init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            let code = error::classify(&e).map_or(1, |f| f.exit_code());
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = FleetConfig::load(cli.config.as_deref(), cli.mode)?;
    match cli.command {
        Commands::Ls {
            pattern,
            long,
            metadata,
            image_info,
            fast,
            online,
            offline,
            sequential,
        } => {
            let online = if online {
                Some(true)
            } else if offline {
                Some(false)
            } else {
                None
            };
            let view = ListView {
                long,
                metadata,
                image_info,
            };
            run_ls(&cfg, pattern.as_deref(), online, fast, !sequential, view).await
        }
        Commands::Add {
            name,
            image,
            tag,
            clone_from,
            local_only,
            www,
            mailserver,
            no_add_account,
            force,
            start,
        } => {
            let mut opts = CreateOptions::new(name);
            opts.image = image;
            opts.tag = tag;
            opts.clone_from = clone_from;
            opts.local_only = local_only;
            opts.www = www;
            opts.mail_relay = mailserver;
            opts.add_account = !no_add_account;
            opts.force = force;
            run_add(&cfg, opts, start).await
        }
        Commands::Rm { name, force, www } => run_rm(&cfg, name, force, www).await,
        Commands::Start { name, wait } => {
            let lc = lifecycle(&cfg)?;
            let port = lc.start(&name, wait).await?;
            match port {
                Some(port) => println!("{} {name} (port {port})", "▶".green().bold()),
                None => println!("{} {name}", "▶".green().bold()),
            }
            Ok(())
        }
        Commands::Stop { name } => {
            lifecycle(&cfg)?.stop(&name).await?;
            println!("{} {name}", "■".yellow().bold());
            Ok(())
        }
        Commands::Update {
            name,
            image,
            tag,
            message,
        } => {
            let lc = lifecycle(&cfg)?;
            let report = lc
                .update(&UpdateOptions {
                    name: name.clone(),
                    image,
                    tag,
                    message,
                })
                .await?;
            println!(
                "{} {name} now runs {}",
                "↻".green().bold(),
                report.image.as_deref().unwrap_or("unknown").cyan()
            );
            for service in &report.retired_services {
                println!("  {} service {service}", "-".red());
            }
            for volume in &report.removed_volumes {
                println!("  {} volume {volume}", "-".red());
            }
            Ok(())
        }
        Commands::Erase { name, force } => {
            if !confirm(&format!(
                "This deletes all containers and data volumes of {name}. Type the instance name to continue:"
            ), name.as_str())?
            {
                println!("Aborted.");
                return Ok(());
            }
            lifecycle(&cfg)?.erase(&name, force).await?;
            println!("{} {name} runtime state erased", "-".red().bold());
            Ok(())
        }
        Commands::Info { name } => run_info(&cfg, &name).await,
        Commands::Doctor => run_doctor(&cfg),
    }
}

fn lifecycle(cfg: &FleetConfig) -> anyhow::Result<Lifecycle<'_, DockerRuntime>> {
    let docker = DockerRuntime::new(cfg.deployment_mode, cfg.command_timeout);
    Lifecycle::new(cfg, docker, SocketProbe)
}

fn prompt(question: &str) -> anyhow::Result<String> {
    print!("{question} ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read answer")?;
    Ok(answer.trim().to_string())
}

/// The answer must match `expected` exactly.
fn confirm(question: &str, expected: &str) -> anyhow::Result<bool> {
    Ok(prompt(question)? == expected)
}

struct ListView {
    long: bool,
    metadata: bool,
    image_info: bool,
}

#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
}

#[derive(Tabled)]
struct DetailRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "PORT")]
    port: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "VERSION")]
    version: String,
    #[tabled(rename = "ROUTE")]
    route: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

fn status_cell(status: Status) -> String {
    match status {
        Status::Up => "up".green().to_string(),
        Status::Degraded => "degraded".yellow().to_string(),
        Status::Down => "down".red().to_string(),
    }
}

async fn run_ls(
    cfg: &FleetConfig,
    pattern: Option<&str>,
    online: Option<bool>,
    fast: bool,
    parallel: bool,
    view: ListView,
) -> anyhow::Result<()> {
    runtime::ensure_fleet_root(cfg)?;
    let filter = Filter::new(pattern, online)?;
    let prober = Prober::new(cfg, fast)?;
    let instances = scanner::discover(&cfg.fleet_root, &cfg.config_file_name)?;
    let listings = scanner::list(
        instances,
        &cfg.app_service,
        &cfg.proxy_service,
        &filter,
        &prober,
        parallel,
    )
    .await;

    if listings.is_empty() {
        println!("No instances found.");
        return Ok(());
    }

    use tabled::settings::Style;
    let table = if view.long || view.metadata || view.image_info {
        let routes = ProxyRegistrar::new(cfg).entries().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "proxy routes unavailable");
            Vec::new()
        });
        let rows: Vec<DetailRow> = listings
            .iter()
            .map(|l| {
                let mut detail = Vec::new();
                if view.image_info {
                    detail.push(l.image.clone().unwrap_or_else(|| "-".to_string()));
                }
                if view.metadata {
                    if let Some(last) = l.metadata.last() {
                        detail.push(metadata::split_line(last).1.to_string());
                    }
                }
                DetailRow {
                    name: l.instance.name.as_str().bold().to_string(),
                    port: l.port.map_or_else(|| "-".to_string(), |p| p.to_string()),
                    status: status_cell(l.status),
                    version: l.version.clone().unwrap_or_else(|| "-".to_string()),
                    route: proxy::target_of(&routes, l.instance.name.as_str())
                        .unwrap_or("-")
                        .to_string(),
                    detail: detail.join("  ").dimmed().to_string(),
                }
            })
            .collect();
        tabled::Table::new(&rows).with(Style::blank()).to_string()
    } else {
        let rows: Vec<InstanceRow> = listings
            .iter()
            .map(|l| InstanceRow {
                name: l.instance.name.as_str().bold().to_string(),
                status: status_cell(l.status),
            })
            .collect();
        tabled::Table::new(&rows).with(Style::blank()).to_string()
    };
    println!("{table}");
    Ok(())
}

async fn run_add(cfg: &FleetConfig, opts: CreateOptions, start: bool) -> anyhow::Result<()> {
    let lc = lifecycle(cfg)?;
    let report = lc.create(&opts).await?;
    let name = &opts.name;
    match &opts.clone_from {
        Some(src) => println!(
            "{} {name} cloned from {src} on port {}",
            "+".green().bold(),
            report.port
        ),
        None => println!("{} {name} on port {}", "+".green().bold(), report.port),
    }
    println!("  {}", report.instance.directory.display().to_string().dimmed());
    if report.certificate {
        println!("  certificate requested via {}", cfg.cert_tool);
    }
    if let Some(outcome) = report.proxy {
        if !outcome.reloaded {
            println!(
                "  {} proxy route written to {} but reload failed",
                "!".yellow(),
                cfg.proxy_config.display()
            );
        }
    }

    let start = start || {
        let answer = prompt(&format!("Start {name} now? [y/N]"))?;
        matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes")
    };
    if start {
        let port = lc.start(name, true).await?;
        println!(
            "{} {name} is up{}",
            "▶".green().bold(),
            port.map(|p| format!(" on port {p}")).unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_rm(cfg: &FleetConfig, name: InstanceName, force: bool, www: bool) -> anyhow::Result<()> {
    if !confirm(
        &format!("Removing {name} deletes its containers, volumes, directory and routing. Type the instance name to continue:"),
        name.as_str(),
    )? {
        println!("Aborted.");
        return Ok(());
    }
    if !confirm("Type `remove` to confirm:", "remove")? {
        println!("Aborted.");
        return Ok(());
    }
    let report = lifecycle(cfg)?.remove(&name, force, www).await?;
    println!("{} {name}", "-".red().bold());
    if report.certificate_revoked {
        println!("  certificate released via {}", cfg.cert_tool);
    }
    if let Some(outcome) = report.proxy {
        if outcome.changed && !outcome.reloaded {
            println!("  {} proxy route removed but reload failed", "!".yellow());
        }
    }
    Ok(())
}

async fn run_info(cfg: &FleetConfig, name: &InstanceName) -> anyhow::Result<()> {
    let instance = scanner::find(&cfg.fleet_root, &cfg.config_file_name, name.as_str())?;
    let doc = ComposeFile::load(&instance.config_path())?;
    let port = doc.local_port(&cfg.proxy_service);
    let marker = Marker::read(&instance.marker_path());

    println!("{}", instance.name.as_str().bold());
    println!("  directory  {}", instance.directory.display());
    println!(
        "  managed    {}",
        if instance.is_managed() { "yes".green() } else { "no".red() }
    );
    println!("  mode       {}", cfg.deployment_mode);
    println!("  project    {}", instance.project());
    println!(
        "  port       {}",
        port.map_or_else(|| "-".to_string(), |p| p.to_string())
    );
    println!(
        "  image      {}",
        doc.image_of(&cfg.app_service).unwrap_or("-").cyan()
    );
    if marker.local_only {
        println!("  routing    local only");
    } else if marker.www {
        println!("  routing    {name}, {}", name.www());
    } else {
        println!("  routing    {name}");
    }
    if let Some(port) = port {
        let prober = Prober::new(cfg, false)?;
        let (status, version) = prober.check(port).await;
        match version {
            Some(v) => println!("  status     {} ({v})", status_cell(status)),
            None => println!("  status     {}", status_cell(status)),
        }
    }
    let mut secret_files: Vec<String> = std::fs::read_dir(instance.secrets_dir())
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    secret_files.sort();
    println!(
        "  secrets    {} ({})",
        instance.secrets_dir().display(),
        secret_files.join(", ")
    );
    let log = metadata::read(&instance.metadata_path());
    if !log.is_empty() {
        println!("  metadata");
        for line in log {
            println!("    {}", line.dimmed());
        }
    }
    Ok(())
}

fn run_doctor(cfg: &FleetConfig) -> anyhow::Result<()> {
    println!("{}", "Flotilla Doctor".bold());
    println!();

    let mut issues = 0u32;
    print_check(true, &format!("deployment mode: {}", cfg.deployment_mode));

    // 1. fleet root
    let instances = if cfg.fleet_root.is_dir() {
        let instances = scanner::discover(&cfg.fleet_root, &cfg.config_file_name)?;
        print_check(
            true,
            &format!(
                "fleet root exists ({}), {} instance(s)",
                cfg.fleet_root.display(),
                instances.len()
            ),
        );
        let unmanaged: Vec<String> = instances
            .iter()
            .filter(|i| !i.is_managed())
            .map(|i| i.name.to_string())
            .collect();
        if !unmanaged.is_empty() {
            print_warn(&format!("no marker file: {}", unmanaged.join(", ")));
        }
        instances
    } else {
        print_check(
            false,
            &format!("fleet root missing: {}", cfg.fleet_root.display()),
        );
        issues += 1;
        Vec::new()
    };

    // 2. template renders
    let template_config = cfg.template_dir.join(&cfg.config_file_name);
    match ComposeFile::load(&template_config) {
        Ok(template) => {
            let probe_name = InstanceName::parse("doctor.flotilla.invalid")
                .context("doctor probe name")?;
            let ctx = RenderContext {
                name: &probe_name,
                port: cfg.port_ceiling,
                image: cfg.default_image.as_deref(),
                tag: cfg.default_tag.as_deref(),
                mail_relay: cfg.mail_relay.as_deref(),
                repository: None,
            };
            match render(&template, cfg, &ctx) {
                Ok(_) => print_check(
                    true,
                    &format!("template renders ({})", template_config.display()),
                ),
                Err(e) => {
                    print_check(false, &format!("template does not render: {e:#}"));
                    issues += 1;
                }
            }
        }
        Err(e) => {
            print_check(false, &format!("template unreadable: {e:#}"));
            issues += 1;
        }
    }

    // 3. proxy config
    match ProxyRegistrar::new(cfg).entries() {
        Ok(entries) => {
            print_check(
                true,
                &format!(
                    "proxy managed region found ({}), {} route(s)",
                    cfg.proxy_config.display(),
                    entries.len()
                ),
            );
            let routed: Vec<&str> = entries.iter().map(|e| e.host.as_str()).collect();
            let missing: Vec<String> = instances
                .iter()
                .filter(|i| !Marker::read(&i.marker_path()).local_only)
                .filter(|i| !routed.contains(&i.name.as_str()))
                .map(|i| i.name.to_string())
                .collect();
            if !missing.is_empty() {
                print_warn(&format!("instances without a proxy route: {}", missing.join(", ")));
            }
        }
        Err(e) => {
            print_check(false, &format!("proxy config: {e:#}"));
            issues += 1;
        }
    }

    // 4. external tools
    let mut tools = vec!["docker", cfg.cert_tool.as_str()];
    if let Some(reload) = cfg.proxy_reload_command.first() {
        tools.push(reload.as_str());
    }
    for tool in tools {
        if runtime::which(tool) {
            print_check(true, &format!("{tool} found on PATH"));
        } else {
            print_check(false, &format!("{tool} not found on PATH"));
            issues += 1;
        }
    }

    // 5. port headroom
    let declared = ports::declared_ports(&instances);
    let highest = declared
        .iter()
        .copied()
        .filter(|p| *p > cfg.port_floor)
        .max()
        .unwrap_or(cfg.port_floor);
    let left = cfg.port_ceiling.saturating_sub(highest);
    if left == 0 {
        print_check(false, "no ports left above the highest allocated one");
        issues += 1;
    } else {
        print_check(
            true,
            &format!("{left} port(s) left above {highest} (ceiling {})", cfg.port_ceiling),
        );
    }

    println!();
    if issues == 0 {
        println!("{}", "All checks passed!".green().bold());
    } else {
        println!("{}", format!("{issues} issue(s) found").red().bold());
    }
    Ok(())
}

fn print_check(ok: bool, msg: &str) {
    if ok {
        println!("  {} {msg}", "✓".green());
    } else {
        println!("  {} {msg}", "✗".red());
    }
}

fn print_warn(msg: &str) {
    println!("  {} {msg}", "!".yellow());
}
