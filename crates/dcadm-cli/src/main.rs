use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use dcadm_config::Config;
use dcadm_core::api::SdcClients;
use dcadm_core::api::cnapi::RebootPlanAction;
use dcadm_core::catalog::Catalog;
use dcadm_core::inventory::Inventory;
use dcadm_core::reboot;
use dcadm_core::resolve::{self, ResolveOptions};
use dcadm_core::selfupdate::{self, CurrentBuild, SelfUpdateOptions};
use dcadm_core::{changes, executor, health, maint, plan};
use dcadm_types::{Change, HealthFilter, RebootPlanState};

mod progress;

use progress::{CliReporter, confirm};

/// Build stamp shipped next to the installed binary.
const BUILD_STAMP_PATH: &str = "/opt/dcadm/etc/buildstamp";

#[derive(Parser, Debug)]
#[command(name = "dcadm", version)]
#[command(about = "Administer a datacenter fleet: service updates, rolling reboots, maintenance")]
struct Cli {
    /// Path to the config file (default /var/dcadm/dcadm.conf)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the system configuration to derive URLs from
    #[arg(long, global = true)]
    system_config: Option<PathBuf>,

    /// Log at debug instead of warn
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Update services or instances to newer images.
    Update {
        /// Services or instances to update (names, aliases, or uuids)
        targets: Vec<String>,

        /// Update every updatable service
        #[arg(long)]
        all: bool,

        /// Read a JSON change set from a file, or "-" for stdin
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,

        /// Plan and summarize without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,

        /// Only import the images; do not touch services
        #[arg(long)]
        just_images: bool,

        /// Allow updates to the message broker
        #[arg(long)]
        force_rabbitmq: bool,

        /// Keep updates whose image is already running everywhere
        #[arg(long)]
        force_same_image: bool,
    },

    /// Update the dcadm tool itself.
    SelfUpdate {
        #[arg(long)]
        dry_run: bool,

        /// Allow an update across a major version boundary
        #[arg(long)]
        allow_major_update: bool,
    },

    /// Report per-instance health across the fleet.
    CheckHealth {
        /// Restrict to these nodes (hostnames or uuids)
        targets: Vec<String>,
    },

    /// Compare the local configuration against the live registry.
    CheckConfig,

    /// Datacenter maintenance mode.
    DcMaint {
        #[command(subcommand)]
        action: MaintAction,
    },

    /// Rolling reboot plans.
    RebootPlan {
        #[command(subcommand)]
        action: RebootPlanCmd,
    },

    /// Emit shell completions.
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
enum MaintAction {
    Start,
    Stop,
    Status,
}

#[derive(Subcommand, Debug)]
enum RebootPlanCmd {
    /// Create a reboot plan for the selected nodes.
    Create {
        /// Nodes to reboot (hostnames or uuids)
        servers: Vec<String>,

        #[arg(long, default_value_t = 1)]
        concurrency: u32,

        /// Skip nodes already booted into their next platform
        #[arg(long)]
        skip_current: bool,

        /// Run one batch, then stop for inspection
        #[arg(long)]
        single_step: bool,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,

        /// Start the plan immediately
        #[arg(long)]
        run: bool,

        /// Start the plan and watch it
        #[arg(short = 'w', long)]
        watch: bool,
    },
    /// Start a created plan.
    Run { plan: uuid::Uuid },
    /// Watch a plan until it settles.
    Watch { plan: uuid::Uuid },
    /// Show plan state.
    Status { plan: Option<uuid::Uuid> },
    /// Stop a running plan after in-flight reboots complete.
    Stop { plan: uuid::Uuid },
    /// Cancel a plan.
    Cancel { plan: uuid::Uuid },
    /// Poll for a pending plan and execute it (run under the service
    /// manager).
    Execute,
}

/// JSON logs on stderr at warn (debug with `-v`); mutating subcommands
/// also get a rotating trace-level file under `<state>/logs/`.
fn init_logging(verbose: bool, trace_file: Option<(&std::path::Path, &'static str)>) {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let stderr_layer = fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let file_layer = trace_file.map(|(state_dir, command)| {
        let dir = state_dir.join("logs");
        let _ = std::fs::create_dir_all(&dir);
        let appender = tracing_appender::rolling::daily(dir, format!("{command}.log"));
        fmt::layer()
            .json()
            .with_writer(appender)
            .with_filter(LevelFilter::TRACE)
    });

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

/// Name of the trace log for subcommands that mutate state.
fn mutating_command(cmd: &Commands) -> Option<&'static str> {
    match cmd {
        Commands::Update { dry_run: false, .. } => Some("update"),
        Commands::SelfUpdate { dry_run: false, .. } => Some("self-update"),
        Commands::DcMaint {
            action: MaintAction::Start | MaintAction::Stop,
        } => Some("dc-maint"),
        Commands::RebootPlan {
            action:
                RebootPlanCmd::Create { .. }
                | RebootPlanCmd::Run { .. }
                | RebootPlanCmd::Stop { .. }
                | RebootPlanCmd::Cancel { .. }
                | RebootPlanCmd::Execute,
        } => Some("reboot-plan"),
        _ => None,
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref(), cli.system_config.as_deref())?;
    init_logging(
        cli.verbose,
        mutating_command(&cli.cmd).map(|name| (config.state_dir.as_path(), name)),
    );
    let mut reporter = CliReporter;

    match cli.cmd {
        Commands::Update {
            targets,
            all,
            file,
            dry_run,
            yes,
            just_images,
            force_rabbitmq,
            force_same_image,
        } => {
            config.require_urls()?;
            let clients = SdcClients::new(&config)?;
            let catalog = Catalog::new(clients.imgapi.clone(), clients.updates.clone());
            let inventory = Inventory::new(&clients, &config);
            let snapshot = inventory.snapshot()?;

            let requested: Vec<Change> = if let Some(path) = file {
                changes::parse_changes(&read_input(&path)?)?
            } else if all {
                changes::changes_for_all(&snapshot)
            } else if targets.is_empty() {
                bail!("nothing to update: give targets, --all, or --file");
            } else {
                changes::changes_from_targets(&targets, &snapshot)?
            };

            changes::validate(&requested, &snapshot)?;
            let resolved = resolve::resolve_changes(
                &requested,
                &snapshot,
                &catalog,
                &config,
                &ResolveOptions {
                    force_rabbitmq,
                    force_same_image,
                },
            )?;
            let update_plan = plan::build_plan(&snapshot, resolved, just_images);

            if !update_plan.changes.is_empty() && !dry_run && !yes && !confirm("Proceed with the update?")? {
                println!("Aborting.");
                return Ok(());
            }

            executor::execute(
                &update_plan,
                &clients,
                &catalog,
                &config,
                &mut reporter,
                &executor::ExecuteOptions { dry_run },
            )
        }

        Commands::SelfUpdate {
            dry_run,
            allow_major_update,
        } => {
            let clients = SdcClients::new(&config)?;
            let current = CurrentBuild::detect(std::path::Path::new(BUILD_STAMP_PATH))?;
            selfupdate::self_update(
                &clients.updates,
                &config,
                &current,
                &mut reporter,
                &SelfUpdateOptions {
                    allow_major_update,
                    dry_run,
                },
            )
        }

        Commands::CheckHealth { targets } => {
            config.require_urls()?;
            let clients = SdcClients::new(&config)?;
            let filter = health_filter_for(&clients, &config, &targets)?;
            let results = health::check(&clients, &filter)?;
            for r in &results {
                let state = if r.healthy { "healthy" } else { "UNHEALTHY" };
                println!(
                    "{:<16} {:<28} {:<12} {}",
                    r.service,
                    r.instance,
                    r.hostname,
                    state
                );
                for err in &r.health_errors {
                    println!("    {err}");
                }
            }
            if results.iter().any(|r| !r.healthy) {
                bail!("some instances are unhealthy");
            }
            Ok(())
        }

        Commands::CheckConfig => {
            config.require_urls()?;
            let clients = SdcClients::new(&config)?;
            let drift = check_config_drift(&clients, &config)?;
            if drift.is_empty() {
                println!("All good.");
            } else {
                for line in &drift {
                    println!("{line}");
                }
                bail!("{} configuration mismatches", drift.len());
            }
            Ok(())
        }

        Commands::DcMaint { action } => {
            let clients = SdcClients::new(&config)?;
            match action {
                MaintAction::Start => maint::start(&clients, &config, &mut reporter),
                MaintAction::Stop => maint::stop(&clients, &config, &mut reporter),
                MaintAction::Status => {
                    let status = maint::status(&config)?;
                    if status.maintenance {
                        println!(
                            "DC maintenance: on (since {})",
                            status
                                .start_time
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "unknown".to_string())
                        );
                    } else {
                        println!("DC maintenance: off");
                    }
                    Ok(())
                }
            }
        }

        Commands::RebootPlan { action } => {
            config.require_urls()?;
            let clients = SdcClients::new(&config)?;
            run_reboot_plan(action, &clients, &config, &mut reporter)
        }

        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "dcadm", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn read_input(path: &std::path::Path) -> Result<String> {
    if path == std::path::Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read change set from stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read change set {}", path.display()))
    }
}

fn health_filter_for(
    clients: &SdcClients,
    config: &Config,
    targets: &[String],
) -> Result<HealthFilter> {
    if targets.is_empty() {
        return Ok(HealthFilter::default());
    }
    let inventory = Inventory::new(clients, config);
    let nodes = inventory.nodes()?;
    let mut servers = Vec::new();
    for target in targets {
        let node = match target.parse::<uuid::Uuid>() {
            Ok(uuid) => nodes.iter().find(|n| n.uuid == uuid),
            Err(_) => nodes.iter().find(|n| n.hostname == *target),
        };
        let node = node.with_context(|| format!("unknown node: {target:?}"))?;
        servers.push(node.uuid);
    }
    Ok(HealthFilter {
        servers: Some(servers),
        uuids: None,
        kind: None,
    })
}

/// Compare the layered config against the live registry metadata.
fn check_config_drift(clients: &SdcClients, config: &Config) -> Result<Vec<String>> {
    let inventory = Inventory::new(clients, config);
    let snapshot = inventory.snapshot()?;
    let mut drift = Vec::new();

    for (url, name) in [
        (&config.sapi_url, "sapi"),
        (&config.cnapi_url, "cnapi"),
        (&config.vmapi_url, "vmapi"),
        (&config.imgapi_url, "imgapi"),
    ] {
        if snapshot.service_by_name(name).is_none() {
            drift.push(format!(
                "service {name:?} (configured at {url}) is not in the registry"
            ));
        }
    }
    Ok(drift)
}

fn run_reboot_plan(
    action: RebootPlanCmd,
    clients: &SdcClients,
    config: &Config,
    reporter: &mut CliReporter,
) -> Result<()> {
    match action {
        RebootPlanCmd::Create {
            servers,
            concurrency,
            skip_current,
            single_step,
            yes,
            run,
            watch,
        } => {
            if servers.is_empty() {
                bail!("no servers selected");
            }
            let inventory = Inventory::new(clients, config);
            let snapshot = inventory.snapshot()?;

            let mut selected = Vec::new();
            for token in &servers {
                let node = match token.parse::<uuid::Uuid>() {
                    Ok(uuid) => snapshot.node_by_uuid(uuid),
                    Err(_) => snapshot.node_by_hostname(token),
                };
                selected
                    .push(node.with_context(|| format!("unknown node: {token:?}"))?.clone());
            }

            let opts = reboot::CreateOptions {
                concurrency,
                skip_current,
                single_step,
            };
            let preview = reboot::preview(&snapshot, &selected, &opts);
            for warning in &preview.warnings {
                eprintln!("warning: {warning}");
            }
            if preview.entries.is_empty() {
                println!("Nothing to reboot.");
                return Ok(());
            }

            println!(
                "This plan will reboot {} node(s), concurrency {}:",
                preview.entries.len(),
                concurrency
            );
            for entry in &preview.entries {
                let marker = if entry.core { " (core)" } else { "" };
                println!(
                    "  {} {} -> {}{marker}",
                    entry.node.hostname, entry.node.current_platform, entry.node.boot_platform
                );
            }

            if !yes && !confirm("Create this reboot plan?")? {
                println!("Aborting.");
                return Ok(());
            }

            let created = reboot::create(clients, &preview, &opts)?;
            println!("Created reboot plan {}", created.uuid);

            if run || watch {
                clients
                    .cnapi
                    .update_reboot_plan(created.uuid, RebootPlanAction::Run)?;
                println!("Started reboot plan {}", created.uuid);
            }
            if watch {
                watch_plan(clients, created.uuid)?;
            }
            Ok(())
        }

        RebootPlanCmd::Run { plan } => {
            clients.cnapi.update_reboot_plan(plan, RebootPlanAction::Run)?;
            println!("Started reboot plan {plan}");
            Ok(())
        }

        RebootPlanCmd::Watch { plan } => watch_plan(clients, plan),

        RebootPlanCmd::Status { plan } => {
            let plans = match plan {
                Some(uuid) => vec![clients.cnapi.get_reboot_plan(uuid)?],
                None => {
                    let mut all = clients
                        .cnapi
                        .list_reboot_plans(Some(RebootPlanState::Running), true)?;
                    all.extend(
                        clients
                            .cnapi
                            .list_reboot_plans(Some(RebootPlanState::Pending), true)?,
                    );
                    all
                }
            };
            if plans.is_empty() {
                println!("No pending or running reboot plans.");
            }
            for p in &plans {
                print_plan_status(p);
            }
            Ok(())
        }

        RebootPlanCmd::Stop { plan } => {
            clients
                .cnapi
                .update_reboot_plan(plan, RebootPlanAction::Stop)?;
            println!("Stopping reboot plan {plan} (in-flight reboots will finish)");
            Ok(())
        }

        RebootPlanCmd::Cancel { plan } => {
            clients
                .cnapi
                .update_reboot_plan(plan, RebootPlanAction::Cancel)?;
            println!("Canceled reboot plan {plan}");
            Ok(())
        }

        RebootPlanCmd::Execute => {
            let outcome = reboot::runner::run_pending(clients, config, reporter)?;
            tracing::info!(?outcome, "reboot plan execution finished");
            Ok(())
        }
    }
}

fn print_plan_status(plan: &dcadm_types::RebootPlan) {
    let done = plan.reboots.iter().filter(|r| r.is_done()).count();
    println!(
        "{} {} ({}/{} done, concurrency {})",
        plan.uuid,
        plan.state,
        done,
        plan.reboots.len(),
        plan.concurrency
    );
    for r in &plan.reboots {
        let state = if r.operational_at.is_some() {
            "operational"
        } else if r.canceled_at.is_some() {
            "canceled"
        } else if r.started_at.is_some() || r.job_uuid.is_some() {
            "rebooting"
        } else {
            "queued"
        };
        println!("  {:<20} {}", r.server_hostname, state);
    }
}

/// Watch until the plan leaves the pending/running states. The plan runs
/// server-side: interrupting the watch does not stop it.
fn watch_plan(clients: &SdcClients, plan: uuid::Uuid) -> Result<()> {
    println!("Watching reboot plan {plan}; interrupting this watch does not stop the plan.");
    loop {
        let current = clients.cnapi.get_reboot_plan(plan)?;
        print_plan_status(&current);
        match current.state {
            RebootPlanState::Pending | RebootPlanState::Running | RebootPlanState::Created => {
                std::thread::sleep(std::time::Duration::from_secs(5));
            }
            _ => {
                println!("Reboot plan {} is {}.", plan, current.state);
                return Ok(());
            }
        }
    }
}
