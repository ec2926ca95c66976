//! `gt`; multi-agent workspace orchestrator.
//!
//! Thin CLI over the rigtown library: rigs, sessions, the shared SQL
//! server, routing, and doctor. Flag parsing stays here; everything with
//! behavior lives in the library.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use rigtown::config::GtConfig;
use rigtown::dolt::{self, health, server::DoltServer};
use rigtown::error::TownError;
use rigtown::rig::add::{add_rig, AddRigOptions};
use rigtown::rig::register::{register_rig, RegisterRigOptions};
use rigtown::session::{self, Mux};
use rigtown::town::RigRegistry;
use rigtown::{doctor, routes, Town};

/// Multi-agent workspace orchestrator
///
/// A town hosts rigs; source repositories with their own agent fleets,
/// bead databases, and worktrees. `gt` materializes the topology, runs
/// the shared SQL server, and manages agent sessions.
#[derive(Parser)]
#[command(name = "gt")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'gt <command> --help' for details on a specific command.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage rigs
    #[command(subcommand)]
    Rig(RigCommands),

    /// Manage agent sessions
    #[command(subcommand)]
    Session(SessionCommands),

    /// Manage the shared SQL server
    #[command(subcommand)]
    Dolt(DoltCommands),

    /// Manage bead routing
    #[command(subcommand)]
    Routes(RoutesCommands),

    /// Check and repair the town
    ///
    /// Composes route, git, workspace, session, and server checks.
    /// Destructive repairs only run with --fix.
    Doctor {
        /// Apply repairs instead of only reporting.
        #[arg(long)]
        fix: bool,
    },
}

#[derive(Subcommand)]
enum RigCommands {
    /// Create a rig from a git URL
    Add(AddArgs),
    /// Adopt an existing rig directory
    Register(RegisterArgs),
    /// List registered rigs
    List,
}

#[derive(Args)]
struct AddArgs {
    /// Rig name (lowercase, underscores)
    name: String,
    /// Git URL to clone
    #[arg(long)]
    git_url: String,
    /// Local repository used to accelerate cloning
    #[arg(long)]
    local_repo: Option<PathBuf>,
    /// Issue prefix override (e.g. "al")
    #[arg(long)]
    prefix: Option<String>,
    /// Default branch override
    #[arg(long)]
    default_branch: Option<String>,
}

#[derive(Args)]
struct RegisterArgs {
    /// Rig directory name under the town root
    name: String,
    /// Git URL (auto-detected from origin when omitted)
    #[arg(long)]
    git_url: Option<String>,
    /// Issue prefix (derived from the name when omitted)
    #[arg(long)]
    prefix: Option<String>,
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Start (or adopt) a polecat's session
    Start {
        /// Rig name
        rig: String,
        /// Polecat name
        name: String,
        /// Bead to hook on start
        #[arg(long)]
        issue: Option<String>,
        /// Explicit work directory
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },
    /// Stop a session (with descendant reaping)
    Stop {
        /// Session id (e.g. gt-alpha-nux)
        session: String,
        /// Send C-c and wait before killing
        #[arg(long)]
        interrupt: bool,
    },
    /// Complete a polecat's work: merge its database branch, stop the
    /// session, and remove the worktree when it is clean
    Complete {
        /// Rig name
        rig: String,
        /// Polecat name
        name: String,
        /// The polecat's database branch
        #[arg(long)]
        branch: String,
        /// Remove the worktree even with uncommitted changes
        #[arg(long)]
        force: bool,
    },
    /// List and classify live sessions
    List,
}

#[derive(Subcommand)]
enum DoltCommands {
    /// Start the SQL server
    Up,
    /// Stop the SQL server
    Down,
    /// Show server status and health
    Status,
    /// Initialize a rig's database
    Init {
        /// Database name (rig name, or "hq")
        name: String,
    },
    /// Migrate embedded databases into the central data directory
    Migrate,
}

#[derive(Subcommand)]
enum RoutesCommands {
    /// Print the route table
    List,
    /// Insert or update a route
    Add {
        /// Prefix including the trailing hyphen (e.g. "al-")
        prefix: String,
        /// Path relative to the town root ("." for town-level)
        path: String,
    },
    /// Remove a route by prefix
    Remove {
        /// Prefix including the trailing hyphen
        prefix: String,
    },
}

fn main() -> Result<()> {
    rigtown::telemetry::init();
    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("cannot read current directory")?;

    match cli.command {
        Commands::Rig(cmd) => run_rig(&town(&cwd)?, cmd),
        Commands::Session(cmd) => run_session(&town(&cwd)?, cmd),
        Commands::Dolt(cmd) => run_dolt(&town(&cwd)?, cmd),
        Commands::Routes(cmd) => run_routes(&town(&cwd)?, cmd),
        Commands::Doctor { fix } => {
            doctor::run(&town(&cwd)?, fix)?;
            Ok(())
        }
    }
}

fn town(cwd: &std::path::Path) -> Result<Town> {
    Ok(Town::find(cwd)?)
}

fn run_rig(town: &Town, cmd: RigCommands) -> Result<()> {
    match cmd {
        RigCommands::Add(args) => {
            let config = add_rig(
                town,
                &AddRigOptions {
                    name: args.name,
                    git_url: args.git_url,
                    local_repo: args.local_repo,
                    prefix: args.prefix,
                    default_branch: args.default_branch,
                },
            )?;
            println!(
                "rig '{}' created (prefix {}-, branch {})",
                config.name, config.beads.prefix, config.default_branch
            );
            Ok(())
        }
        RigCommands::Register(args) => {
            let config = register_rig(
                town,
                &RegisterRigOptions {
                    name: args.name,
                    git_url: args.git_url,
                    prefix: args.prefix,
                },
            )?;
            println!("rig '{}' registered (prefix {}-)", config.name, config.beads.prefix);
            Ok(())
        }
        RigCommands::List => {
            let registry = RigRegistry::load(town)?;
            if registry.rigs.is_empty() {
                println!("no rigs registered");
                return Ok(());
            }
            for (name, entry) in &registry.rigs {
                let dir = town.rig_dir(name);
                let mut notes = Vec::new();
                if !dir.is_dir() {
                    notes.push("directory missing");
                }
                if !dir.join("config.json").is_file() {
                    notes.push("config.json missing");
                }
                if !dolt::database_dir(town, name).join(".dolt").is_dir() {
                    notes.push("database missing");
                }
                let status = if notes.is_empty() {
                    "ok".to_owned()
                } else {
                    notes.join(", ")
                };
                println!("{name}\t{}-\t{}\t{status}", entry.beads.prefix, entry.git_url);
            }
            Ok(())
        }
    }
}

fn run_session(town: &Town, cmd: SessionCommands) -> Result<()> {
    let mux = Mux::default();
    let config = GtConfig::load(town)?;
    match cmd {
        SessionCommands::Start {
            rig,
            name,
            issue,
            work_dir,
        } => {
            let server = DoltServer::new(town.clone(), config.server_config());
            let server_up = server.probe_running().is_some();
            if server_up {
                let (capacity_ok, live) = health::has_connection_capacity(town, &server);
                if !capacity_ok {
                    match live {
                        Some(count) => bail!(
                            "refusing to spawn: {count} active connections (over 80% of limit)"
                        ),
                        None => bail!("refusing to spawn: connection capacity unknown"),
                    }
                }
            }

            let db_branch = dolt::branch::polecat_branch_name(&name)?;
            if server_up {
                let sql = dolt::sql::DoltSql::new(town.dolt_data_dir());
                dolt::branch::create_branch(&sql, &rig, &db_branch, || {
                    health::recover_read_only(town, &server)
                })?;
            }
            let opts = session::StartOptions {
                issue,
                work_dir,
                db_branch: Some(db_branch),
                work_text: None,
                molecule: None,
            };
            match session::start_polecat(
                town,
                &mux,
                &config.agent_profile(),
                &rig,
                &name,
                &opts,
            ) {
                Ok(started) => {
                    println!("session {} started", started.session_id);
                    session::nudge::nudge_witness(
                        &mux,
                        &rig,
                        &format!("polecat {name} is up"),
                    );
                    Ok(())
                }
                Err(TownError::SessionReused { session }) => {
                    println!("session {session} already healthy; reused");
                    Ok(())
                }
                Err(err) => Err(err.into()),
            }
        }
        SessionCommands::Stop { session, interrupt } => {
            session::stop_session(
                town,
                &mux,
                &session,
                session::StopOptions { interrupt },
            )?;
            println!("session {session} stopped");
            Ok(())
        }
        SessionCommands::Complete {
            rig,
            name,
            branch,
            force,
        } => {
            let session_id = session::names::rig_session_id(&rig, &name);
            session::stop_session(
                town,
                &mux,
                &session_id,
                session::StopOptions { interrupt: true },
            )?;

            let sql = dolt::sql::DoltSql::new(town.dolt_data_dir());
            let result = dolt::branch::merge_polecat_branch(&sql, &rig, &branch)?;
            println!("merged {branch}: {result:?}");
            session::nudge::nudge_refinery(
                &mux,
                &rig,
                &format!("polecat {name} completed; branch {branch} merged"),
            );

            let polecat_dir = town.rig_dir(&rig).join("polecats").join(&name);
            if polecat_dir.is_dir() {
                let work_dir = session::start::resolve_work_dir(&polecat_dir, &rig, None);
                let clean = !rigtown::git::Git::in_dir(&work_dir)
                    .has_uncommitted_work()
                    .unwrap_or(true);
                if clean || force {
                    let bare = rigtown::git::Git::bare(town.rig_dir(&rig).join(".repo.git"));
                    bare.worktree_remove(&work_dir, true)?;
                    if polecat_dir.exists() {
                        std::fs::remove_dir_all(&polecat_dir)?;
                    }
                    println!("worktree removed");
                } else {
                    println!("worktree kept: uncommitted work present");
                }
            }
            Ok(())
        }
        SessionCommands::List => {
            let profile = config.agent_profile();
            let mut any = false;
            for session_id in mux.list_sessions() {
                let Some((rig, name)) = session::names::parse_rig_session(&session_id) else {
                    continue;
                };
                any = true;
                let polecat_dir = town.rig_dir(rig).join("polecats").join(name);
                let work_dir = session::start::resolve_work_dir(&polecat_dir, rig, None);
                let state = session::classify(&mux, &session_id, &work_dir, &profile);
                println!("{session_id}\t{state:?}");
            }
            if !any {
                println!("no sessions");
            }
            Ok(())
        }
    }
}

fn run_dolt(town: &Town, cmd: DoltCommands) -> Result<()> {
    let config = GtConfig::load(town)?;
    let server = DoltServer::new(town.clone(), config.server_config());
    match cmd {
        DoltCommands::Up => {
            let pid = server.start()?;
            println!("sql server started (pid {pid})");
            Ok(())
        }
        DoltCommands::Down => {
            server.stop()?;
            println!("sql server stopped");
            Ok(())
        }
        DoltCommands::Status => {
            let state = server.load_state();
            match server.probe_running() {
                Some(pid) => {
                    let reachable = if server.is_reachable() {
                        "reachable"
                    } else {
                        "NOT reachable"
                    };
                    println!("running: pid {pid}, port {}, {reachable}", server.config().port);
                }
                None => println!("not running (last state: running={})", state.running),
            }
            println!("databases: {:?}", dolt::list_databases(town)?);
            let report = health::collect(town, &server)?;
            if let Some(latency) = report.latency {
                println!("latency: {}ms", latency.as_millis());
            }
            if let Some(connections) = report.active_connections {
                println!("connections: {connections}");
            }
            println!("disk: {} bytes", report.disk_usage);
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            Ok(())
        }
        DoltCommands::Init { name } => {
            dolt::init_rig(town, &name)?;
            println!("database '{name}' ready");
            Ok(())
        }
        DoltCommands::Migrate => {
            let migrated = dolt::migrate::migrate_all(town)?;
            if migrated.is_empty() {
                println!("nothing to migrate");
            } else {
                for name in migrated {
                    println!("migrated {name}");
                }
            }
            Ok(())
        }
    }
}

fn run_routes(town: &Town, cmd: RoutesCommands) -> Result<()> {
    match cmd {
        RoutesCommands::List => {
            let routes = routes::load(&town.beads_dir())?;
            if routes.is_empty() {
                println!("no routes");
            }
            for route in routes {
                println!("{}\t{}", route.prefix, route.path);
            }
            let conflicts = routes::find_conflicting_prefixes(&town.beads_dir())?;
            for (prefix, paths) in conflicts {
                println!("CONFLICT {prefix}: {paths:?}");
            }
            Ok(())
        }
        RoutesCommands::Add { prefix, path } => {
            routes::append_to_dir(&town.beads_dir(), routes::Route::new(prefix, path))?;
            Ok(())
        }
        RoutesCommands::Remove { prefix } => {
            routes::remove(town, &prefix)?;
            Ok(())
        }
    }
}
