use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use futures::StreamExt;
use serde_json::Value;

use agentbox::sandbox::{Secret, TrustLevel, TurnContext, TurnRequest};
use agentbox::{Config, SandboxOrchestrator};

#[derive(Args)]
pub struct EnvArgs {
    #[command(subcommand)]
    pub command: EnvCommands,
}

#[derive(Subcommand)]
pub enum EnvCommands {
    /// List environments and their container status
    List,

    /// Create an environment record (the container starts on first use)
    Create(CreateArgs),

    /// Start the environment's container if it is not running
    Ensure {
        slug: String,
    },

    /// Run one turn and print the event stream as JSON lines
    Run(RunArgs),

    /// Stop and remove the container
    Teardown {
        slug: String,

        /// Also delete the home directory and the record
        #[arg(long)]
        destroy: bool,
    },

    /// Change or clear the display name
    Rename {
        slug: String,

        /// New display name; omit to clear
        name: Option<String>,
    },
}

#[derive(Args)]
pub struct CreateArgs {
    pub slug: String,

    /// Display name
    #[arg(long)]
    pub name: Option<String>,

    /// Private environment (home deleted with the environment)
    #[arg(long)]
    pub private: bool,

    /// Trust level: untrusted, standard or trusted
    #[arg(long, default_value = "standard")]
    pub trust: String,

    /// Memory limit (e.g. 512m, 2g)
    #[arg(long)]
    pub memory: Option<String>,

    /// CPU limit in cores
    #[arg(long)]
    pub cpus: Option<f64>,

    /// Process limit
    #[arg(long)]
    pub pids: Option<u32>,

    /// Turn timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Allow outbound network
    #[arg(long)]
    pub network: bool,
}

#[derive(Args)]
pub struct RunArgs {
    pub slug: String,

    /// User message for the turn
    pub message: String,

    /// Session id passed to the workload
    #[arg(long)]
    pub session: Option<String>,

    /// Model override
    #[arg(long)]
    pub model: Option<String>,

    /// Working directory inside the container
    #[arg(long)]
    pub workdir: Option<String>,

    /// Read the API token from this environment variable
    #[arg(long, value_name = "VAR")]
    pub token_env: Option<String>,

    /// System prompt for the turn
    #[arg(long)]
    pub system_prompt: Option<String>,
}

pub async fn run(args: EnvArgs) -> Result<()> {
    let config = Config::load()?;
    let orchestrator = SandboxOrchestrator::from_config(&config)?;

    match args.command {
        EnvCommands::List => list(&orchestrator).await,
        EnvCommands::Create(create_args) => create(&orchestrator, create_args),
        EnvCommands::Ensure { slug } => {
            let handle = orchestrator.ensure(&slug).await?;
            println!("{} running ({})", handle.name, handle.config_hash.short());
            Ok(())
        }
        EnvCommands::Run(run_args) => run_turn(&orchestrator, run_args).await,
        EnvCommands::Teardown { slug, destroy } => {
            if destroy {
                orchestrator.destroy(&slug).await?;
                println!("Destroyed {}", slug);
            } else {
                orchestrator.teardown(&slug).await?;
                println!("Stopped {}", slug);
            }
            Ok(())
        }
        EnvCommands::Rename { slug, name } => {
            let env = orchestrator.store().rename(&slug, name)?;
            println!("{} is now \"{}\"", env.slug, env.label());
            Ok(())
        }
    }
}

async fn list(orchestrator: &SandboxOrchestrator) -> Result<()> {
    let envs = orchestrator.store().list()?;
    if envs.is_empty() {
        println!("No environments.");
        return Ok(());
    }

    println!(
        "{:<24} {:<20} {:<8} {:>8}  {:<12} STATUS",
        "SLUG", "NAME", "KIND", "SESSIONS", "HASH"
    );
    for env in envs {
        // A failing engine should not hide the records
        let status = match orchestrator.lifecycle().status(&env.slug).await {
            Ok(status) => status.as_str().to_string(),
            Err(e) => format!("unknown ({:?})", e.kind()),
        };
        println!(
            "{:<24} {:<20} {:<8} {:>8}  {:<12} {}",
            env.slug,
            env.display_name.as_deref().unwrap_or("-"),
            if env.shared { "shared" } else { "private" },
            env.sessions.len(),
            env.config_hash.short(),
            status
        );
    }
    Ok(())
}

fn create(orchestrator: &SandboxOrchestrator, args: CreateArgs) -> Result<()> {
    let trust: TrustLevel = args.trust.parse()?;
    let mut profile = orchestrator.default_profile(trust);
    if let Some(memory) = args.memory {
        profile.limits.memory = memory;
    }
    if let Some(cpus) = args.cpus {
        profile.limits.cpus = cpus;
    }
    if let Some(pids) = args.pids {
        profile.limits.pids = pids;
    }
    if let Some(timeout) = args.timeout {
        profile.limits.timeout_secs = timeout;
    }
    if args.network {
        profile = profile.with_capability("network", Value::Bool(true));
    }

    let env = orchestrator
        .store()
        .create(&args.slug, args.name, !args.private, profile)
        .with_context(|| format!("Failed to create environment '{}'", args.slug))?;

    println!("Created {} ({})", env.slug, env.config_hash.short());
    Ok(())
}

async fn run_turn(orchestrator: &SandboxOrchestrator, args: RunArgs) -> Result<()> {
    let mut request = TurnRequest::new(args.message);
    if let Some(var) = args.token_env {
        let token = std::env::var(&var)
            .with_context(|| format!("Environment variable {} is not set", var))?;
        request = request.with_token(Secret::new(token));
    }
    if let Some(prompt) = args.system_prompt {
        request = request.with_system_prompt(prompt);
    }

    let mut context = match args.session {
        Some(id) => TurnContext::for_session(id),
        None => TurnContext::default(),
    };
    context.model = args.model;
    context.workdir = args.workdir;

    let mut events = orchestrator.run(&args.slug, request, context).await?;
    let mut failed = false;
    while let Some(event) = events.next().await {
        if event.error_code().is_some() {
            failed = true;
        }
        println!("{}", serde_json::to_string(&event)?);
    }

    if failed {
        anyhow::bail!("turn ended with an error");
    }
    Ok(())
}
