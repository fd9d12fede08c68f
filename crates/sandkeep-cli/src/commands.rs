use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sandkeep_control::ControlClient;
use sandkeep_core::{HeatLevel, ResourceSpec, SandboxId, SandboxRequest, TemplateId, TenantId};

use crate::display;
use crate::ui;

#[derive(Parser)]
#[command(name = "sandkeep", version, about = "Submit, inspect, and cancel sandbox runs")]
struct Cli {
    /// Control-plane QUIC address to connect to.
    #[arg(long, global = true, default_value = "127.0.0.1:4433")]
    server: SocketAddr,

    /// TLS server name the control plane's certificate was issued for.
    #[arg(long, global = true, default_value = "localhost")]
    server_name: String,

    /// Output format.
    #[arg(long, short = 'o', global = true, value_enum, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum HeatArg {
    Warm,
    Cold,
}

impl From<HeatArg> for HeatLevel {
    fn from(value: HeatArg) -> Self {
        match value {
            HeatArg::Warm => HeatLevel::Warm,
            HeatArg::Cold => HeatLevel::Cold,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Admit a new sandbox run and have it scheduled onto a node.
    Submit {
        /// Template id to run.
        template: String,
        /// Tenant submitting the request.
        #[arg(long, default_value = "tnt-default")]
        tenant: String,
        /// Command to execute inside the sandbox.
        #[arg(long)]
        command: String,
        /// Arguments passed to the command.
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
        /// Environment variables, KEY=VALUE. Repeatable.
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// CPU share in millicpu.
        #[arg(long, default_value_t = 1000)]
        cpu_millicpu: u32,
        /// Memory in MB.
        #[arg(long, default_value_t = 512)]
        mem_mb: u32,
        /// GPU count.
        #[arg(long, default_value_t = 0)]
        gpu: u32,
        /// Network contract id, or "no-net" for no networking.
        #[arg(long, default_value = "no-net")]
        network_ref: String,
        /// Start warm (snapshot-restored) or cold (full boot).
        #[arg(long, value_enum, default_value = "warm")]
        heat: HeatArg,
    },
    /// Look up the current state of a run.
    Status {
        /// Sandbox id, e.g. sbx-...
        sandbox_id: String,
    },
    /// Cancel a run, pending or already scheduled.
    Cancel {
        /// Sandbox id, e.g. sbx-...
        sandbox_id: String,
    },
}

fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("invalid --env entry (expected KEY=VALUE): {pair}"))?;
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = ControlClient::new().context("failed to create control-plane client")?;

    match cli.command {
        Commands::Submit {
            template,
            tenant,
            command,
            args,
            env,
            cpu_millicpu,
            mem_mb,
            gpu,
            network_ref,
            heat,
        } => {
            let request = SandboxRequest {
                id: SandboxId::new(),
                template_id: TemplateId::from(template),
                tenant_id: TenantId::from(tenant),
                command,
                args,
                env: parse_env(&env)?,
                resources: ResourceSpec {
                    cpu_millicpu,
                    mem_mb,
                    gpu,
                },
                network_ref,
                heat_level: heat.into(),
                retention: Default::default(),
                metadata: BTreeMap::new(),
                created_at: chrono::Utc::now(),
            };
            let sandbox_id = request.id.clone();

            let node_id = client.submit(cli.server, &cli.server_name, request).await?;
            match cli.output {
                OutputFormat::Table => {
                    ui::success(&format!("submitted {sandbox_id} to node {node_id}"));
                }
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({"sandbox_id": sandbox_id.as_str(), "node_id": node_id.as_str()}));
                }
            }
        }

        Commands::Status { sandbox_id } => {
            let id = SandboxId::from(sandbox_id);
            let run = client.status(cli.server, &cli.server_name, id.clone()).await?;
            match run {
                Some(run) => match cli.output {
                    OutputFormat::Table => display::run_table(&run),
                    OutputFormat::Json => display::run_json(&run)?,
                },
                None => {
                    ui::error(&format!("no such run: {id}"));
                    std::process::exit(1);
                }
            }
        }

        Commands::Cancel { sandbox_id } => {
            let id = SandboxId::from(sandbox_id);
            client.cancel(cli.server, &cli.server_name, id.clone()).await?;
            ui::success(&format!("canceled {id}"));
        }
    }

    Ok(())
}
