use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use sandkeep_core::observability::{init_logging, LogFormat};
use sandkeep_core::protocol::AGENT_SOCKET_PATH;
use sandkeep_runtime::hostd;
use sandkeep_runtime::runtime::{MockRuntime, Runtime};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "sandkeep-hostd", about = "sandkeep privileged executor daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Start the hostd daemon, listening on a Unix domain socket.
    Serve {
        /// Path to the Unix domain socket.
        #[arg(long, default_value = AGENT_SOCKET_PATH)]
        socket: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging("sandkeep-hostd", LogFormat::Json);

    match cli.command {
        Command::Serve { socket } => {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
            // MockRuntime until a real FirecrackerRuntime-backed executor
            // is wired up behind this daemon; the wire protocol and
            // connection lifecycle are what this binary exists to prove out.
            let runtime: Arc<dyn Runtime> = Arc::new(MockRuntime::new());
            rt.block_on(hostd::serve(socket, runtime))
        }
    }
}
