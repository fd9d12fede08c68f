use sandkeep_core::observability::{init_logging, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging("sandkeep-cli", LogFormat::Human);

    sandkeep_cli::run().await
}
