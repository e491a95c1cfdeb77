use std::io;
use std::process;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use moss_common::{GpuList, ModelName};
use moss_infer::{launch, snapshot_download, ChatSession, MossRuntime};

#[derive(Parser, Debug)]
#[command(name = "moss-cli", about = "Chat with MOSS in the terminal")]
struct Args {
    /// Checkpoint to run: a hub repository id, also tried as a local path.
    #[arg(
        long = "model_name",
        default_value = "fnlp/moss-moon-003-sft-int4",
        value_parser = ModelName::ALL_IDS
    )]
    model_name: String,
    /// Comma-separated GPU ids; more than one shards the model across them.
    #[arg(long, default_value = "0")]
    gpu: String,
    /// Sampling seed. Random when omitted.
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let model: ModelName = args.model_name.parse()?;
    let seed = args.seed.unwrap_or_else(rand::random);
    tracing::info!(%model, seed, "starting");

    let runtime = launch(model, GpuList::new(args.gpu), snapshot_download, |dir, devices| {
        MossRuntime::load(dir, devices, seed)
    })?;
    let mut session = ChatSession::new(runtime);
    session.run(io::stdin().lock(), &mut io::stdout(), clear_screen)
}

fn clear_screen() {
    let status = if cfg!(windows) {
        process::Command::new("cmd").args(["/C", "cls"]).status()
    } else {
        process::Command::new("clear").status()
    };
    if let Err(err) = status {
        tracing::warn!(%err, "unable to clear the screen");
    }
}
