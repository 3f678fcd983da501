use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use flotilla::worker::{run_worker, BootstrapArgs};

/// Worker bootstrap: launched over ssh by the master, dials home, runs
/// the job kernel for its assigned rank, and exits.
#[derive(Parser, Debug)]
#[command(name = "flotilla")]
#[command(about = "Flotilla worker process")]
struct Args {
    /// Master hostname to dial back to
    #[arg(long)]
    master_host: String,

    /// Rendezvous port on the master
    #[arg(long)]
    master_port: u16,

    /// Rank assigned to this worker
    #[arg(long)]
    rank: u32,

    /// Total group size including the master
    #[arg(long)]
    size: u32,

    /// Job identifier, echoed back in the handshake
    #[arg(long)]
    job_id: Uuid,

    /// One-shot launch credential
    #[arg(long)]
    nonce: Uuid,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let bootstrap = BootstrapArgs {
        master_host: args.master_host,
        master_port: args.master_port,
        rank: args.rank,
        size: args.size,
        job_id: args.job_id,
        nonce: args.nonce,
    };

    match run_worker(bootstrap).await {
        Ok(()) => {}
        Err(e) => {
            tracing::error!(error = %e, "worker failed");
            std::process::exit(e.exit_code());
        }
    }
}
