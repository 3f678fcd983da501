use clap::Parser;

use flotilla::kernels::monte_carlo::MonteCarloParams;
use flotilla::kernels::Matrix;
use flotilla::Runtime;

#[derive(Parser, Debug)]
#[command(name = "cluster-demo")]
#[command(about = "Run the bundled kernels on a local flotilla runtime")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Primality-test a number
    Prime {
        #[arg(short, long)]
        n: u64,
    },
    /// Multiply two randomly filled matrices and report a checksum
    Matmul {
        #[arg(short, long, default_value = "64")]
        size: usize,
    },
    /// Estimate the mean of a uniform draw
    Uniform {
        #[arg(short, long, default_value = "1000000")]
        samples: u64,

        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let runtime = Runtime::local();

    match args.command {
        Commands::Prime { n } => {
            let verdict = runtime.is_prime(n).await?;
            match verdict {
                Some(true) => println!("{n} is prime"),
                Some(false) => println!("{n} is not prime"),
                None => println!("job was cancelled"),
            }
        }
        Commands::Matmul { size } => {
            let a = Matrix::from_vec(
                size,
                size,
                (0..size * size).map(|i| ((i * 31 + 7) % 13) as f64).collect(),
            )?;
            let b = Matrix::from_vec(
                size,
                size,
                (0..size * size).map(|i| ((i * 17 + 3) % 11) as f64).collect(),
            )?;
            match runtime.mat_mul(&a, &b).await? {
                Some(c) => {
                    let mut checksum = 0.0;
                    for r in 0..c.rows() {
                        for col in 0..c.cols() {
                            checksum += c.get(r, col);
                        }
                    }
                    println!("{size}x{size} product checksum: {checksum}");
                }
                None => println!("job was cancelled"),
            }
        }
        Commands::Uniform { samples, seed } => {
            let mut params = MonteCarloParams::new(samples);
            if let Some(seed) = seed {
                params = params.with_seed(seed);
            }
            match runtime.monte_carlo(&params, "uniform").await? {
                Some(stats) => {
                    println!("samples:  {}", stats.samples);
                    println!("mean:     {:.6}", stats.mean);
                    println!("variance: {:.6}", stats.variance);
                    println!("stderr:   {:.6}", stats.stderr);
                }
                None => println!("job was cancelled"),
            }
        }
    }

    Ok(())
}
