use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;

use bgeval::nn::network;
use bgeval::{EncodedPosition, Engine, EngineOptions, NetClass, NetworkSet};

const BENCH_POSITIONS: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "bgeval", about = "Backgammon neural network evaluator")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Cmd {
    /// Convert text weights to the binary format
    Convert {
        /// Text weights file to read
        input: PathBuf,
        /// Binary weights file to write
        output: PathBuf,
    },
    /// Measure evaluations per second across the worker pool
    Bench {
        /// Weights file (text or binary)
        weights: PathBuf,
        /// Worker threads
        #[arg(default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
        threads: u16,
        /// Passes over the benchmark positions per worker
        #[arg(default_value_t = 1000)]
        iterations: usize,
    },
}

fn convert(input: &Path, output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let nets = network::load_nets(input)?;
    network::save_binary_nets(output, &nets)?;
    println!("wrote {} nets to {}", nets.len(), output.display());
    Ok(())
}

fn bench(weights: &Path, threads: usize, iterations: usize) -> Result<(), Box<dyn std::error::Error>> {
    let nets = NetworkSet::load(weights)?;
    let mut rng = StdRng::seed_from_u64(0x6267);
    let positions: Arc<[EncodedPosition]> = (0..BENCH_POSITIONS)
        .map(|i| {
            let class = NetClass::ALL[i % NetClass::ALL.len()];
            EncodedPosition::random(&mut rng, class, nets.net(class).inputs())
        })
        .collect();

    let options = EngineOptions {
        threads,
        ..EngineOptions::default()
    };
    let mut engine = Engine::new(nets, options)?;
    let result = engine.calibrate(positions, iterations)?;

    println!(
        "{} evaluations in {:.3}s: {:.0} evaluations/s on {} threads ({} backend)",
        result.evaluations,
        result.elapsed.as_secs_f64(),
        result.per_second,
        engine.scheduler().effective_threads(),
        engine.evaluator().nets().net(NetClass::Contact).backend().name()
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Cmd::Convert { input, output } => convert(&input, &output),
        Cmd::Bench {
            weights,
            threads,
            iterations,
        } => bench(&weights, usize::from(threads), iterations),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_bench_defaults() {
        let cli = Cli::try_parse_from(["bgeval", "bench", "w.bin"]).unwrap();
        assert_eq!(
            cli.command,
            Cmd::Bench {
                weights: PathBuf::from("w.bin"),
                threads: 1,
                iterations: 1000,
            }
        );
    }

    #[test]
    fn test_bench_all_arguments() {
        let cli = Cli::try_parse_from(["bgeval", "bench", "w.bin", "4", "100"]).unwrap();
        assert_eq!(
            cli.command,
            Cmd::Bench {
                weights: PathBuf::from("w.bin"),
                threads: 4,
                iterations: 100,
            }
        );
    }

    #[test]
    fn test_convert() {
        let cli = Cli::try_parse_from(["bgeval", "convert", "a.txt", "b.bin"]).unwrap();
        assert_eq!(
            cli.command,
            Cmd::Convert {
                input: PathBuf::from("a.txt"),
                output: PathBuf::from("b.bin"),
            }
        );
    }

    #[test]
    fn test_extra_argument_rejected() {
        assert!(Cli::try_parse_from(["bgeval", "bench", "w.bin", "4", "100", "junk"]).is_err());
    }

    #[test]
    fn test_bad_numbers_rejected() {
        assert!(Cli::try_parse_from(["bgeval", "bench", "w.bin", "four"]).is_err());
        assert!(Cli::try_parse_from(["bgeval", "bench", "w.bin", "0"]).is_err());
    }

    #[test]
    fn test_help_is_not_an_error() {
        let err = Cli::try_parse_from(["bgeval", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        assert_eq!(err.exit_code(), 0);
    }

    #[test]
    fn test_missing_subcommand_rejected() {
        assert!(Cli::try_parse_from(["bgeval"]).is_err());
    }
}
