use std::process::ExitCode;
use std::time::Instant;

use camino::Utf8PathBuf;
use clap::Parser;
use console::style;

use mimesis::{
    Config, DispatchError, Dispatcher, LedgerStore, MimesisError, Options, Resource, Status,
    as_overhead, logging,
};

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
struct Args {
    /// URL or local media file to process.
    resource: String,

    /// Config file. Defaults to conf/mimesis.json when present.
    #[arg(short, long, env = "MIMESIS_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Ledger store directory, overrides the config.
    #[arg(long)]
    store: Option<Utf8PathBuf>,

    /// Backup directory, overrides the config.
    #[arg(long)]
    backup: Option<Utf8PathBuf>,

    /// Print what would run without running or writing anything.
    #[arg(long, conflicts_with = "status")]
    dry_run: bool,

    /// Print the task states of the resource and exit.
    #[arg(long)]
    status: bool,

    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = logging::init(args.verbose) {
        eprintln!("{} {e}", style("warning:").yellow());
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), MimesisError> {
    let config = Config::load_or_default(args.config.as_deref())?;
    let registry = config.registry()?;

    let store = LedgerStore::open(args.store.unwrap_or_else(|| config.store_dir.clone()))?;

    if args.status {
        return match store.find_by_url(&args.resource)? {
            Some((path, ledger)) => {
                println!("{}", style(path).dim());
                print!("{}", Status { registry: &registry, ledger: &ledger });
                Ok(())
            }
            None => Err(DispatchError::MetadataMissing(args.resource).into()),
        };
    }

    let resource = Resource::parse(&args.resource)?;
    let options = Options {
        dry_run: args.dry_run,
        backup_dir: args.backup.or_else(|| config.backup_dir.clone()),
    };

    let dispatcher = Dispatcher::new(registry, store, config.capabilities()?, options);

    let start = Instant::now();
    let report = dispatcher.run(&resource)?;

    print!("{report}");
    if args.dry_run {
        println!("{} {}", style("Dry run, nothing written").yellow(), as_overhead(start));
    } else {
        println!(
            "{} {} completed, {} failed {}",
            style("Pass finished:").green(),
            report.completed(),
            report.failed(),
            as_overhead(start),
        );
    }

    Ok(())
}
