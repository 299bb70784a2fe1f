use clap::{Parser, Subcommand};
use carchive::snafu::ErrorCompat;

mod commands;

#[derive(Parser)]
#[clap(version = "0.1.0")]
struct Opts {
    /// Directory holding prod.keys / title.keys (defaults to the usual
    /// system locations)
    #[clap(long)]
    keys: Option<std::path::PathBuf>,

    #[clap(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Print header and section information of a content archive
    Info(commands::InfoOpts),
    /// Extract the files of a content archive section
    Extract(commands::ExtractOpts),
    /// Stream a whole content archive to a file, optionally hashing it
    Dump(commands::DumpOpts),
}

fn main() {
    tracing_subscriber::fmt::init();

    let opts = Opts::parse();

    let result = match opts.action {
        Action::Info(action) => commands::info(opts.keys.as_deref(), action),
        Action::Extract(action) => commands::extract(opts.keys.as_deref(), action),
        Action::Dump(action) => commands::dump(opts.keys.as_deref(), action),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        eprintln!("Caused by:");
        for cause in e.iter_chain().skip(1) {
            eprintln!(" - {}", cause);
        }
        std::process::exit(1);
    }
}
