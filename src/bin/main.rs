//! Command-line entry point (spec.md §6 "CLI"):
//! `leech [-m] <source> [<outpath>]`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use leech::conf::Conf;
use leech::engine::Engine;

#[derive(Parser, Debug)]
#[clap(name = "leech", about = "A BitTorrent v1 leeching client")]
struct Args {
    /// Treat `source` as a magnet URI instead of a path to a `.torrent` file.
    #[clap(short = 'm', long)]
    magnet: bool,

    /// A `.torrent` file path, or a magnet URI when `-m` is given.
    source: String,

    /// Directory in which downloaded files are placed.
    #[clap(default_value = ".")]
    outpath: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    // `info` surfaces one line per completed piece via `Progress::piece_done`
    // without the user having to set RUST_LOG themselves.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let source = args.source.clone();

    match run(args).await {
        Ok(()) => {
            eprintln!("leech: downloaded {} successfully", source);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("leech: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> leech::error::Result<()> {
    let conf = Conf::new(args.outpath);
    let engine = Engine::new(conf);

    if args.magnet {
        engine.download_magnet(&args.source).await
    } else {
        let buf = std::fs::read(&args.source)?;
        engine.download_metainfo(&buf).await
    }
}
