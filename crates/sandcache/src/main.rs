// The hook and relay protocols write to stdout; logs go to stderr.
#![allow(clippy::print_stdout)]

use sandcache::cli::{self, Mode};
use sandcache::{hook, logging, proxy, relay, server};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = cli::parse();
    logging::init(cli.level.into())?;

    match cli::resolve_mode(&cli)? {
        Mode::Server => server::run_from_env().await,
        Mode::Client => relay::run().await,
        Mode::Hook => hook::run(&cli.args).await,
        Mode::Goproxy => proxy::run_from_env().await,
    }
}
