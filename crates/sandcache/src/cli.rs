//! Command-line interface.
//!
//! One binary serves four roles; the sandbox builder installs it under
//! different names (or passes `--mode`) to pick one.

use crate::logging::LogLevel;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "sandcache")]
#[command(about = "Shared build-cache daemon for hermetic sandboxed builds")]
#[command(version)]
pub struct Cli {
    /// Which mode to run; "auto" derives it from the program name
    #[arg(long, default_value = "auto")]
    pub mode: String,

    #[arg(
        short = 'l',
        long,
        global = true,
        help = "Set logging level",
        default_value = "warn",
        value_enum
    )]
    pub level: LogLevel,

    /// Mode-specific arguments (the hook receives the build recipe path)
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,
}

/// The four roles of the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Long-lived cache server on the socket-activated listener
    Server,
    /// In-sandbox relay between toolchain stdio and the session socket
    Client,
    /// Builder hook emitting sandbox-path directives
    Hook,
    /// In-sandbox module proxy
    Goproxy,
}

pub fn parse() -> Cli {
    Cli::parse()
}

/// Resolve the requested mode, falling back to the program basename when
/// `--mode` is "auto". An optional `sandcache-` prefix on the basename is
/// accepted so symlinks like `sandcache-hook` dispatch too.
pub fn resolve_mode(cli: &Cli) -> miette::Result<Mode> {
    let name = if cli.mode == "auto" {
        std::env::args()
            .next()
            .map(|argv0| {
                std::path::Path::new(&argv0)
                    .file_name()
                    .map_or_else(|| argv0.clone(), |f| f.to_string_lossy().into_owned())
            })
            .unwrap_or_default()
    } else {
        cli.mode.clone()
    };
    mode_from_name(&name).ok_or_else(|| miette::miette!("unknown mode {name:?}"))
}

fn mode_from_name(name: &str) -> Option<Mode> {
    let name = name.strip_prefix("sandcache-").unwrap_or(name);
    match name {
        "server" => Some(Mode::Server),
        "client" => Some(Mode::Client),
        "hook" => Some(Mode::Hook),
        "goproxy" => Some(Mode::Goproxy),
        _ => None,
    }
}
