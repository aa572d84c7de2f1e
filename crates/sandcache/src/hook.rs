//! Builder hook: registers a workspace for an upcoming build and tells
//! the sandbox builder which paths to expose into it.
//!
//! The hook is invoked for every build; it stays silent unless the build
//! recipe opts in by depending on us.

use crate::{paths, relay};
use miette::miette;
use sandcache_proto::buildid;
use sandcache_proto::wire::{Hello, HookResponse, Phase, read_frame, write_frame};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tracing::{debug, warn};

/// Recipes opt in by carrying the hook package in their build inputs.
static OPT_IN_MARKER: LazyLock<regex::bytes::Regex> = LazyLock::new(|| {
    regex::bytes::Regex::new(r#""nativeBuildInputs","[^"]*sandcache-hook"#)
        .expect("marker regex compiles")
});

pub async fn run(args: &[String]) -> miette::Result<()> {
    let Some(recipe) = args.first() else {
        // Not called as a hook properly?
        return Ok(());
    };
    let self_bin =
        std::env::current_exe().map_err(|e| miette!("can't locate own binary: {e}"))?;
    if let Some(directives) = emit(Path::new(recipe), &relay::socket_path(), &self_bin).await? {
        print!("{directives}");
    }
    Ok(())
}

/// Inspect the recipe and, if it opts in, register a build and return the
/// directives to print. `None` means stay silent (unreadable recipe, no
/// marker).
pub async fn emit(
    recipe: &Path,
    socket: &Path,
    self_bin: &Path,
) -> miette::Result<Option<String>> {
    let contents = match std::fs::read(recipe) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(recipe = %recipe.display(), error = %e, "can't open recipe");
            return Ok(None);
        }
    };
    if !OPT_IN_MARKER.is_match(&contents) {
        debug!(recipe = %recipe.display(), "recipe does not depend on the hook");
        return Ok(None);
    }

    let (build_id, build_dir) = register_build(socket).await?;
    Ok(Some(directives(&build_id, &build_dir, self_bin)))
}

/// Register a fresh build id with the server; returns the id and the
/// workspace directory the server created for it.
pub async fn register_build(socket: &Path) -> miette::Result<(String, PathBuf)> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| miette!("connect {}: {e}", socket.display()))?;
    let (read_half, mut write_half) = stream.into_split();

    let build_id = buildid::generate();
    write_frame(
        &mut write_half,
        &Hello {
            build_id: build_id.clone(),
            phase: Phase::Hook,
        },
    )
    .await
    .map_err(|e| miette!("send hello: {e}"))?;

    let mut reader = BufReader::new(read_half);
    let res: HookResponse = read_frame(&mut reader)
        .await
        .map_err(|e| miette!("read hook response: {e}"))?
        .ok_or_else(|| miette!("server closed before responding"))?;
    Ok((build_id, res.build_dir))
}

/// The text protocol consumed by the sandbox builder: the socket
/// directory, the build workspace, and our own binary (as the in-sandbox
/// relay client).
#[must_use]
pub fn directives(build_id: &str, build_dir: &Path, self_bin: &Path) -> String {
    format!(
        "extra-sandbox-paths\n{}\n{}/{}={}\n{}/client={}\n",
        paths::SOCKET_DIR,
        paths::SANDBOX_CACHE_DIR,
        build_id,
        build_dir.display(),
        paths::SANDBOX_CACHE_DIR,
        self_bin.display(),
    )
}
