//! In-sandbox relay: pipes the toolchain's cache-protocol stdio to the
//! server socket, after announcing which build this sandbox belongs to.

use crate::paths;
use miette::miette;
use sandcache_proto::buildid;
use sandcache_proto::wire::{Hello, Phase, write_frame};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt as _;
use tokio::net::UnixStream;
use tracing::warn;

pub async fn run() -> miette::Result<()> {
    let sandbox_dir = Path::new(paths::SANDBOX_CACHE_DIR);
    let build_id = find_build_id(sandbox_dir)
        .ok_or_else(|| miette!("can't find a build id under {}", sandbox_dir.display()))?;
    let socket = Path::new(paths::SOCKET_DIR).join(paths::SOCKET_FILE);
    relay(&socket, &build_id).await
}

/// The sandbox has exactly one workspace mounted; its directory name is
/// the build id.
pub fn find_build_id(sandbox_dir: &Path) -> Option<String> {
    for entry in std::fs::read_dir(sandbox_dir).ok()?.flatten() {
        if !entry.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if buildid::validate(&name) {
            return Some(name);
        }
    }
    None
}

/// Connect, send the build hello, then shuttle bytes until both sides
/// close. Stdin EOF shuts down our write half so the server sees the
/// session end.
pub async fn relay(socket: &Path, build_id: &str) -> miette::Result<()> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| miette!("connect {}: {e}", socket.display()))?;
    let (mut read_half, mut write_half) = stream.into_split();

    write_frame(
        &mut write_half,
        &Hello {
            build_id: build_id.to_string(),
            phase: Phase::Build,
        },
    )
    .await
    .map_err(|e| miette!("send hello: {e}"))?;

    let inbound = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        if let Err(e) = tokio::io::copy(&mut stdin, &mut write_half).await {
            warn!(error = %e, "copy in error");
        }
        let _ = write_half.shutdown().await;
    });
    let outbound = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        if let Err(e) = tokio::io::copy(&mut read_half, &mut stdout).await {
            warn!(error = %e, "copy out error");
        }
        let _ = stdout.shutdown().await;
    });

    let _ = tokio::join!(inbound, outbound);
    Ok(())
}

/// Socket path as seen from inside the sandbox (the socket directory is
/// mounted at its host path).
pub fn socket_path() -> PathBuf {
    Path::new(paths::SOCKET_DIR).join(paths::SOCKET_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_build_id_picks_the_workspace_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("client"), b"binary").unwrap();
        std::fs::create_dir(tmp.path().join("not-a-build-id")).unwrap();
        std::fs::create_dir(tmp.path().join("b-AAAAAAAAAAAAAAAA")).unwrap();

        assert_eq!(
            find_build_id(tmp.path()).as_deref(),
            Some("b-AAAAAAAAAAAAAAAA")
        );
    }

    #[test]
    fn find_build_id_empty_dir() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(find_build_id(tmp.path()).is_none());
        assert!(find_build_id(&tmp.path().join("missing")).is_none());
    }
}
