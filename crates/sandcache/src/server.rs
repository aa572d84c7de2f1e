//! The long-lived cache server.
//!
//! The listening socket is inherited from the init system (socket
//! activation), so an idle exit costs nothing: the next connection starts
//! a fresh server against the same socket. Idle exit is also when cleanup
//! happens: build workspaces are removed and the object store swept.

use crate::paths;
use miette::miette;
use sandcache_proto::buildid::BUILD_ID_PREFIX;
use sandcache_proto::session::{
    BoxError, CacheHit, PutRequest, Session, SessionConfig, SessionHandlers,
};
use sandcache_store::DiskStore;
use std::os::fd::FromRawFd as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Exit the server after this much idle time.
const IDLE_TIME: Duration = Duration::from_secs(60 * 60);
/// Delete store files untouched for this long.
const CACHE_TTL: Duration = Duration::from_secs(60 * 24 * 60 * 60);

/// Entry point for server mode: socket-activated listener plus the
/// environment-provided cache root.
pub async fn run_from_env() -> miette::Result<()> {
    let listener = inherited_listener()?;
    let cache_root = std::env::var("CACHE_DIRECTORY")
        .map_err(|_| miette!("CACHE_DIRECTORY is not set (expected from the service manager)"))?;
    run(
        listener,
        PathBuf::from(cache_root),
        PathBuf::from(paths::SANDBOX_CACHE_DIR),
        IDLE_TIME,
        CACHE_TTL,
    )
    .await
}

/// Validate the socket-activation contract and adopt the inherited
/// listener. FD 3 is the first (and only) passed descriptor.
fn inherited_listener() -> miette::Result<UnixListener> {
    let listen_pid = std::env::var("LISTEN_PID")
        .ok()
        .and_then(|v| v.parse::<u32>().ok());
    if listen_pid != Some(std::process::id()) {
        return Err(miette!("socket activation: LISTEN_PID does not match our pid"));
    }
    match std::env::var("LISTEN_FDS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
    {
        Some(1) => {}
        Some(0) | None => return Err(miette!("socket activation: no fds passed")),
        Some(n) => return Err(miette!("socket activation: expected 1 fd, got {n}")),
    }

    // Safety: under the validated LISTEN_FDS contract, fd 3 is a listening
    // socket passed to us and owned by no one else in this process.
    let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(3) };
    std_listener
        .set_nonblocking(true)
        .map_err(|e| miette!("set_nonblocking on inherited socket: {e}"))?;
    UnixListener::from_std(std_listener).map_err(|e| miette!("adopt inherited socket: {e}"))
}

/// Accept sessions until the server has been idle for `idle_time`, then
/// sweep and return. Concurrent sessions keep the deadline pushed out. A
/// sweep races with any new accept; the losing connection just
/// socket-activates a fresh server.
pub async fn run(
    listener: UnixListener,
    cache_root: PathBuf,
    sandbox_cache_dir: PathBuf,
    idle_time: Duration,
    cache_ttl: Duration,
) -> miette::Result<()> {
    let store = Arc::new(
        DiskStore::open(cache_root.join("obj"))
            .map_err(|e| miette!("open object store: {e}"))?,
    );
    info!(cache_root = %cache_root.display(), "cache server ready");

    let (activity_tx, mut activity_rx) = mpsc::channel::<()>(16);
    let mut deadline = Instant::now() + idle_time;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                deadline = Instant::now() + idle_time;
                match accepted {
                    Ok((stream, _addr)) => {
                        let config = SessionConfig {
                            cache_root: cache_root.clone(),
                            sandbox_cache_dir: sandbox_cache_dir.clone(),
                        };
                        let store = Arc::clone(&store);
                        let activity_tx = activity_tx.clone();
                        tokio::spawn(handle_connection(stream, config, store, activity_tx));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = activity_rx.recv() => {
                deadline = Instant::now() + idle_time;
            }
            () = tokio::time::sleep_until(deadline) => break,
        }
    }

    info!(idle = ?idle_time, "idle, sweeping before exit");
    let removed = sweep_workspaces(&cache_root);
    info!(removed, "removed build workspaces");
    store.sweep(cache_ttl);
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    config: SessionConfig,
    store: Arc<DiskStore>,
    activity_tx: mpsc::Sender<()>,
) {
    let session = Session::new(config, store_handlers(store));
    let (read_half, write_half) = stream.into_split();
    if let Err(e) = session.run(read_half, write_half).await {
        warn!(error = %e, "session ended with error");
    }
    let _ = activity_tx.try_send(());
}

/// Wire the disk store into session capabilities. Store I/O is blocking,
/// so each call hops to the blocking pool.
fn store_handlers(store: Arc<DiskStore>) -> SessionHandlers {
    let get_store = Arc::clone(&store);
    SessionHandlers::default()
        .on_get(move |action: String| {
            let store = Arc::clone(&get_store);
            async move {
                tokio::task::spawn_blocking(move || -> Result<Option<CacheHit>, BoxError> {
                    let Some(hit) = store.get(&action)? else {
                        return Ok(None);
                    };
                    if let Err(e) = std::fs::metadata(&hit.path) {
                        if e.kind() == std::io::ErrorKind::NotFound {
                            // The object was evicted out from under its
                            // index; drop the stale index too.
                            store.forget(&action)?;
                            return Ok(None);
                        }
                    }
                    Ok(Some(CacheHit {
                        output_id: hit.object_id,
                        disk_path: hit.path,
                    }))
                })
                .await
                .map_err(|e| -> BoxError { Box::new(e) })?
            }
        })
        .on_put(move |put: PutRequest| {
            let store = Arc::clone(&store);
            async move {
                tokio::task::spawn_blocking(move || -> Result<PathBuf, BoxError> {
                    let size = u64::try_from(put.size).map_err(|_| "negative body size")?;
                    Ok(store.put(
                        &put.action_id,
                        &put.object_id,
                        size,
                        &mut put.body.as_slice(),
                    )?)
                })
                .await
                .map_err(|e| -> BoxError { Box::new(e) })?
            }
        })
        .on_close(|counters| async move {
            info!(%counters, "cache session closed");
            Ok(())
        })
}

/// Remove every per-build workspace under the cache root. Object files
/// they hardlinked stay alive in `obj/` until the TTL sweep catches them.
pub fn sweep_workspaces(cache_root: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(cache_root) else {
        return 0;
    };
    let mut removed = 0usize;
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with(BUILD_ID_PREFIX) {
            continue;
        }
        if std::fs::remove_dir_all(entry.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}
