//! Server side of one cache session.
//!
//! The engine owns the framing and the hello handshake; what a `get` or
//! `put` actually does is supplied by the caller as optional capabilities,
//! and only the supplied ones are advertised to the peer. Requests are read
//! sequentially off the wire (a put's body frame strictly adjacent to its
//! header) but handled concurrently, each in its own task; a shared lock
//! over the write half keeps response frames whole.

use crate::buildid;
use crate::error::{Error, Result};
use crate::wire::{
    Cmd, Hello, HookResponse, Phase, Request, Response, read_body_frame, read_frame, write_frame,
};
use futures::FutureExt as _;
use futures::future::BoxFuture;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::warn;

/// Errors from handler capabilities; rendered into the response `Err`
/// field, never fatal to the session.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A successful lookup from the get capability.
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// Object id as lowercase hex
    pub output_id: String,
    /// On-host path of the object file
    pub disk_path: PathBuf,
}

/// Arguments to the put capability.
#[derive(Debug)]
pub struct PutRequest {
    /// Action id as lowercase hex
    pub action_id: String,
    /// Object id as lowercase hex
    pub object_id: String,
    /// Declared body size
    pub size: i64,
    /// The body, already length-checked against `size`
    pub body: Vec<u8>,
}

/// Look something up; `None` is a miss. The action id is lowercase hex.
pub type GetFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, std::result::Result<Option<CacheHit>, BoxError>> + Send + Sync>;

/// Store a body, returning the on-host path it landed at.
pub type PutFn =
    Arc<dyn Fn(PutRequest) -> BoxFuture<'static, std::result::Result<PathBuf, BoxError>> + Send + Sync>;

/// Run at the peer's logical shutdown, with the session counters.
pub type CloseFn =
    Arc<dyn Fn(CounterSnapshot) -> BoxFuture<'static, std::result::Result<(), BoxError>> + Send + Sync>;

/// The optional capabilities of a session. Only supplied ones are
/// advertised; an absent get answers every lookup with a miss, an absent
/// put discards bodies.
#[derive(Clone, Default)]
pub struct SessionHandlers {
    pub get: Option<GetFn>,
    pub put: Option<PutFn>,
    pub close: Option<CloseFn>,
}

impl SessionHandlers {
    /// Supply the get capability.
    #[must_use]
    pub fn on_get<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<CacheHit>, BoxError>> + Send + 'static,
    {
        self.get = Some(Arc::new(move |action| f(action).boxed()));
        self
    }

    /// Supply the put capability.
    #[must_use]
    pub fn on_put<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PutRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<PathBuf, BoxError>> + Send + 'static,
    {
        self.put = Some(Arc::new(move |put| f(put).boxed()));
        self
    }

    /// Supply the close capability.
    #[must_use]
    pub fn on_close<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CounterSnapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.close = Some(Arc::new(move |counters| f(counters).boxed()));
        self
    }

    fn known_commands(&self) -> Vec<Cmd> {
        let mut caps = Vec::new();
        if self.get.is_some() {
            caps.push(Cmd::Get);
        }
        if self.put.is_some() {
            caps.push(Cmd::Put);
        }
        if self.close.is_some() {
            caps.push(Cmd::Close);
        }
        caps
    }
}

/// Session request counters. Atomic, never reset.
#[derive(Debug, Default)]
pub struct SessionCounters {
    gets: AtomicI64,
    get_hits: AtomicI64,
    get_misses: AtomicI64,
    get_errors: AtomicI64,
    puts: AtomicI64,
    put_errors: AtomicI64,
}

impl SessionCounters {
    /// A point-in-time copy of the counters.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            get_hits: self.get_hits.load(Ordering::Relaxed),
            get_misses: self.get_misses.load(Ordering::Relaxed),
            get_errors: self.get_errors.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            put_errors: self.put_errors.load(Ordering::Relaxed),
        }
    }
}

/// Copied counter values, as handed to the close callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub gets: i64,
    pub get_hits: i64,
    pub get_misses: i64,
    pub get_errors: i64,
    pub puts: i64,
    pub put_errors: i64,
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} gets ({} hits, {} misses, {} errors); {} puts ({} errors)",
            self.gets, self.get_hits, self.get_misses, self.get_errors, self.puts, self.put_errors
        )
    }
}

/// Where workspaces live on the host and where the sandbox sees them.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Host directory holding per-build workspaces
    pub cache_root: PathBuf,
    /// Path the sandbox's read-only bind mount presents workspaces under
    pub sandbox_cache_dir: PathBuf,
}

/// One cache session, hello to EOF.
pub struct Session {
    config: SessionConfig,
    handlers: SessionHandlers,
    counters: Arc<SessionCounters>,
}

impl Session {
    #[must_use]
    pub fn new(config: SessionConfig, handlers: SessionHandlers) -> Self {
        Self {
            config,
            handlers,
            counters: Arc::new(SessionCounters::default()),
        }
    }

    /// Drive the session over a byte stream until the peer closes its
    /// write half. Protocol violations return an error; per-request
    /// failures are reported to the peer inline and keep the session
    /// alive.
    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut reader = BufReader::new(reader);
        let writer = Arc::new(Mutex::new(writer));

        let Some(hello) = read_frame::<_, Hello>(&mut reader).await? else {
            return Ok(());
        };
        if !buildid::validate(&hello.build_id) {
            return Err(Error::protocol(format!("bad build id {:?}", hello.build_id)));
        }
        let build_dir = self.config.cache_root.join(&hello.build_id);

        match hello.phase {
            Phase::Hook => {
                tokio::fs::create_dir_all(&build_dir)
                    .await
                    .map_err(|e| Error::io(e, "create build dir"))?;
                let mut w = writer.lock().await;
                write_frame(&mut *w, &HookResponse { build_dir }).await?;
                // The hook only needs the directory name; close after the
                // single response.
                return Ok(());
            }
            Phase::Build => {
                if tokio::fs::metadata(&build_dir).await.is_err() {
                    return Err(Error::protocol(format!(
                        "unknown build id {}, register with hook first",
                        hello.build_id
                    )));
                }
            }
        }

        {
            let caps = Response {
                known_commands: Some(self.handlers.known_commands()),
                ..Default::default()
            };
            let mut w = writer.lock().await;
            write_frame(&mut *w, &caps).await?;
        }

        let ctx = Arc::new(HandlerCtx {
            handlers: self.handlers,
            counters: Arc::clone(&self.counters),
            build_dir,
            sandbox_build_dir: self.config.sandbox_cache_dir.join(&hello.build_id),
        });

        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            let Some(req) = read_frame::<_, Request>(&mut reader).await? else {
                break;
            };

            // A put's body frame must be consumed before any other frame
            // is parsed, or the stream loses alignment.
            let body = if req.command == Cmd::Put && req.body_size > 0 {
                let Some(body) = read_body_frame(&mut reader).await? else {
                    return Err(Error::protocol("eof while reading put body"));
                };
                if body.len() as i64 != req.body_size {
                    return Err(Error::protocol(format!(
                        "only got {} bytes of declared {}",
                        body.len(),
                        req.body_size
                    )));
                }
                body
            } else {
                Vec::new()
            };

            let ctx = Arc::clone(&ctx);
            let writer = Arc::clone(&writer);
            tasks.spawn(async move {
                let res = ctx.handle(req, body).await;
                let mut w = writer.lock().await;
                if let Err(e) = write_frame(&mut *w, &res).await {
                    warn!(error = %e, "failed to write response frame");
                }
            });
        }

        // EOF from the peer; let outstanding handlers finish writing.
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

struct HandlerCtx {
    handlers: SessionHandlers,
    counters: Arc<SessionCounters>,
    build_dir: PathBuf,
    sandbox_build_dir: PathBuf,
}

impl HandlerCtx {
    async fn handle(&self, req: Request, body: Vec<u8>) -> Response {
        let mut res = Response {
            id: req.id,
            ..Default::default()
        };
        let result = match req.command {
            Cmd::Close => self.handle_close().await,
            Cmd::Get => self.handle_get(&req, &mut res).await,
            Cmd::Put => self.handle_put(&req, body, &mut res).await,
        };
        match result {
            Ok(()) => {
                if let Err(e) = self.link_to_build(&mut res).await {
                    res.err = e.to_string();
                }
            }
            Err(e) => res.err = e.to_string(),
        }
        res
    }

    async fn handle_close(&self) -> std::result::Result<(), BoxError> {
        match &self.handlers.close {
            Some(close) => close(self.counters.snapshot()).await,
            None => Ok(()),
        }
    }

    async fn handle_get(
        &self,
        req: &Request,
        res: &mut Response,
    ) -> std::result::Result<(), BoxError> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        let result = self.get_inner(req, res).await;
        let counter = match &result {
            Err(_) => &self.counters.get_errors,
            Ok(()) if res.miss => &self.counters.get_misses,
            Ok(()) => &self.counters.get_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    async fn get_inner(
        &self,
        req: &Request,
        res: &mut Response,
    ) -> std::result::Result<(), BoxError> {
        let Some(get) = &self.handlers.get else {
            res.miss = true;
            return Ok(());
        };
        let action = hex::encode(req.action_id.as_deref().unwrap_or_default());
        let Some(hit) = get(action).await? else {
            res.miss = true;
            return Ok(());
        };
        if hit.output_id.is_empty() {
            return Err("no output id".into());
        }
        let output_id =
            hex::decode(&hit.output_id).map_err(|e| format!("invalid output id: {e}"))?;

        let meta = match tokio::fs::metadata(&hit.disk_path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // The object was evicted after the index lookup.
                res.miss = true;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            return Err("not a regular file".into());
        }

        res.output_id = Some(output_id);
        res.size = meta.len() as i64;
        res.time_nanos = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos() as i64);
        res.disk_path = hit.disk_path.to_string_lossy().into_owned();
        Ok(())
    }

    async fn handle_put(
        &self,
        req: &Request,
        body: Vec<u8>,
        res: &mut Response,
    ) -> std::result::Result<(), BoxError> {
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        let action = hex::encode(req.action_id.as_deref().unwrap_or_default());
        let object = hex::encode(req.object_id.as_deref().unwrap_or_default());

        let result = self.put_inner(req, action.clone(), object.clone(), body, res).await;
        if let Err(e) = &result {
            self.counters.put_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                action = %action,
                object = %object,
                size = req.body_size,
                error = %e,
                "put failed"
            );
        }
        result
    }

    async fn put_inner(
        &self,
        req: &Request,
        action_id: String,
        object_id: String,
        body: Vec<u8>,
        res: &mut Response,
    ) -> std::result::Result<(), BoxError> {
        let Some(put) = &self.handlers.put else {
            // Not configured: the body was already consumed off the wire.
            return Ok(());
        };
        let disk_path = put(PutRequest {
            action_id,
            object_id,
            size: req.body_size,
            body,
        })
        .await?;

        let meta = tokio::fs::metadata(&disk_path)
            .await
            .map_err(|e| format!("stat after successful put: {e}"))?;
        if meta.len() as i64 != req.body_size {
            return Err(format!(
                "failed to write file to disk with right size: disk={}; wanted={}",
                meta.len(),
                req.body_size
            )
            .into());
        }
        res.disk_path = disk_path.to_string_lossy().into_owned();
        Ok(())
    }

    /// Hardlink a response's file into the build workspace and rewrite
    /// the path to the one the sandbox will see. The sole mechanism that
    /// exposes host files into the sandbox.
    async fn link_to_build(&self, res: &mut Response) -> std::result::Result<(), BoxError> {
        if res.disk_path.is_empty() {
            return Ok(());
        }
        let disk_path = PathBuf::from(&res.disk_path);
        let base = disk_path
            .file_name()
            .ok_or("disk path has no file name")?
            .to_owned();
        match tokio::fs::hard_link(&disk_path, self.build_dir.join(&base)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        res.disk_path = self
            .sandbox_build_dir
            .join(&base)
            .to_string_lossy()
            .into_owned();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt as _, BufReader, ReadHalf, WriteHalf};

    type Peer = (
        BufReader<ReadHalf<tokio::io::DuplexStream>>,
        WriteHalf<tokio::io::DuplexStream>,
    );

    /// Spawn a session over an in-memory duplex; returns the peer side.
    fn spawn_session(
        config: SessionConfig,
        handlers: SessionHandlers,
    ) -> (Peer, tokio::task::JoinHandle<Result<()>>) {
        let (ours, theirs) = tokio::io::duplex(1 << 20);
        let (server_r, server_w) = tokio::io::split(theirs);
        let handle = tokio::spawn(Session::new(config, handlers).run(server_r, server_w));
        let (peer_r, peer_w) = tokio::io::split(ours);
        ((BufReader::new(peer_r), peer_w), handle)
    }

    fn test_config(root: &std::path::Path) -> SessionConfig {
        SessionConfig {
            cache_root: root.to_path_buf(),
            sandbox_cache_dir: PathBuf::from("/sandcache/build"),
        }
    }

    async fn hello(peer: &mut Peer, build_id: &str, phase: Phase) {
        write_frame(
            &mut peer.1,
            &Hello {
                build_id: build_id.into(),
                phase,
            },
        )
        .await
        .unwrap();
    }

    fn disk_handlers(store: Arc<sandcache_store::DiskStore>) -> SessionHandlers {
        let get_store = Arc::clone(&store);
        SessionHandlers::default()
            .on_get(move |action| {
                let store = Arc::clone(&get_store);
                async move {
                    let hit = store.get(&action)?;
                    Ok(hit.map(|h| CacheHit {
                        output_id: h.object_id,
                        disk_path: h.path,
                    }))
                }
            })
            .on_put(move |put: PutRequest| {
                let store = Arc::clone(&store);
                async move {
                    let path = store.put(
                        &put.action_id,
                        &put.object_id,
                        put.size as u64,
                        &mut put.body.as_slice(),
                    )?;
                    Ok(path)
                }
            })
    }

    #[tokio::test]
    async fn hook_phase_registers_workspace_and_closes() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut peer, handle) = spawn_session(test_config(tmp.path()), SessionHandlers::default());

        hello(&mut peer, "b-AAAAAAAAAAAAAAAA", Phase::Hook).await;
        let res: HookResponse = read_frame(&mut peer.0).await.unwrap().unwrap();
        assert_eq!(res.build_dir, tmp.path().join("b-AAAAAAAAAAAAAAAA"));
        assert!(res.build_dir.is_dir());

        // Connection closes after the single response.
        assert!(read_frame::<_, Response>(&mut peer.0).await.unwrap().is_none());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn build_phase_requires_registered_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut peer, handle) = spawn_session(test_config(tmp.path()), SessionHandlers::default());

        hello(&mut peer, "b-BBBBBBBBBBBBBBBB", Phase::Build).await;
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn invalid_build_id_fails_session() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut peer, handle) = spawn_session(test_config(tmp.path()), SessionHandlers::default());

        hello(&mut peer, "not-a-build-id", Phase::Hook).await;
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn capabilities_reflect_supplied_handlers() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("b-CCCCCCCCCCCCCCCC")).unwrap();
        let handlers = SessionHandlers::default()
            .on_get(|_| async { Ok(None) })
            .on_close(|_| async { Ok(()) });
        let (mut peer, _handle) = spawn_session(test_config(tmp.path()), handlers);

        hello(&mut peer, "b-CCCCCCCCCCCCCCCC", Phase::Build).await;
        let caps: Response = read_frame(&mut peer.0).await.unwrap().unwrap();
        assert_eq!(caps.known_commands, Some(vec![Cmd::Get, Cmd::Close]));
    }

    #[tokio::test]
    async fn unconfigured_get_is_always_miss() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("b-DDDDDDDDDDDDDDDD")).unwrap();
        let (mut peer, _handle) = spawn_session(test_config(tmp.path()), SessionHandlers::default());

        hello(&mut peer, "b-DDDDDDDDDDDDDDDD", Phase::Build).await;
        let _caps: Response = read_frame(&mut peer.0).await.unwrap().unwrap();

        write_frame(
            &mut peer.1,
            &Request {
                id: 1,
                command: Cmd::Get,
                action_id: Some(vec![0xAA]),
                object_id: None,
                body_size: 0,
            },
        )
        .await
        .unwrap();
        let res: Response = read_frame(&mut peer.0).await.unwrap().unwrap();
        assert_eq!(res.id, 1);
        assert!(res.miss);
    }

    #[tokio::test]
    async fn put_then_get_links_workspace_and_rewrites_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let build_id = "b-EEEEEEEEEEEEEEEE";
        std::fs::create_dir(tmp.path().join(build_id)).unwrap();
        let store =
            Arc::new(sandcache_store::DiskStore::open(tmp.path().join("obj")).unwrap());
        let (mut peer, handle) =
            spawn_session(test_config(tmp.path()), disk_handlers(store));

        hello(&mut peer, build_id, Phase::Build).await;
        let _caps: Response = read_frame(&mut peer.0).await.unwrap().unwrap();

        // put
        let body = [0x01u8, 0x02, 0x03];
        write_frame(
            &mut peer.1,
            &Request {
                id: 1,
                command: Cmd::Put,
                action_id: Some(vec![0xAA, 0xAA]),
                object_id: Some(vec![0xBB, 0xBB]),
                body_size: body.len() as i64,
            },
        )
        .await
        .unwrap();
        wire::write_body_frame(&mut peer.1, &mut body.as_slice(), body.len() as u64)
            .await
            .unwrap();
        let put_res: Response = read_frame(&mut peer.0).await.unwrap().unwrap();
        assert_eq!(put_res.id, 1);
        assert!(put_res.err.is_empty(), "unexpected error: {}", put_res.err);
        assert_eq!(
            put_res.disk_path,
            format!("/sandcache/build/{build_id}/o-bbbb")
        );

        // The object got hardlinked into the workspace.
        let ws_link = tmp.path().join(build_id).join("o-bbbb");
        assert_eq!(std::fs::read(&ws_link).unwrap(), body);

        // get it back
        write_frame(
            &mut peer.1,
            &Request {
                id: 2,
                command: Cmd::Get,
                action_id: Some(vec![0xAA, 0xAA]),
                object_id: None,
                body_size: 0,
            },
        )
        .await
        .unwrap();
        let get_res: Response = read_frame(&mut peer.0).await.unwrap().unwrap();
        assert_eq!(get_res.id, 2);
        assert!(!get_res.miss);
        assert_eq!(get_res.output_id.as_deref(), Some(&[0xBB, 0xBB][..]));
        assert_eq!(get_res.size, 3);
        assert!(get_res.time_nanos > 0);
        assert_eq!(
            get_res.disk_path,
            format!("/sandcache/build/{build_id}/o-bbbb")
        );

        peer.1.shutdown().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn get_miss_creates_no_workspace_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let build_id = "b-FFFFFFFFFFFFFFFF";
        std::fs::create_dir(tmp.path().join(build_id)).unwrap();
        let store =
            Arc::new(sandcache_store::DiskStore::open(tmp.path().join("obj")).unwrap());
        let (mut peer, _handle) =
            spawn_session(test_config(tmp.path()), disk_handlers(store));

        hello(&mut peer, build_id, Phase::Build).await;
        let _caps: Response = read_frame(&mut peer.0).await.unwrap().unwrap();

        write_frame(
            &mut peer.1,
            &Request {
                id: 9,
                command: Cmd::Get,
                action_id: Some(vec![0xDE, 0xAD]),
                object_id: None,
                body_size: 0,
            },
        )
        .await
        .unwrap();
        let res: Response = read_frame(&mut peer.0).await.unwrap().unwrap();
        assert!(res.miss);
        assert!(res.disk_path.is_empty());
        assert_eq!(
            std::fs::read_dir(tmp.path().join(build_id)).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn body_size_mismatch_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let build_id = "b-GGGGGGGGGGGGGGGG";
        std::fs::create_dir(tmp.path().join(build_id)).unwrap();
        let store =
            Arc::new(sandcache_store::DiskStore::open(tmp.path().join("obj")).unwrap());
        let (mut peer, handle) =
            spawn_session(test_config(tmp.path()), disk_handlers(store));

        hello(&mut peer, build_id, Phase::Build).await;
        let _caps: Response = read_frame(&mut peer.0).await.unwrap().unwrap();

        write_frame(
            &mut peer.1,
            &Request {
                id: 1,
                command: Cmd::Put,
                action_id: Some(vec![0xAA]),
                object_id: Some(vec![0xBB]),
                body_size: 5,
            },
        )
        .await
        .unwrap();
        // Declared 5 bytes, deliver 3.
        wire::write_body_frame(&mut peer.1, &mut [1u8, 2, 3].as_slice(), 3)
            .await
            .unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn responses_interleave_by_request_id() {
        let tmp = tempfile::tempdir().unwrap();
        let build_id = "b-HHHHHHHHHHHHHHHH";
        std::fs::create_dir(tmp.path().join(build_id)).unwrap();

        // First get stalls; second answers immediately.
        let handlers = SessionHandlers::default().on_get(|action: String| async move {
            if action == "01" {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(None)
        });
        let (mut peer, _handle) = spawn_session(test_config(tmp.path()), handlers);

        hello(&mut peer, build_id, Phase::Build).await;
        let _caps: Response = read_frame(&mut peer.0).await.unwrap().unwrap();

        for (id, action) in [(1, 0x01u8), (2, 0x02)] {
            write_frame(
                &mut peer.1,
                &Request {
                    id,
                    command: Cmd::Get,
                    action_id: Some(vec![action]),
                    object_id: None,
                    body_size: 0,
                },
            )
            .await
            .unwrap();
        }

        let first: Response = read_frame(&mut peer.0).await.unwrap().unwrap();
        let second: Response = read_frame(&mut peer.0).await.unwrap().unwrap();
        assert_eq!(first.id, 2, "fast request should answer first");
        assert_eq!(second.id, 1);
    }

    #[tokio::test]
    async fn close_runs_callback_with_counters() {
        let tmp = tempfile::tempdir().unwrap();
        let build_id = "b-IIIIIIIIIIIIIIII";
        std::fs::create_dir(tmp.path().join(build_id)).unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<CounterSnapshot>();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
        let handlers = SessionHandlers::default()
            .on_get(|_| async { Ok(None) })
            .on_close(move |counters| {
                let tx = Arc::clone(&tx);
                async move {
                    if let Some(tx) = tx.lock().unwrap().take() {
                        let _ = tx.send(counters);
                    }
                    Ok(())
                }
            });
        let (mut peer, _handle) = spawn_session(test_config(tmp.path()), handlers);

        hello(&mut peer, build_id, Phase::Build).await;
        let _caps: Response = read_frame(&mut peer.0).await.unwrap().unwrap();

        write_frame(
            &mut peer.1,
            &Request {
                id: 1,
                command: Cmd::Get,
                action_id: Some(vec![0x01]),
                object_id: None,
                body_size: 0,
            },
        )
        .await
        .unwrap();
        let _res: Response = read_frame(&mut peer.0).await.unwrap().unwrap();

        write_frame(
            &mut peer.1,
            &Request {
                id: 2,
                command: Cmd::Close,
                action_id: None,
                object_id: None,
                body_size: 0,
            },
        )
        .await
        .unwrap();
        let res: Response = read_frame(&mut peer.0).await.unwrap().unwrap();
        assert_eq!(res.id, 2);

        let counters = rx.await.unwrap();
        assert_eq!(counters.gets, 1);
        assert_eq!(counters.get_misses, 1);
    }

    #[tokio::test]
    async fn handler_error_reports_inline_and_session_survives() {
        let tmp = tempfile::tempdir().unwrap();
        let build_id = "b-JJJJJJJJJJJJJJJJ";
        std::fs::create_dir(tmp.path().join(build_id)).unwrap();

        let handlers = SessionHandlers::default().on_get(|action: String| async move {
            if action == "ff" {
                return Err("backend exploded".into());
            }
            Ok(None)
        });
        let (mut peer, _handle) = spawn_session(test_config(tmp.path()), handlers);

        hello(&mut peer, build_id, Phase::Build).await;
        let _caps: Response = read_frame(&mut peer.0).await.unwrap().unwrap();

        write_frame(
            &mut peer.1,
            &Request {
                id: 1,
                command: Cmd::Get,
                action_id: Some(vec![0xFF]),
                object_id: None,
                body_size: 0,
            },
        )
        .await
        .unwrap();
        let res: Response = read_frame(&mut peer.0).await.unwrap().unwrap();
        assert_eq!(res.err, "backend exploded");

        // Session is still alive for further requests.
        write_frame(
            &mut peer.1,
            &Request {
                id: 2,
                command: Cmd::Get,
                action_id: Some(vec![0x00]),
                object_id: None,
                body_size: 0,
            },
        )
        .await
        .unwrap();
        let res: Response = read_frame(&mut peer.0).await.unwrap().unwrap();
        assert_eq!(res.id, 2);
        assert!(res.miss);
    }
}
