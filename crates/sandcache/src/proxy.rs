//! In-sandbox module proxy.
//!
//! Fronts the configured upstream module proxies and caches their
//! immutable artifacts (`.mod` / `.zip`) in the shared store, through the
//! same cache session the compiler uses. A cached object bundles the HTTP
//! response headers and body in one file: a fixed-size JSON prefix padded
//! with newlines, then the body. That shape streams in one pass on both
//! the write path (tee to cache and client simultaneously) and the read
//! path (decode prefix, stream the rest).

use crate::{paths, relay};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt as _;
use miette::miette;
use rand::RngCore as _;
use sandcache_proto::client::CacheClient;
use sandcache_proto::wire::{Hello, Phase, write_frame};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, UnixStream};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// Size of the JSON header prefix in every cached object.
pub const HEADER_PREFIX_SIZE: usize = 4096;
/// Length of proxy action ids and object ids.
const PROXY_CACHE_KEY_BYTES: usize = 24;

/// Hop-specific headers that must not reach our clients.
const SKIP_RETURN_HEADERS: [&str; 3] =
    ["alt-svc", "content-transfer-encoding", "transfer-encoding"];

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// HTTP headers as stored in the cached object's prefix.
type HeaderFields = BTreeMap<String, Vec<String>>;

pub struct ModuleProxy {
    cache: CacheClient,
    upstreams: Vec<String>,
    http: reqwest::Client,
}

/// Entry point for goproxy mode: upstreams from `GOPROXY`, cache session
/// over the sandbox socket, HTTP on the fixed listen address.
pub async fn run_from_env() -> miette::Result<()> {
    let upstreams = parse_upstreams(&std::env::var("GOPROXY").unwrap_or_default());
    if upstreams.is_empty() {
        warn!("no http(s) upstreams in GOPROXY; everything will 404");
    }
    let sandbox_dir = Path::new(paths::SANDBOX_CACHE_DIR);
    let build_id = relay::find_build_id(sandbox_dir)
        .ok_or_else(|| miette!("can't find a build id under {}", sandbox_dir.display()))?;
    let cache = connect_cache(&relay::socket_path(), &build_id).await?;

    let listener = TcpListener::bind(paths::PROXY_LISTEN)
        .await
        .map_err(|e| miette!("bind {}: {e}", paths::PROXY_LISTEN))?;
    info!(
        listen = paths::PROXY_LISTEN,
        upstreams = upstreams.len(),
        "module proxy ready"
    );
    serve(listener, ModuleProxy::new(cache, upstreams)).await
}

/// Open a build-phase cache session for the proxy's own use.
pub async fn connect_cache(socket: &Path, build_id: &str) -> miette::Result<CacheClient> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| miette!("connect {}: {e}", socket.display()))?;
    let (read_half, mut write_half) = stream.into_split();
    write_frame(
        &mut write_half,
        &Hello {
            build_id: build_id.to_string(),
            phase: Phase::Build,
        },
    )
    .await
    .map_err(|e| miette!("send hello: {e}"))?;
    Ok(CacheClient::new(read_half, write_half))
}

pub async fn serve(listener: TcpListener, proxy: ModuleProxy) -> miette::Result<()> {
    let app = Router::new().fallback(handle).with_state(Arc::new(proxy));
    axum::serve(listener, app)
        .await
        .map_err(|e| miette!("proxy server: {e}"))
}

async fn handle(
    State(proxy): State<Arc<ModuleProxy>>,
    req: axum::extract::Request,
) -> Response {
    proxy.serve_path(req.uri().path()).await
}

/// Cache key for a request path, or `None` for paths that are not
/// immutable and must not be cached.
pub fn cache_key(path: &str) -> Option<Vec<u8>> {
    if !(path.ends_with(".mod") || path.ends_with(".zip")) {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(b"gomodproxy v1\n");
    hasher.update(format!("path={path}\n"));
    hasher.update(format!("headerPrefixSize={HEADER_PREFIX_SIZE}\n"));
    Some(hasher.finalize()[..PROXY_CACHE_KEY_BYTES].to_vec())
}

impl ModuleProxy {
    #[must_use]
    pub fn new(cache: CacheClient, upstreams: Vec<String>) -> Self {
        Self {
            cache,
            upstreams,
            http: reqwest::Client::new(),
        }
    }

    pub async fn serve_path(&self, path: &str) -> Response {
        let action_id = cache_key(path);
        if let Some(action) = &action_id {
            match self.replay_from_cache(action).await {
                Ok(response) => {
                    debug!(path, "cache hit");
                    return response;
                }
                Err(e) => debug!(path, error = %e, "cache miss"),
            }
        }
        self.fetch_from_upstreams(path, action_id).await
    }

    /// Serve a cached object: decode the header prefix, verify sizes,
    /// stream the remainder as the body. Any failure reads as a miss and
    /// the caller falls through to the upstreams.
    async fn replay_from_cache(&self, action: &[u8]) -> Result<Response, BoxError> {
        let res = self.cache.get(action).await?;
        if !res.err.is_empty() {
            return Err(res.err.into());
        }
        if res.miss {
            return Err("cache miss".into());
        }
        if res.disk_path.is_empty() {
            return Err("missing disk path".into());
        }

        let mut file = tokio::fs::File::open(&res.disk_path).await?;
        let mut prefix = vec![0u8; HEADER_PREFIX_SIZE];
        file.read_exact(&mut prefix).await?;
        // The prefix is padded with trailing newlines, which the JSON
        // parser accepts as whitespace.
        let mut headers: HeaderFields = serde_json::from_slice(&prefix)?;

        let disk_size = file.metadata().await?.len() as i64;
        if res.size != disk_size {
            return Err(
                format!("mismatched cache size and disk size: {} != {disk_size}", res.size).into(),
            );
        }
        let body_len = res.size - HEADER_PREFIX_SIZE as i64;
        match content_length_of(&headers) {
            Some(cl) if cl == body_len => {}
            Some(cl) => {
                return Err(
                    format!("cache had wrong Content-Length header: {cl} != {body_len}").into(),
                );
            }
            // This should be there, but if not fill it in.
            None => set_content_length(&mut headers, res.size),
        }

        let builder = apply_headers(Response::builder().status(StatusCode::OK), &headers);
        builder
            .body(Body::from_stream(ReaderStream::new(file)))
            .map_err(Into::into)
    }

    async fn fetch_from_upstreams(&self, path: &str, action_id: Option<Vec<u8>>) -> Response {
        let last = self.upstreams.len().checked_sub(1);
        for (i, upstream) in self.upstreams.iter().enumerate() {
            let is_last = Some(i) == last;
            let url = format!("{upstream}{path}");
            let res = match self.http.get(&url).send().await {
                Ok(res) => res,
                Err(e) => {
                    if is_last {
                        warn!(url = %url, error = %e, "http error on last upstream");
                        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                            .into_response();
                    }
                    warn!(url = %url, error = %e, "http error, trying next upstream");
                    continue;
                }
            };
            if res.status() != reqwest::StatusCode::OK {
                if is_last {
                    warn!(url = %url, status = %res.status(), "http status on last upstream, passing through");
                    return stream_through(res);
                }
                warn!(url = %url, status = %res.status(), "http status, trying next upstream");
                continue;
            }
            return match action_id {
                Some(action) => self.cache_and_stream(action, res).await,
                None => stream_through(res),
            };
        }
        (StatusCode::NOT_FOUND, "no upstreams").into_response()
    }

    /// Populate the cache while streaming the body through to the
    /// client. Preconditions that fail here just downgrade to an uncached
    /// pass-through; failures after the tee starts are only logged, since
    /// the client response is already in flight.
    async fn cache_and_stream(&self, action: Vec<u8>, res: reqwest::Response) -> Response {
        let Some(content_length) = res.content_length() else {
            debug!("no content length on upstream response, passing through uncached");
            return stream_through(res);
        };
        let headers = header_fields(res.headers());
        let Some(prefix) = encode_header_prefix(&headers) else {
            debug!("headers too big for the prefix, passing through uncached");
            return stream_through(res);
        };

        // Streaming needs the object id before any body bytes exist, so
        // it can't be a content hash. A random token works: nothing but
        // our own index ever references it.
        let mut object_id = [0u8; PROXY_CACHE_KEY_BYTES];
        rand::rng().fill_bytes(&mut object_id);

        let size = HEADER_PREFIX_SIZE as i64 + content_length as i64;
        let (cache_w, cache_r) = tokio::io::duplex(64 * 1024);
        let cache = self.cache.clone();
        let action_hex = hex::encode(&action);
        tokio::spawn(async move {
            let mut body = std::io::Cursor::new(prefix).chain(cache_r);
            match cache.put(&action, &object_id, size, &mut body).await {
                Ok(res) if res.err.is_empty() => debug!(action = %action_hex, "module cached"),
                Ok(res) => warn!(action = %action_hex, err = %res.err, "cache put rejected"),
                Err(e) => warn!(action = %action_hex, error = %e, "cache put failed"),
            }
        });

        let builder = apply_headers(Response::builder().status(StatusCode::OK), &headers);
        match builder.body(Body::from_stream(tee_body(res, cache_w))) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "failed to build response");
                (StatusCode::INTERNAL_SERVER_ERROR, "bad upstream headers").into_response()
            }
        }
    }
}

/// Forward the upstream body to the client, copying every chunk into the
/// cache writer on the way past. If the cache side stalls or dies the
/// client keeps streaming; if the upstream dies the cache writer is
/// dropped, which fails the put with a short body.
fn tee_body(
    res: reqwest::Response,
    cache_w: tokio::io::DuplexStream,
) -> impl futures::Stream<Item = reqwest::Result<Bytes>> + Send {
    futures::stream::unfold(
        (res.bytes_stream(), Some(cache_w)),
        |(mut body, mut cache_w)| async move {
            match body.next().await {
                Some(Ok(chunk)) => {
                    if let Some(w) = cache_w.as_mut() {
                        if w.write_all(&chunk).await.is_err() {
                            cache_w = None;
                        }
                    }
                    Some((Ok(chunk), (body, cache_w)))
                }
                Some(Err(e)) => Some((Err(e), (body, None))),
                None => {
                    if let Some(mut w) = cache_w.take() {
                        let _ = w.shutdown().await;
                    }
                    None
                }
            }
        },
    )
}

/// Copy an upstream response through untouched (modulo the skip list).
fn stream_through(res: reqwest::Response) -> Response {
    let status = res.status().as_u16();
    let headers = header_fields(res.headers());
    let builder = apply_headers(Response::builder().status(status), &headers);
    match builder.body(Body::from_stream(res.bytes_stream())) {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "failed to build pass-through response");
            (StatusCode::INTERNAL_SERVER_ERROR, "bad upstream response").into_response()
        }
    }
}

fn header_fields(headers: &reqwest::header::HeaderMap) -> HeaderFields {
    let mut map = HeaderFields::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

/// JSON-encode headers into the fixed-size prefix, padding with
/// newlines. `None` if they don't fit (the object is then not cached).
fn encode_header_prefix(headers: &HeaderFields) -> Option<Vec<u8>> {
    let mut buf = serde_json::to_vec(headers).ok()?;
    buf.push(b'\n');
    if buf.len() > HEADER_PREFIX_SIZE {
        return None;
    }
    buf.resize(HEADER_PREFIX_SIZE, b'\n');
    Some(buf)
}

fn apply_headers(
    mut builder: axum::http::response::Builder,
    headers: &HeaderFields,
) -> axum::http::response::Builder {
    for (name, values) in headers {
        if SKIP_RETURN_HEADERS
            .iter()
            .any(|skip| name.eq_ignore_ascii_case(skip))
        {
            continue;
        }
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    builder
}

fn content_length_of(headers: &HeaderFields) -> Option<i64> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, values)| values.first())
        .and_then(|value| value.parse().ok())
}

fn set_content_length(headers: &mut HeaderFields, len: i64) {
    headers.retain(|name, _| !name.eq_ignore_ascii_case("content-length"));
    headers.insert("Content-Length".to_string(), vec![len.to_string()]);
}

/// Keep the http(s) upstreams from a comma-separated `GOPROXY` value;
/// other entries (`off`, `direct`, ...) are silently ignored.
pub fn parse_upstreams(goproxy: &str) -> Vec<String> {
    goproxy
        .split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            let url = reqwest::Url::parse(entry).ok()?;
            matches!(url.scheme(), "http" | "https")
                .then(|| entry.trim_end_matches('/').to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_only_for_immutable_paths() {
        let modkey = cache_key("/example.com/foo/@v/v1.2.3.mod").unwrap();
        let zipkey = cache_key("/example.com/foo/@v/v1.2.3.zip").unwrap();
        assert_eq!(modkey.len(), PROXY_CACHE_KEY_BYTES);
        assert_ne!(modkey, zipkey);
        assert_eq!(modkey, cache_key("/example.com/foo/@v/v1.2.3.mod").unwrap());

        assert!(cache_key("/example.com/foo/@v/v1.2.3.info").is_none());
        assert!(cache_key("/example.com/foo/@v/list").is_none());
    }

    #[test]
    fn header_prefix_pads_to_fixed_size() {
        let mut headers = HeaderFields::new();
        headers.insert("Content-Length".into(), vec!["42".into()]);
        headers.insert("Content-Type".into(), vec!["text/plain".into()]);

        let prefix = encode_header_prefix(&headers).unwrap();
        assert_eq!(prefix.len(), HEADER_PREFIX_SIZE);
        let decoded: HeaderFields = serde_json::from_slice(&prefix).unwrap();
        assert_eq!(decoded, headers);
    }

    #[test]
    fn oversized_headers_refuse_to_encode() {
        let mut headers = HeaderFields::new();
        headers.insert("X-Big".into(), vec!["v".repeat(HEADER_PREFIX_SIZE)]);
        assert!(encode_header_prefix(&headers).is_none());
    }

    #[test]
    fn content_length_lookup_is_case_insensitive() {
        let mut headers = HeaderFields::new();
        headers.insert("content-length".into(), vec!["42".into()]);
        assert_eq!(content_length_of(&headers), Some(42));

        set_content_length(&mut headers, 99);
        assert_eq!(content_length_of(&headers), Some(99));
        assert_eq!(headers.len(), 1, "backfill replaces, never duplicates");
    }

    #[test]
    fn unparseable_content_length_reads_as_absent() {
        let mut headers = HeaderFields::new();
        headers.insert("Content-Length".into(), vec!["many".into()]);
        assert_eq!(content_length_of(&headers), None);
    }

    #[test]
    fn parse_upstreams_keeps_only_http() {
        let upstreams =
            parse_upstreams("https://proxy.golang.org/,direct,off,http://mirror.internal,file:///x");
        assert_eq!(
            upstreams,
            vec!["https://proxy.golang.org", "http://mirror.internal"]
        );
        assert!(parse_upstreams("").is_empty());
        assert!(parse_upstreams("off,direct").is_empty());
    }

    #[test]
    fn skip_headers_never_propagate() {
        let mut headers = HeaderFields::new();
        headers.insert("Transfer-Encoding".into(), vec!["chunked".into()]);
        headers.insert("Alt-Svc".into(), vec!["h3".into()]);
        headers.insert("Content-Type".into(), vec!["application/zip".into()]);

        let response = apply_headers(Response::builder().status(StatusCode::OK), &headers)
            .body(Body::empty())
            .unwrap();
        assert!(response.headers().get("transfer-encoding").is_none());
        assert!(response.headers().get("alt-svc").is_none());
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/zip"
        );
    }
}
