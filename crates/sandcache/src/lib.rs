//! sandcache: a shared build-cache daemon for hermetic sandboxed builds.
//!
//! One binary, four roles:
//! - `server`: long-lived cache daemon on a socket-activated Unix socket
//! - `client`: in-sandbox relay between the toolchain's stdio and the
//!   server socket
//! - `hook`: builder hook that registers a per-build workspace and tells
//!   the sandbox which paths to expose
//! - `goproxy`: in-sandbox HTTP proxy that caches immutable module
//!   artifacts through the same cache sessions

pub mod cli;
pub mod hook;
pub mod logging;
pub mod paths;
pub mod proxy;
pub mod relay;
pub mod server;
