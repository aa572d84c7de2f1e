//! Fixed paths shared between the host and the sandbox.
//!
//! The sandbox builder bind-mounts `SOCKET_DIR` into the sandbox at the
//! same path, and mounts each build's workspace at
//! `SANDBOX_CACHE_DIR/<buildID>`, so these constants have to be valid on
//! both sides of the boundary.

/// Host directory holding the session socket; exposed into the sandbox
/// unchanged.
pub const SOCKET_DIR: &str = "/run/sandcache";

/// Socket file name under [`SOCKET_DIR`].
pub const SOCKET_FILE: &str = "server.sock";

/// Directory inside the sandbox where per-build workspaces (and the relay
/// client binary) appear.
pub const SANDBOX_CACHE_DIR: &str = "/sandcache";

/// Listen address of the in-sandbox module proxy.
pub const PROXY_LISTEN: &str = "127.0.0.1:18511";
