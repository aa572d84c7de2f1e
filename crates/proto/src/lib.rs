//! The cache session protocol spoken between sandboxed builds and the
//! sandcache server.
//!
//! A session is one Unix-socket connection. It opens with a `Hello` frame
//! that names the build and its phase (`hook` registers a per-build
//! workspace, `build` starts a request loop), then carries line-framed JSON
//! requests and responses correlated by `ID`. A `put` request is followed
//! immediately by a second frame holding its body as a base64 JSON string.
//!
//! [`session::Session`] is the server side of the loop; [`client::CacheClient`]
//! is the in-process client used by the module proxy.

pub mod buildid;
pub mod client;
mod error;
pub mod session;
pub mod wire;

pub use error::{Error, Result};
