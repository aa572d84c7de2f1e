//! Request-multiplexing client of the cache session protocol.
//!
//! The module proxy stores and fetches its own payloads over one session
//! socket. Many callers may be in flight at once: a single lock guards the
//! write half together with the routing table, and a background reader
//! task decodes responses and wakes the caller whose `ID` matches.

use crate::error::{Error, Result};
use crate::wire::{Cmd, Request, Response, read_frame, write_body_frame, write_frame};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{Mutex, oneshot};
use tracing::debug;

struct ClientState {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    next_id: i64,
    inflight: HashMap<i64, oneshot::Sender<Response>>,
    closed: bool,
}

/// Client handle over one established session (hello already sent).
///
/// Cheap to clone; all clones share the connection. Callers block until
/// their response arrives; the peer is local and trusted, so there are
/// no timeouts here.
#[derive(Clone)]
pub struct CacheClient {
    state: Arc<Mutex<ClientState>>,
}

impl CacheClient {
    /// Wrap a connected session stream and start the reader task.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let state = Arc::new(Mutex::new(ClientState {
            writer: Box::new(writer),
            next_id: 0,
            inflight: HashMap::new(),
            closed: false,
        }));
        tokio::spawn(read_loop(BufReader::new(reader), Arc::clone(&state)));
        Self { state }
    }

    /// Look up an action id.
    pub async fn get(&self, action_id: &[u8]) -> Result<Response> {
        let rx = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(Error::ConnectionClosed);
            }
            state.next_id += 1;
            let id = state.next_id;
            let req = Request {
                id,
                command: Cmd::Get,
                action_id: Some(action_id.to_vec()),
                object_id: None,
                body_size: 0,
            };
            let (tx, rx) = oneshot::channel();
            state.inflight.insert(id, tx);
            if let Err(e) = write_frame(&mut state.writer, &req).await {
                state.inflight.remove(&id);
                state.closed = true;
                return Err(e);
            }
            rx
        };
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Store `size` bytes read from `body` under the given ids.
    ///
    /// The request header and the streamed body frame are written under
    /// one lock acquisition: the server parses them strictly adjacently,
    /// so no other request may land between them.
    pub async fn put<R>(
        &self,
        action_id: &[u8],
        object_id: &[u8],
        size: i64,
        body: &mut R,
    ) -> Result<Response>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let rx = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(Error::ConnectionClosed);
            }
            state.next_id += 1;
            let id = state.next_id;
            let req = Request {
                id,
                command: Cmd::Put,
                action_id: Some(action_id.to_vec()),
                object_id: Some(object_id.to_vec()),
                body_size: size,
            };
            let (tx, rx) = oneshot::channel();
            state.inflight.insert(id, tx);
            let written = async {
                write_frame(&mut state.writer, &req).await?;
                if size > 0 {
                    write_body_frame(&mut state.writer, body, size as u64).await?;
                }
                Ok::<_, Error>(())
            }
            .await;
            if let Err(e) = written {
                // A partial frame may be on the wire; the stream is done.
                state.inflight.remove(&id);
                state.closed = true;
                return Err(e);
            }
            rx
        };
        rx.await.map_err(|_| Error::ConnectionClosed)
    }
}

async fn read_loop<R>(mut reader: BufReader<R>, state: Arc<Mutex<ClientState>>)
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        match read_frame::<_, Response>(&mut reader).await {
            Ok(Some(res)) => {
                let mut state = state.lock().await;
                // Unknown ids (including the capabilities frame, which
                // carries none) are dropped.
                if let Some(tx) = state.inflight.remove(&res.id) {
                    let _ = tx.send(res);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "cache client reader stopped");
                break;
            }
        }
    }
    // Dropping the senders fails every waiting caller instead of leaving
    // it parked forever.
    let mut state = state.lock().await;
    state.closed = true;
    state.inflight.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::read_body_frame;
    use tokio::io::{AsyncWriteExt as _, BufReader};

    /// A hand-rolled peer: reads request frames off the duplex and lets
    /// the test decide what to answer and when.
    fn fake_server() -> (
        CacheClient,
        BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    ) {
        let (client_side, server_side) = tokio::io::duplex(1 << 20);
        let (client_r, client_w) = tokio::io::split(client_side);
        let client = CacheClient::new(client_r, client_w);
        let (server_r, server_w) = tokio::io::split(server_side);
        (client, BufReader::new(server_r), server_w)
    }

    #[tokio::test]
    async fn responses_route_by_id_out_of_order() {
        let (client, mut server_r, mut server_w) = fake_server();

        let c1 = client.clone();
        let first = tokio::spawn(async move { c1.get(&[0x01]).await });
        let req1: Request = read_frame(&mut server_r).await.unwrap().unwrap();

        let c2 = client.clone();
        let second = tokio::spawn(async move { c2.get(&[0x02]).await });
        let req2: Request = read_frame(&mut server_r).await.unwrap().unwrap();

        assert_eq!((req1.id, req2.id), (1, 2), "ids allocate monotonically");

        // Answer in reverse order, with a stray unknown id in between.
        for id in [req2.id, 999, req1.id] {
            write_frame(&mut server_w, &Response { id, ..Default::default() })
                .await
                .unwrap();
        }

        assert_eq!(second.await.unwrap().unwrap().id, 2);
        assert_eq!(first.await.unwrap().unwrap().id, 1);
    }

    #[tokio::test]
    async fn put_writes_adjacent_header_and_body_frames() {
        let (client, mut server_r, mut server_w) = fake_server();

        let body = b"module bytes".to_vec();
        let expect = body.clone();
        let task = tokio::spawn(async move {
            client
                .put(&[0xAA], &[0xBB], expect.len() as i64, &mut expect.as_slice())
                .await
        });

        let req: Request = read_frame(&mut server_r).await.unwrap().unwrap();
        assert_eq!(req.command, Cmd::Put);
        assert_eq!(req.body_size, body.len() as i64);
        let got = read_body_frame(&mut server_r).await.unwrap().unwrap();
        assert_eq!(got, body);

        write_frame(
            &mut server_w,
            &Response {
                id: req.id,
                disk_path: "/sandcache/build/b-x/o-bbbb".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let res = task.await.unwrap().unwrap();
        assert_eq!(res.disk_path, "/sandcache/build/b-x/o-bbbb");
    }

    #[tokio::test]
    async fn peer_disconnect_fails_waiting_and_future_calls() {
        let (client, _server_r, mut server_w) = fake_server();

        let c1 = client.clone();
        let waiting = tokio::spawn(async move { c1.get(&[0x01]).await });
        // Give the request time to land in the in-flight table.
        tokio::task::yield_now().await;

        server_w.shutdown().await.unwrap();
        drop(server_w);
        drop(_server_r);

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));

        let err = client.get(&[0x02]).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }
}
