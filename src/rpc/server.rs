use crate::fs::ChunkStore;
use crate::fs::errors::{Status, code_of};
use crate::ring::RingTable;
use crate::rpc::{Request, Response, RpcClient, framed, recv_message, send_message};
use crate::task::spawn_named;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The request dispatcher: every inbound RPC is either executed against the
/// local chunk store or forwarded to the owner the ring names.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    ring: Arc<RingTable>,
    store: ChunkStore,
    forward_timeout: Duration,
    election_tx: mpsc::UnboundedSender<String>,
}

impl RpcServer {
    pub fn new(
        ring: Arc<RingTable>,
        store: ChunkStore,
        forward_timeout: Duration,
        election_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        RpcServer {
            inner: Arc::new(ServerInner {
                ring,
                store,
                forward_timeout,
                election_tx,
            }),
        }
    }

    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr().context("rpc listener address")?;
        info!(%local, "rpc server listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "rpc accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "rpc connection");
                    let inner = self.inner.clone();
                    spawn_named("rpc-conn", async move {
                        inner.handle_conn(stream).await;
                    });
                }
                _ = shutdown.cancelled() => break,
            }
        }
        info!(%local, "rpc server shutting down");
        Ok(())
    }

    /// Dispatches one request as a connection handler would; used by tests.
    pub async fn dispatch(&self, request: Request) -> Response {
        let (response, dead_peer) = self.inner.dispatch(request).await;
        self.inner.report_dead(dead_peer);
        response
    }
}

impl ServerInner {
    async fn handle_conn(self: Arc<Self>, stream: TcpStream) {
        let mut conn = framed(stream);
        loop {
            let request = match recv_message::<Request>(&mut conn).await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "rpc receive failed");
                    break;
                }
            };
            let (response, dead_peer) = self.dispatch(request).await;
            if let Err(e) = send_message(&mut conn, &response).await {
                warn!(error = %e, "rpc respond failed");
                break;
            }
            // Only after the client has its answer does the failure feed
            // back into membership.
            self.report_dead(dead_peer);
        }
    }

    fn report_dead(&self, dead_peer: Option<String>) {
        if let Some(peer) = dead_peer {
            let _ = self.election_tx.send(peer);
        }
    }

    /// Returns the response plus the address of a peer whose transport
    /// failed during forwarding, if any.
    async fn dispatch(&self, request: Request) -> (Response, Option<String>) {
        if matches!(request, Request::NodeList) {
            return (
                Response::NodeList {
                    nodes: self.ring.snapshot(),
                },
                None,
            );
        }
        // Zero-length reads complete without touching the ring or the disk.
        if let Request::Read { size: 0, .. } = request {
            return (
                Response::Read {
                    err: 0,
                    value: Vec::new(),
                },
                None,
            );
        }

        // Hold the self reference for the whole dispatch so a concurrent
        // ring reconfiguration cannot invalidate it mid-request.
        let self_addr = self.ring.self_address();
        let Some(key) = request.key() else {
            return (error_response(&request, Status::NotSupported), None);
        };
        let Some(target) = self.ring.lookup(key) else {
            debug!("ring is empty: no owner available");
            return (error_response(&request, Status::ServerDown), None);
        };

        if target != self_addr.as_ref() {
            debug!(target = %target, "forwarding");
            match self.forward(&target, &request).await {
                Ok(response) => (response, None),
                Err(status) => (error_response(&request, status), Some(target)),
            }
        } else {
            (self.execute(request).await, None)
        }
    }

    async fn forward(&self, target: &str, request: &Request) -> Result<Response, Status> {
        let mut client = RpcClient::connect(target, self.forward_timeout).await?;
        client.call(request).await
    }

    async fn execute(&self, request: Request) -> Response {
        match request {
            Request::Create {
                key,
                uid,
                gid,
                mode,
                chunk_size,
            } => {
                let result = self
                    .store
                    .create(&key, uid, gid, mode, chunk_size, None)
                    .await;
                log_outcome("inode_create", &key, &result);
                Response::Create {
                    err: code_of(&result),
                }
            }
            Request::Stat { key } => {
                let result = self.store.stat(&key).await;
                log_outcome("inode_stat", &key, &result);
                match result {
                    Ok(stat) => Response::Stat {
                        err: 0,
                        stat: Some(stat),
                    },
                    Err(status) => Response::Stat {
                        err: status.code(),
                        stat: None,
                    },
                }
            }
            Request::Write {
                key,
                value,
                offset,
                mode,
                chunk_size,
            } => {
                let result = self
                    .store
                    .write(&key, Bytes::from(value), offset, mode, chunk_size)
                    .await;
                log_outcome("inode_write", &key, &result);
                match result {
                    Ok(value_size) => Response::Write { err: 0, value_size },
                    Err(status) => Response::Write {
                        err: status.code(),
                        value_size: 0,
                    },
                }
            }
            Request::Read { key, size, offset } => {
                let result = self.store.read(&key, size, offset).await;
                log_outcome("inode_read", &key, &result);
                match result {
                    Ok(value) => Response::Read { err: 0, value },
                    Err(status) => Response::Read {
                        err: status.code(),
                        value: Vec::new(),
                    },
                }
            }
            Request::Remove { key } => {
                let result = self.store.remove(&key).await;
                log_outcome("inode_remove", &key, &result);
                Response::Remove {
                    err: code_of(&result),
                }
            }
            Request::NodeList => Response::NodeList {
                nodes: self.ring.snapshot(),
            },
        }
    }
}

fn error_response(request: &Request, status: Status) -> Response {
    let err = status.code();
    match request {
        Request::Create { .. } => Response::Create { err },
        Request::Stat { .. } => Response::Stat { err, stat: None },
        Request::Write { .. } => Response::Write { err, value_size: 0 },
        Request::Read { .. } => Response::Read {
            err,
            value: Vec::new(),
        },
        Request::Remove { .. } => Response::Remove { err },
        Request::NodeList => Response::NodeList { nodes: Vec::new() },
    }
}

fn log_outcome<T>(op: &str, key: &[u8], result: &Result<T, Status>) {
    match result {
        Ok(_) => info!(op, key = %String::from_utf8_lossy(key), "ok"),
        Err(status) if status.is_benign() => {
            info!(op, key = %String::from_utf8_lossy(key), %status, "failed")
        }
        Err(status) => {
            tracing::error!(op, key = %String::from_utf8_lossy(key), %status, "failed")
        }
    }
}
