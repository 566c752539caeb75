use crate::fs::errors::{Status, result_of};
use crate::fs::types::FileStat;
use crate::ring::NodeEntry;
use crate::rpc::{Conn, Request, Response, framed, recv_message, send_message};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Client side of the inode RPCs, used both for forwarding requests to the
/// owning peer and for fetching membership snapshots on join.
///
/// Every transport failure (connect, send, receive, deadline expiry)
/// surfaces as [`Status::ServerDown`]; application errors travel inside the
/// response and propagate verbatim.
pub struct RpcClient {
    conn: Conn,
    timeout: Duration,
}

impl RpcClient {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, Status> {
        let stream = with_deadline(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Status::ServerDown)?
            .map_err(|_| Status::ServerDown)?;
        stream.set_nodelay(true).ok();
        debug!(addr, "connected to peer");
        Ok(RpcClient {
            conn: framed(stream),
            timeout,
        })
    }

    pub async fn call(&mut self, request: &Request) -> Result<Response, Status> {
        let exchange = async {
            send_message(&mut self.conn, request).await?;
            recv_message::<Response>(&mut self.conn).await
        };
        match with_deadline(self.timeout, exchange).await {
            Ok(Ok(Some(response))) => Ok(response),
            // Peer closed, transport error, or deadline expiry.
            _ => Err(Status::ServerDown),
        }
    }

    pub async fn create(
        &mut self,
        key: &[u8],
        uid: u32,
        gid: u32,
        mode: u32,
        chunk_size: u64,
    ) -> Result<(), Status> {
        let response = self
            .call(&Request::Create {
                key: key.to_vec(),
                uid,
                gid,
                mode,
                chunk_size,
            })
            .await?;
        match response {
            Response::Create { err } => result_of(err),
            _ => Err(Status::Unknown),
        }
    }

    pub async fn stat(&mut self, key: &[u8]) -> Result<FileStat, Status> {
        let response = self.call(&Request::Stat { key: key.to_vec() }).await?;
        match response {
            Response::Stat { err, stat } => {
                result_of(err)?;
                stat.ok_or(Status::Unknown)
            }
            _ => Err(Status::Unknown),
        }
    }

    pub async fn write(
        &mut self,
        key: &[u8],
        value: Vec<u8>,
        offset: i64,
        mode: u32,
        chunk_size: u64,
    ) -> Result<u64, Status> {
        let response = self
            .call(&Request::Write {
                key: key.to_vec(),
                value,
                offset,
                mode,
                chunk_size,
            })
            .await?;
        match response {
            Response::Write { err, value_size } => {
                result_of(err)?;
                Ok(value_size)
            }
            _ => Err(Status::Unknown),
        }
    }

    pub async fn read(&mut self, key: &[u8], size: u64, offset: i64) -> Result<Vec<u8>, Status> {
        let response = self
            .call(&Request::Read {
                key: key.to_vec(),
                size,
                offset,
            })
            .await?;
        match response {
            Response::Read { err, value } => {
                result_of(err)?;
                Ok(value)
            }
            _ => Err(Status::Unknown),
        }
    }

    pub async fn remove(&mut self, key: &[u8]) -> Result<(), Status> {
        let response = self.call(&Request::Remove { key: key.to_vec() }).await?;
        match response {
            Response::Remove { err } => result_of(err),
            _ => Err(Status::Unknown),
        }
    }

    pub async fn node_list(&mut self) -> Result<Vec<NodeEntry>, Status> {
        let response = self.call(&Request::NodeList).await?;
        match response {
            Response::NodeList { nodes } => Ok(nodes),
            _ => Err(Status::Unknown),
        }
    }
}

/// A zero duration disables the deadline.
async fn with_deadline<F>(timeout: Duration, future: F) -> Result<F::Output, tokio::time::error::Elapsed>
where
    F: Future,
{
    if timeout.is_zero() {
        Ok(future.await)
    } else {
        tokio::time::timeout(timeout, future).await
    }
}
