pub mod client;
pub mod server;

pub use client::RpcClient;
pub use server::RpcServer;

use crate::fs::FileStat;
use crate::ring::NodeEntry;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::io;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Upper bound on one frame: a chunk payload plus message overhead.
const MAX_FRAME_LEN: usize = 64 << 20;

/// The five inode RPCs plus the membership snapshot. Keys are opaque byte
/// sequences (`base\0index`); the receiving dispatcher routes on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Create {
        key: Vec<u8>,
        uid: u32,
        gid: u32,
        mode: u32,
        chunk_size: u64,
    },
    Stat {
        key: Vec<u8>,
    },
    Write {
        key: Vec<u8>,
        value: Vec<u8>,
        offset: i64,
        mode: u32,
        chunk_size: u64,
    },
    Read {
        key: Vec<u8>,
        size: u64,
        offset: i64,
    },
    Remove {
        key: Vec<u8>,
    },
    NodeList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Create {
        err: i32,
    },
    Stat {
        err: i32,
        stat: Option<FileStat>,
    },
    Write {
        err: i32,
        value_size: u64,
    },
    Read {
        err: i32,
        value: Vec<u8>,
    },
    Remove {
        err: i32,
    },
    NodeList {
        nodes: Vec<NodeEntry>,
    },
}

impl Request {
    /// The routing key, absent only for membership requests.
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            Request::Create { key, .. }
            | Request::Stat { key }
            | Request::Write { key, .. }
            | Request::Read { key, .. }
            | Request::Remove { key } => Some(key),
            Request::NodeList => None,
        }
    }
}

pub type Conn = Framed<TcpStream, LengthDelimitedCodec>;

pub fn framed(stream: TcpStream) -> Conn {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_framed(stream)
}

pub async fn send_message<T: Serialize>(conn: &mut Conn, msg: &T) -> io::Result<()> {
    let buf = bincode::serialize(msg)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    conn.send(Bytes::from(buf)).await
}

/// Receives one message; `Ok(None)` means the peer closed the connection.
pub async fn recv_message<T: DeserializeOwned>(conn: &mut Conn) -> io::Result<Option<T>> {
    let Some(frame) = conn.next().await else {
        return Ok(None);
    };
    let frame = frame?;
    bincode::deserialize(&frame)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
