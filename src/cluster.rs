use crate::ring::{RingTable, UpdateSource};
use crate::rpc::RpcClient;
use crate::task::spawn_named;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Joins an existing cluster by pulling the membership snapshot from the
/// first reachable seed. Snapshot names are already derived, so they are
/// adopted verbatim; hashing them again would shift every ring position.
/// With no reachable seed the node keeps its single-member ring.
pub async fn join(ring: &Arc<RingTable>, seeds: &[String], timeout: Duration) {
    let self_addr = ring.self_address();
    for seed in seeds {
        if seed.as_str() == self_addr.as_ref() {
            continue;
        }
        let mut client = match RpcClient::connect(seed, timeout).await {
            Ok(client) => client,
            Err(status) => {
                warn!(seed = %seed, %status, "seed unreachable");
                continue;
            }
        };
        match client.node_list().await {
            Ok(mut nodes) => {
                if !nodes.iter().any(|n| n.address.as_str() == self_addr.as_ref()) {
                    nodes.push(ring.self_entry());
                }
                ring.update(&nodes, UpdateSource::Client);
                info!(seed = %seed, members = ring.len(), "joined ring");
                return;
            }
            Err(status) => warn!(seed = %seed, %status, "node_list fetch failed"),
        }
    }
    info!(members = ring.len(), "no seed reachable; serving a single-member ring");
}

/// Consumes peer-down notifications from the dispatcher: the dead node is
/// dropped from the ring and, when this server is the coordinator (the tail
/// of the address order), it announces that it drives the re-election. The
/// election state machine itself lives outside this crate.
pub fn spawn_membership(
    ring: Arc<RingTable>,
    mut election_rx: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    spawn_named("membership", async move {
        loop {
            tokio::select! {
                suspect = election_rx.recv() => {
                    let Some(suspect) = suspect else { break };
                    warn!(peer = %suspect, "peer down, removing from ring");
                    ring.remove(&suspect);
                    if ring.is_coordinator() {
                        info!("coordinator: driving ring re-election");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        info!("membership task stopped");
    })
}
