//! Startup handshake that asks an existing member to add this node.

use reqwest::Client;
use tracing::info;

use crate::error::StartupJoinError;

/// Asks the gateway at `seed` to add `peer_address` (this node's raft
/// address) as a voter.
///
/// Anything but the literal `ok` body is a rejection.
pub async fn join_cluster(
    client: &Client,
    seed: &str,
    peer_address: &str,
) -> Result<(), StartupJoinError> {
    let transport = |source| StartupJoinError::Transport {
        seed: seed.to_string(),
        source,
    };

    let url = format!("http://{seed}/join");
    info!(%url, peer_address, "joining cluster");
    let body = client
        .get(&url)
        .query(&[("peerAddress", peer_address)])
        .send()
        .await
        .map_err(transport)?
        .text()
        .await
        .map_err(transport)?;

    if body != "ok" {
        return Err(StartupJoinError::Rejected {
            seed: seed.to_string(),
            body,
        });
    }
    info!(seed, "joined cluster");
    Ok(())
}
