//! Per-channel connector
//!
//! One task per accepted channel-open: register with the machine's
//! activity counter, translate the virtual address, dial the real
//! endpoint, then proxy bytes in both directions with half-close.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use jg_core::{BoxedChannelIo, ChannelOpen, Machine, RejectReason};

/// Drive one channel against its machine. Spawned by the manager.
pub async fn run_channel(channel: Box<dyn ChannelOpen>, machine: Arc<Machine>) {
    // The guard pairs the increment with a decrement on every exit path.
    let Some(_guard) = machine.begin_activity() else {
        channel
            .reject(RejectReason::ConnectionFailed, "service unavailable")
            .await;
        return;
    };

    // Blocks until the machine has passed its reachability probe. `None`
    // is the unavailable sentinel, including from the post-exit drain.
    let resolved = match machine.translate(channel.target(), channel.port()).await {
        Some(resolved) => resolved,
        None => {
            channel
                .reject(RejectReason::ConnectionFailed, "service unavailable")
                .await;
            return;
        }
    };

    let remote = match TcpStream::connect(&resolved).await {
        Ok(remote) => remote,
        Err(e) => {
            channel
                .reject(RejectReason::ConnectionFailed, &e.to_string())
                .await;
            return;
        }
    };

    let target = channel.target().to_string();
    let stream = match channel.accept().await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("channel for {:?} vanished before accept: {}", target, e);
            return;
        }
    };

    tracing::debug!("proxying channel for {:?} to {}", target, resolved);
    proxy(stream, remote).await;
    tracing::debug!("channel for {:?} finished", target);
}

/// Copy both directions until EOF.
///
/// Each write side is shut down as its feeding direction ends, so a
/// unidirectional shutdown stays visible to the far endpoint (`ssh -W`
/// and scp use it as a framing signal). Copy errors mid-stream are
/// treated as EOF. Both directions are awaited before the streams drop.
async fn proxy(client: BoxedChannelIo, remote: TcpStream) {
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut remote_rd, mut remote_wr) = remote.into_split();

    let uplink = async move {
        let _ = tokio::io::copy(&mut client_rd, &mut remote_wr).await;
        let _ = remote_wr.shutdown().await;
    };
    let downlink = async move {
        let _ = tokio::io::copy(&mut remote_rd, &mut client_wr).await;
        let _ = client_wr.shutdown().await;
    };
    tokio::join!(uplink, downlink);
}
