// Copyright 2020 Joyent, Inc.

//! The accept loop for a listening channel.

use std::sync::Arc;
use std::time::Duration;

use slog::{error, info, Logger};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionContext, ConnectionDirection};
use crate::peers::PeerRegistry;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts connections on `listener` until the returned task is aborted.
/// Each accepted socket becomes an inbound connection that is filed under
/// its peer once the handshake identifies it.
pub fn make_task(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    registry: Arc<PeerRegistry>,
    log: &Logger,
) -> JoinHandle<()> {
    let log = log.clone();
    tokio::spawn(async move {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(log, "failed to accept connection"; "error" => %e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            info!(log, "accepted connection"; "remote_addr" => %addr);
            match Connection::spawn(stream, ConnectionDirection::In, Arc::clone(&ctx)) {
                Ok(conn) => registry.add_inbound(conn),
                Err(e) => {
                    error!(log, "failed to start connection";
                        "remote_addr" => %addr, "error" => %e)
                }
            }
        }
    })
}
