// src/core/connection/handshake.rs

//! Connection setup: protocol negotiation and authentication, client naming,
//! client id retrieval, and database selection.

use super::Connection;
use crate::config::{ConnectionOptions, RespProtocol};
use crate::core::ClientError;
use crate::core::commands;
use crate::core::protocol::RespFrame;
use tracing::{debug, warn};

pub(super) async fn perform(
    conn: &Connection,
    options: &ConnectionOptions,
) -> Result<(), ClientError> {
    match options.protocol {
        RespProtocol::Resp3 => {
            let cmd = commands::hello(
                options.user.as_deref(),
                options.password.as_deref(),
                options.client_name.as_deref(),
            );
            let reply = step(conn, &cmd, "HELLO").await?;
            if !matches!(reply, RespFrame::Map(_) | RespFrame::Array(_)) {
                return Err(ClientError::Handshake(format!(
                    "unexpected HELLO reply: {}",
                    reply.to_text_lossy()
                )));
            }
        }
        RespProtocol::Resp2 => {
            if let Some(password) = options.password.as_deref() {
                let cmd = commands::auth(options.user.as_deref(), password);
                step(conn, &cmd, "AUTH").await?;
            }
            if let Some(name) = options.client_name.as_deref() {
                step(conn, &commands::client_setname(name), "CLIENT SETNAME").await?;
            }
        }
    }

    // Servers without CLIENT ID still work; they just cannot receive redirected
    // invalidations.
    match conn.execute_async(&commands::client_id(), None).await {
        Ok(reply) => match reply.as_u64() {
            Some(id) => conn.set_client_id(id),
            None => warn!("CLIENT ID returned a non-integer reply: {:?}", reply),
        },
        Err(ClientError::Server(msg)) => warn!("CLIENT ID not supported: {}", msg),
        Err(e) => return Err(e),
    }

    if options.database > 0 {
        step(conn, &commands::select(options.database), "SELECT").await?;
        conn.set_database(options.database);
    }

    debug!(
        "Handshake complete for connection {} (client id {}).",
        conn.id(),
        conn.client_id()
    );
    Ok(())
}

/// Runs one handshake command; server error replies become handshake errors.
async fn step(
    conn: &Connection,
    cmd: &crate::core::protocol::Command,
    what: &str,
) -> Result<RespFrame, ClientError> {
    conn.execute_async(cmd, None).await.map_err(|e| match e {
        ClientError::Server(msg) => ClientError::Handshake(format!("{what} failed: {msg}")),
        other => other,
    })
}
