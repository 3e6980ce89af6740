use crate::core::GridEvent;
use crate::BroadcastMessage;
use multiview_proto::protocol::{Broadcast, Command, Message, PROTOCOL_VERSION};
use multiview_proto::state::GridStateStore;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info, warn};

/// Largest command payload a client may send.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

pub fn start_server(
    bind_address: String,
    port: u16,
    store: Arc<GridStateStore>,
    event_tx: mpsc::Sender<GridEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);
        serve(listener, store, event_tx, broadcast_tx).await;
    })
}

async fn serve(
    listener: TcpListener,
    store: Arc<GridStateStore>,
    event_tx: mpsc::Sender<GridEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) {
    let mut client_id = 0usize;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;
                info!("Client {} connected from {}", id, peer);

                let store = store.clone();
                let evt_tx = event_tx.clone();
                let bcast_rx = broadcast_tx.subscribe();
                tokio::spawn(async move {
                    handle_client(stream, store, id, evt_tx, bcast_rx).await;
                    info!("Client {} disconnected", id);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    store: Arc<GridStateStore>,
    client_id: usize,
    event_tx: mpsc::Sender<GridEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Send Hello with current state snapshot on connect
    if let Ok(encoded) = encode_hello(&store).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            let frame_len = match next_frame_len(&read_buf) {
                                Some(len) if len > MAX_FRAME_LEN => {
                                    warn!("Client {} sent oversized frame ({} bytes), disconnecting", client_id, len);
                                    return;
                                }
                                Some(len) if read_buf.len() >= 4 + len => 4 + len,
                                _ => break,
                            };
                            let frame: Vec<u8> = read_buf.drain(..frame_len).collect();

                            let encoded = match Message::decode(&frame) {
                                Ok((Message::Command(cmd), _)) => {
                                    info!("Client {} sent command: {:?}", client_id, cmd);
                                    match dispatch(&event_tx, cmd).await {
                                        Some(Ok(())) => encode_state(&store).await,
                                        Some(Err(message)) => {
                                            Message::Broadcast(Broadcast::Error { message }).encode()
                                        }
                                        None => {
                                            warn!("GridEvent channel closed");
                                            return;
                                        }
                                    }
                                }
                                Ok(_) => continue,
                                Err(e) => {
                                    warn!("Client {} sent malformed frame: {}", client_id, e);
                                    Message::Broadcast(Broadcast::Error {
                                        message: format!("malformed frame: {}", e),
                                    })
                                    .encode()
                                }
                            };
                            if let Ok(encoded) = encoded {
                                if write_half.write_all(&encoded).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let encoded = match msg {
                    Ok(BroadcastMessage::StateUpdated) => encode_state(&store).await,
                    Ok(BroadcastMessage::Alert { tile, active, message }) => {
                        Message::Broadcast(Broadcast::Alert { tile, active, message }).encode()
                    }
                    Ok(BroadcastMessage::Log(message)) => {
                        Message::Broadcast(Broadcast::Log { message }).encode()
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        encode_state(&store).await
                    }
                    Err(_) => break,
                };
                if let Ok(encoded) = encoded {
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// Payload length announced by the frame header at the front of `buf`.
fn next_frame_len(buf: &[u8]) -> Option<usize> {
    let header: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(header) as usize)
}

/// Forward a command to the core and wait for its outcome.  Errors go back
/// to the requesting client only.  `None` once the core is gone.
async fn dispatch(
    event_tx: &mpsc::Sender<GridEvent>,
    command: Command,
) -> Option<Result<(), String>> {
    let (reply, answer) = oneshot::channel();
    event_tx
        .send(GridEvent::Request { command, reply })
        .await
        .ok()?;
    let outcome = answer.await.ok()?;
    Some(outcome.map(|_| ()).map_err(|e| e.to_string()))
}

async fn encode_hello(store: &GridStateStore) -> anyhow::Result<Vec<u8>> {
    let state = store.get_state().await;
    let rev = state.rev;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        daemon_rev: rev,
        state,
    })
    .encode()
}

async fn encode_state(store: &GridStateStore) -> anyhow::Result<Vec<u8>> {
    let state = store.get_state().await;
    Message::Broadcast(Broadcast::State { data: state }).encode()
}
