// TCP transport for host and client peers. The coordinator and peer state
// machines never touch a socket: reader tasks feed them decoded packets
// under the coarse lock, and everything outbound leaves through channels
// drained by writer tasks outside the lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{error, info, warn, Instrument};

use crate::client::ClientPeer;
use crate::command::ConnId;
use crate::error::PeerError;
use crate::fields;
use crate::host::{HostCoordinator, NetDirective};
use crate::protocol::{parse_frame, Packet};
use crate::simulation::SyncedSimulation;

/// Housekeeping cadence for both sides; frames are still handled the moment
/// they arrive, the tick only drives time advancement and timers.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

const READ_BUFFER_SIZE: usize = 4096;

type Writers = Arc<RwLock<HashMap<ConnId, mpsc::UnboundedSender<Vec<u8>>>>>;

/// Runs the host side: accepts connections, spawns one reader and one
/// writer task per connection, and executes the coordinator's directives.
/// Returns only when the listener fails.
pub async fn serve_host<S>(
    listener: TcpListener,
    coordinator: Arc<Mutex<HostCoordinator<S>>>,
    directives: mpsc::UnboundedReceiver<NetDirective>,
) -> Result<()>
where
    S: SyncedSimulation + Send + 'static,
{
    let writers: Writers = Arc::new(RwLock::new(HashMap::new()));

    tokio::spawn(dispatch_directives(writers.clone(), directives));
    tokio::spawn(host_ticks(coordinator.clone()));

    info!(addr = %listener.local_addr()?, "host listening");

    let mut next_conn: ConnId = 1;
    loop {
        let (stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let conn = next_conn;
        next_conn = next_conn.wrapping_add(1);

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        writers.write().await.insert(conn, tx);
        coordinator.lock().await.accept(conn);

        let span = tracing::info_span!(
            "session",
            { fields::CONN_ID } = conn,
            { fields::ADDR } = %addr
        );
        tokio::spawn(
            host_read_loop(read_half, conn, coordinator.clone(), writers.clone())
                .instrument(span),
        );
        tokio::spawn(write_loop(write_half, rx));
    }
}

async fn host_read_loop<S>(
    mut read: OwnedReadHalf,
    conn: ConnId,
    coordinator: Arc<Mutex<HostCoordinator<S>>>,
    writers: Writers,
) where
    S: SyncedSimulation + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        loop {
            match parse_frame(&buf) {
                Ok(Some((packet, used))) => {
                    buf.advance(used);
                    coordinator.lock().await.handle_frame(conn, packet);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!({ fields::ERROR } = %e, "undecodable frame");
                    let arg = e.to_string();
                    let reason = PeerError::from(e).reason();
                    coordinator.lock().await.disconnect(conn, reason, arg);
                    return;
                }
            }
        }
        match read.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!({ fields::ERROR } = %e, "read failed");
                break;
            }
        }
    }
    writers.write().await.remove(&conn);
    coordinator.lock().await.peer_gone(conn);
}

/// Executes the coordinator's network directives: frame encoding happens
/// here, once per send, and a Drop closes the writer channel so the writer
/// task drains what is already queued and shuts the socket down.
async fn dispatch_directives(
    writers: Writers,
    mut directives: mpsc::UnboundedReceiver<NetDirective>,
) {
    while let Some(directive) = directives.recv().await {
        match directive {
            NetDirective::Send { conn, packet } => match packet.encode_frame() {
                Ok(frame) => {
                    if let Some(tx) = writers.read().await.get(&conn) {
                        let _ = tx.send(frame);
                    }
                }
                Err(e) => error!(
                    { fields::CONN_ID } = conn,
                    { fields::ERROR } = %e,
                    "failed to encode outgoing frame"
                ),
            },
            NetDirective::Drop { conn } => {
                writers.write().await.remove(&conn);
            }
        }
    }
}

async fn write_loop(mut write: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if write.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = write.shutdown().await;
}

async fn host_ticks<S>(coordinator: Arc<Mutex<HostCoordinator<S>>>)
where
    S: SyncedSimulation + Send + 'static,
{
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last = Instant::now();
    loop {
        interval.tick().await;
        let now = Instant::now();
        let delta_ms = now.duration_since(last).as_millis() as u32;
        last = now;
        coordinator.lock().await.think(delta_ms);
    }
}

/// Runs the client side over an established connection. Returns when the
/// connection is gone, after the peer has been told why.
pub async fn run_client<S>(
    stream: TcpStream,
    peer: Arc<Mutex<ClientPeer<S>>>,
    mut outgoing: mpsc::UnboundedReceiver<Packet>,
) -> Result<()>
where
    S: SyncedSimulation + Send + 'static,
{
    stream.set_nodelay(true)?;
    let (mut read, mut write) = stream.into_split();

    tokio::spawn(async move {
        while let Some(packet) = outgoing.recv().await {
            match packet.encode_frame() {
                Ok(frame) => {
                    if write.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!({ fields::ERROR } = %e, "failed to encode outgoing frame"),
            }
        }
        let _ = write.shutdown().await;
    });

    tokio::spawn(client_ticks(peer.clone()));

    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        loop {
            match parse_frame(&buf) {
                Ok(Some((packet, used))) => {
                    buf.advance(used);
                    peer.lock().await.handle_frame(packet);
                }
                Ok(None) => break,
                Err(e) => {
                    peer.lock().await.protocol_failure(e);
                    return Ok(());
                }
            }
        }
        match read.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!({ fields::ERROR } = %e, "read failed");
                break;
            }
        }
    }
    peer.lock().await.connection_lost();
    Ok(())
}

async fn client_ticks<S>(peer: Arc<Mutex<ClientPeer<S>>>)
where
    S: SyncedSimulation + Send + 'static,
{
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last = Instant::now();
    loop {
        interval.tick().await;
        let now = Instant::now();
        let delta_ms = now.duration_since(last).as_millis() as u32;
        last = now;
        let mut peer = peer.lock().await;
        if !peer.is_connected() {
            break;
        }
        peer.think(delta_ms);
    }
}
