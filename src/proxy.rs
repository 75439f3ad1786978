//! A relay that pairs worker connections with controller connections.
//!
//! Two listening sockets with distinct roles. Arrivals on either side wait
//! in FIFO order until a counterpart arrives on the other; a matched pair
//! forwards bytes blindly in both directions until either side closes,
//! which closes both. The proxy never looks inside the stream; framing is
//! handled end to end by the controller and worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::endpoint::{Endpoint, DEFAULT_CONTROLLER_PORT, DEFAULT_WORKER_PORT};

/// Per-direction scratch size. Each pair owns its own buffers, so pairs
/// can forward concurrently.
const FORWARD_BUFFER_SIZE: usize = 128 * 1024;

pub async fn run(worker_listen: Endpoint, controller_listen: Endpoint) -> Result<()> {
    let worker_addr = worker_listen.listen_addr(DEFAULT_WORKER_PORT);
    let worker_listener = TcpListener::bind(&worker_addr)
        .await
        .with_context(|| format!("listening for workers on {worker_addr}"))?;

    let controller_addr = controller_listen.listen_addr(DEFAULT_CONTROLLER_PORT);
    let controller_listener = TcpListener::bind(&controller_addr)
        .await
        .with_context(|| format!("listening for controllers on {controller_addr}"))?;

    info!(
        workers = %worker_listener.local_addr()?,
        controllers = %controller_listener.local_addr()?,
        "proxy listening"
    );

    let mut waiting_workers: VecDeque<TcpStream> = VecDeque::new();
    let mut waiting_controllers: VecDeque<TcpStream> = VecDeque::new();
    let active_pairs = Arc::new(AtomicUsize::new(0));

    loop {
        tokio::select! {
            accepted = worker_listener.accept() => {
                let (stream, peer) = accepted.context("accepting worker side")?;
                debug!(%peer, "worker side connected");
                match waiting_controllers.pop_front() {
                    Some(controller) => spawn_pair(stream, controller, &active_pairs),
                    None => waiting_workers.push_back(stream),
                }
            }
            accepted = controller_listener.accept() => {
                let (stream, peer) = accepted.context("accepting controller side")?;
                debug!(%peer, "controller side connected");
                match waiting_workers.pop_front() {
                    Some(worker) => spawn_pair(worker, stream, &active_pairs),
                    None => waiting_controllers.push_back(stream),
                }
            }
        }

        info!(
            waiting_workers = waiting_workers.len(),
            waiting_controllers = waiting_controllers.len(),
            matched = active_pairs.load(Ordering::Relaxed),
            "pair table"
        );
    }
}

fn spawn_pair(worker: TcpStream, controller: TcpStream, active_pairs: &Arc<AtomicUsize>) {
    active_pairs.fetch_add(1, Ordering::Relaxed);
    let active_pairs = Arc::clone(active_pairs);
    tokio::spawn(async move {
        match forward(worker, controller).await {
            Ok(()) => debug!("pair closed"),
            Err(err) => debug!(error = %err, "pair closed with error"),
        }
        active_pairs.fetch_sub(1, Ordering::Relaxed);
    });
}

/// Shuttle bytes between the two sides until either closes. Byte order is
/// preserved per direction; both sockets close when this returns.
async fn forward(mut worker: TcpStream, mut controller: TcpStream) -> std::io::Result<()> {
    let (mut worker_read, mut worker_write) = worker.split();
    let (mut controller_read, mut controller_write) = controller.split();

    let worker_to_controller = async {
        let mut scratch = vec![0u8; FORWARD_BUFFER_SIZE];
        loop {
            let received = worker_read.read(&mut scratch).await?;
            if received == 0 {
                break;
            }
            controller_write.write_all(&scratch[..received]).await?;
        }
        controller_write.shutdown().await
    };

    let controller_to_worker = async {
        let mut scratch = vec![0u8; FORWARD_BUFFER_SIZE];
        loop {
            let received = controller_read.read(&mut scratch).await?;
            if received == 0 {
                break;
            }
            worker_write.write_all(&scratch[..received]).await?;
        }
        worker_write.shutdown().await
    };

    let (to_controller, to_worker) = tokio::join!(worker_to_controller, controller_to_worker);
    to_controller.and(to_worker)
}
