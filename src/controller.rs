//! The scheduler: keeps a pool of worker connections busy with frames.
//!
//! Frames pop off the front of a queue and go to whichever connection is
//! idle first. A frame whose worker dies goes back on the *front* of the
//! queue, so the most recently lost work retries first. The run is over
//! when the queue is empty and no connection is mid-frame; each surviving
//! worker then gets its final copy-out pass.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, DEFAULT_CONTROLLER_PORT, DEFAULT_WORKER_PORT};
use crate::job::Job;
use crate::session::{self, Event, Session, SessionError};

/// Scheduler-side record of one live connection.
struct Conn {
    /// Frame assignments to the session task; `None` once closed to tell
    /// the session no frames remain.
    assign: Option<mpsc::Sender<i64>>,
    /// Completed the welcome and one-time copy-ins at least once.
    ready: bool,
    /// Mid-frame right now.
    busy: bool,
    /// Index into the configured proxy list, for redial on death.
    proxy_index: Option<usize>,
}

pub async fn run(job: Job, listen: Endpoint, proxies: Vec<Endpoint>) -> Result<()> {
    let job = Arc::new(job);
    let mut queue: VecDeque<i64> = job.frames.expand();
    info!(frames = queue.len(), "controller starting");

    let listen_addr = listen.listen_addr(DEFAULT_WORKER_PORT);
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("listening on {listen_addr}"))?;
    info!(addr = %listener.local_addr()?, "listening for workers");

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut pool: BTreeMap<usize, Conn> = BTreeMap::new();
    let mut next_conn: usize = 0;
    let mut completed: usize = 0;

    loop {
        // Every configured proxy gets exactly one live connection; redial
        // any that died. A proxy that cannot be reached ends the run.
        for (index, endpoint) in proxies.iter().enumerate() {
            if pool.values().any(|conn| conn.proxy_index == Some(index)) {
                continue;
            }
            let addr = endpoint.dial_addr(DEFAULT_CONTROLLER_PORT);
            let stream = TcpStream::connect(&addr)
                .await
                .with_context(|| format!("dialing proxy {addr}"))?;
            debug!(%addr, index, "dialed proxy");
            spawn_session(
                stream,
                Some(index),
                &job,
                &mut pool,
                &mut next_conn,
                &event_tx,
            );
        }

        if queue.is_empty() && pool.values().all(|conn| !conn.busy) {
            break;
        }

        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accepting worker connection")?;
                debug!(%peer, "worker connected");
                spawn_session(stream, None, &job, &mut pool, &mut next_conn, &event_tx);
            }
            event = event_rx.recv() => {
                let Some(event) = event else { continue };
                match event {
                    Event::Idle { conn } => {
                        if let Some(record) = pool.get_mut(&conn) {
                            if record.busy {
                                completed += 1;
                            }
                            record.ready = true;
                            record.busy = false;
                        }
                    }
                    Event::Finished { conn } => {
                        pool.remove(&conn);
                    }
                    Event::Failed { conn, frame, error } => {
                        pool.remove(&conn);
                        if !error.is_connection_scoped() {
                            bail!(error);
                        }
                        warn!(error = %error, "removing failed worker");
                        if let Some(frame) = frame {
                            info!(frame, "requeueing frame from failed worker");
                            queue.push_front(frame);
                        }
                    }
                }
            }
        }

        dispatch(&mut queue, &mut pool).await;
    }

    info!(completed, "all frames done, collecting one-time outputs");

    // Closing the assignment channels tells every surviving session to run
    // its final copy-out pass; wait for each to report in.
    for conn in pool.values_mut() {
        conn.assign = None;
    }
    while !pool.is_empty() {
        let Some(event) = event_rx.recv().await else {
            break;
        };
        match event {
            Event::Finished { conn } => {
                pool.remove(&conn);
            }
            Event::Failed { conn, error, .. } => {
                handle_final_failure(error)?;
                pool.remove(&conn);
            }
            Event::Idle { .. } => {}
        }
    }

    info!("controller run complete");
    Ok(())
}

/// Hand queued frames to idle workers, front of the queue first.
async fn dispatch(queue: &mut VecDeque<i64>, pool: &mut BTreeMap<usize, Conn>) {
    while let Some(&frame) = queue.front() {
        let Some(record) = pool
            .values_mut()
            .find(|conn| conn.ready && !conn.busy && conn.assign.is_some())
        else {
            break;
        };
        let Some(assign) = record.assign.as_ref() else {
            break;
        };
        if assign.send(frame).await.is_err() {
            // The session died before taking the frame; its Failed event is
            // still in flight and will clean up the pool entry.
            record.ready = false;
            continue;
        }
        record.busy = true;
        queue.pop_front();
    }
}

/// During the final copy-out pass frames are already safe; a dying worker
/// only costs its one-time outputs, which is worth a warning but not the
/// run. Anything non-connection-scoped still ends the run.
fn handle_final_failure(error: SessionError) -> Result<()> {
    if !error.is_connection_scoped() {
        bail!(error);
    }
    warn!(error = %error, "worker failed during final copy-out");
    Ok(())
}

fn spawn_session(
    stream: TcpStream,
    proxy_index: Option<usize>,
    job: &Arc<Job>,
    pool: &mut BTreeMap<usize, Conn>,
    next_conn: &mut usize,
    events: &mpsc::UnboundedSender<Event>,
) {
    let conn = *next_conn;
    *next_conn += 1;

    let (assign_tx, assign_rx) = mpsc::channel(1);
    let session = Session::new(stream, Arc::clone(job), proxy_index);
    tokio::spawn(session::drive(session, conn, assign_rx, events.clone()));

    pool.insert(
        conn,
        Conn {
            assign: Some(assign_tx),
            ready: false,
            busy: false,
            proxy_index,
        },
    );
}
