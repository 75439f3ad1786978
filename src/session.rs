//! Drives one worker connection through the per-job lifecycle.
//!
//! The sequence on every connection is fixed: welcome, then the one-time
//! copy-ins, then an idle wait for frame assignments; each frame runs its
//! copy-ins, the execute, and its copy-outs; when no frames remain the
//! one-time copy-outs run and the connection is done. Each session runs as
//! its own task and talks to the scheduler through channels, so the
//! sequence reads as straight-line code suspending only on framed I/O.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::job::Job;
use crate::paths;
use crate::protocol::{self, Request, RequestKind, Response, WireError};
use crate::subst;

/// Sentinel frame for the one-time copy passes: substitution leaves
/// templates untouched for negative values, and the copy-list partition
/// test compares against "has a frame" = false.
pub const NO_FRAME: i64 = -1;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("expected {expected:?} response, got {got:?}")]
    ResponseMismatch {
        expected: RequestKind,
        got: RequestKind,
    },
    #[error("worker password rejected")]
    PasswordMismatch,
    #[error("local file {pathname}: {source}")]
    LocalFile {
        pathname: String,
        source: std::io::Error,
    },
}

impl SessionError {
    /// Whether the failure is scoped to this connection (remove the worker,
    /// requeue its frame) rather than fatal to the whole controller run.
    pub fn is_connection_scoped(&self) -> bool {
        match self {
            SessionError::Wire(WireError::Io(_)) => false,
            SessionError::LocalFile { .. } => false,
            _ => true,
        }
    }
}

/// The controller's view of one worker connection.
pub struct Session<S> {
    stream: S,
    job: Arc<Job>,
    hostname: String,
    proxy_index: Option<usize>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(stream: S, job: Arc<Job>, proxy_index: Option<usize>) -> Self {
        Session {
            stream,
            job,
            hostname: String::new(),
            proxy_index,
        }
    }

    /// Hostname learned from the welcome response; empty before that.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Index of the proxy this connection was dialed through, if any.
    pub fn proxy_index(&self) -> Option<usize> {
        self.proxy_index
    }

    async fn transact(&mut self, request: &Request) -> Result<Response, SessionError> {
        protocol::write_message(&mut self.stream, request).await?;
        let response: Response = protocol::read_message(&mut self.stream).await?;
        Ok(response)
    }

    fn mismatch(expected: RequestKind, got: &Response) -> SessionError {
        SessionError::ResponseMismatch {
            expected,
            got: got.kind(),
        }
    }

    /// Welcome exchange plus the one-time copy-ins. Leaves the worker idle.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        let response = self.transact(&Request::Welcome).await?;
        match response {
            Response::Welcome {
                hostname,
                core_count,
                password,
            } => {
                if password != self.job.password {
                    return Err(SessionError::PasswordMismatch);
                }
                info!(host = %hostname, cores = core_count, "worker connected");
                self.hostname = hostname;
            }
            other => return Err(Self::mismatch(RequestKind::Welcome, &other)),
        }

        self.copy_in_pass(NO_FRAME).await
    }

    /// Ship every copy-in whose classification matches the frame: the
    /// one-time list for [`NO_FRAME`], the per-frame list otherwise.
    async fn copy_in_pass(&mut self, frame: i64) -> Result<(), SessionError> {
        let job = Arc::clone(&self.job);
        for copy in &job.in_copies {
            if copy.per_frame() != (frame >= 0) {
                continue;
            }
            let source = subst::substitute(&copy.source, frame);
            let destination = subst::substitute(&copy.destination, frame);
            debug!(source = %source, destination = %destination, "copying in");

            let content = paths::read_file(&source).map_err(|err| SessionError::LocalFile {
                pathname: source.clone(),
                source: err,
            })?;
            let response = self
                .transact(&Request::CopyIn {
                    pathname: destination.clone(),
                    content,
                })
                .await?;
            match response {
                Response::CopyIn { success } => {
                    if !success {
                        warn!(
                            pathname = %destination,
                            host = %self.hostname,
                            "worker could not write file"
                        );
                    }
                }
                other => return Err(Self::mismatch(RequestKind::CopyIn, &other)),
            }
        }
        Ok(())
    }

    async fn execute(&mut self, frame: i64) -> Result<(), SessionError> {
        let job = Arc::clone(&self.job);
        let arguments = job
            .arguments
            .iter()
            .map(|argument| subst::substitute(argument, frame))
            .collect();
        let response = self
            .transact(&Request::Execute {
                executable: job.executable.clone(),
                arguments,
            })
            .await?;
        match response {
            Response::Execute { status } => {
                if status != 0 {
                    warn!(
                        frame,
                        status,
                        host = %self.hostname,
                        "command exited with non-zero status"
                    );
                }
                Ok(())
            }
            other => Err(Self::mismatch(RequestKind::Execute, &other)),
        }
    }

    /// Fetch every copy-out whose classification matches the frame. The
    /// request names the remote source; the content lands in the local
    /// destination.
    async fn copy_out_pass(&mut self, frame: i64) -> Result<(), SessionError> {
        let job = Arc::clone(&self.job);
        for copy in &job.out_copies {
            if copy.per_frame() != (frame >= 0) {
                continue;
            }
            let source = subst::substitute(&copy.source, frame);
            let destination = subst::substitute(&copy.destination, frame);
            debug!(source = %source, destination = %destination, "copying out");

            let response = self
                .transact(&Request::CopyOut {
                    pathname: source.clone(),
                })
                .await?;
            match response {
                Response::CopyOut {
                    success: true,
                    content,
                } => {
                    paths::write_file(&destination, &content).map_err(|err| {
                        SessionError::LocalFile {
                            pathname: destination.clone(),
                            source: err,
                        }
                    })?;
                }
                Response::CopyOut { success: false, .. } => {
                    warn!(
                        pathname = %source,
                        host = %self.hostname,
                        "worker could not read file"
                    );
                }
                other => return Err(Self::mismatch(RequestKind::CopyOut, &other)),
            }
        }
        Ok(())
    }

    /// Run one frame end to end. The caller must only do this between
    /// [`Session::start`] and [`Session::finish`], one frame at a time.
    pub async fn run_frame(&mut self, frame: i64) -> Result<(), SessionError> {
        info!(frame, host = %self.hostname, "starting frame");
        self.copy_in_pass(frame).await?;
        self.execute(frame).await?;
        self.copy_out_pass(frame).await
    }

    /// The one-time copy-outs, after the last frame this worker will see.
    pub async fn finish(&mut self) -> Result<(), SessionError> {
        self.copy_out_pass(NO_FRAME).await
    }
}

/// Lifecycle notifications a session task sends the scheduler.
#[derive(Debug)]
pub enum Event {
    /// Reached the idle state; ready for a frame assignment.
    Idle { conn: usize },
    /// Completed the final copy-out pass. Terminal.
    Finished { conn: usize },
    /// The connection failed; `frame` is the assignment in flight, if any.
    /// Terminal.
    Failed {
        conn: usize,
        frame: Option<i64>,
        error: SessionError,
    },
}

/// Task body for one connection: run the lifecycle, taking assignments
/// until the scheduler closes the channel, then do the final copy-outs.
pub async fn drive<S>(
    mut session: Session<S>,
    conn: usize,
    mut assignments: mpsc::Receiver<i64>,
    events: mpsc::UnboundedSender<Event>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(error) = session.start().await {
        let _ = events.send(Event::Failed {
            conn,
            frame: None,
            error,
        });
        return;
    }
    let _ = events.send(Event::Idle { conn });

    while let Some(frame) = assignments.recv().await {
        if let Err(error) = session.run_frame(frame).await {
            let _ = events.send(Event::Failed {
                conn,
                frame: Some(frame),
                error,
            });
            return;
        }
        let _ = events.send(Event::Idle { conn });
    }

    // Assignment channel closed: no more frames for this worker.
    match session.finish().await {
        Ok(()) => {
            let _ = events.send(Event::Finished { conn });
        }
        Err(error) => {
            let _ = events.send(Event::Failed {
                conn,
                frame: None,
                error,
            });
        }
    }
}
