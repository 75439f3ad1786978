//! The worker role: serve framed requests from one controller, in order.
//!
//! The worker dials a controller (or a proxy fronting one) and then runs a
//! synchronous request/reply loop: read one framed request, act on it,
//! send the framed response. File and child-process failures are reported
//! in-band and never end the loop; only the transport does.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, DEFAULT_WORKER_PORT};
use crate::paths;
use crate::protocol::{blocking, Request, Response, WireError};

pub fn run(endpoint: &Endpoint, password: &str, root: &Path) -> Result<()> {
    let addr = endpoint.dial_addr(DEFAULT_WORKER_PORT);
    let stream = TcpStream::connect(&addr).with_context(|| format!("connecting to {addr}"))?;
    info!(%addr, root = %root.display(), "connected");
    serve_connection(stream, password, root)
}

/// Serve requests until the controller closes the connection.
pub fn serve_connection<S: Read + Write>(
    mut stream: S,
    password: &str,
    root: &Path,
) -> Result<()> {
    loop {
        let request: Request = match blocking::read_message(&mut stream) {
            Ok(request) => request,
            Err(WireError::Closed) => {
                info!("controller closed the connection");
                return Ok(());
            }
            Err(err) => return Err(err).context("reading request"),
        };
        let response = handle_request(request, password, root);
        blocking::write_message(&mut stream, &response).context("sending response")?;
    }
}

fn handle_request(request: Request, password: &str, root: &Path) -> Response {
    match request {
        Request::Welcome => Response::Welcome {
            hostname: local_hostname(),
            core_count: core_count(),
            password: password.to_string(),
        },
        Request::CopyIn { pathname, content } => Response::CopyIn {
            success: save_file(root, &pathname, &content),
        },
        Request::Execute {
            executable,
            arguments,
        } => Response::Execute {
            status: execute(root, &executable, &arguments),
        },
        Request::CopyOut { pathname } => match load_file(root, &pathname) {
            Some(content) => Response::CopyOut {
                success: true,
                content,
            },
            None => Response::CopyOut {
                success: false,
                content: Vec::new(),
            },
        },
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn core_count() -> u32 {
    std::thread::available_parallelism()
        .map(|cores| cores.get() as u32)
        .unwrap_or(1)
}

fn save_file(root: &Path, pathname: &str, content: &[u8]) -> bool {
    if !paths::is_local(pathname) {
        warn!(pathname, "refusing to write non-local pathname");
        return false;
    }
    match paths::write_file(paths::under_root(root, pathname), content) {
        Ok(()) => {
            debug!(pathname, bytes = content.len(), "wrote file");
            true
        }
        Err(err) => {
            warn!(pathname, error = %err, "could not write file");
            false
        }
    }
}

fn load_file(root: &Path, pathname: &str) -> Option<Vec<u8>> {
    if !paths::is_local(pathname) {
        warn!(pathname, "refusing to read non-local pathname");
        return None;
    }
    match paths::read_file(paths::under_root(root, pathname)) {
        Ok(content) => {
            debug!(pathname, bytes = content.len(), "read file");
            Some(content)
        }
        Err(err) => {
            warn!(pathname, error = %err, "could not read file");
            None
        }
    }
}

/// Run the command and wait for it. The executable must be a local path
/// under the root; it is invoked directly, with no path search and no
/// environment changes. Spawn failures report as status -1.
fn execute(root: &Path, executable: &str, arguments: &[String]) -> i32 {
    if !paths::is_local(executable) {
        warn!(executable, "refusing to run non-local executable");
        return -1;
    }

    let program: PathBuf = paths::under_root(root, executable);
    debug!(executable, ?arguments, "running command");
    match Command::new(&program)
        .args(arguments)
        .current_dir(root)
        .status()
    {
        Ok(status) => {
            let status = exit_code(status);
            debug!(executable, status, "command finished");
            status
        }
        Err(err) => {
            warn!(executable, error = %err, "could not run command");
            -1
        }
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::blocking::{read_message, write_message};
    use std::io::{self, Cursor};

    /// One-directional fake socket: requests come from `input`, responses
    /// land in `output`.
    struct Pipe {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn serve(requests: &[Request], password: &str, root: &Path) -> Vec<Response> {
        let mut input = Vec::new();
        for request in requests {
            write_message(&mut input, request).unwrap();
        }
        let mut pipe = Pipe {
            input: Cursor::new(input),
            output: Vec::new(),
        };
        serve_connection(&mut pipe, password, root).unwrap();

        let mut responses = Vec::new();
        let mut cursor = Cursor::new(pipe.output);
        while let Ok(response) = read_message::<_, Response>(&mut cursor) {
            responses.push(response);
        }
        responses
    }

    #[test]
    fn welcome_reports_identity() {
        let dir = tempfile::tempdir().unwrap();
        let responses = serve(&[Request::Welcome], "hunter2", dir.path());
        match &responses[..] {
            [Response::Welcome {
                core_count,
                password,
                ..
            }] => {
                assert!(*core_count >= 1);
                assert_eq!(password, "hunter2");
            }
            other => panic!("got {other:?}"),
        }
    }

    #[test]
    fn copy_in_then_out_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let responses = serve(
            &[
                Request::CopyIn {
                    pathname: "nested/in.txt".into(),
                    content: b"payload".to_vec(),
                },
                Request::CopyOut {
                    pathname: "nested/in.txt".into(),
                },
            ],
            "",
            dir.path(),
        );
        assert!(matches!(responses[0], Response::CopyIn { success: true }));
        match &responses[1] {
            Response::CopyOut { success, content } => {
                assert!(success);
                assert_eq!(content, b"payload");
            }
            other => panic!("got {other:?}"),
        }
        assert_eq!(
            std::fs::read(dir.path().join("nested/in.txt")).unwrap(),
            b"payload"
        );
    }

    #[test]
    fn non_local_pathnames_fail_in_band() {
        let dir = tempfile::tempdir().unwrap();
        let responses = serve(
            &[
                Request::CopyIn {
                    pathname: "/etc/shadow".into(),
                    content: vec![1],
                },
                Request::CopyOut {
                    pathname: "a/../../escape".into(),
                },
                Request::Execute {
                    executable: "/bin/true".into(),
                    arguments: vec![],
                },
            ],
            "",
            dir.path(),
        );
        assert!(matches!(responses[0], Response::CopyIn { success: false }));
        assert!(matches!(
            responses[1],
            Response::CopyOut { success: false, .. }
        ));
        assert!(matches!(responses[2], Response::Execute { status: -1 }));
    }

    #[test]
    fn missing_file_copy_out_fails_in_band() {
        let dir = tempfile::tempdir().unwrap();
        let responses = serve(
            &[Request::CopyOut {
                pathname: "absent.txt".into(),
            }],
            "",
            dir.path(),
        );
        assert!(matches!(
            responses[0],
            Response::CopyOut { success: false, .. }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn execute_runs_and_reports_status() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("job");
        std::fs::write(&script, "#!/bin/sh\necho \"ran $1\" > result.txt\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let responses = serve(
            &[Request::Execute {
                executable: "./job".into(),
                arguments: vec!["7".into()],
            }],
            "",
            dir.path(),
        );
        assert!(matches!(responses[0], Response::Execute { status: 3 }));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("result.txt")).unwrap(),
            "ran 7\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn execute_missing_program_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let responses = serve(
            &[Request::Execute {
                executable: "./absent".into(),
                arguments: vec![],
            }],
            "",
            dir.path(),
        );
        assert!(matches!(responses[0], Response::Execute { status: -1 }));
    }
}
