use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use framefarm::endpoint::Endpoint;
use framefarm::frames::FrameRange;
use framefarm::job::{FileCopy, Job};
use framefarm::protocol::{blocking, Request, Response};
use framefarm::{controller, proxy, worker};

/// Pick a port that was free a moment ago.
fn free_port() -> u16 {
    let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = sock.local_addr().unwrap().port();
    drop(sock);
    port
}

/// Dial until the other side starts listening.
fn dial_with_retry(port: u16) -> std::net::TcpStream {
    for _ in 0..250 {
        if let Ok(stream) = std::net::TcpStream::connect(("127.0.0.1", port)) {
            return stream;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("could not connect to 127.0.0.1:{port}");
}

#[cfg(unix)]
fn write_script(dir: &Path, name: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(unix)]
fn render_job(ctrl_dir: &Path, frames: &str) -> Job {
    Job {
        frames: frames.parse::<FrameRange>().unwrap(),
        executable: "./job".into(),
        arguments: vec!["%d".into()],
        in_copies: vec![FileCopy::new(
            ctrl_dir.join("a.txt").to_string_lossy().into_owned(),
            "b.txt",
        )],
        out_copies: vec![FileCopy::new(
            "c-%d.png",
            ctrl_dir.join("d-%d.png").to_string_lossy().into_owned(),
        )],
        password: String::new(),
    }
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_worker_happy_path() -> Result<()> {
    let ctrl_dir = tempfile::tempdir()?;
    let worker_dir = tempfile::tempdir()?;

    std::fs::write(ctrl_dir.path().join("a.txt"), b"shared input\n")?;
    write_script(
        worker_dir.path(),
        "job",
        "#!/bin/sh\ncp b.txt \"c-$1.png\"\n",
    );

    let port = free_port();
    let worker_root = worker_dir.path().to_path_buf();
    let worker_thread = std::thread::spawn(move || {
        let stream = dial_with_retry(port);
        worker::serve_connection(stream, "", &worker_root)
    });

    let job = render_job(ctrl_dir.path(), "1,2");
    let listen: Endpoint = format!(":{port}").parse()?;
    controller::run(job, listen, Vec::new()).await?;

    worker_thread.join().unwrap()?;

    for frame in [1, 2] {
        let output = std::fs::read(ctrl_dir.path().join(format!("d-{frame}.png")))?;
        assert_eq!(output, b"shared input\n", "frame {frame}");
    }
    Ok(())
}

/// A worker that completes the handshake and the one-time copy-in, then
/// drops the connection the moment it is told to execute a frame.
#[cfg(unix)]
fn doomed_worker(port: u16) {
    let mut stream = dial_with_retry(port);
    loop {
        let request: Request = match blocking::read_message(&mut stream) {
            Ok(request) => request,
            Err(_) => return,
        };
        let response = match request {
            Request::Welcome => Response::Welcome {
                hostname: "doomed".into(),
                core_count: 1,
                password: String::new(),
            },
            Request::CopyIn { .. } => Response::CopyIn { success: true },
            Request::Execute { .. } => return, // die mid-frame
            Request::CopyOut { .. } => Response::CopyOut {
                success: false,
                content: Vec::new(),
            },
        };
        if blocking::write_message(&mut stream, &response).is_err() {
            return;
        }
    }
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn frame_from_dead_worker_is_requeued() -> Result<()> {
    let ctrl_dir = tempfile::tempdir()?;
    let worker_dir = tempfile::tempdir()?;

    std::fs::write(ctrl_dir.path().join("a.txt"), b"shared input\n")?;
    write_script(
        worker_dir.path(),
        "job",
        "#!/bin/sh\nsleep 0.3\ncp b.txt \"c-$1.png\"\n",
    );

    let port = free_port();

    // The doomed worker connects first, so the scheduler is certain to
    // hand it a frame; that frame must come back and finish elsewhere.
    let doomed_thread = std::thread::spawn(move || doomed_worker(port));
    std::thread::sleep(Duration::from_millis(50));

    let worker_root = worker_dir.path().to_path_buf();
    let worker_thread = std::thread::spawn(move || {
        let stream = dial_with_retry(port);
        worker::serve_connection(stream, "", &worker_root)
    });

    let job = render_job(ctrl_dir.path(), "1,3");
    let listen: Endpoint = format!(":{port}").parse()?;
    controller::run(job, listen, Vec::new()).await?;

    doomed_thread.join().unwrap();
    worker_thread.join().unwrap()?;

    for frame in [1, 2, 3] {
        let output = std::fs::read(ctrl_dir.path().join(format!("d-{frame}.png")))?;
        assert_eq!(output, b"shared input\n", "frame {frame}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proxy_pairs_first_worker_with_first_controller() -> Result<()> {
    let worker_port = free_port();
    let controller_port = free_port();
    let proxy_task = tokio::spawn(proxy::run(
        format!(":{worker_port}").parse().unwrap(),
        format!(":{controller_port}").parse().unwrap(),
    ));

    // Worker side arrives first and waits half-open.
    let worker_side = tokio::task::spawn_blocking(move || {
        let mut stream = dial_with_retry(worker_port);
        let mut greeting = [0u8; 5];
        stream.read_exact(&mut greeting).unwrap();
        assert_eq!(&greeting, b"hello");
        stream.write_all(b"world").unwrap();
        // The far side hanging up must surface as EOF here.
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    });

    std::thread::sleep(Duration::from_millis(50));
    let controller_side = tokio::task::spawn_blocking(move || {
        let mut stream = dial_with_retry(controller_port);
        stream.write_all(b"hello").unwrap();
        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"world");
        drop(stream);
    });

    controller_side.await?;
    worker_side.await?;
    proxy_task.abort();
    Ok(())
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_run_through_a_proxy() -> Result<()> {
    let ctrl_dir = tempfile::tempdir()?;
    let worker_dir = tempfile::tempdir()?;

    std::fs::write(ctrl_dir.path().join("a.txt"), b"proxied input\n")?;
    write_script(
        worker_dir.path(),
        "job",
        "#!/bin/sh\ncp b.txt \"c-$1.png\"\n",
    );

    let worker_port = free_port();
    let controller_port = free_port();
    let proxy_task = tokio::spawn(proxy::run(
        format!(":{worker_port}").parse().unwrap(),
        format!(":{controller_port}").parse().unwrap(),
    ));

    // Worker dials the proxy before any controller exists.
    let worker_root = worker_dir.path().to_path_buf();
    let worker_thread = std::thread::spawn(move || {
        let stream = dial_with_retry(worker_port);
        worker::serve_connection(stream, "", &worker_root)
    });
    std::thread::sleep(Duration::from_millis(50));

    let job = render_job(ctrl_dir.path(), "4");
    let listen: Endpoint = format!(":{}", free_port()).parse()?;
    let proxies = vec![format!("127.0.0.1:{controller_port}").parse().unwrap()];
    controller::run(job, listen, proxies).await?;

    worker_thread.join().unwrap()?;
    proxy_task.abort();

    let output = std::fs::read(ctrl_dir.path().join("d-4.png"))?;
    assert_eq!(output, b"proxied input\n");
    Ok(())
}
