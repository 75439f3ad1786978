//! framefarm: distribute a per-frame batch command across remote workers.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use framefarm::endpoint::Endpoint;
use framefarm::frames::FrameRange;
use framefarm::job::{FileCopy, Job};
use framefarm::paths;
use framefarm::{controller, proxy, worker};

#[derive(Parser, Debug)]
#[command(
    name = "framefarm",
    version,
    about = "Distribute a per-frame batch command across a pool of remote workers"
)]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Serve jobs for a controller or proxy.
    Worker {
        /// Endpoint of the controller or proxy to connect to [:1120].
        endpoint: Endpoint,

        /// Password to present to the controller.
        #[arg(long, default_value = "")]
        password: String,

        /// Directory to keep job files in and run commands from.
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },

    /// Relay workers behind restricted networks to a controller.
    Proxy {
        /// Endpoint to listen for workers on [:1120].
        #[arg(long = "worker-listen", default_value = "")]
        worker_listen: Endpoint,

        /// Endpoint to listen for controllers on [:1121].
        #[arg(long = "controller-listen", default_value = "")]
        controller_listen: Endpoint,
    },

    /// Distribute frames of work across connected workers.
    Controller {
        /// Proxy endpoint to dial for workers [:1121]. Can be repeated.
        #[arg(long = "proxy")]
        proxies: Vec<Endpoint>,

        /// Copy LOCAL to REMOTE before the run (or per frame when either
        /// pathname mentions the frame). Can be repeated.
        #[arg(long = "in", num_args = 2, value_names = ["LOCAL", "REMOTE"], action = ArgAction::Append)]
        in_copies: Vec<String>,

        /// Copy REMOTE to LOCAL after each frame (or once at the end when
        /// neither pathname mentions the frame). Can be repeated.
        #[arg(long = "out", num_args = 2, value_names = ["REMOTE", "LOCAL"], action = ArgAction::Append)]
        out_copies: Vec<String>,

        /// Endpoint to listen on for direct workers [:1120].
        #[arg(long, default_value = "")]
        listen: Endpoint,

        /// Password expected from workers.
        #[arg(long, default_value = "")]
        password: String,

        /// Frame range: FIRST[,LAST[,STEP]]. STEP defaults to 1 or -1
        /// depending on the order of FIRST and LAST; LAST defaults to FIRST.
        frames: FrameRange,

        /// Executable to run on each worker (a local path there).
        exec: String,

        /// Arguments for the executable; %d and %0Nd expand to the frame.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp
                | ErrorKind::DisplayVersion
                | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                | ErrorKind::MissingSubcommand => ExitCode::from(2),
                _ => ExitCode::from(1),
            };
        }
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("framefarm: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.role {
        Role::Worker {
            endpoint,
            password,
            root,
        } => worker::run(&endpoint, &password, &root),

        Role::Proxy {
            worker_listen,
            controller_listen,
        } => runtime()?.block_on(proxy::run(worker_listen, controller_listen)),

        Role::Controller {
            proxies,
            in_copies,
            out_copies,
            listen,
            password,
            frames,
            exec,
            args,
        } => {
            let job = build_job(frames, exec, args, &in_copies, &out_copies, password)?;
            runtime()?.block_on(controller::run(job, listen, proxies))
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}

/// Assemble the controller's job, rejecting non-local remote pathnames the
/// same way the worker will.
fn build_job(
    frames: FrameRange,
    executable: String,
    arguments: Vec<String>,
    in_copies: &[String],
    out_copies: &[String],
    password: String,
) -> Result<Job> {
    if !paths::is_local(&executable) {
        anyhow::bail!("executable must be a local path: {executable}");
    }

    // clap guarantees the pair flags arrive in twos.
    let in_copies: Vec<FileCopy> = in_copies
        .chunks_exact(2)
        .map(|pair| {
            let (local, remote) = (&pair[0], &pair[1]);
            if !paths::is_local(remote) {
                anyhow::bail!("remote pathname must be local with --in: {remote}");
            }
            Ok(FileCopy::new(local.clone(), remote.clone()))
        })
        .collect::<Result<_>>()?;

    let out_copies: Vec<FileCopy> = out_copies
        .chunks_exact(2)
        .map(|pair| {
            let (remote, local) = (&pair[0], &pair[1]);
            if !paths::is_local(remote) {
                anyhow::bail!("remote pathname must be local with --out: {remote}");
            }
            Ok(FileCopy::new(remote.clone(), local.clone()))
        })
        .collect::<Result<_>>()?;

    Ok(Job {
        frames,
        executable,
        arguments,
        in_copies,
        out_copies,
        password,
    })
}
