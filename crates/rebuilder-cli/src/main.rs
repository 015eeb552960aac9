//! Rebuilder CLI Entry Point
//!
//! Main binary for the rebuild coordinator. Runs one of three roles:
//!
//! ```bash
//! # Start a build worker
//! rebuilder worker -l 0.0.0.0:12311 --cache-dir /var/cache/rebuilder -j 2
//!
//! # Start the admission balancer over two workers
//! rebuilder balancer -b host-a:12311 -b host-b:12311 -j 4
//!
//! # Rebuild two packages against the balancer
//! rebuilder rebuild -e localhost:12345 -a new_1.0_amd64.deb hello_2.10-1 jq_1.7-1
//! ```
//!
//! Addresses starting with `/` are treated as UNIX socket paths,
//! everything else as TCP endpoints.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use rebuilder_balancer::{BalancerConfig, BalancerServer};
use rebuilder_scheduler::{BuildJob, Scheduler, SchedulerConfig};
use rebuilder_worker::{WorkerConfig, WorkerServer};

#[derive(FromArgs)]
/// Rebuilder - distributed package rebuild coordinator
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Worker(WorkerArgs),
    Balancer(BalancerArgs),
    Rebuild(RebuildArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "worker")]
/// start a build worker (admission control + build execution)
struct WorkerArgs {
    /// address to listen on; a path starting with / binds a UNIX socket
    #[argh(option, short = 'l', default = "\"localhost:12311\".into()")]
    listen: String,

    /// address put into grants, for callers that cannot reach the
    /// listen address as written (defaults to the bound address)
    #[argh(option)]
    advertise: Option<String>,

    /// directory under which per-lease working directories are created
    #[argh(option, long = "cache-dir", default = "\"/var/cache/rebuilder\".into()")]
    cache_dir: String,

    /// maximum number of concurrently granted build leases
    #[argh(option, short = 'j', long = "concurrent-builds", default = "1")]
    concurrent_builds: usize,

    /// build tool to invoke inside each lease directory
    #[argh(option, long = "build-command", default = "\"sbuild\".into()")]
    build_command: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "balancer")]
/// start the round-robin admission balancer
struct BalancerArgs {
    /// address to listen on
    #[argh(option, short = 'l', default = "\"localhost:12345\".into()")]
    listen: String,

    /// worker address to balance over; may be given multiple times
    #[argh(option, short = 'b', long = "backend")]
    backends: Vec<String>,

    /// directory watched for dynamically appearing worker sockets
    #[argh(option, long = "socket-dir")]
    socket_dir: Option<String>,

    /// aggregate capacity advertised for the whole pool
    #[argh(option, short = 'j', long = "concurrent-builds", default = "8")]
    concurrent_builds: u32,

    /// backend discovery polling interval in seconds
    #[argh(option, long = "poll-interval", default = "1")]
    poll_interval_secs: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "rebuild")]
/// rebuild packages against a worker or balancer endpoint
struct RebuildArgs {
    /// admission endpoint: a worker, or the balancer in front of many
    #[argh(option, short = 'e', default = "\"localhost:12311\".into()")]
    endpoint: String,

    /// directory receiving one output directory per package
    #[argh(option, long = "log-dir", default = "\"buildlogs\".into()")]
    log_dir: String,

    /// local artifact file injected into every build; may be given
    /// multiple times
    #[argh(option, short = 'a', long = "extra-artifact")]
    extra_artifacts: Vec<String>,

    /// target distribution passed to the build tool
    #[argh(option, long = "dist", default = "String::new()")]
    distribution: String,

    /// delay between admission retries in seconds, shared across all
    /// packages
    #[argh(option, long = "retry-delay", default = "10")]
    retry_delay_secs: u64,

    /// re-run failed builds without injected artifacts to tell
    /// pre-existing breakage apart from regressions
    #[argh(switch)]
    recheck: bool,

    /// point log references at the build tool's own log file instead of
    /// the captured console output
    #[argh(switch, long = "keep-native-log")]
    keep_native_log: bool,

    /// suppress the live progress line
    #[argh(switch, short = 'q')]
    quiet: bool,

    /// packages to rebuild, each as name_version (e.g. hello_2.10-1)
    #[argh(positional)]
    packages: Vec<String>,
}

/// Splits a `name_version` spec at its last underscore.
fn parse_package_spec(spec: &str) -> Result<BuildJob> {
    match spec.rsplit_once('_') {
        Some((package, version)) if !package.is_empty() && !version.is_empty() => {
            Ok(BuildJob::new(package, version))
        }
        _ => anyhow::bail!(
            "invalid package spec {:?}: expected name_version (e.g. hello_2.10-1)",
            spec
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // The rebuild command owns the terminal (progress line + report),
    // so logging stays off there unless explicitly requested.
    if !matches!(cli.command, Commands::Rebuild(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    } else if std::env::var_os("RUST_LOG").is_some() {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }

    match cli.command {
        Commands::Worker(args) => run_worker(args).await,
        Commands::Balancer(args) => run_balancer(args).await,
        Commands::Rebuild(args) => run_rebuild(args).await,
    }
}

async fn run_worker(args: WorkerArgs) -> Result<()> {
    tracing::info!("starting worker on {}", args.listen);
    let mut config = WorkerConfig::new(args.listen.clone(), PathBuf::from(args.cache_dir));
    config.advertise = args.advertise;
    config.concurrent_builds = args.concurrent_builds;
    config.build_command = args.build_command;

    let server = WorkerServer::bind(config).await?;
    server.run().await?;
    Ok(())
}

async fn run_balancer(args: BalancerArgs) -> Result<()> {
    tracing::info!(
        "starting balancer on {} with {} static backend(s)",
        args.listen,
        args.backends.len()
    );
    let mut config = BalancerConfig::new(args.listen.clone());
    config.static_backends = args.backends;
    config.socket_dir = args.socket_dir.map(PathBuf::from);
    config.concurrent_builds = args.concurrent_builds;
    config.poll_interval = Duration::from_secs(args.poll_interval_secs);

    let server = BalancerServer::bind(config).await?;
    server.run().await?;
    Ok(())
}

async fn run_rebuild(args: RebuildArgs) -> Result<()> {
    if args.packages.is_empty() {
        anyhow::bail!("no packages given; pass each as name_version (e.g. hello_2.10-1)");
    }
    let jobs = args
        .packages
        .iter()
        .map(|spec| parse_package_spec(spec))
        .collect::<Result<Vec<_>>>()?;

    let mut config = SchedulerConfig::new(args.endpoint, PathBuf::from(args.log_dir));
    config.distribution = args.distribution;
    config.extra_artifacts = args.extra_artifacts.into_iter().map(PathBuf::from).collect();
    config.retry_delay = Duration::from_secs(args.retry_delay_secs);
    config.recheck = args.recheck;
    config.keep_native_log = args.keep_native_log;
    config.progress = !args.quiet;

    let report = Scheduler::new(config).run(jobs).await?;
    print!("{}", report.render());

    if report.has_failing() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_worker_defaults() {
        let cli = Cli::from_args(&["rebuilder"], &["worker"]).unwrap();
        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(args.listen, "localhost:12311");
                assert_eq!(args.cache_dir, "/var/cache/rebuilder");
                assert_eq!(args.concurrent_builds, 1);
                assert_eq!(args.build_command, "sbuild");
                assert!(args.advertise.is_none());
            }
            _ => panic!("expected worker command"),
        }
    }

    #[test]
    fn parse_worker_unix_socket_listen() {
        let cli = Cli::from_args(
            &["rebuilder"],
            &["worker", "-l", "/run/rebuilder/w1.sock", "-j", "4"],
        )
        .unwrap();
        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(args.listen, "/run/rebuilder/w1.sock");
                assert_eq!(args.concurrent_builds, 4);
            }
            _ => panic!("expected worker command"),
        }
    }

    #[test]
    fn parse_balancer_with_backends_and_socket_dir() {
        let cli = Cli::from_args(
            &["rebuilder"],
            &[
                "balancer",
                "-b", "host-a:12311",
                "-b", "host-b:12311",
                "--socket-dir", "/run/rebuilder",
            ],
        )
        .unwrap();
        match cli.command {
            Commands::Balancer(args) => {
                assert_eq!(
                    args.backends,
                    vec!["host-a:12311".to_string(), "host-b:12311".to_string()]
                );
                assert_eq!(args.socket_dir, Some("/run/rebuilder".to_string()));
                assert_eq!(args.concurrent_builds, 8);
                assert_eq!(args.poll_interval_secs, 1);
            }
            _ => panic!("expected balancer command"),
        }
    }

    #[test]
    fn parse_rebuild_with_flags() {
        let cli = Cli::from_args(
            &["rebuilder"],
            &[
                "rebuild",
                "-e", "localhost:12345",
                "--log-dir", "logs",
                "-a", "new_1.0_amd64.deb",
                "--recheck",
                "--keep-native-log",
                "hello_2.10-1",
                "jq_1.7-1",
            ],
        )
        .unwrap();
        match cli.command {
            Commands::Rebuild(args) => {
                assert_eq!(args.endpoint, "localhost:12345");
                assert_eq!(args.log_dir, "logs");
                assert_eq!(args.extra_artifacts, vec!["new_1.0_amd64.deb".to_string()]);
                assert!(args.recheck);
                assert!(args.keep_native_log);
                assert!(!args.quiet);
                assert_eq!(
                    args.packages,
                    vec!["hello_2.10-1".to_string(), "jq_1.7-1".to_string()]
                );
            }
            _ => panic!("expected rebuild command"),
        }
    }

    #[test]
    fn package_specs_split_at_the_last_underscore() {
        let job = parse_package_spec("libfoo-bar_1.2-3").unwrap();
        assert_eq!(job.package, "libfoo-bar");
        assert_eq!(job.version, "1.2-3");

        // Underscores inside the name belong to the name.
        let job = parse_package_spec("foo_bar_1.0").unwrap();
        assert_eq!(job.package, "foo_bar");
        assert_eq!(job.version, "1.0");

        assert!(parse_package_spec("noversion").is_err());
        assert!(parse_package_spec("_1.0").is_err());
        assert!(parse_package_spec("foo_").is_err());
    }
}
