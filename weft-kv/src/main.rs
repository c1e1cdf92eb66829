use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use weft_kv::config::{PinConfig, ServerConfig};
use weft_kv::net_worker::Policy;
use weft_kv::supervisor::{Server, install_signal_handlers};

/// KV Server options
#[derive(Parser, Debug)]
#[command(name = "weft-kv")]
struct Opts {
    /// Server IP
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// Server port
    #[arg(long, default_value_t = 12345)]
    port: u16,

    /// Initial commands
    #[arg(long = "cmd-file")]
    cmd_file: Option<PathBuf>,

    /// Experiment log directory
    #[arg(long = "log-dir", short = 'L', default_value = "./")]
    log_dir: PathBuf,

    /// Number of store workers
    #[arg(long, short = 'w', default_value_t = 1)]
    workers: usize,

    /// Turn on latency recording
    #[arg(long = "record-lat", short = 'r')]
    record_lat: bool,

    /// Worker choice function (RR or KEY)
    #[arg(long, short = 'c', value_enum, default_value = "RR")]
    choice: PolicyArg,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum PolicyArg {
    #[value(name = "RR")]
    Rr,
    #[value(name = "KEY")]
    Key,
}

impl From<PolicyArg> for Policy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Rr => Policy::RoundRobin,
            PolicyArg::Key => Policy::Key,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            use clap::error::ErrorKind;
            let code: u8 = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let ip: Ipv4Addr = match opts.ip.parse() {
        Ok(ip) => ip,
        Err(_) => {
            error!(ip = %opts.ip, "could not parse server ip");
            return ExitCode::from(255);
        }
    };

    let config = ServerConfig {
        bind: SocketAddr::from((ip, opts.port)),
        cmd_file: opts.cmd_file,
        workers: opts.workers,
        policy: opts.choice.into(),
        latency_log: opts.record_lat.then(|| opts.log_dir.join("net_traces")),
        pinning: PinConfig::default(),
    };

    info!(addr = %config.bind, workers = config.workers, "launching kv server");
    install_signal_handlers();

    let server = match Server::launch(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "server failed to launch");
            return ExitCode::from(255);
        }
    };
    match server.supervise() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server terminated with error");
            ExitCode::from(255)
        }
    }
}
