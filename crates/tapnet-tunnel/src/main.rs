//! `tunnelctl` entry point.
//!
//! Drives one control connection per (server, instance) pair. In quiet
//! mode the only stdout is the resulting port number, or `-1` on failure,
//! so scripts can capture it directly.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tapnet_tunnel::{
    ForwardSpec, RemoteSpec, Session, SshTransport, TargetSpec, TunnelConfig, TunnelError,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tunnelctl", about = "Tunnel control connection client")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', long = "config", default_value = "tunnels.toml")]
    config: PathBuf,

    /// Quiet: print only the port number (or -1). Used in scripts.
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Establish a SOCKS listener on attach.
    #[arg(short = 's', long)]
    socks: bool,

    /// Verbose logging.
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Verb,
}

#[derive(Debug, Subcommand)]
enum Verb {
    /// Create (or reuse) the control connection.
    Attach,
    /// Tear the control connection down and forget all mappings.
    Detach,
    /// Add a forward mapping, `local:host:remote`.
    Forward { spec: String },
    /// Add a reverse mapping, `remote:host:local`.
    Remote { spec: String },
    /// Forward to `host:remote`, picking a free local port automatically.
    Autoforward { target: String },
    /// Reverse-forward `host:remote`, picking a free local port automatically.
    Autoremote { target: String },
    /// Show attachment state and active mappings.
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = format!("tapnet_tunnel={level}").parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if !cli.quiet {
        println!("Tunnel Setup");
    }

    match run(&cli).await {
        Ok(()) => {}
        Err(e) => {
            if cli.quiet {
                // Bare sentinel for scripts capturing stdout.
                println!("-1");
            } else {
                eprintln!("{e}");
            }
            std::process::exit(1);
        }
    }
}

async fn run(cli: &Cli) -> Result<(), TunnelError> {
    let config = TunnelConfig::load(&cli.config)?;
    let session = Session::from_config(&config)?;
    let transport = SshTransport::new(&config);

    match &cli.command {
        Verb::Attach => {
            let socks = (cli.socks || config.proxy.socks_active)
                .then_some((config.proxy.socks_start, config.proxy.socks_end));
            // Scripts are assumed to want a fresh master each time.
            let socks_port = session.attach(&transport, socks, cli.quiet).await?;
            if cli.quiet {
                if let Some(port) = socks_port {
                    println!("{port}");
                }
            } else {
                println!("Server {} is now attached", session.server());
                if let Some(port) = socks_port {
                    println!("Socks server on port {port}");
                }
            }
        }
        Verb::Detach => {
            session.detach(&transport).await?;
            if !cli.quiet {
                println!("Server {} is now detached", session.server());
            }
        }
        Verb::Forward { spec } => {
            let spec = ForwardSpec::parse(spec)?;
            let outcome = session.forward(&transport, &spec).await?;
            report_mapping(cli.quiet, "Forward", &spec.to_string(), &outcome);
        }
        Verb::Remote { spec } => {
            let spec = RemoteSpec::parse(spec)?;
            let outcome = session.remote(&transport, &spec).await?;
            report_mapping(cli.quiet, "Remote", &spec.to_string(), &outcome);
        }
        Verb::Autoforward { target } => {
            let target = TargetSpec::parse(target)?;
            let outcome = session
                .autoforward(&transport, &target, (config.port_start, config.port_end))
                .await?;
            if cli.quiet {
                println!("{}", outcome.local_port);
            } else {
                println!(
                    "Forward tunnel {}:{}:{} active",
                    outcome.local_port, target.host, target.port
                );
            }
        }
        Verb::Autoremote { target } => {
            let target = TargetSpec::parse(target)?;
            let outcome = session
                .autoremote(&transport, &target, (config.port_start, config.port_end))
                .await?;
            if cli.quiet {
                println!("{}", outcome.local_port);
            } else {
                println!(
                    "Remote tunnel {}:{}:{} active",
                    target.port, target.host, outcome.local_port
                );
            }
        }
        Verb::Config => {
            let (attached, records) = session.status()?;
            println!("Configuration:");
            println!("Instance: {}", session.instance());
            println!("Server: {}", session.server());
            if attached {
                println!("Attached to proxy {}", session.server());
            } else {
                println!("Not attached");
            }
            if records.is_empty() {
                println!("No active tunnels");
            } else {
                println!("Tunnels:");
                for record in records {
                    println!("{record}");
                }
            }
        }
    }
    Ok(())
}

fn report_mapping(quiet: bool, kind: &str, spec: &str, outcome: &tapnet_tunnel::MappingOutcome) {
    if quiet {
        println!("{}", outcome.local_port);
    } else if outcome.existing {
        println!("{kind} tunnel {spec} is already active");
    } else {
        println!("{kind} tunnel {spec} active");
    }
}
