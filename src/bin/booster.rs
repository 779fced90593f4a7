//! Booster Binary
//!
//! Usage: booster [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>        Path to configuration file
//!   -p, --ports <PROXY> <BOOSTER>  Run with default settings on these ports
//!   -w, --wire <ADDR>          Booster to wire to at startup (repeatable)
//!   -g, --generate             Generate a configuration file
//!   -h, --help                 Print help information

use std::env;

use booster::{Booster, BoosterConfig, BoosterConfigFile, Error};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG (e.g. RUST_LOG=booster=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        print_usage();
        return Ok(());
    }

    let mut config: Option<BoosterConfig> = None;
    let mut peers: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            "-g" | "--generate" => {
                return generate_config();
            }
            "-c" | "--config" => {
                let path = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("--config requires a file path"))?;
                let (file_config, file_peers) = load_config(path)?;
                config = Some(file_config);
                peers.extend(file_peers);
                i += 2;
            }
            "-p" | "--ports" => {
                let (Some(pport), Some(bport)) = (args.get(i + 1), args.get(i + 2)) else {
                    anyhow::bail!("--ports requires a proxy port and a booster port");
                };
                config = Some(BoosterConfig::new(pport.parse()?, bport.parse()?));
                i += 3;
            }
            "-w" | "--wire" => {
                let addr = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("--wire requires an address"))?;
                peers.push(addr.clone());
                i += 2;
            }
            other => {
                eprintln!("Unknown option: {}", other);
                print_usage();
                return Ok(());
            }
        }
    }

    run_booster(config.unwrap_or_default(), peers).await
}

fn print_usage() {
    println!(
        r#"Booster - peer-to-peer SOCKS5 relay mesh

USAGE:
    booster [OPTIONS]

OPTIONS:
    -c, --config <FILE>             Path to configuration file
    -p, --ports <PROXY> <BOOSTER>   Run with default settings on these ports
    -w, --wire <ADDR>               Booster to wire to at startup (repeatable)
    -g, --generate                  Generate a configuration file
    -h, --help                      Print help information

EXAMPLES:
    Generate a configuration:
        booster --generate > booster.toml

    Run a node:
        booster --config booster.toml

    Run a second node on the same host and wire it to the first:
        booster --ports 1081 4885 --wire 127.0.0.1:4884
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let config_file = BoosterConfigFile::from_config(&BoosterConfig::default());

    println!("# Booster Configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!("# Protocol: {}", booster::VERSION);
    println!();
    println!("{}", toml::to_string_pretty(&config_file)?);

    Ok(())
}

fn load_config(path: &str) -> anyhow::Result<(BoosterConfig, Vec<String>)> {
    let content = std::fs::read_to_string(path)?;
    let config_file: BoosterConfigFile = toml::from_str(&content)?;
    let config = config_file.to_config().map_err(|e: String| anyhow::anyhow!(e))?;

    config.validate().map_err(|e: String| anyhow::anyhow!(e))?;

    Ok((config, config_file.peers))
}

async fn run_booster(config: BoosterConfig, peers: Vec<String>) -> anyhow::Result<()> {
    tracing::info!(
        "Starting booster {}: proxy port {}, booster port {}",
        booster::VERSION,
        config.proxy_port,
        config.booster_port
    );

    let node = Booster::new(config)?;

    for peer in peers {
        let node = node.clone();
        let ctx = node.stop_token();
        tokio::spawn(async move {
            match node.wire(ctx, "tcp", &peer).await {
                Ok(conn) => tracing::info!("Wired to {} ({})", peer, conn.peer_addr()),
                Err(e) => tracing::error!("Cannot wire to {}: {}", peer, e),
            }
        });
    }

    let res = node.run().await;
    tracing::info!("\n{}", node.metrics().format_report());

    match res {
        Ok(()) | Err(Error::Stopped) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
