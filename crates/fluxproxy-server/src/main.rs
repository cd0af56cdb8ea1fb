use clap::Parser;
use fluxproxy_server::{Proxy, ProxyConfig};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "fluxproxy")]
#[command(version)]
#[command(about = "fluxproxy - write/query proxy with backup, batching and tag-based sharding")]
struct Args {
    #[arg(short, long, env = "FLUXPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// 覆盖配置中的日志级别
    #[arg(long)]
    log_level: Option<String>,

    /// 覆盖配置中的拓扑文件
    #[arg(long)]
    topology: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    if let Some(topology) = args.topology {
        config.topology_file = Some(topology);
    }

    fluxproxy_server::init_logging(&config.log.level, config.log.json);
    if let Some(path) = &args.config {
        info!("Loaded config from {:?}", path);
    }

    let proxy = Proxy::from_config(config)?;
    proxy.reload().await?;
    info!("fluxproxy started, clusters: {:?}", proxy.clusters().names());

    tokio::select! {
        result = proxy.run() => {
            if let Err(e) = result {
                error!("Proxy error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    proxy.shutdown().await;
    info!("fluxproxy stopped");
    Ok(())
}
