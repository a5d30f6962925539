use std::{net::ToSocketAddrs, sync::Arc, time::Duration};

use clap::Parser;
use once_cell::sync::OnceCell;
use pgrollback_config::loader::ConfigLoader;
use pgrollback_core::{
    config::ProxyConfig,
    err::{Context, Result},
};
use pgrollback_logging::{error, info};
use pgrollback_pg::{handler::PostgresConnectionHandler, registry::SessionRegistry};
use pgrollback_proxy::{
    conf::{HandlerConf, ProxyConf},
    server::ProxyServer,
};
use pgrollback_web::{HttpApi, HttpApiState};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};

mod args;

use args::Args;

/// How often idle sessions are swept
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// The proxy configuration lives for the whole process
static CONFIG: OnceCell<ProxyConfig> = OnceCell::new();

/// This is the entrypoint to booting the proxy
fn main() {
    pgrollback_logging::init_logging().unwrap();
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    info!("Loading configuration...");
    let loaded = ConfigLoader::new().load(args.config.as_deref());

    let conf = match loaded {
        Ok(conf) => CONFIG.get_or_init(|| conf),
        Err(err) => {
            error!("Failed to load configuration: {:?}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = run(conf) {
        error!("Failed to start: {:?}", err);
        std::process::exit(2);
    }

    info!("Shutdown complete");
}

fn run(conf: &'static ProxyConfig) -> Result<()> {
    let registry = Arc::new(SessionRegistry::new(conf));

    let addr = conf
        .proxy
        .addr()
        .to_socket_addrs()
        .context("Failed to resolve listen address")?
        .next()
        .context("Listen address resolved to nothing")?;

    // Background runtime for the dashboard api and the idle sweeper; the
    // proxy server runs its connection handlers on its own runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("pgrollback-tasks")
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    info!("Starting dashboard api...");
    let http_api = runtime
        .block_on(HttpApi::start(HttpApiState::new(Arc::clone(&registry))))
        .context("Failed to start http api")?;

    let proxy_conf: &'static ProxyConf = Box::leak(Box::new(ProxyConf {
        addr,
        handlers: HandlerConf::new(
            PostgresConnectionHandler::new(Arc::clone(&registry)),
            http_api.handler(),
        ),
    }));

    info!("Starting proxy server...");
    let mut server = ProxyServer::new(proxy_conf);
    server.start().context("Failed to start proxy server")?;

    let sweeper_registry = Arc::clone(&registry);
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);

        loop {
            ticker.tick().await;

            let destroyed = sweeper_registry.cleanup_expired().await;
            if destroyed > 0 {
                info!("Destroyed {} idle session(s)", destroyed);
            }
        }
    });

    info!("Startup complete, listening on {}", addr);

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;
    let signal = signals.forever().next();
    info!("Received signal {:?}, shutting down", signal);

    // Roll every outer transaction back before the process exits
    runtime.block_on(registry.destroy_all());

    server.terminate()?;
    http_api.terminate()?;

    Ok(())
}
