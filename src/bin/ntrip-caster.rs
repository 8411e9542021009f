use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, info, level_filters::LevelFilter};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{fmt::Subscriber as FmtSubscriber, EnvFilter};

use ntrip_caster::{
    geocode::NullReverseGeocoder, AdminSurface, Catalog, Config, FanoutEngine, Registry,
    SourcetableCache,
};

/// NTRIP caster: TCP relay and fan-out engine for GNSS correction streams
#[derive(Clone, PartialEq, Debug, Parser)]
struct Args {
    #[clap(long, default_value = "caster.toml")]
    /// Path to the caster's TOML configuration file
    pub config: PathBuf,

    #[clap(long, default_value = "info")]
    /// Set log level, overriding the configuration file's `log.level`
    pub log_level: Option<LevelFilter>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let level = args.log_level.unwrap_or_else(|| {
        config.log.level.parse().unwrap_or(LevelFilter::INFO)
    });

    let file_appender = tracing_appender::rolling::never(&config.log.dir, "caster.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let _ = FmtSubscriber::builder()
        .compact()
        .with_max_level(level)
        .with_env_filter(filter)
        .with_writer(file_writer.and(std::io::stdout))
        .try_init();

    info!("starting NTRIP caster");
    debug!("config: {config:?}");

    let catalog = Arc::new(Catalog::open(
        &config.catalog_path,
        &config.default_admin.username,
        &config.default_admin.password,
    )?);
    let registry = Arc::new(Registry::new(config.max_user_connections_per_mount));
    let fanout = Arc::new(FanoutEngine::new(registry.clone(), config.data_send_timeout()));
    let sourcetable = Arc::new(SourcetableCache::new(
        PathBuf::from(&config.mount_list_path),
        config.app.clone(),
        config.caster.clone(),
        config.host.clone(),
        config.ntrip_port,
    ));
    let geocoder = Arc::new(NullReverseGeocoder);
    let _admin = AdminSurface::new(registry.clone());

    let shutdown = tokio_util::sync::CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("received Ctrl-C, shutting down");
                shutdown.cancel();
            }
        }
    });

    let caster = Arc::new(ntrip_caster::Caster {
        config: Arc::new(config.clone()),
        catalog,
        registry: registry.clone(),
        fanout: fanout.clone(),
        sourcetable,
        geocoder,
    });

    let broadcast_interval = config.broadcast_interval();
    let broadcast_fanout = fanout.clone();
    let broadcast_shutdown = shutdown.clone();
    let broadcast_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(broadcast_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => broadcast_fanout.broadcast_tick().await,
                _ = broadcast_shutdown.cancelled() => break,
            }
        }
    });

    let reaper_task = tokio::spawn(ntrip_caster::reaper::run(
        registry,
        config.mount_timeout(),
        config.client_timeout(),
        shutdown.clone(),
    ));

    ntrip_caster::protocol::run(caster, shutdown).await?;

    let _ = broadcast_task.await;
    let _ = reaper_task.await;
    info!("shutdown complete");
    Ok(())
}
