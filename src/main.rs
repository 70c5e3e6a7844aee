use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use gridtrade::config::GridTradeConfig;
use gridtrade::gridtrade::types::{InstrumentId, InstrumentSpec};
use gridtrade::gridtrade::GridEngine;
use gridtrade::ports::paper_venue::PaperVenue;
use gridtrade::ports::replay_feed::ReplayFeed;
use log::LevelFilter;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::env;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

const PAPER_SEED: u64 = 42;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging with local timezone
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .unwrap_or_else(|_| "3600".to_string())
        .parse::<i32>()
        .expect("Invalid TIMEZONE_OFFSET");
    let offset = FixedOffset::east_opt(offset_seconds).expect("Invalid offset");
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
                .unwrap_or(LevelFilter::Debug),
        )
        .init();

    let git_hash = option_env!("GRIDTRADE_GIT_HASH").unwrap_or("unknown");
    log::info!("gridtrade git: {}", git_hash);

    let cfg = GridTradeConfig::from_env_or_yaml().expect("invalid grid config");
    let Some(replay_file) = cfg.replay_file.clone() else {
        log::error!("no replay_file configured; only replay mode is available");
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "replay_file is not configured",
        ));
    };

    let size_step = Decimal::from_f64(cfg.paper_size_step).unwrap_or_else(|| Decimal::new(1, 3));
    let specs = [&cfg.instrument_a, &cfg.instrument_b]
        .into_iter()
        .map(|id| InstrumentSpec {
            id: InstrumentId::new(id.as_str()),
            size_step,
            min_order: None,
        })
        .collect();
    let venue = Arc::new(PaperVenue::new(
        specs,
        cfg.paper_fill_probability,
        PAPER_SEED,
    ));

    log::info!("Starting grid replay from {}...", replay_file);
    let mut feed = ReplayFeed::new(&replay_file).expect("failed to load replay file");
    let mut engine = GridEngine::new(cfg, venue.clone(), venue.clone())
        .expect("failed to initialize grid engine");
    let summary = engine
        .run(&mut feed, &venue)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    log::info!("{:?}", summary);
    Ok(())
}
