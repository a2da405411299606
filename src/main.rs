use std::{path::PathBuf, sync::Arc, time::Instant};

use anyhow::Context;
use chrono::{Duration, NaiveDate};
use clap::Parser;
use hotel_rate_loader::{
    archive::{ArchiveSink, MemoryArchive},
    mock_vendor::{MockVendor, ServerMode},
    vendor::{HttpAuthenticator, HttpRateFetcher},
    Authenticator, Config, LoadError, LoadRatesRequest, RateFetcher, RateService,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rate-loader", about = "Load hotel rates through a bounded worker pool")]
struct Args {
    /// JSON config file; flags below override it
    #[arg(long, env = "RATE_LOADER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "RATE_LOADER_WORKERS")]
    workers: Option<usize>,

    #[arg(long, env = "RATE_LOADER_INTAKE_CAPACITY")]
    intake_capacity: Option<usize>,

    /// Number of hotels to request (hotel0..hotelN)
    #[arg(long, default_value_t = 20)]
    hotels: usize,

    #[arg(long, default_value = "2025-06-01")]
    check_in: NaiveDate,

    #[arg(long, default_value_t = 2)]
    nights: i64,

    /// Simulated vendor latency per call
    #[arg(long, default_value_t = 100)]
    delay_ms: u64,

    /// Simulated vendor: fail every N-th hotel (0 = never)
    #[arg(long, default_value_t = 0)]
    fail_every: usize,

    /// Simulated vendor: randomly fail ~20% of calls
    #[arg(long)]
    flaky: bool,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn simulated_vendor(args: &Args) -> Arc<MockVendor> {
    let vendor = Arc::new(MockVendor::new());
    vendor.set_delay(args.delay_ms);
    if args.flaky {
        vendor.set_mode(ServerMode::Overloaded);
    }
    if args.fail_every > 0 {
        for i in (0..args.hotels).filter(|i| (i + 1) % args.fail_every == 0) {
            vendor.fail_hotel(&format!("hotel{i}"));
        }
    }
    vendor
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(workers) = args.workers {
        config.pool.worker_count = workers;
    }
    if let Some(capacity) = args.intake_capacity {
        config.pool.intake_queue_capacity = capacity;
    }
    config.validate()?;

    let mut archive_task = None;
    let (authenticator, fetcher): (Arc<dyn Authenticator>, Arc<dyn RateFetcher>) =
        match &config.vendor {
            Some(vendor_config) => {
                let mut fetcher = HttpRateFetcher::new(vendor_config)?;
                if config.archive.enabled {
                    let (sink, task) =
                        ArchiveSink::start(Arc::new(MemoryArchive::new()), config.archive.queue_capacity);
                    fetcher = fetcher.with_archive(sink);
                    archive_task = Some(task);
                }
                let authenticator = HttpAuthenticator::new(vendor_config.clone())?;
                (Arc::new(authenticator) as Arc<dyn Authenticator>, Arc::new(fetcher) as Arc<dyn RateFetcher>)
            }
            None => {
                tracing::info!("no vendor configured, using simulated vendor");
                let vendor = simulated_vendor(&args);
                (vendor.clone() as Arc<dyn Authenticator>, vendor as Arc<dyn RateFetcher>)
            }
        };

    let service = RateService::start(&config, authenticator, fetcher)?;

    let request = LoadRatesRequest::new(
        (0..args.hotels).map(|i| format!("hotel{i}")).collect(),
        args.check_in,
        args.check_in + Duration::days(args.nights),
    )?;

    let started = Instant::now();
    let outcome = service.load_rates(request).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let stats = service.stats();
    service.stop().await;
    drop(service);
    if let Some(task) = archive_task {
        // the sink lives in the fetcher, which is gone with the service
        task.await?;
    }

    let summary = match outcome {
        Ok(set) => json!({
            "status": "ok",
            "elapsed_ms": elapsed_ms,
            "succeeded": set.successes().count(),
            "failed": set.failures().count(),
            "rates": set.successes().map(|(hotel, rate)| json!({ "hotel_id": hotel, "rate": rate })).collect::<Vec<_>>(),
            "failures": set.failures().map(|(hotel, e)| json!({ "hotel_id": hotel, "error": e.to_string() })).collect::<Vec<_>>(),
            "pool": stats,
        }),
        Err(LoadError::NoRatesFound { failures }) => json!({
            "status": "no_rates_found",
            "elapsed_ms": elapsed_ms,
            "failed": failures.len(),
            "pool": stats,
        }),
        Err(e) => return Err(e.into()),
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
