// Process-wide wiring: one token provider, one worker pool, and a loader
// handle that inbound handlers clone.

use std::sync::Arc;

use crate::{
    config::Config,
    coordinator::RateLoader,
    error::{ConfigError, LoadError},
    pool::{PoolStatsSnapshot, WorkerPool},
    token::TokenProvider,
    types::{LoadRatesRequest, RateSet},
    vendor::{Authenticator, RateFetcher},
};

pub struct RateService {
    tokens: TokenProvider,
    pool: Arc<WorkerPool>,
    loader: RateLoader,
}

impl RateService {
    pub fn start(
        config: &Config,
        authenticator: Arc<dyn Authenticator>,
        fetcher: Arc<dyn RateFetcher>,
    ) -> Result<Self, ConfigError> {
        config.token.validate()?;
        config.pool.validate()?;

        let tokens = TokenProvider::start(authenticator, &config.token);
        let pool = Arc::new(WorkerPool::start(
            config.pool.clone(),
            tokens.client(),
            fetcher,
        )?);
        let loader = RateLoader::new(pool.clone());

        Ok(Self {
            tokens,
            pool,
            loader,
        })
    }

    pub fn loader(&self) -> RateLoader {
        self.loader.clone()
    }

    pub async fn load_rates(&self, request: LoadRatesRequest) -> Result<RateSet, LoadError> {
        self.loader.load_rates(request).await
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.pool.stats()
    }

    // Pool first so in-flight jobs can still get tokens while draining
    pub async fn stop(&self) {
        self.pool.stop().await;
        self.tokens.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::PoolConfig, mock_vendor::MockVendor};
    use chrono::NaiveDate;

    fn request(n: usize) -> LoadRatesRequest {
        LoadRatesRequest::new(
            (0..n).map(|i| format!("hotel{i}")).collect(),
            NaiveDate::from_ymd_opt(2025, 8, 10).unwrap(),
            NaiveDate::from_ymd_opt(2025, 8, 12).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_lifecycle() {
        let vendor = Arc::new(MockVendor::new());
        vendor.set_delay(25);
        let config = Config {
            pool: PoolConfig::new(3, 6),
            ..Default::default()
        };
        let service = RateService::start(&config, vendor.clone(), vendor.clone()).unwrap();

        let set = service.load_rates(request(10)).await.unwrap();
        assert_eq!(set.len(), 10);
        assert_eq!(vendor.auth_calls(), 1);

        let loader = service.loader();
        let set = loader.load_rates(request(4)).await.unwrap();
        assert_eq!(set.len(), 4);
        assert_eq!(vendor.auth_calls(), 1);

        let stats = service.stats();
        assert_eq!(stats.jobs_submitted, 14);
        assert_eq!(stats.jobs_succeeded, 14);
        assert!(stats.peak_in_flight <= 3);

        service.stop().await;
        assert!(matches!(
            loader.load_rates(request(1)).await,
            Err(LoadError::ShutdownInProgress)
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let vendor = Arc::new(MockVendor::new());
        let config = Config {
            pool: PoolConfig::new(1, 0),
            ..Default::default()
        };
        assert!(RateService::start(&config, vendor.clone(), vendor).is_err());
    }
}
