// Simulated vendor for tests, benchmarks and the demo binary.
// Implements both collaborator traits and counts what it sees, including how
// many rate calls and auth calls overlap.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::{
    error::{AuthError, VendorError},
    types::{RateInfo, RateQuery, Token},
    vendor::{Authenticator, RateFetcher},
};

#[derive(Debug, Clone, Copy)]
pub enum ServerMode {
    Normal,
    Degraded,
    Overloaded,
    PartialOutage,
    CompleteOutage,
}

pub struct MockVendor {
    mode: AtomicU8,
    delay_ms: AtomicU64,
    auth_delay_ms: AtomicU64,
    token_ttl_ms: AtomicU64,
    fail_next_auth: AtomicUsize,
    fail_next_requests: AtomicUsize,
    panic_next_auth: AtomicUsize,
    failing_hotels: DashSet<String>,
    panicking_hotels: DashSet<String>,
    rates: DashMap<String, RateInfo>,
    auth_calls: AtomicUsize,
    request_count: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    auth_in_flight: AtomicUsize,
    peak_auth_in_flight: AtomicUsize,
}

// Decrements a counter when the call finishes or is dropped mid-flight
struct Inflight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> Inflight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for Inflight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MockVendor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVendor {
    pub fn new() -> Self {
        Self {
            mode: AtomicU8::new(0), // Normal mode
            delay_ms: AtomicU64::new(0),
            auth_delay_ms: AtomicU64::new(0),
            token_ttl_ms: AtomicU64::new(3_600_000),
            fail_next_auth: AtomicUsize::new(0),
            fail_next_requests: AtomicUsize::new(0),
            panic_next_auth: AtomicUsize::new(0),
            failing_hotels: DashSet::new(),
            panicking_hotels: DashSet::new(),
            rates: DashMap::new(),
            auth_calls: AtomicUsize::new(0),
            request_count: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            auth_in_flight: AtomicUsize::new(0),
            peak_auth_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn set_mode(&self, mode: ServerMode) {
        let mode_value = match mode {
            ServerMode::Normal => 0,
            ServerMode::Degraded => 1,
            ServerMode::Overloaded => 2,
            ServerMode::PartialOutage => 3,
            ServerMode::CompleteOutage => 4,
        };
        self.mode.store(mode_value, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay_ms: u64) {
        self.delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    pub fn set_auth_delay(&self, delay_ms: u64) {
        self.auth_delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    pub fn set_token_ttl(&self, ttl_ms: u64) {
        self.token_ttl_ms.store(ttl_ms, Ordering::SeqCst);
    }

    pub fn fail_next_auth(&self, count: usize) {
        self.fail_next_auth.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_requests(&self, count: usize) {
        self.fail_next_requests.store(count, Ordering::SeqCst);
    }

    // Every rate call for this hotel fails
    pub fn fail_hotel(&self, hotel_id: &str) {
        self.failing_hotels.insert(hotel_id.to_string());
    }

    // Misbehaving vendor: the next `count` auth calls panic instead of returning
    pub fn panic_next_auth(&self, count: usize) {
        self.panic_next_auth.store(count, Ordering::SeqCst);
    }

    pub fn panic_on_hotel(&self, hotel_id: &str) {
        self.panicking_hotels.insert(hotel_id.to_string());
    }

    pub fn add_rate(&self, hotel_id: &str, rate: RateInfo) {
        self.rates.insert(hotel_id.to_string(), rate);
    }

    pub fn auth_calls(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_concurrent_auth(&self) -> usize {
        self.peak_auth_in_flight.load(Ordering::SeqCst)
    }

    // Random failure odds per mode
    fn failure_probability(mode: u8) -> f32 {
        match mode {
            1 => 0.1,
            2 => 0.2,
            3 => 0.5,
            _ => 0.0,
        }
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn default_rate(query: &RateQuery) -> RateInfo {
        RateInfo {
            price: 100.0 * query.stay.nights() as f64,
            currency: "EUR".to_string(),
            room_type: "DBL".to_string(),
            board_type: "RO".to_string(),
            refundable: true,
        }
    }
}

#[async_trait]
impl Authenticator for MockVendor {
    async fn authenticate(&self) -> Result<Token, AuthError> {
        let call = self.auth_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = Inflight::enter(&self.auth_in_flight, &self.peak_auth_in_flight);

        let delay = self.auth_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if Self::take_one(&self.panic_next_auth) {
            panic!("simulated authenticator panic");
        }

        if self.mode.load(Ordering::SeqCst) == 4 {
            return Err(AuthError::NetworkError("Service unavailable".to_string()));
        }

        if Self::take_one(&self.fail_next_auth) {
            return Err(AuthError::Rejected {
                status_code: 503,
                message: "Auth temporarily unavailable".to_string(),
            });
        }

        let ttl = Duration::from_millis(self.token_ttl_ms.load(Ordering::SeqCst));
        Ok(Token::new(format!("token-{call}"), ttl))
    }
}

#[async_trait]
impl RateFetcher for MockVendor {
    async fn fetch(&self, query: &RateQuery, token: &Token) -> Result<RateInfo, VendorError> {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        let _guard = Inflight::enter(&self.in_flight, &self.peak_in_flight);

        if token.value.is_empty() {
            return Err(VendorError::TokenRejected);
        }

        let mode = self.mode.load(Ordering::SeqCst);
        if mode == 4 {
            return Err(VendorError::NetworkError("Service unavailable".to_string()));
        }

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            // Add jitter for realism
            let jitter = if mode > 0 {
                rand::random::<u64>() % delay
            } else {
                0
            };
            tokio::time::sleep(Duration::from_millis(delay + jitter)).await;
        }

        if rand::random::<f32>() < Self::failure_probability(mode) {
            return Err(VendorError::ApiResponseError {
                status_code: 503,
                message: "Service temporarily unavailable".to_string(),
            });
        }

        if Self::take_one(&self.fail_next_requests) {
            return Err(VendorError::ApiResponseError {
                status_code: 500,
                message: "Internal Server Error".to_string(),
            });
        }

        if self.panicking_hotels.contains(&query.hotel_id) {
            panic!("simulated vendor panic for hotel {}", query.hotel_id);
        }

        if self.failing_hotels.contains(&query.hotel_id) {
            return Err(VendorError::NoAvailability(query.hotel_id.clone()));
        }

        Ok(self
            .rates
            .get(&query.hotel_id)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| Self::default_rate(query)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StayDates;
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn query(hotel_id: &str) -> RateQuery {
        RateQuery {
            hotel_id: hotel_id.to_string(),
            stay: StayDates::new(
                NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 6, 3).unwrap(),
            )
            .unwrap(),
        }
    }

    #[tokio::test]
    async fn test_default_and_custom_rates() {
        let vendor = MockVendor::new();
        let token = vendor.authenticate().await.unwrap();
        assert_eq!(token.value, "token-1");

        let rate = vendor.fetch(&query("h1"), &token).await.unwrap();
        assert_eq!(rate.price, 200.0);

        vendor.add_rate(
            "h2",
            RateInfo {
                price: 55.0,
                currency: "USD".to_string(),
                room_type: "SGL".to_string(),
                board_type: "BB".to_string(),
                refundable: false,
            },
        );
        let rate = vendor.fetch(&query("h2"), &token).await.unwrap();
        assert_eq!(rate.currency, "USD");
        assert_eq!(vendor.request_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let vendor = MockVendor::new();
        let token = vendor.authenticate().await.unwrap();

        vendor.fail_next_requests(1);
        assert!(vendor.fetch(&query("h1"), &token).await.is_err());
        assert!(vendor.fetch(&query("h1"), &token).await.is_ok());

        vendor.fail_hotel("h3");
        assert_eq!(
            vendor.fetch(&query("h3"), &token).await,
            Err(VendorError::NoAvailability("h3".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracks_peak_concurrency() {
        let vendor = Arc::new(MockVendor::new());
        vendor.set_delay(100);
        let token = vendor.authenticate().await.unwrap();

        let calls = (0..4).map(|i| {
            let vendor = vendor.clone();
            let token = token.clone();
            tokio::spawn(async move { vendor.fetch(&query(&format!("h{i}")), &token).await })
        });
        for call in futures::future::join_all(calls).await {
            assert!(call.unwrap().is_ok());
        }

        assert_eq!(vendor.peak_in_flight(), 4);
        assert_eq!(vendor.in_flight(), 0);
    }
}
