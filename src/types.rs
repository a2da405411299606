// Shared data model: queries, jobs, results and the auth token

use std::fmt;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{LoadError, RateFailure};

pub type HotelId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StayDates {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl StayDates {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Result<Self, LoadError> {
        if check_out <= check_in {
            return Err(LoadError::InvalidStay {
                check_in: check_in.to_string(),
                check_out: check_out.to_string(),
            });
        }
        Ok(Self {
            check_in,
            check_out,
        })
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }
}

// What a worker asks the vendor for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateQuery {
    pub hotel_id: HotelId,
    pub stay: StayDates,
}

// Inbound "load rates" operation: many hotels, one stay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRatesRequest {
    pub hotel_ids: Vec<HotelId>,
    pub stay: StayDates,
}

impl LoadRatesRequest {
    pub fn new(hotel_ids: Vec<HotelId>, check_in: NaiveDate, check_out: NaiveDate) -> Result<Self, LoadError> {
        if hotel_ids.is_empty() {
            return Err(LoadError::NoHotels);
        }
        Ok(Self {
            hotel_ids,
            stay: StayDates::new(check_in, check_out)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateInfo {
    pub price: f64,
    pub currency: String,
    pub room_type: String,
    pub board_type: String,
    pub refundable: bool,
}

// One unit of work in the intake queue. `reply` is shared by every job of the
// same inbound request and sized so delivery never blocks.
#[derive(Debug)]
pub struct RateRequest {
    pub query: RateQuery,
    pub reply: mpsc::Sender<RateResult>,
    pub cancel: CancellationToken,
}

impl RateRequest {
    pub fn hotel_id(&self) -> &str {
        &self.query.hotel_id
    }

    // Consumes the job, delivering its single result without blocking
    pub fn complete(self, outcome: Result<RateInfo, RateFailure>) -> bool {
        let result = RateResult {
            hotel_id: self.query.hotel_id,
            outcome,
        };
        match self.reply.try_send(result) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(result)) => {
                tracing::debug!(hotel_id = %result.hotel_id, "reply channel closed, result discarded");
                false
            }
            Err(mpsc::error::TrySendError::Full(result)) => {
                tracing::warn!(hotel_id = %result.hotel_id, "reply channel full, result discarded");
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateResult {
    pub hotel_id: HotelId,
    pub outcome: Result<RateInfo, RateFailure>,
}

impl RateResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

// Aggregated response of one inbound request. Holds every per-hotel result.
#[derive(Debug, Clone, Default)]
pub struct RateSet {
    pub results: Vec<RateResult>,
}

impl RateSet {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn successes(&self) -> impl Iterator<Item = (&str, &RateInfo)> {
        self.results
            .iter()
            .filter_map(|r| r.outcome.as_ref().ok().map(|info| (r.hotel_id.as_str(), info)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &RateFailure)> {
        self.results
            .iter()
            .filter_map(|r| r.outcome.as_ref().err().map(|e| (r.hotel_id.as_str(), e)))
    }

    pub fn get(&self, hotel_id: &str) -> Option<&RateResult> {
        self.results.iter().find(|r| r.hotel_id == hotel_id)
    }
}

// Time-limited vendor credential
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub expires_at: Instant,
}

impl Token {
    pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            expires_at: Instant::now() + ttl,
        }
    }

    // Valid if it outlives `now` by at least `margin`
    pub fn is_valid_at(&self, now: Instant, margin: Duration) -> bool {
        now + margin < self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: String = self.value.chars().take(4).collect();
        f.debug_struct("Token")
            .field("value", &format_args!("{shown}***"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_stay_dates_validation() {
        let stay = StayDates::new(date("2025-06-01"), date("2025-06-05")).unwrap();
        assert_eq!(stay.nights(), 4);

        assert!(matches!(
            StayDates::new(date("2025-06-05"), date("2025-06-05")),
            Err(LoadError::InvalidStay { .. })
        ));
        assert!(matches!(
            LoadRatesRequest::new(vec![], date("2025-06-01"), date("2025-06-05")),
            Err(LoadError::NoHotels)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_validity_window() {
        let token = Token::new("secret-value", Duration::from_secs(60));
        let now = Instant::now();

        assert!(token.is_valid_at(now, Duration::ZERO));
        assert!(token.is_valid_at(now, Duration::from_secs(59)));
        assert!(!token.is_valid_at(now, Duration::from_secs(60)));
        assert!(!token.is_valid_at(now + Duration::from_secs(61), Duration::ZERO));
    }

    #[test]
    fn test_token_debug_redacts_value() {
        let token = Token {
            value: "abcdefghijkl".to_string(),
            expires_at: Instant::now(),
        };
        let shown = format!("{token:?}");
        assert!(shown.contains("abcd***"));
        assert!(!shown.contains("efghijkl"));
    }

    #[tokio::test]
    async fn test_complete_delivers_once_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let job = RateRequest {
            query: RateQuery {
                hotel_id: "hotel1".to_string(),
                stay: StayDates::new(date("2025-06-01"), date("2025-06-02")).unwrap(),
            },
            reply: tx.clone(),
            cancel: CancellationToken::new(),
        };
        assert!(job.complete(Err(RateFailure::Cancelled)));

        let result = rx.recv().await.unwrap();
        assert_eq!(result.hotel_id, "hotel1");
        assert!(!result.is_success());

        // a second delivery into a full channel is dropped, not awaited
        tx.try_send(result.clone()).unwrap();
        let extra = RateRequest {
            query: RateQuery {
                hotel_id: "hotel2".to_string(),
                stay: StayDates::new(date("2025-06-01"), date("2025-06-02")).unwrap(),
            },
            reply: tx,
            cancel: CancellationToken::new(),
        };
        assert!(!extra.complete(Err(RateFailure::Cancelled)));
    }
}
