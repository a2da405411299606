// Request coordinator: scatters one inbound "N hotels" request over the
// worker pool and gathers exactly N results back on a private reply channel.

use std::{fmt, sync::Arc};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::LoadError,
    pool::WorkerPool,
    types::{LoadRatesRequest, RateQuery, RateRequest, RateSet},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Dispatching,
    Awaiting,
    Complete,
    Failed,
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadPhase::Dispatching => "dispatching",
            LoadPhase::Awaiting => "awaiting",
            LoadPhase::Complete => "complete",
            LoadPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
pub struct RateLoader {
    pool: Arc<WorkerPool>,
}

impl RateLoader {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    // One result per hotel id, duplicates included, in completion order.
    // NoRatesFound only when nothing succeeded. Dropping the future cancels
    // the jobs still pending.
    pub async fn load_rates(&self, request: LoadRatesRequest) -> Result<RateSet, LoadError> {
        let expected = request.hotel_ids.len();
        if expected == 0 {
            return Err(LoadError::NoHotels);
        }

        let cancel = CancellationToken::new();
        let abandon_on_drop = cancel.clone().drop_guard();
        let (reply, mut replies) = mpsc::channel(expected);

        tracing::debug!(hotels = expected, phase = %LoadPhase::Dispatching, "loading rates");
        for hotel_id in request.hotel_ids {
            let job = RateRequest {
                query: RateQuery {
                    hotel_id,
                    stay: request.stay,
                },
                reply: reply.clone(),
                cancel: cancel.clone(),
            };
            self.pool.submit(job).await?;
        }
        // only the jobs hold senders from here on
        drop(reply);

        tracing::debug!(hotels = expected, phase = %LoadPhase::Awaiting, "jobs dispatched");
        let mut results = Vec::with_capacity(expected);
        while results.len() < expected {
            match replies.recv().await {
                Some(result) => results.push(result),
                None => break,
            }
        }
        abandon_on_drop.disarm();

        if results.len() < expected {
            tracing::warn!(
                expected,
                received = results.len(),
                "reply channel closed before all results arrived"
            );
            return Err(LoadError::ShutdownInProgress);
        }

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        if succeeded == 0 {
            tracing::info!(hotels = expected, phase = %LoadPhase::Failed, "no rates found");
            return Err(LoadError::NoRatesFound { failures: results });
        }

        tracing::info!(
            hotels = expected,
            succeeded,
            failed = expected - succeeded,
            phase = %LoadPhase::Complete,
            "rates loaded"
        );
        Ok(RateSet { results })
    }
}
