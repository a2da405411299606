// Token provider: a single acceptor task owns the shared vendor token.
// While a refresh runs, callers are parked and all get its outcome.
// Errors are never cached; the next caller starts a fresh attempt.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::TokenConfig,
    error::{panic_message, AuthError},
    types::Token,
    vendor::Authenticator,
};

pub type TokenResponse = Result<Token, AuthError>;

#[derive(Debug)]
pub struct TokenRequest {
    pub requested_at: Instant,
    pub reply: oneshot::Sender<TokenResponse>,
}

// Cloneable handle used by workers to ask for a token
#[derive(Debug, Clone)]
pub struct TokenClient {
    requests: mpsc::Sender<TokenRequest>,
}

impl TokenClient {
    // The token is unexpired when issued, not necessarily for the whole vendor call
    pub async fn request_token(&self) -> Result<Token, AuthError> {
        let (reply, rx) = oneshot::channel();
        let request = TokenRequest {
            requested_at: Instant::now(),
            reply,
        };

        self.requests
            .send(request)
            .await
            .map_err(|_| AuthError::ProviderStopped)?;

        rx.await.map_err(|_| AuthError::ProviderStopped)?
    }
}

pub struct TokenProvider {
    client: TokenClient,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokenProvider {
    pub fn start(authenticator: Arc<dyn Authenticator>, config: &TokenConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.request_queue_capacity.max(1));
        let shutdown = CancellationToken::new();

        let acceptor = TokenAcceptor {
            authenticator,
            refresh_margin: config.refresh_margin(),
            current: None,
            waiting: Vec::new(),
            refresh_task: None,
        };
        let task = tokio::spawn(acceptor.run(rx, shutdown.clone()));

        tracing::info!(
            refresh_margin_ms = config.refresh_margin_ms,
            "token provider started"
        );

        Self {
            client: TokenClient { requests: tx },
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn client(&self) -> TokenClient {
        self.client.clone()
    }

    pub async fn request_token(&self) -> Result<Token, AuthError> {
        self.client.request_token().await
    }

    // Stops the acceptor and waits for it. Parked callers get ProviderStopped.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "token provider task failed");
            }
            tracing::info!("token provider stopped");
        }
    }
}

struct TokenAcceptor {
    authenticator: Arc<dyn Authenticator>,
    refresh_margin: Duration,
    current: Option<Token>,
    waiting: Vec<TokenRequest>,
    refresh_task: Option<JoinHandle<()>>,
}

impl TokenAcceptor {
    async fn run(mut self, mut requests: mpsc::Receiver<TokenRequest>, shutdown: CancellationToken) {
        // Refresh outcomes come back through here; we keep the sender so the
        // receiver never closes.
        let (done_tx, mut done_rx) = mpsc::channel::<TokenResponse>(1);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(outcome) = done_rx.recv() => self.finish_refresh(outcome),
                request = requests.recv() => match request {
                    Some(request) => self.accept(request, &done_tx),
                    None => break,
                },
            }
        }

        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
        requests.close();
        while let Ok(request) = requests.try_recv() {
            self.waiting.push(request);
        }
        for request in self.waiting.drain(..) {
            let _ = request.reply.send(Err(AuthError::ProviderStopped));
        }
    }

    fn accept(&mut self, request: TokenRequest, done_tx: &mpsc::Sender<TokenResponse>) {
        if let Some(token) = &self.current {
            if token.is_valid_at(Instant::now(), self.refresh_margin) {
                let _ = request.reply.send(Ok(token.clone()));
                return;
            }
        }

        self.waiting.push(request);
        if self.refresh_task.is_none() {
            self.start_refresh(done_tx.clone());
        }
    }

    fn start_refresh(&mut self, done_tx: mpsc::Sender<TokenResponse>) {
        tracing::debug!(waiting = self.waiting.len(), "refreshing vendor token");
        let authenticator = self.authenticator.clone();
        self.refresh_task = Some(tokio::spawn(async move {
            // A panic must still reach finish_refresh or callers stay parked
            let outcome = AssertUnwindSafe(authenticator.authenticate())
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(AuthError::Panicked(panic_message(panic.as_ref()))));
            let _ = done_tx.send(outcome).await;
        }));
    }

    fn finish_refresh(&mut self, outcome: TokenResponse) {
        self.refresh_task = None;
        let now = Instant::now();

        let outcome = match outcome {
            Ok(token) if !token.is_valid_at(now, Duration::ZERO) => Err(AuthError::InvalidResponse(
                "authenticator returned an expired token".to_string(),
            )),
            other => other,
        };

        match &outcome {
            Ok(token) => {
                if !token.is_valid_at(now, self.refresh_margin) {
                    tracing::warn!(
                        refresh_margin_ms = self.refresh_margin.as_millis() as u64,
                        "token lifetime is shorter than the refresh margin"
                    );
                }
                tracing::debug!(waiting = self.waiting.len(), "token refreshed");
                self.current = Some(token.clone());
            }
            Err(e) => {
                tracing::warn!(error = %e, waiting = self.waiting.len(), "token refresh failed");
                self.current = None;
            }
        }

        for request in self.waiting.drain(..) {
            tracing::trace!(
                waited_ms = request.requested_at.elapsed().as_millis() as u64,
                "token request answered"
            );
            let _ = request.reply.send(outcome.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_vendor::{MockVendor, ServerMode};
    use futures::future::join_all;

    fn config(refresh_margin_ms: u64) -> TokenConfig {
        TokenConfig {
            refresh_margin_ms,
            request_queue_capacity: 16,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpired_token_is_reused() {
        let vendor = Arc::new(MockVendor::new());
        let provider = TokenProvider::start(vendor.clone(), &config(0));

        let first = provider.request_token().await.unwrap();
        let second = provider.request_token().await.unwrap();

        assert_eq!(first.value, second.value);
        assert_eq!(vendor.auth_calls(), 1);
        provider.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_refresh() {
        let vendor = Arc::new(MockVendor::new());
        vendor.set_auth_delay(200);
        let provider = TokenProvider::start(vendor.clone(), &config(0));
        let client = provider.client();

        let calls = (0..50).map(|_| {
            let client = client.clone();
            async move { client.request_token().await }
        });
        let tokens = join_all(calls).await;

        assert_eq!(vendor.auth_calls(), 1);
        assert_eq!(vendor.peak_concurrent_auth(), 1);
        let first = tokens[0].as_ref().unwrap().value.clone();
        assert!(tokens.iter().all(|t| t.as_ref().unwrap().value == first));
        provider.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_triggers_one_refresh() {
        let vendor = Arc::new(MockVendor::new());
        vendor.set_token_ttl(1_000);
        let provider = TokenProvider::start(vendor.clone(), &config(0));

        let first = provider.request_token().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let client = provider.client();
        let racing = join_all((0..10).map(|_| {
            let client = client.clone();
            async move { client.request_token().await }
        }))
        .await;

        assert_eq!(vendor.auth_calls(), 2);
        for token in racing {
            let token = token.unwrap();
            assert_ne!(token.value, first.value);
        }
        provider.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_margin_renews_early() {
        let vendor = Arc::new(MockVendor::new());
        vendor.set_token_ttl(10_000);
        let provider = TokenProvider::start(vendor.clone(), &config(2_000));

        provider.request_token().await.unwrap();
        tokio::time::sleep(Duration::from_millis(7_000)).await;
        provider.request_token().await.unwrap();
        assert_eq!(vendor.auth_calls(), 1);

        // inside the margin, still unexpired, but renewed anyway
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        provider.request_token().await.unwrap();
        assert_eq!(vendor.auth_calls(), 2);
        provider.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_reaches_all_waiters_and_is_not_cached() {
        let vendor = Arc::new(MockVendor::new());
        vendor.set_auth_delay(100);
        vendor.fail_next_auth(1);
        let provider = TokenProvider::start(vendor.clone(), &config(0));
        let client = provider.client();

        let outcomes = join_all((0..5).map(|_| {
            let client = client.clone();
            async move { client.request_token().await }
        }))
        .await;

        assert_eq!(vendor.auth_calls(), 1);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, Err(AuthError::Rejected { .. }))));

        // the next caller starts a new attempt
        tokio_test::assert_ok!(provider.request_token().await);
        assert_eq!(vendor.auth_calls(), 2);
        provider.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_authenticator_is_reported_and_retried() {
        let vendor = Arc::new(MockVendor::new());
        vendor.set_auth_delay(50);
        vendor.panic_next_auth(1);
        let provider = TokenProvider::start(vendor.clone(), &config(0));
        let client = provider.client();

        let outcomes = join_all((0..3).map(|_| {
            let client = client.clone();
            async move { client.request_token().await }
        }))
        .await;
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, Err(AuthError::Panicked(_)))));

        // the refresh slot was released, so the next caller gets a token
        tokio_test::assert_ok!(provider.request_token().await);
        assert_eq!(vendor.auth_calls(), 2);
        provider.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_expired_token_is_rejected() {
        let vendor = Arc::new(MockVendor::new());
        vendor.set_token_ttl(0);
        let provider = TokenProvider::start(vendor.clone(), &config(0));

        let err = tokio_test::assert_err!(provider.request_token().await);
        assert!(matches!(err, AuthError::InvalidResponse(_)));

        // nothing was cached, so a longer-lived token is fetched next time
        vendor.set_token_ttl(60_000);
        tokio_test::assert_ok!(provider.request_token().await);
        assert_eq!(vendor.auth_calls(), 2);
        provider.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_surfaces_network_error() {
        let vendor = Arc::new(MockVendor::new());
        vendor.set_mode(ServerMode::CompleteOutage);
        let provider = TokenProvider::start(vendor.clone(), &config(0));

        let err = tokio_test::assert_err!(provider.request_token().await);
        assert!(matches!(err, AuthError::NetworkError(_)));
        provider.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_after_stop_fail() {
        let vendor = Arc::new(MockVendor::new());
        let provider = TokenProvider::start(vendor.clone(), &config(0));
        let client = provider.client();

        provider.stop().await;
        // second stop is a no-op
        provider.stop().await;

        assert_eq!(client.request_token().await, Err(AuthError::ProviderStopped));
        assert_eq!(vendor.auth_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_parked_callers() {
        let vendor = Arc::new(MockVendor::new());
        vendor.set_auth_delay(10_000);
        let provider = TokenProvider::start(vendor.clone(), &config(0));
        let client = provider.client();

        let parked = tokio::spawn(async move { client.request_token().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        provider.stop().await;

        assert_eq!(parked.await.unwrap(), Err(AuthError::ProviderStopped));
    }
}
