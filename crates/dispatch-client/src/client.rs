//! Leased request execution
//!
//! A [`DispatchClient`] binds one operation to at most one leased identity
//! and one open session at a time. Each response is classified and the
//! verdict decides whether the identity is kept, parked, demoted or
//! refreshed before the request is retried.

use std::sync::Arc;

use identity_pool::{Lease, Outcome, Pool};
use lease_store::{Identity, Operation, Selector};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

use crate::classify::{ClassificationTable, Verdict};
use crate::error::{Error, Result};
use crate::metrics;
use crate::settings::DispatchConfig;
use crate::transport::{
    HttpTransport, Session, SessionLimiter, Transport, UpstreamRequest, UpstreamResponse,
};

/// Shared pieces every client of one pool uses: transport, classification
/// rules and the session cap.
pub struct Dispatcher {
    pool: Arc<Pool>,
    transport: Arc<dyn Transport>,
    classifier: Arc<ClassificationTable>,
    limiter: SessionLimiter,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(pool: Arc<Pool>, transport: Arc<dyn Transport>, config: DispatchConfig) -> Self {
        let limiter = SessionLimiter::new(config.max_sessions);
        Self {
            pool,
            transport,
            classifier: Arc::new(ClassificationTable::default()),
            limiter,
            config,
        }
    }

    /// Dispatcher over the `reqwest` transport.
    pub fn http(pool: Arc<Pool>, config: DispatchConfig) -> Self {
        let transport = Arc::new(HttpTransport::new(config.request_timeout()));
        Self::new(pool, transport, config)
    }

    pub fn with_classifier(mut self, table: ClassificationTable) -> Self {
        self.classifier = Arc::new(table);
        self
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn limiter(&self) -> &SessionLimiter {
        &self.limiter
    }

    /// Client for `operation` drawing from the whole pool.
    pub fn client(&self, operation: Operation) -> DispatchClient {
        self.client_for(operation, Selector::any())
    }

    pub fn client_for(&self, operation: Operation, selector: Selector) -> DispatchClient {
        DispatchClient {
            pool: Arc::clone(&self.pool),
            transport: Arc::clone(&self.transport),
            classifier: Arc::clone(&self.classifier),
            limiter: self.limiter.clone(),
            config: self.config.clone(),
            operation,
            selector,
            held: None,
        }
    }
}

/// Lease plus the session opened for it.
struct Held {
    lease: Lease,
    session: Box<dyn Session>,
    _permit: OwnedSemaphorePermit,
    /// A call completed on this lease; renew before the next one.
    used: bool,
}

/// Executes requests for one operation on leased identities.
///
/// Dropping the client without [`close`](Self::close) frees its identity
/// and keeps the operation lock.
pub struct DispatchClient {
    pool: Arc<Pool>,
    transport: Arc<dyn Transport>,
    classifier: Arc<ClassificationTable>,
    limiter: SessionLimiter,
    config: DispatchConfig,
    operation: Operation,
    selector: Selector,
    held: Option<Held>,
}

impl std::fmt::Debug for DispatchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchClient")
            .field("operation", &self.operation)
            .field("selector", &self.selector)
            .field("held", &self.held_handle())
            .finish()
    }
}

impl DispatchClient {
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Handle of the currently leased identity.
    pub fn held_handle(&self) -> Option<&str> {
        self.held.as_ref().map(|held| held.lease.handle())
    }

    pub fn held_identity(&self) -> Option<&Identity> {
        self.held.as_ref().map(|held| held.lease.identity())
    }

    /// Send `request` on a leased identity until the upstream gives a usable
    /// answer.
    ///
    /// Rate limits, bans and parked identities are retried on another
    /// identity without limit; only `Aborted`, malformed requests and pool
    /// errors end the loop early. The identity that served the response
    /// stays leased for the next call.
    pub async fn execute(&mut self, request: &UpstreamRequest) -> Result<UpstreamResponse> {
        let mut transport_failures = 0u32;
        let mut unknown_failures = 0u32;
        let mut refreshed: Option<String> = None;

        loop {
            let held = self.hold().await?;
            let handle = held.lease.handle().to_string();
            let result = held.session.send(request).await;

            let response = match result {
                Ok(response) => response,
                Err(e) if !e.is_transient() => {
                    metrics::record_transport_error(self.operation.as_str(), e.label());
                    warn!(
                        identity = %handle,
                        operation = %self.operation,
                        error = %e,
                        "request cannot be sent, giving up"
                    );
                    return Err(Error::Transport(e));
                }
                Err(e) => {
                    metrics::record_transport_error(self.operation.as_str(), e.label());
                    transport_failures += 1;
                    if transport_failures < self.config.transport_retries {
                        debug!(
                            identity = %handle,
                            operation = %self.operation,
                            attempt = transport_failures,
                            error = %e,
                            "transport error, retrying on same identity"
                        );
                        continue;
                    }
                    warn!(
                        identity = %handle,
                        operation = %self.operation,
                        error = %e,
                        "transport errors exhausted, parking identity"
                    );
                    transport_failures = 0;
                    unknown_failures = 0;
                    self.park(self.config.transport_cooldown()).await?;
                    continue;
                }
            };

            let verdict = self.classifier.classify(&response);
            metrics::record_verdict(self.operation.as_str(), verdict.label());

            match verdict {
                Verdict::Success => {
                    if let Some(held) = self.held.as_mut() {
                        held.used = true;
                    }
                    return Ok(response);
                }
                Verdict::Abort { reason } => {
                    warn!(
                        identity = %handle,
                        operation = %self.operation,
                        status = response.status,
                        reason = %reason,
                        "request aborted"
                    );
                    if let Some(held) = self.held.as_mut() {
                        held.used = true;
                    }
                    return Err(Error::Aborted {
                        reason,
                        response: Box::new(response),
                    });
                }
                Verdict::RateLimited { until } => {
                    info!(
                        identity = %handle,
                        operation = %self.operation,
                        until = ?until,
                        "rate limited, switching identity"
                    );
                    self.release_held(Outcome::Throttled { until }).await?;
                }
                Verdict::Banned { reason } => {
                    self.release_held(Outcome::Banned { reason }).await?;
                }
                Verdict::AuthExpired { reason } => {
                    if self.config.refresh_on_auth_expired
                        && refreshed.as_deref() != Some(handle.as_str())
                    {
                        refreshed = Some(handle);
                        self.refresh_held(reason).await?;
                        continue;
                    }
                    self.release_held(Outcome::AuthExpired { reason }).await?;
                }
                Verdict::Unknown { reason } => {
                    unknown_failures += 1;
                    if unknown_failures < self.config.unknown_retries {
                        debug!(
                            identity = %handle,
                            operation = %self.operation,
                            attempt = unknown_failures,
                            reason = %reason,
                            "unexpected response, retrying on same identity"
                        );
                        continue;
                    }
                    warn!(
                        identity = %handle,
                        operation = %self.operation,
                        reason = %reason,
                        "unexpected responses persist, parking identity"
                    );
                    self.park(self.config.unknown_cooldown()).await?;
                }
            }
            transport_failures = 0;
            unknown_failures = 0;
        }
    }

    /// Release the held identity as a success and close its session.
    pub async fn close(&mut self) -> Result<()> {
        self.release_held(Outcome::Success).await
    }

    /// Current lease, renewed if a call already completed on it, or a new
    /// one with a fresh session.
    async fn hold(&mut self) -> Result<&mut Held> {
        if self.held.as_ref().is_some_and(|held| held.used) {
            self.renew_held().await?;
        }
        let held = match self.held.take() {
            Some(held) => held,
            None => self.open_held().await?,
        };
        Ok(self.held.insert(held))
    }

    async fn renew_held(&mut self) -> Result<()> {
        let Some(held) = self.held.as_mut() else {
            return Ok(());
        };
        match self.pool.renew(&mut held.lease).await {
            Ok(()) => {
                held.used = false;
                Ok(())
            }
            Err(identity_pool::Error::LeaseLost(handle)) => {
                info!(identity = %handle, operation = %self.operation, "lease lost, acquiring another identity");
                self.held = None;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn open_held(&self) -> Result<Held> {
        let permit = self.limiter.acquire().await.ok_or(Error::LimiterClosed)?;
        let lease = self.pool.acquire(&self.operation, &self.selector).await?;
        match self.transport.open(lease.identity()) {
            Ok(session) => Ok(Held {
                lease,
                session,
                _permit: permit,
                used: false,
            }),
            Err(source) => {
                let handle = lease.handle().to_string();
                warn!(identity = %handle, error = %source, "cannot open session, parking identity");
                let until = self.cooldown_until(self.config.transport_cooldown());
                self.pool
                    .release(lease, Outcome::Throttled { until: Some(until) })
                    .await?;
                Err(Error::Session { handle, source })
            }
        }
    }

    /// Force a credential refresh on the held identity and reopen its
    /// session. Without a trigger the identity is demoted instead.
    async fn refresh_held(&mut self, reason: String) -> Result<()> {
        let Some(mut held) = self.held.take() else {
            return Ok(());
        };
        match self.pool.refresh(&mut held.lease).await {
            Ok(()) => match self.transport.open(held.lease.identity()) {
                Ok(session) => {
                    info!(identity = %held.lease.handle(), "credential refreshed after auth expiry");
                    held.session = session;
                    self.held = Some(held);
                    Ok(())
                }
                Err(source) => {
                    let handle = held.lease.handle().to_string();
                    let until = self.cooldown_until(self.config.transport_cooldown());
                    self.pool
                        .release(held.lease, Outcome::Throttled { until: Some(until) })
                        .await?;
                    Err(Error::Session { handle, source })
                }
            },
            // The pool already demoted the identity and consumed the lease.
            Err(identity_pool::Error::RefreshFailed { handle, .. }) => {
                debug!(identity = %handle, "refresh after auth expiry failed");
                Ok(())
            }
            Err(identity_pool::Error::NoRefreshTrigger) => {
                warn!(identity = %held.lease.handle(), "no refresh trigger installed, demoting");
                self.pool
                    .release(held.lease, Outcome::AuthExpired { reason })
                    .await?;
                Ok(())
            }
            Err(e) => {
                self.held = Some(held);
                Err(e.into())
            }
        }
    }

    async fn release_held(&mut self, outcome: Outcome) -> Result<()> {
        if let Some(held) = self.held.take() {
            self.pool.release(held.lease, outcome).await?;
        }
        Ok(())
    }

    /// Lock the held identity for `cooldown` without demoting it.
    async fn park(&mut self, cooldown: std::time::Duration) -> Result<()> {
        let until = self.cooldown_until(cooldown);
        self.release_held(Outcome::Throttled { until: Some(until) })
            .await
    }

    fn cooldown_until(&self, cooldown: std::time::Duration) -> i64 {
        self.pool.store().now_millis() + cooldown.as_millis() as i64
    }
}
