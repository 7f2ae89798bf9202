//! The per-order poller.
//!
//! Each order is driven by one long-lived task that owns its [`Session`]
//! and walks the order from creation through challenge satisfaction,
//! finalization, and certificate download. Everything the poller cannot do
//! itself (provisioning TXT records or webroot files, producing a CSR,
//! storing the issued chain) goes through the caller's [`Publisher`].
//!
//! A poller tolerates transient failures by retrying within per-phase time
//! budgets, honors server `Retry-After` directives, and can be cancelled or
//! introspected through its [`PollerHandle`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::prelude::*;
use rand::Rng as _;
use tokio::{
    sync::watch,
    time::{sleep, Instant},
};

use crate::{
    api,
    dns::{DohResolver, TxtLookup},
    error::{CallbackError, Error, Result},
    order::{Authz, ChallengeResponse, NewOrderOptions, Order},
    trans::Session,
};

/// What [`Publisher::handle_finalization_error`] wants done about a
/// rejected finalize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizationDisposition {
    /// Submit the finalize request again (within the finalization budget).
    Retry,
    /// Give up; the order transitions to failed.
    Abort,
}

/// The caller-supplied collaborator that provisions challenge material and
/// consumes results.
///
/// Callback failures are treated as transient: the poller retries them on
/// its backoff schedule within the current phase's budget. After a terminal
/// transition (done, failed, cancelled) no callbacks fire.
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    /// Called once on startup; may augment the opaque `args` value the
    /// poller was configured with.
    async fn init(&self, args: serde_json::Value) -> Result<serde_json::Value, CallbackError> {
        Ok(args)
    }

    /// Provision the computed challenge responses (TXT records, webroot
    /// files). Retries may invoke this more than once with the same
    /// responses; implementations must be idempotent.
    async fn publish_challenge_responses(
        &self,
        responses: &[ChallengeResponse],
    ) -> Result<(), CallbackError>;

    /// Produce the DER-encoded CSR once the order is ready to finalize.
    async fn get_csr(&self, identifiers: &[api::Identifier]) -> Result<Vec<u8>, CallbackError>;

    /// Store the issued PEM chain.
    async fn process_certificate(
        &self,
        order: &api::Order,
        pem_chain: &str,
    ) -> Result<(), CallbackError>;

    /// Mark the order complete; the order URL is worth persisting here.
    async fn ack_order(&self, order: &api::Order) -> Result<(), CallbackError>;

    /// An authorization or the order itself turned invalid. Terminal.
    async fn invalid_order(&self, order: &api::Order);

    /// The finalize request was rejected; decide between retry and abort.
    async fn handle_finalization_error(
        &self,
        order: &api::Order,
        err: &Error,
    ) -> FinalizationDisposition {
        let _ = (order, err);
        FinalizationDisposition::Abort
    }
}

/// States of the order state machine.
///
/// Progression on the happy path follows declaration order; `Done`,
/// `Failed`, and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Starting,
    CreatingOrder,
    FetchingAuthorizations,
    PublishingChallenges,
    AwaitingDnsPropagation,
    PokingChallenges,
    PollingAuthorizations,
    Ready,
    Finalizing,
    PollingOrder,
    Downloading,
    Done,
    Failed,
    Cancelled,
}

impl PollerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PollerState::Done | PollerState::Failed | PollerState::Cancelled
        )
    }
}

/// Snapshot of a poller, observable through [`PollerHandle::status()`].
#[derive(Debug, Clone)]
pub struct PollerStatus {
    pub state: PollerState,
    /// Known as soon as the order is created (or immediately when resuming).
    pub order_url: Option<String>,
    /// Populated when the poller transitions to `Failed`.
    pub last_error: Option<Arc<Error>>,
}

/// Polling schedule and per-phase time budgets.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for server polls.
    pub poll_base: Duration,
    /// Base delay for DNS propagation polls.
    pub dns_base: Duration,
    /// Backoff multiplier, applied per retry.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Jitter fraction applied to every delay (± this share of the delay).
    pub jitter: f64,
    /// Budget for everything up to and including authorization convergence.
    pub authorization_budget: Duration,
    /// Budget for finalize submission and the post-finalize order poll.
    pub finalization_budget: Duration,
    /// Budget for downloading the certificate and running the success
    /// callbacks.
    pub download_budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            poll_base: Duration::from_secs(2),
            dns_base: Duration::from_secs(1),
            multiplier: 1.7,
            cap: Duration::from_secs(60),
            jitter: 0.2,
            authorization_budget: Duration::from_secs(600),
            finalization_budget: Duration::from_secs(120),
            download_budget: Duration::from_secs(120),
        }
    }
}

/// Configuration for [`Poller::spawn()`].
pub struct PollerConfig {
    /// Opaque value handed to [`Publisher::init`].
    pub args: serde_json::Value,
    /// Resume a previously created order instead of submitting a new one.
    pub order_url: Option<String>,
    pub policy: RetryPolicy,
    /// Resolver used for DNS propagation checks.
    pub resolver: Arc<dyn TxtLookup>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            args: serde_json::Value::Null,
            order_url: None,
            policy: RetryPolicy::default(),
            resolver: Arc::new(DohResolver::new()),
        }
    }
}

/// Handle to a running poller: introspection and cancellation.
///
/// Dropping the handle detaches the poller; it keeps running.
pub struct PollerHandle {
    status_rx: watch::Receiver<PollerStatus>,
    cancel_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<PollerOutcome>,
}

impl PollerHandle {
    /// Latest status snapshot.
    pub fn status(&self) -> PollerStatus {
        self.status_rx.borrow().clone()
    }

    /// Request cancellation. The poller transitions to `Cancelled` at its
    /// next suspension point; no callbacks fire afterwards.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Wait until the poller reaches a terminal state.
    pub async fn wait_terminal(&mut self) -> PollerStatus {
        while !self.status_rx.borrow().state.is_terminal() {
            if self.status_rx.changed().await.is_err() {
                break;
            }
        }
        self.status_rx.borrow().clone()
    }

    /// Wait for the poller to finish and take its outcome (including the
    /// released [`Session`]).
    pub async fn join(self) -> PollerOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            // we never abort the task, so a join error is a panic
            Err(err) => std::panic::resume_unwind(err.into_panic()),
        }
    }
}

/// Final result of a poller run. The session is handed back so the caller
/// can reuse it (or its key material) for further orders.
pub struct PollerOutcome {
    pub state: PollerState,
    pub order: Option<api::Order>,
    pub order_url: Option<String>,
    pub certificate_pem: Option<String>,
    pub last_error: Option<Arc<Error>>,
    pub session: Session,
}

/// Entry point for driving one order to a terminal state.
pub struct Poller;

impl Poller {
    /// Spawn a poller task that owns `session` for the duration of the run.
    ///
    /// The session must already have an account key ID (see
    /// [`Session::new_account`](crate::Session::new_account)).
    pub fn spawn(
        session: Session,
        identifiers: NewOrderOptions,
        publisher: Arc<dyn Publisher>,
        config: PollerConfig,
    ) -> PollerHandle {
        let (status_tx, status_rx) = watch::channel(PollerStatus {
            state: PollerState::Starting,
            order_url: config.order_url.clone(),
            last_error: None,
        });
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let poller = OrderPoller {
            session,
            publisher,
            opts: identifiers,
            args: config.args,
            order_url: config.order_url,
            policy: config.policy,
            resolver: config.resolver,
            status_tx,
            cancel_rx,
            order: None,
            authzs: Vec::new(),
            certificate: None,
        };

        let task = tokio::spawn(poller.run());

        PollerHandle {
            status_rx,
            cancel_tx,
            task,
        }
    }
}

/// One retry phase: a deadline derived from the phase budget, plus the
/// labels used when the budget runs out.
#[derive(Clone, Copy)]
struct Phase {
    deadline: Instant,
    budget: Duration,
    what: &'static str,
}

/// Exponential backoff with jitter.
#[derive(Debug)]
struct Backoff {
    base: Duration,
    next: Duration,
    multiplier: f64,
    cap: Duration,
    jitter: f64,
}

impl Backoff {
    fn new(base: Duration, policy: &RetryPolicy) -> Backoff {
        Backoff {
            base,
            next: base,
            multiplier: policy.multiplier,
            cap: policy.cap,
            jitter: policy.jitter,
        }
    }

    fn reset(&mut self) {
        self.next = self.base;
    }

    fn next_delay(&mut self) -> Duration {
        let spread = 1.0 + self.jitter * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
        let delay = self.next.mul_f64(spread).min(self.cap);
        self.next = self.next.mul_f64(self.multiplier).min(self.cap);
        delay
    }
}

struct OrderPoller {
    session: Session,
    publisher: Arc<dyn Publisher>,
    opts: NewOrderOptions,
    args: serde_json::Value,
    order_url: Option<String>,
    policy: RetryPolicy,
    resolver: Arc<dyn TxtLookup>,
    status_tx: watch::Sender<PollerStatus>,
    cancel_rx: watch::Receiver<bool>,
    order: Option<Order>,
    authzs: Vec<Authz>,
    certificate: Option<String>,
}

impl OrderPoller {
    async fn run(mut self) -> PollerOutcome {
        let result = self.drive().await;

        let (state, last_error) = match result {
            Ok(()) => (PollerState::Done, None),
            Err(Error::Cancelled) => (PollerState::Cancelled, None),
            Err(err) => {
                log::warn!("order poller failed: {err}");
                (PollerState::Failed, Some(Arc::new(err)))
            }
        };

        let last_error_for_status = last_error.clone();
        self.status_tx.send_modify(|status| {
            status.state = state;
            status.last_error = last_error_for_status;
        });

        PollerOutcome {
            state,
            order: self.order.as_ref().map(|order| order.api.clone()),
            order_url: self.order_url,
            certificate_pem: self.certificate,
            last_error,
            session: self.session,
        }
    }

    async fn drive(&mut self) -> Result<()> {
        self.enter(PollerState::Starting)?;
        let phase = self.phase("authorization convergence", self.policy.authorization_budget);
        let mut backoff = Backoff::new(self.policy.poll_base, &self.policy);

        // init callback; may augment args
        self.args = loop {
            self.check_cancel()?;
            match self.publisher.init(self.args.clone()).await {
                Ok(args) => break args,
                Err(err) => {
                    self.retry_or_fail(Error::Callback(err), &mut backoff, phase)
                        .await?
                }
            }
        };

        // create the order, or re-read it when resuming
        self.enter(PollerState::CreatingOrder)?;
        backoff.reset();
        let order = loop {
            self.check_cancel()?;
            let attempt = match self.order_url.clone() {
                Some(url) => self.session.fetch_order(&url).await,
                None => self.session.new_order(&self.opts).await,
            };
            match attempt {
                Ok(order) => break order,
                Err(err) => self.retry_or_fail(err, &mut backoff, phase).await?,
            }
        };
        self.order_url = Some(order.url.clone());
        let url = order.url.clone();
        self.status_tx
            .send_modify(|status| status.order_url = Some(url));
        self.order = Some(order);

        // read every authorization and compute challenge responses
        self.enter(PollerState::FetchingAuthorizations)?;
        backoff.reset();
        self.authzs = loop {
            self.check_cancel()?;
            let order = self.order.clone().expect("order set above");
            match self.session.create_challenge_responses(&order).await {
                Ok(authzs) => break authzs,
                Err(err) => self.retry_or_fail(err, &mut backoff, phase).await?,
            }
        };

        // one challenge per authorization that still needs proving
        let mut selected = Vec::new();
        for authz in &self.authzs {
            if !authz.needs_challenge() {
                continue;
            }
            match authz.preferred_response() {
                Some(response) => selected.push(response.clone()),
                None => {
                    return Err(Error::NoSupportedChallenge {
                        identifier: authz.api.identifier.value.clone(),
                    })
                }
            }
        }

        self.enter(PollerState::PublishingChallenges)?;
        backoff.reset();
        if !selected.is_empty() {
            loop {
                self.check_cancel()?;
                match self.publisher.publish_challenge_responses(&selected).await {
                    Ok(()) => break,
                    Err(err) => {
                        self.retry_or_fail(Error::Callback(err), &mut backoff, phase)
                            .await?
                    }
                }
            }
        }

        // wait until every dns-01 TXT record is observable before burning
        // server-side validation attempts
        self.enter(PollerState::AwaitingDnsPropagation)?;
        self.await_dns_propagation(&selected, phase).await?;

        // tell the server about challenges it has not started on
        self.enter(PollerState::PokingChallenges)?;
        backoff.reset();
        let to_poke: Vec<String> = selected
            .iter()
            .filter(|response| response.status == api::ChallengeStatus::Pending)
            .map(|response| response.url.clone())
            .collect();
        for url in to_poke {
            loop {
                self.check_cancel()?;
                match self.session.poke(&url).await {
                    Ok(_) => break,
                    Err(err) => self.retry_or_fail(err, &mut backoff, phase).await?,
                }
            }
        }

        // poll authorizations until the join is satisfied: all valid, or
        // any invalid
        self.enter(PollerState::PollingAuthorizations)?;
        backoff.reset();
        let pending_urls: Vec<String> = self
            .authzs
            .iter()
            .filter(|authz| authz.needs_challenge())
            .map(|authz| authz.url.clone())
            .collect();
        loop {
            self.check_cancel()?;
            let mut all_valid = true;
            for url in &pending_urls {
                let auth: api::Authorization = loop {
                    self.check_cancel()?;
                    let attempt = self
                        .session
                        .post_as_get(url)
                        .await
                        .and_then(|res| res.json());
                    match attempt {
                        Ok(auth) => break auth,
                        Err(err) => self.retry_or_fail(err, &mut backoff, phase).await?,
                    }
                };

                match auth.status {
                    api::AuthorizationStatus::Valid => {}
                    api::AuthorizationStatus::Invalid
                    | api::AuthorizationStatus::Deactivated
                    | api::AuthorizationStatus::Expired
                    | api::AuthorizationStatus::Revoked => {
                        return self.authorization_invalid(auth).await;
                    }
                    api::AuthorizationStatus::Pending => all_valid = false,
                }
            }
            if all_valid {
                break;
            }
            let delay = backoff.next_delay();
            self.pause(delay, phase).await?;
        }

        // the order should now move to ready
        backoff.reset();
        loop {
            self.check_cancel()?;
            let mut order = self.order.clone().expect("order set above");
            match self.session.refresh_order(&mut order).await {
                Ok(()) => {
                    let status = order.api.status;
                    self.order = Some(order);
                    match status {
                        Some(api::OrderStatus::Ready) | Some(api::OrderStatus::Valid) => break,
                        Some(api::OrderStatus::Invalid) => return self.order_invalid().await,
                        _ => {
                            let delay = backoff.next_delay();
                            self.pause(delay, phase).await?;
                        }
                    }
                }
                Err(err) => self.retry_or_fail(err, &mut backoff, phase).await?,
            }
        }
        self.enter(PollerState::Ready)?;

        // finalize, unless the server already issued (a resumed order may
        // come back valid)
        let already_valid = self
            .order
            .as_ref()
            .is_some_and(|order| order.api.status_is(api::OrderStatus::Valid));
        if !already_valid {
            self.finalize().await?;
        }

        self.download().await
    }

    async fn await_dns_propagation(
        &mut self,
        selected: &[ChallengeResponse],
        phase: Phase,
    ) -> Result<()> {
        let dns_responses: Vec<&ChallengeResponse> = selected
            .iter()
            .filter(|response| response.challenge_type == "dns-01")
            .collect();
        if dns_responses.is_empty() {
            return Ok(());
        }

        let mut backoff = Backoff::new(self.policy.dns_base, &self.policy);
        loop {
            self.check_cancel()?;

            let mut all_seen = true;
            for response in &dns_responses {
                let (Some(name), Some(expected)) = (
                    response.dns_record_name.as_deref(),
                    response.response.as_deref(),
                ) else {
                    continue;
                };

                let observed = self.resolver.lookup_txt(name).await;
                if !observed.iter().any(|value| value == expected) {
                    log::debug!("TXT record at {name} not observable yet");
                    all_seen = false;
                    break;
                }
            }

            if all_seen {
                return Ok(());
            }
            let delay = backoff.next_delay();
            self.pause(delay, phase).await?;
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        self.enter(PollerState::Finalizing)?;
        let phase = self.phase("finalization", self.policy.finalization_budget);
        let mut backoff = Backoff::new(self.policy.poll_base, &self.policy);

        let order_api = self.order.as_ref().expect("order set").api.clone();

        let csr = loop {
            self.check_cancel()?;
            match self.publisher.get_csr(&order_api.identifiers).await {
                Ok(csr) => break csr,
                Err(err) => {
                    self.retry_or_fail(Error::Callback(err), &mut backoff, phase)
                        .await?
                }
            }
        };

        let finalize = api::Finalize::new(BASE64_URL_SAFE_NO_PAD.encode(&csr));
        let body = serde_json::to_vec(&finalize)?;
        let finalize_url = order_api.finalize.clone();

        backoff.reset();
        loop {
            self.check_cancel()?;
            match self.session.post(&finalize_url, &body).await {
                Ok(_) => break,
                Err(err) if err.is_transient() => {
                    self.retry_or_fail(err, &mut backoff, phase).await?
                }
                Err(Error::Protocol { problem, .. }) => {
                    // a 4xx rejection of the CSR is the caller's call
                    let err = Error::Finalization { problem };
                    match self
                        .publisher
                        .handle_finalization_error(&order_api, &err)
                        .await
                    {
                        FinalizationDisposition::Retry => {
                            log::debug!("finalization retry requested after: {err}");
                            let delay = backoff.next_delay();
                            self.pause(delay, phase).await?;
                        }
                        FinalizationDisposition::Abort => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }

        // wait out "processing"
        self.enter(PollerState::PollingOrder)?;
        backoff.reset();
        loop {
            self.check_cancel()?;
            let mut order = self.order.clone().expect("order set");
            match self.session.refresh_order(&mut order).await {
                Ok(()) => {
                    let status = order.api.status;
                    self.order = Some(order);
                    match status {
                        Some(api::OrderStatus::Valid) => return Ok(()),
                        Some(api::OrderStatus::Invalid) => return self.order_invalid().await,
                        _ => {
                            let delay = backoff.next_delay();
                            self.pause(delay, phase).await?;
                        }
                    }
                }
                Err(err) => self.retry_or_fail(err, &mut backoff, phase).await?,
            }
        }
    }

    async fn download(&mut self) -> Result<()> {
        self.enter(PollerState::Downloading)?;
        let phase = self.phase("certificate download", self.policy.download_budget);
        let mut backoff = Backoff::new(self.policy.poll_base, &self.policy);

        let order_api = self.order.as_ref().expect("order set").api.clone();
        let cert_url = order_api.certificate.clone().ok_or_else(|| {
            Error::InvalidResponse("valid order is missing a certificate URL".into())
        })?;

        let pem = loop {
            self.check_cancel()?;
            match self.session.post_as_get(&cert_url).await {
                Ok(res) => break res.body().to_owned(),
                Err(err) => self.retry_or_fail(err, &mut backoff, phase).await?,
            }
        };
        self.certificate = Some(pem.clone());

        backoff.reset();
        loop {
            self.check_cancel()?;
            match self.publisher.process_certificate(&order_api, &pem).await {
                Ok(()) => break,
                Err(err) => {
                    self.retry_or_fail(Error::Callback(err), &mut backoff, phase)
                        .await?
                }
            }
        }

        loop {
            self.check_cancel()?;
            match self.publisher.ack_order(&order_api).await {
                Ok(()) => break,
                Err(err) => {
                    self.retry_or_fail(Error::Callback(err), &mut backoff, phase)
                        .await?
                }
            }
        }

        Ok(())
    }

    async fn authorization_invalid(&mut self, auth: api::Authorization) -> Result<()> {
        log::warn!(
            "authorization for {} is {:?}",
            auth.identifier.value,
            auth.status
        );
        let order_api = self.order.as_ref().expect("order set").api.clone();
        self.publisher.invalid_order(&order_api).await;

        Err(Error::AuthorizationInvalid {
            identifier: auth.identifier.value.clone(),
            problem: auth.challenge_error().cloned(),
        })
    }

    async fn order_invalid(&mut self) -> Result<()> {
        let order_api = self.order.as_ref().expect("order set").api.clone();
        log::warn!("order for {:?} is invalid", order_api.domains());
        self.publisher.invalid_order(&order_api).await;

        Err(Error::AuthorizationInvalid {
            identifier: order_api.domains().join(","),
            problem: order_api.error.clone(),
        })
    }

    fn phase(&self, what: &'static str, budget: Duration) -> Phase {
        Phase {
            deadline: Instant::now() + budget,
            budget,
            what,
        }
    }

    fn enter(&mut self, state: PollerState) -> Result<()> {
        self.check_cancel()?;
        log::debug!("order poller state: {state:?}");
        self.status_tx.send_modify(|status| status.state = state);
        Ok(())
    }

    fn check_cancel(&self) -> Result<()> {
        if *self.cancel_rx.borrow() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Classify `err`: transient errors wait (honoring `Retry-After` when
    /// the server supplied one) and return so the caller's loop retries;
    /// anything else propagates.
    async fn retry_or_fail(
        &mut self,
        err: Error,
        backoff: &mut Backoff,
        phase: Phase,
    ) -> Result<()> {
        if !err.is_transient() {
            return Err(err);
        }

        let delay = err.retry_after().unwrap_or_else(|| backoff.next_delay());
        log::warn!("{} hit a transient error ({err}); retrying in {delay:?}", phase.what);
        self.pause(delay, phase).await
    }

    /// Sleep `delay`, bounded by the phase deadline, waking early on
    /// cancellation.
    async fn pause(&mut self, delay: Duration, phase: Phase) -> Result<()> {
        let now = Instant::now();
        if now >= phase.deadline {
            return Err(Error::Timeout {
                what: phase.what,
                budget: phase.budget,
            });
        }

        let delay = delay.min(phase.deadline - now);
        tokio::select! {
            _ = cancelled(&mut self.cancel_rx) => Err(Error::Cancelled),
            _ = sleep(delay) => Ok(()),
        }
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // handle dropped without cancelling; keep running detached
            std::future::pending::<()>().await;
        }
    }
}
