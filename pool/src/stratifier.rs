//! The stratifier: message dispatch, session lifecycle, watchdog.
//!
//! Sits between the connector (which owns sockets) and the generator
//! (which owns templates and the node RPC). All state lives in an
//! injected `PoolState`; nothing here is process-global.
//!
//! Lock order: the workbase rwlock write side is never held across any
//! other lock; a session state lock may be held while taking the
//! registry mutex, never the reverse. Worker/user internals are leaf
//! locks.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use lode_core::clock::monotonic_now;
use lode_core::target::normalize_pool_diff;

use crate::config::PoolConfig;
use crate::connector::{ClientMessage, Connector};
use crate::generator::Generator;
use crate::metrics::prometheus as metrics;
use crate::registry::PoolRegistry;
use crate::session::{parse_password_diff, Session, REJECT_RUN_DROP};
use crate::shares::acceptor::{self, SubmitVerdict};
use crate::stats::{
    PersistSink, PoolSnapshot, SnapshotSink, StratifierMetrics, UserRecord, UserSnapshot,
    WorkerSnapshot,
};
use crate::stratum::protocol::{
    notification, set_difficulty, ua_allowed, StratumError, StratumRequest, StratumResponse,
};
use crate::vardiff::{self, DiffBounds, Retarget, DIFF_EPSILON, TARGET_SHARE_SECS};
use crate::workbase::{Workbase, WorkbaseStore, WorkbaseTemplate};

const WATCHDOG_PERIOD: Duration = Duration::from_secs(1);
/// Seconds of share silence before the cold-path decay kicks in.
const IDLE_SCAN_SECS: f64 = 60.0;

pub struct PoolState {
    pub config: PoolConfig,
    pub workbases: WorkbaseStore,
    pub registry: Mutex<PoolRegistry>,
    pub metrics: StratifierMetrics,
}

pub struct Stratifier {
    state: Arc<PoolState>,
    connector: Arc<dyn Connector>,
    generator: Arc<dyn Generator>,
    persist_sink: Mutex<Option<PersistSink>>,
    snapshot_sink: Mutex<Option<SnapshotSink>>,
    last_prevhash: Mutex<Option<[u8; 32]>>,
    shutdown: watch::Sender<bool>,
}

impl Stratifier {
    pub fn new(
        mut config: PoolConfig,
        connector: Arc<dyn Connector>,
        generator: Arc<dyn Generator>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let workbases = WorkbaseStore::new(config.workbase_grace);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            state: Arc::new(PoolState {
                config,
                workbases,
                registry: Mutex::new(PoolRegistry::new()),
                metrics: StratifierMetrics::new(),
            }),
            connector,
            generator,
            persist_sink: Mutex::new(None),
            snapshot_sink: Mutex::new(None),
            last_prevhash: Mutex::new(None),
            shutdown,
        })
    }

    pub fn state(&self) -> Arc<PoolState> {
        self.state.clone()
    }

    pub fn set_persist_sink(&self, sink: PersistSink) {
        *self.persist_sink.lock() = Some(sink);
    }

    pub fn set_snapshot_sink(&self, sink: SnapshotSink) {
        *self.snapshot_sink.lock() = Some(sink);
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn send(&self, client_id: u64, line: String) {
        self.connector.send_to_client(client_id, line).await;
    }

    async fn reply_ok(&self, client_id: u64, id: Value, result: Value) {
        self.send(client_id, StratumResponse::ok(id, result).to_line())
            .await;
    }

    async fn reply_err(&self, client_id: u64, id: Value, err: StratumError) {
        self.send(client_id, StratumResponse::err(id, &err).to_line())
            .await;
    }

    /// Ingest one template snapshot from the generator: store it, make it
    /// current, and notify every subscribed session.
    pub async fn add_workbase(&self, tpl: WorkbaseTemplate) -> anyhow::Result<u64> {
        let now = monotonic_now();
        let wb = self.state.workbases.put(&tpl, now)?;

        let clean = {
            let mut last = self.last_prevhash.lock();
            let changed = last.map(|p| p != wb.prevhash).unwrap_or(true);
            *last = Some(wb.prevhash);
            changed
        };

        metrics::set_workbase_height(wb.height);
        info!(
            "workbase {} height {} network_diff {:.3e} clean={}",
            wb.id, wb.height, wb.network_diff, clean
        );

        let sessions: Vec<Arc<Session>> = {
            let registry = self.state.registry.lock();
            registry.sessions.values().cloned().collect()
        };
        let line = notify_line(&wb, clean);
        let mut notified = 0usize;
        for session in sessions {
            let subscribed = {
                let mut state = session.state.write();
                if state.dropped || !state.subscribed {
                    false
                } else {
                    state.current_workbase = Some(wb.id);
                    true
                }
            };
            if subscribed {
                self.send(session.id, line.clone()).await;
                notified += 1;
            }
        }
        if notified > 0 {
            metrics::inc_job_broadcasts();
            debug!("notified {notified} sessions of workbase {}", wb.id);
        }
        Ok(wb.id)
    }

    /// Entry point for one decoded JSON-RPC line from a client.
    pub async fn handle_message(
        &self,
        client_id: u64,
        line: &str,
        source: Option<(IpAddr, u16)>,
    ) {
        let req = match StratumRequest::parse(line) {
            Ok(req) => req,
            Err(err) => {
                self.state
                    .metrics
                    .rpc_errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                metrics::inc_rpc_errors();
                debug!("client {client_id}: unparseable message: {err}");
                self.reply_err(client_id, Value::Null, StratumError::InvalidParams)
                    .await;
                return;
            }
        };

        let now = monotonic_now();
        let session = {
            let mut registry = self.state.registry.lock();
            registry.session_or_create(client_id, now)
        };
        if let Some(source) = source {
            let mut state = session.state.write();
            if state.source.is_none() {
                state.source = Some(source);
            }
        }

        match req.method.as_str() {
            "mining.subscribe" => self.handle_subscribe(&session, &req).await,
            "mining.configure" => self.handle_configure(&session, &req).await,
            "mining.suggest_difficulty" => self.handle_suggest_difficulty(&session, &req).await,
            "mining.authorize" => {
                if !session.state.read().subscribed {
                    self.drop_session(&session, "authorize before subscribe").await;
                } else {
                    self.handle_authorize(&session, &req).await;
                }
            }
            "mining.submit" => {
                if !session.state.read().subscribed {
                    self.drop_session(&session, "submit before subscribe").await;
                } else {
                    self.handle_submit(&session, &req).await;
                }
            }
            other => {
                if !session.state.read().subscribed {
                    self.drop_session(&session, "unknown method before subscribe")
                        .await;
                } else {
                    debug!("client {client_id}: unknown method {other}");
                    self.state
                        .metrics
                        .rpc_errors
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    metrics::inc_rpc_errors();
                    self.reply_err(client_id, req.id.clone(), StratumError::UnknownMethod)
                        .await;
                }
            }
        }
    }

    /// The connector lost this client's socket.
    pub async fn handle_disconnect(&self, client_id: u64) {
        let session = self.state.registry.lock().session(client_id);
        if let Some(session) = session {
            self.state
                .metrics
                .client_disconnects
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            metrics::inc_disconnects();
            self.mark_dropped(&session);
        }
    }

    async fn handle_subscribe(&self, session: &Arc<Session>, req: &StratumRequest) {
        let params = req.params_array();
        let useragent = params
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        if !ua_allowed(&useragent, &self.state.config.ua_whitelist) {
            warn!(
                "client {}: useragent {useragent:?} not whitelisted",
                session.id
            );
            self.reply_err(
                session.id,
                req.id.clone(),
                StratumError::UnauthorizedUserAgent,
            )
            .await;
            self.drop_session(session, "useragent not whitelisted").await;
            return;
        }

        let enonce1 = {
            let mut state = session.state.write();
            if !state.subscribed {
                state.subscribed = true;
                state.enonce1 = format!("{:016x}", session.id);
            }
            state.useragent = useragent;
            state.enonce1.clone()
        };

        debug!("client {}: subscribed enonce1={enonce1}", session.id);
        self.reply_ok(
            session.id,
            req.id.clone(),
            json!([
                [
                    ["mining.set_difficulty", enonce1.clone()],
                    ["mining.notify", enonce1.clone()]
                ],
                enonce1,
                self.state.config.enonce2_size
            ]),
        )
        .await;
    }

    async fn handle_configure(&self, session: &Arc<Session>, req: &StratumRequest) {
        let params = req.params_array();
        let extensions: Vec<String> = params
            .first()
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        if extensions.iter().any(|e| e == "version-rolling") {
            let requested = params
                .get(1)
                .and_then(|v| v.get("version-rolling.mask"))
                .and_then(|v| v.as_str())
                .and_then(|s| u32::from_str_radix(s, 16).ok())
                .unwrap_or(u32::MAX);
            let agreed = self.state.config.version_mask & requested;
            session.state.write().version_mask = Some(agreed);
            self.reply_ok(
                session.id,
                req.id.clone(),
                json!({
                    "version-rolling": true,
                    "version-rolling.mask": format!("{agreed:08x}"),
                }),
            )
            .await;
        } else {
            // No extension we support; echo an empty agreement.
            self.reply_ok(session.id, req.id.clone(), json!({})).await;
        }
    }

    async fn handle_authorize(&self, session: &Arc<Session>, req: &StratumRequest) {
        let params = req.params_array();
        let workername = params.first().and_then(|v| v.as_str()).unwrap_or("");
        let password = params.get(1).and_then(|v| v.as_str()).unwrap_or("");
        let now = monotonic_now();

        if session.state.read().authorised {
            // Repeat authorize from a live session is answered, not
            // re-attached.
            let same = session.state.read().workername == workername;
            self.reply_ok(session.id, req.id.clone(), json!(same)).await;
            return;
        }

        if workername.is_empty() {
            self.auth_failed(session, req, None, now).await;
            return;
        }

        let (user_part, worker_part) = crate::users::split_username(workername);
        let user = {
            let mut registry = self.state.registry.lock();
            registry.users.get_or_create(user_part, now)
        };

        // Back-off gate: repeated failures inside the window are refused
        // without touching the credential path.
        let throttled = {
            let mut auth = user.auth.lock();
            if !auth.authorised
                && auth.failed_authtime > 0.0
                && now - auth.failed_authtime < auth.auth_backoff
            {
                auth.throttled = true;
                true
            } else {
                false
            }
        };
        if throttled {
            debug!("user {user_part}: authorize throttled by back-off");
            self.state
                .metrics
                .auth_fails
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            metrics::inc_auth_fails();
            self.reply_ok(session.id, req.id.clone(), json!(false)).await;
            return;
        }

        session.state.write().authorising = true;

        if user.address.is_none() {
            session.state.write().authorising = false;
            self.auth_failed(session, req, Some(&user), now).await;
            return;
        }

        let worker = user.get_or_create_worker(worker_part, now);

        {
            let mut auth = user.auth.lock();
            auth.authorised = true;
            auth.auth_time = now;
            auth.failed_authtime = 0.0;
            auth.auth_backoff = 0.0;
            auth.throttled = false;
        }

        // Password-selected difficulty acts as a worker floor.
        let password_diff = parse_password_diff(
            password,
            self.state.config.mindiff,
            self.state.config.maxdiff,
        );
        if password_diff > 0.0 {
            worker.state.lock().mindiff = password_diff;
        }

        let (useragent, suggest_diff) = {
            let state = session.state.read();
            (state.useragent.clone(), state.suggest_diff)
        };

        worker.instance_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        worker.refresh_useragent(Some(&useragent));
        user.attach_session(session.id);

        let current_wb = self.state.workbases.current();
        let network_diff = current_wb
            .as_ref()
            .map(|wb| wb.network_diff)
            .unwrap_or(f64::INFINITY);

        // Initial difficulty: worker history beats start_diff, an explicit
        // suggestion or password diff beats both.
        let mut initial = self.state.config.start_diff;
        let history = worker.state.lock().rates.dsps5;
        if history > 0.0 {
            initial = normalize_pool_diff(history * TARGET_SHARE_SECS);
        }
        if suggest_diff > 0.0 {
            initial = suggest_diff;
        }
        if password_diff > 0.0 {
            initial = password_diff;
        }
        initial = initial.max(self.state.config.mindiff);
        if self.state.config.maxdiff > 0.0 {
            initial = initial.min(self.state.config.maxdiff);
        }
        if initial > network_diff {
            initial = network_diff;
        }
        initial = normalize_pool_diff(initial);

        let ua_key = self.state.registry.lock().ua.add(&useragent);

        {
            let mut state = session.state.write();
            state.authorising = false;
            state.authorised = true;
            state.workername = workername.to_string();
            state.user = Some(user.clone());
            state.worker = Some(worker.clone());
            state.ua_key = ua_key;
            state.old_diff = initial;
            state.diff = initial;
            state.password_diff_set = password_diff > 0.0;
            state.ssdc = 0;
            state.last_diff_change = now;
            // A diff chosen at authorize applies to the job the client is
            // about to work on, not the next one.
            state.diff_change_job_id = self.state.workbases.current_id().unwrap_or(0);
        }

        info!(
            "client {}: authorized {workername} diff {initial}",
            session.id
        );

        self.reply_ok(session.id, req.id.clone(), json!(true)).await;
        self.send(session.id, set_difficulty(initial)).await;
        if let Some(wb) = current_wb {
            session.state.write().current_workbase = Some(wb.id);
            self.send(session.id, notify_line(&wb, true)).await;
        }
    }

    async fn auth_failed(
        &self,
        session: &Arc<Session>,
        req: &StratumRequest,
        user: Option<&Arc<crate::users::User>>,
        now: f64,
    ) {
        if let Some(user) = user {
            let mut auth = user.auth.lock();
            auth.failed_authtime = now;
            auth.auth_backoff = if auth.auth_backoff <= 0.0 {
                self.state.config.auth_backoff_start
            } else {
                (auth.auth_backoff * 2.0).min(self.state.config.auth_backoff_cap)
            };
            debug!(
                "user {}: auth failed, back-off now {}s",
                user.username, auth.auth_backoff
            );
        }
        self.state
            .metrics
            .auth_fails
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        metrics::inc_auth_fails();
        self.reply_ok(session.id, req.id.clone(), json!(false)).await;
    }

    async fn handle_suggest_difficulty(&self, session: &Arc<Session>, req: &StratumRequest) {
        let Some(requested) = req.params_array().first().and_then(value_as_f64) else {
            return;
        };
        if !requested.is_finite() || requested <= 0.0 {
            return;
        }
        let mut wanted = requested.max(self.state.config.mindiff);
        if self.state.config.maxdiff > 0.0 {
            wanted = wanted.min(self.state.config.maxdiff);
        }
        wanted = normalize_pool_diff(wanted);

        let now = monotonic_now();
        let broadcast = {
            let mut state = session.state.write();
            if (wanted - state.suggest_diff).abs() < DIFF_EPSILON
                || (state.diff - wanted).abs() < DIFF_EPSILON
            {
                false
            } else if !state.authorised {
                // Queued; applied as the initial difficulty at authorize.
                state.suggest_diff = wanted;
                false
            } else {
                state.old_diff = state.diff;
                state.diff = wanted;
                state.suggest_diff = wanted;
                state.ssdc = 0;
                state.last_diff_change = now;
                // Takes effect on the next issued job.
                state.diff_change_job_id = self.state.workbases.next_id();
                true
            }
        };
        if broadcast {
            debug!("client {}: suggest_difficulty -> {wanted}", session.id);
            self.send(session.id, set_difficulty(wanted)).await;
        }
    }

    async fn handle_submit(&self, session: &Arc<Session>, req: &StratumRequest) {
        if !session.state.read().authorised {
            // Authorize may still be in flight; reject-and-move-on keeps
            // the accept loop from blocking on the authorizer.
            self.reply_err(session.id, req.id.clone(), StratumError::Stale)
                .await;
            return;
        }

        let started = Instant::now();
        let now = monotonic_now();
        let outcome = acceptor::process_submit(
            session,
            req.params_array(),
            &self.state.workbases,
            &self.state.registry,
            &self.state.config,
            now,
        );
        self.state
            .metrics
            .submit_latency
            .lock()
            .record(started.elapsed().as_secs_f64());

        match &outcome.verdict {
            SubmitVerdict::Accepted(share) => {
                self.state
                    .metrics
                    .shares_accepted
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                metrics::inc_accepted();
                debug!(
                    "client {}: share accepted diff {:.3} measured {:.3}",
                    session.id, share.credited_diff, share.share_diff
                );
                self.reply_ok(session.id, req.id.clone(), json!(true)).await;
            }
            SubmitVerdict::Rejected(err) => {
                self.state
                    .metrics
                    .shares_rejected
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                metrics::inc_rejected();
                debug!("client {}: share rejected: {err}", session.id);
                self.reply_err(session.id, req.id.clone(), err.to_stratum())
                    .await;
            }
            SubmitVerdict::Malformed(what) => {
                self.state
                    .metrics
                    .shares_invalid
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                metrics::inc_invalid();
                debug!("client {}: malformed submit: {what}", session.id);
                self.reply_err(session.id, req.id.clone(), StratumError::InvalidParams)
                    .await;
            }
        }

        if let Some(new_diff) = outcome.new_diff {
            metrics::inc_vardiff_retarget();
            debug!("client {}: vardiff -> {new_diff}", session.id);
            self.send(session.id, set_difficulty(new_diff)).await;
        }

        if let Some((block_hex, meta)) = outcome.candidate {
            metrics::inc_block_candidates();
            info!(
                "client {}: BLOCK CANDIDATE height {} hash {}",
                session.id, meta.height, meta.hash_hex
            );
            let fetch_started = Instant::now();
            match self.generator.submit_block(block_hex, meta).await {
                Ok(true) => metrics::inc_blocks_accepted(),
                Ok(false) => warn!("candidate block rejected upstream"),
                Err(err) => {
                    // Upstream trouble never stops share acceptance.
                    error!("block submit failed: {err}");
                    self.state
                        .metrics
                        .rpc_errors
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    metrics::inc_rpc_errors();
                }
            }
            self.state
                .metrics
                .block_fetch_latency
                .lock()
                .record(fetch_started.elapsed().as_secs_f64());
        }
    }

    /// Mark a session dropped and detach it from worker/user/UA
    /// accounting. Table removal is the watchdog's job.
    fn mark_dropped(&self, session: &Arc<Session>) {
        let (worker, user, ua_key, was_authorised) = {
            let mut state = session.state.write();
            if state.dropped {
                return;
            }
            state.dropped = true;
            let was_authorised = state.authorised;
            state.authorised = false;
            (
                state.worker.take(),
                state.user.take(),
                state.ua_key.take(),
                was_authorised,
            )
        };
        if !was_authorised {
            return;
        }
        if let Some(worker) = worker {
            worker
                .instance_count
                .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            worker.refresh_useragent(None);
        }
        if let Some(user) = user {
            user.detach_session(session.id);
        }
        if let Some(key) = ua_key {
            // The stored key is already normalized; removal re-normalizes
            // idempotently, so pairing with the original add holds.
            self.state.registry.lock().ua.remove(&key);
        }
    }

    async fn drop_session(&self, session: &Arc<Session>, reason: &str) {
        debug!("client {}: dropped ({reason})", session.id);
        self.mark_dropped(session);
        self.connector.drop_client(session.id).await;
    }

    /// One watchdog pass: reap zombies, decay idle sessions, enforce
    /// dropidle, purge retired workbases.
    pub async fn watchdog_tick(&self) {
        let now = monotonic_now();
        let sessions: Vec<Arc<Session>> = {
            let registry = self.state.registry.lock();
            registry.sessions.values().cloned().collect()
        };

        for session in &sessions {
            let (dropped, authorised, last_share, last_decay, reject_run) = {
                let state = session.state.read();
                (
                    state.dropped,
                    state.authorised,
                    state.last_share,
                    state.last_decay,
                    state.reject_run,
                )
            };

            if dropped {
                if self.connector.client_exists(session.id) {
                    // Legitimate drop: the connector still owns a socket.
                    self.connector.drop_client(session.id).await;
                } else {
                    // Unlink only when nobody else borrows it: the table
                    // and our sweep clone are the two expected holders.
                    let mut registry = self.state.registry.lock();
                    if Arc::strong_count(session) <= 2 {
                        registry.remove_session(session.id);
                    }
                }
                continue;
            }

            if reject_run == REJECT_RUN_DROP {
                self.drop_session(session, "reject run").await;
                continue;
            }

            if self.state.config.dropidle > 0.0
                && authorised
                && last_share > 0.0
                && now - last_share > self.state.config.dropidle
            {
                self.drop_session(session, "idle").await;
                continue;
            }

            // Cold path: sessions silent beyond the fast windows decay
            // toward zero and may have their diff re-clamped downward.
            if authorised && now - last_decay >= IDLE_SCAN_SECS {
                let (dsps5, ssdc, since_change, current_diff, worker) = {
                    let mut state = session.state.write();
                    let gap = now - state.last_decay;
                    state.rates.decay_idle(gap);
                    state.last_decay = now;
                    (
                        state.rates.dsps5,
                        state.ssdc,
                        now - state.last_diff_change,
                        state.diff,
                        state.worker.clone(),
                    )
                };
                let mut worker_mindiff = 0.0;
                if let Some(worker) = &worker {
                    let mut wstate = worker.state.lock();
                    worker_mindiff = wstate.mindiff;
                    if last_share > 0.0 && now - last_share > IDLE_SCAN_SECS {
                        wstate.idle = true;
                    }
                }
                let network_diff = self
                    .state
                    .workbases
                    .current()
                    .map(|wb| wb.network_diff)
                    .unwrap_or(f64::INFINITY);
                let bounds = DiffBounds {
                    pool_mindiff: self.state.config.mindiff,
                    pool_maxdiff: self.state.config.maxdiff,
                    worker_mindiff,
                    worker_maxdiff: 0.0,
                    network_diff,
                };
                if let Retarget::Adjust(next) = vardiff::retarget(
                    current_diff,
                    dsps5,
                    ssdc,
                    since_change,
                    worker_mindiff > 0.0,
                    &bounds,
                ) {
                    // The cold path only ever lowers difficulty.
                    if next < current_diff {
                        {
                            let mut state = session.state.write();
                            state.old_diff = state.diff;
                            state.diff = next;
                            state.ssdc = 0;
                            state.last_diff_change = now;
                            state.diff_change_job_id = self.state.workbases.next_id();
                        }
                        metrics::inc_vardiff_retarget();
                        self.send(session.id, set_difficulty(next)).await;
                    }
                }
            }
        }

        let purged = self.state.workbases.purge(now);
        if purged > 0 {
            debug!("purged {purged} retired workbases");
        }
        metrics::set_active_sessions(self.state.registry.lock().session_count());
    }

    /// Emit the periodic stats snapshot and per-user persistence records.
    pub async fn stats_tick(&self) {
        let (users, ua, session_count, user_count) = {
            let registry = self.state.registry.lock();
            (
                registry.users.iter().cloned().collect::<Vec<_>>(),
                registry.ua.snapshot(),
                registry.session_count(),
                registry.users.len(),
            )
        };

        let mut user_stats = Vec::with_capacity(users.len());
        for user in &users {
            let workers: Vec<WorkerSnapshot> = user
                .workers
                .lock()
                .iter()
                .map(|w| {
                    let wstate = w.state.lock();
                    WorkerSnapshot {
                        workername: w.workername.clone(),
                        instances: w.instances(),
                        rates: wstate.rates,
                        best_diff: wstate.best_diff,
                        best_ever: wstate.best_ever,
                        idle: wstate.idle,
                    }
                })
                .collect();
            let state = user.state.lock();
            user_stats.push(UserSnapshot {
                username: user.username.clone(),
                worker_count: workers.len(),
                session_count: user.sessions.lock().len(),
                rates: state.rates,
                best_diff: state.best_diff,
                best_ever: state.best_ever,
                shares: state.shares,
                workers,
            });
        }

        let (metrics_snapshot, delta) = self.state.metrics.snapshot_with_delta();
        let snapshot = PoolSnapshot {
            timestamp: PoolSnapshot::now_timestamp(),
            sessions: session_count,
            users: user_count,
            workbase_height: self.state.workbases.current().map(|wb| wb.height),
            metrics: metrics_snapshot,
            metrics_delta: delta,
            user_stats: user_stats.clone(),
            useragents: ua,
        };

        info!(
            "stats: {} sessions, {} users, {} accepted (+{}), {} rejected (+{})",
            snapshot.sessions,
            snapshot.users,
            snapshot.metrics.shares_accepted,
            delta.shares_accepted,
            snapshot.metrics.shares_rejected,
            delta.shares_rejected,
        );

        let persist = self.persist_sink.lock().clone();
        if let Some(sink) = persist {
            for (user, arc) in user_stats.into_iter().zip(users.iter()) {
                let (useragent, norm_useragent) = arc
                    .workers
                    .lock()
                    .first()
                    .map(|w| {
                        let ws = w.state.lock();
                        (ws.useragent.clone(), ws.norm_useragent.clone())
                    })
                    .unwrap_or_default();
                sink(UserRecord {
                    username: user.username,
                    worker_count: user.worker_count,
                    rates: user.rates,
                    best_diff: user.best_diff,
                    best_ever: user.best_ever,
                    useragent,
                    norm_useragent,
                });
            }
        }
        let snap_sink = self.snapshot_sink.lock().clone();
        if let Some(sink) = snap_sink {
            sink(snapshot);
        }
    }

    /// Main loop: route inbound client messages to sharded workers (per-
    /// client ordering is preserved by the id-hash routing), ingest
    /// template pushes, and run the watchdog and stats cadences.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<ClientMessage>,
        mut templates: mpsc::Receiver<WorkbaseTemplate>,
    ) -> anyhow::Result<()> {
        let shards = self.state.config.worker_shards.max(1);
        let mut senders = Vec::with_capacity(shards);
        let mut workers = Vec::with_capacity(shards);
        for shard in 0..shards {
            let (tx, mut rx) = mpsc::channel::<ClientMessage>(1024);
            senders.push(tx);
            let this = self.clone();
            workers.push(tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    match msg {
                        ClientMessage::Line {
                            client_id,
                            line,
                            source,
                        } => this.handle_message(client_id, &line, source).await,
                        ClientMessage::Disconnected { client_id } => {
                            this.handle_disconnect(client_id).await
                        }
                    }
                }
                debug!("submit worker {shard} finished");
            }));
        }

        let template_task = {
            let this = self.clone();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        tpl = templates.recv() => {
                            let Some(tpl) = tpl else { break };
                            if let Err(err) = this.add_workbase(tpl).await {
                                error!("bad workbase template: {err}");
                                this.state
                                    .metrics
                                    .rpc_errors
                                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                                metrics::inc_rpc_errors();
                            }
                        }
                    }
                }
            })
        };

        let watchdog_task = {
            let this = self.clone();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(WATCHDOG_PERIOD);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tick.tick() => this.watchdog_tick().await,
                    }
                }
            })
        };

        let stats_task = {
            let this = self.clone();
            let mut shutdown = self.shutdown.subscribe();
            let period = Duration::from_secs_f64(self.state.config.stats_interval.max(1.0));
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tick.tick() => this.stats_tick().await,
                    }
                }
            })
        };

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                msg = inbound.recv() => {
                    let Some(msg) = msg else { break };
                    let client_id = match &msg {
                        ClientMessage::Line { client_id, .. } => *client_id,
                        ClientMessage::Disconnected { client_id } => *client_id,
                    };
                    let shard = (client_id % shards as u64) as usize;
                    if senders[shard].send(msg).await.is_err() {
                        break;
                    }
                }
            }
        }

        // Drain: close the shards, mark every session dropped, stop the
        // background cadences.
        drop(senders);
        for worker in workers {
            let _ = worker.await;
        }
        let sessions: Vec<Arc<Session>> = {
            let registry = self.state.registry.lock();
            registry.sessions.values().cloned().collect()
        };
        for session in &sessions {
            self.mark_dropped(session);
        }
        let _ = self.shutdown.send(true);
        let _ = template_task.await;
        let _ = watchdog_task.await;
        let _ = stats_task.await;
        info!("stratifier drained {} sessions", sessions.len());
        Ok(())
    }
}

fn value_as_f64(v: &Value) -> Option<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

/// Build a mining.notify line for a workbase.
pub fn notify_line(wb: &Workbase, clean: bool) -> String {
    let branches: Vec<String> = wb.merkle_branches.iter().map(hex::encode).collect();
    notification(
        "mining.notify",
        json!([
            wb.job_id_hex(),
            wb.prevhash_stratum_hex(),
            hex::encode(&wb.coinbase1),
            hex::encode(&wb.coinbase2),
            branches,
            format!("{:08x}", wb.version),
            format!("{:08x}", wb.nbits),
            format!("{:08x}", wb.ntime),
            clean,
        ]),
    )
}
