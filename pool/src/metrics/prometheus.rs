use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};
use std::sync::OnceLock;

static ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static REJECTED: OnceLock<IntCounter> = OnceLock::new();
static INVALID: OnceLock<IntCounter> = OnceLock::new();
static AUTH_FAILS: OnceLock<IntCounter> = OnceLock::new();
static DISCONNECTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static VARDIFF_RETARGETS: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_CANDIDATES: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_ACCEPTED: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static WORKBASE_HEIGHT: OnceLock<IntGauge> = OnceLock::new();

fn accepted() -> &'static IntCounter {
    ACCEPTED.get_or_init(|| IntCounter::new("shares_accepted_total", "Total accepted shares").unwrap())
}

fn rejected() -> &'static IntCounter {
    REJECTED.get_or_init(|| IntCounter::new("shares_rejected_total", "Total rejected shares").unwrap())
}

fn invalid() -> &'static IntCounter {
    INVALID.get_or_init(|| {
        IntCounter::new("shares_invalid_total", "Total malformed share submissions").unwrap()
    })
}

fn auth_fails() -> &'static IntCounter {
    AUTH_FAILS
        .get_or_init(|| IntCounter::new("auth_fails_total", "Total failed authorize attempts").unwrap())
}

fn disconnects() -> &'static IntCounter {
    DISCONNECTS.get_or_init(|| {
        IntCounter::new("client_disconnects_total", "Total client disconnects").unwrap()
    })
}

fn rpc_errors() -> &'static IntCounter {
    RPC_ERRORS.get_or_init(|| IntCounter::new("rpc_errors_total", "Total malformed RPC messages").unwrap())
}

fn vardiff_retargets() -> &'static IntCounter {
    VARDIFF_RETARGETS.get_or_init(|| {
        IntCounter::new("vardiff_retargets_total", "Total vardiff retarget events").unwrap()
    })
}

fn job_broadcasts() -> &'static IntCounter {
    JOB_BROADCASTS.get_or_init(|| {
        IntCounter::new("job_broadcasts_total", "Total mining.notify broadcasts sent").unwrap()
    })
}

fn block_candidates() -> &'static IntCounter {
    BLOCK_CANDIDATES.get_or_init(|| {
        IntCounter::new(
            "block_candidates_total",
            "Total shares meeting the network target",
        )
        .unwrap()
    })
}

fn blocks_accepted() -> &'static IntCounter {
    BLOCKS_ACCEPTED.get_or_init(|| {
        IntCounter::new("blocks_accepted_total", "Total candidate blocks accepted upstream")
            .unwrap()
    })
}

fn active_sessions() -> &'static IntGauge {
    ACTIVE_SESSIONS
        .get_or_init(|| IntGauge::new("sessions_active", "Sessions currently in the table").unwrap())
}

fn workbase_height() -> &'static IntGauge {
    WORKBASE_HEIGHT
        .get_or_init(|| IntGauge::new("workbase_height", "Current workbase height").unwrap())
}

pub fn inc_accepted() {
    accepted().inc();
}

pub fn inc_rejected() {
    rejected().inc();
}

pub fn inc_invalid() {
    invalid().inc();
}

pub fn inc_auth_fails() {
    auth_fails().inc();
}

pub fn inc_disconnects() {
    disconnects().inc();
}

pub fn inc_rpc_errors() {
    rpc_errors().inc();
}

pub fn inc_vardiff_retarget() {
    vardiff_retargets().inc();
}

pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
}

pub fn inc_block_candidates() {
    block_candidates().inc();
}

pub fn inc_blocks_accepted() {
    blocks_accepted().inc();
}

pub fn set_active_sessions(n: usize) {
    active_sessions().set(n as i64);
}

pub fn set_workbase_height(height: u64) {
    workbase_height().set(height as i64);
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(accepted().collect());
    mfs.extend(rejected().collect());
    mfs.extend(invalid().collect());
    mfs.extend(auth_fails().collect());
    mfs.extend(disconnects().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(vardiff_retargets().collect());
    mfs.extend(job_broadcasts().collect());
    mfs.extend(block_candidates().collect());
    mfs.extend(blocks_accepted().collect());
    mfs.extend(active_sessions().collect());
    mfs.extend(workbase_height().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}
