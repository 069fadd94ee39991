use criterion::{criterion_group, criterion_main, Criterion};
use parking_lot::Mutex;
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;

use lode_pool::config::PoolConfig;
use lode_pool::registry::PoolRegistry;
use lode_pool::session::Session;
use lode_pool::shares::process_submit;
use lode_pool::workbase::{WorkbaseStore, WorkbaseTemplate};

fn template() -> WorkbaseTemplate {
    WorkbaseTemplate {
        version: 0x20000000,
        prevhash: hex::encode([0xabu8; 32]),
        coinbase1: "01000000010000000000000000".to_string(),
        coinbase2: "ffffffff0100f2052a01000000".to_string(),
        merkles: vec![hex::encode([0x44u8; 32]), hex::encode([0x55u8; 32])],
        nbits: "1b0404cb".to_string(),
        ntime: 0x6553f100,
        height: 850000,
    }
}

fn bench_share_validation(c: &mut Criterion) {
    let config = PoolConfig {
        mindiff: 0.0,
        ..Default::default()
    };
    let store = WorkbaseStore::new(60.0);
    store.put(&template(), 0.0).unwrap();
    let registry = Mutex::new(PoolRegistry::new());

    let session = Arc::new(Session::new(1, 0.0));
    {
        let mut state = session.state.write();
        state.subscribed = true;
        state.authorised = true;
        state.enonce1 = "0000000000000001".to_string();
        state.workername = "addr.rig".to_string();
        state.diff = 1e-12;
        state.old_diff = 1e-12;
        state.diff_change_job_id = 1;
    }

    let mut counter: u64 = 0;
    c.bench_function("share_validation", |b| {
        b.iter(|| {
            counter += 1;
            let nonce2 = format!("{counter:016x}");
            let params = vec![
                json!("addr.rig"),
                json!("0000000000000001"),
                json!(nonce2),
                json!("6553f100"),
                json!("deadbeef"),
            ];
            black_box(process_submit(
                &session, &params, &store, &registry, &config, 1.0,
            ))
        })
    });
}

criterion_group!(benches, bench_share_validation);
criterion_main!(benches);
