//! Criterion benchmarks for the frame codec.
//!
//! Run with:
//! ```bash
//! cargo bench --package sonoff-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sonoff_core::protocol::codec::{decode_frame, encode_frame};
use sonoff_core::protocol::frame::{Frame, HelloFrame, UpdateFrame};
use sonoff_core::protocol::handshake::user_online;
use sonoff_core::{OutletState, Params, SwitchState};

// ── Frame fixtures ────────────────────────────────────────────────────────────

fn make_single_update() -> Frame {
    Frame::Update(UpdateFrame::command(
        "100060af40",
        "nonce",
        1_548_124_045_842,
        Params::single(SwitchState::On),
        4,
        1_548_124_045,
    ))
}

fn make_multi_update() -> Frame {
    let outlets = (0..4)
        .map(|i| OutletState::new(i, SwitchState::from(i % 2 == 0)))
        .collect();
    let params = Params::multi(outlets)
        .expect("unique outlets")
        .with_field("rssi", serde_json::json!(-62))
        .with_field("power", serde_json::json!("12.34"));
    Frame::Update(UpdateFrame::command("100040e943", "nonce", 7, params, 4, 0))
}

fn make_hello() -> Frame {
    Frame::Hello(HelloFrame {
        error: 0,
        apikey: Some("09a15816-c289-4333-bf7b-aa52ffafdf96".to_string()),
        sequence: Some("1548124045842".to_string()),
        deviceid: "100060af40".to_string(),
        config: None,
    })
}

fn fixtures() -> Vec<(&'static str, Frame)> {
    vec![
        ("UserOnline", Frame::UserOnline(user_online("nonce", 1))),
        ("Hello", make_hello()),
        ("UpdateSingle", make_single_update()),
        ("UpdateMulti", make_multi_update()),
    ]
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_frame");
    for (name, frame) in fixtures() {
        group.bench_with_input(BenchmarkId::new("frame", name), &frame, |b, frame| {
            b.iter(|| encode_frame(black_box(frame)).expect("encode must succeed"))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_frame");
    for (name, frame) in fixtures() {
        let text = encode_frame(&frame).expect("encode must succeed for benchmark setup");
        group.bench_with_input(BenchmarkId::new("frame", name), &text, |b, text| {
            b.iter(|| decode_frame(black_box(text)).expect("decode must succeed"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
