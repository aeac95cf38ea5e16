use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use whiteboard_collab::broadcast::BroadcastBus;
use whiteboard_collab::protocol::{ClientMessage, DrawAction, Point, ServerMessage};
use whiteboard_collab::registry::{
    OutboundFrame, SessionHandle, SessionRegistry, SessionState,
};

fn stroke(len: usize) -> Vec<Point> {
    (0..len as i64)
        .map(|i| Point::new(i, i * 2, 3, "#1e90ff"))
        .collect()
}

fn bench_draw_decode(c: &mut Criterion) {
    let frame = ClientMessage::draw("alice", stroke(32)).encode().unwrap();

    c.bench_function("draw_decode_32pts", |b| {
        b.iter(|| {
            black_box(ClientMessage::decode(black_box(&frame)).unwrap());
        })
    });
}

fn bench_draw_encode(c: &mut Criterion) {
    let msg = ServerMessage::Draw {
        data: DrawAction {
            points: stroke(32),
            timestamp: 1_700_000_000_000_000,
            session_id: "alice".into(),
        },
    };

    c.bench_function("draw_encode_32pts", |b| {
        b.iter(|| {
            black_box(OutboundFrame::new(black_box(&msg)).unwrap());
        })
    });
}

fn bench_sync_encode(c: &mut Criterion) {
    let actions: Vec<DrawAction> = (0..1_000)
        .map(|i| DrawAction {
            points: stroke(16),
            timestamp: i,
            session_id: format!("peer-{}", i % 10),
        })
        .collect();
    let msg = ServerMessage::sync(actions, 0);

    c.bench_function("sync_encode_1k_actions", |b| {
        b.iter(|| {
            black_box(msg.encode().unwrap());
        })
    });
}

/// Publish to 100 active sessions, draining each queue between rounds.
fn bench_fan_out(c: &mut Criterion) {
    let registry = Arc::new(SessionRegistry::new());
    let bus = BroadcastBus::new(registry.clone());
    let mut receivers = Vec::new();
    for i in 0..100 {
        let (tx, rx) = mpsc::channel(1024);
        let entry = registry.register(
            format!("peer-{i}"),
            SessionHandle {
                outbound: tx,
                cancel: CancellationToken::new(),
            },
            0,
        );
        registry.transition(&entry, SessionState::Syncing).unwrap();
        registry.transition(&entry, SessionState::Active).unwrap();
        receivers.push(rx);
    }

    let msg = ServerMessage::Draw {
        data: DrawAction {
            points: stroke(32),
            timestamp: 1,
            session_id: "peer-0".into(),
        },
    };

    c.bench_function("fan_out_100_peers", |b| {
        b.iter(|| {
            let report = bus.publish(black_box(&msg), "peer-0", true).unwrap();
            black_box(report.delivered);
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(
    benches,
    bench_draw_decode,
    bench_draw_encode,
    bench_sync_encode,
    bench_fan_out,
);
criterion_main!(benches);
