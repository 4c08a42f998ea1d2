use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quill_collab::awareness::{AwarenessState, AwarenessTracker, CursorRange, UserInfo};
use quill_collab::codec;
use quill_collab::document::DocumentStore;
use quill_collab::protocol::ChannelMessage;
use std::sync::Arc;
use uuid::Uuid;

fn bench_codec_encode(c: &mut Criterion) {
    let payload = vec![0u8; 256]; // Typical merged delta

    c.bench_function("codec_encode_256B", |b| {
        b.iter(|| {
            black_box(codec::encode(black_box(&payload)));
        })
    });
}

fn bench_codec_roundtrip(c: &mut Criterion) {
    let payload = vec![0u8; 256];
    let text = codec::encode(&payload);

    c.bench_function("codec_decode_256B", |b| {
        b.iter(|| {
            black_box(codec::decode(black_box(&text)).unwrap());
        })
    });
}

fn bench_envelope_roundtrip(c: &mut Criterion) {
    let sender = Uuid::new_v4();
    let msg = ChannelMessage::Update {
        sender,
        update: codec::encode(&vec![0u8; 256]),
    };
    let encoded = msg.encode().unwrap();

    c.bench_function("envelope_encode", |b| {
        b.iter(|| {
            black_box(msg.encode().unwrap());
        })
    });

    c.bench_function("envelope_decode", |b| {
        b.iter(|| {
            black_box(ChannelMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_merge_updates(c: &mut Criterion) {
    // Ten keystroke-level deltas from one editing burst.
    let source = DocumentStore::new();
    let mut deltas = Vec::new();
    for i in 0..10 {
        let before = source.state_vector();
        source.insert(source.len(), &format!("keystroke {i} "));
        deltas.push(source.diff_since(&before).unwrap());
    }

    c.bench_function("merge_10_deltas", |b| {
        b.iter(|| {
            black_box(DocumentStore::merge_updates(black_box(&deltas)).unwrap());
        })
    });
}

fn bench_apply_update(c: &mut Criterion) {
    let source = DocumentStore::new();
    source.insert(0, &"lorem ipsum ".repeat(64));
    let snapshot = source.encode_state();

    c.bench_function("apply_full_snapshot", |b| {
        b.iter(|| {
            let doc = DocumentStore::new();
            doc.apply_update(black_box(&snapshot), quill_collab::UpdateOrigin::Remote)
                .unwrap();
            black_box(doc);
        })
    });
}

fn bench_awareness_apply(c: &mut Criterion) {
    let tracker = Arc::new(AwarenessTracker::new(
        Uuid::new_v4(),
        UserInfo {
            id: "user-1".into(),
            name: "Alice".into(),
            color: "#336699".into(),
        },
    ));
    let peer = Uuid::new_v4();
    let state = AwarenessState {
        user: UserInfo {
            id: "user-2".into(),
            name: "Bob".into(),
            color: "#996633".into(),
        },
        cursor: Some(CursorRange { anchor: 10, head: 24 }),
    };

    c.bench_function("awareness_apply_remote", |b| {
        b.iter(|| {
            tracker.apply_remote(black_box(peer), black_box(state.clone()));
        })
    });
}

criterion_group!(
    benches,
    bench_codec_encode,
    bench_codec_roundtrip,
    bench_envelope_roundtrip,
    bench_merge_updates,
    bench_apply_update,
    bench_awareness_apply
);
criterion_main!(benches);
