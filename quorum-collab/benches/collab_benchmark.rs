use criterion::{criterion_group, criterion_main, Criterion};
use quorum_collab::{
    AwarenessMessage, AwarenessRegistry, BroadcastGroup, ClientId, Presence, SyncMessage,
};
use quorum_core::{Identity, UserId};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn bench_delta_encode(c: &mut Criterion) {
    let peer = ClientId::new();
    let doc = Uuid::new_v4();
    let frame = vec![0u8; 64];

    c.bench_function("delta_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::delta(
                black_box(peer),
                black_box(doc),
                black_box(1),
                black_box(frame.clone()),
            );
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_delta_decode(c: &mut Criterion) {
    let msg = SyncMessage::delta(ClientId::new(), Uuid::new_v4(), 1, vec![0u8; 64]);
    let encoded = msg.encode().unwrap();

    c.bench_function("delta_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_awareness_encode(c: &mut Criterion) {
    let peer = ClientId::new();
    let doc = Uuid::new_v4();
    let mut presence = Presence::for_identity(peer, &Identity::new(UserId::from("bench-user")));
    presence.selected_word_index = Some(3);
    let message = AwarenessMessage::Update(presence);

    c.bench_function("awareness_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::awareness(peer, doc, 1, black_box(&message)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_registry_remote_update(c: &mut Criterion) {
    let mut registry = AwarenessRegistry::new(ClientId::new(), &Identity::new(UserId::from("local")));
    let remotes: Vec<Presence> = (0..100)
        .map(|i| {
            Presence::for_identity(ClientId::new(), &Identity::new(UserId::new(format!("user-{i}"))))
        })
        .collect();
    let mut n = 0usize;

    c.bench_function("registry_remote_update_100_peers", |b| {
        b.iter(|| {
            let mut p = remotes[n % remotes.len()].clone();
            p.selected_word_index = Some(n % 16);
            n += 1;
            black_box(registry.on_remote_update(p));
        })
    });
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let group = BroadcastGroup::new(1024);
    let mut receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
    let frame = Arc::new(vec![0u8; 64]);

    c.bench_function("broadcast_100_peers", |b| {
        b.iter(|| {
            black_box(group.broadcast_raw(frame.clone()));
            rt.block_on(async {
                for rx in receivers.iter_mut() {
                    black_box(rx.recv().await.unwrap());
                }
            });
        })
    });
}

criterion_group!(
    benches,
    bench_delta_encode,
    bench_delta_decode,
    bench_awareness_encode,
    bench_registry_remote_update,
    bench_broadcast_fan_out,
);
criterion_main!(benches);
