//! Benchmarks for the per-frame hot paths.
//!
//! Run with: cargo bench --bench rollback_engine
//!
//! The rollback engine, state checksums and the control codec run every frame or on every
//! reset; these measure them with a toy state.

// Allow benchmark-specific patterns
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rollback_netplay::control::wire;
use rollback_netplay::control::{ControlMessage, ResetMessage};
use rollback_netplay::reset::{Roster, RosterEntry};
use rollback_netplay::snapshot::Snapshot;
use rollback_netplay::{
    frame_checksum, Frame, NetplayConfig, NetplayError, PlayerHandle, PlayerId, RollbackEngine,
    RollbackHandler, SaveBuffer, SaveBufferPool, SavedFrame,
};
use std::hint::black_box;
use std::net::SocketAddr;

/// A state of `len` bytes, rehashed a little every frame.
struct BenchMachine {
    state: Vec<u8>,
    pool: SaveBufferPool,
}

impl BenchMachine {
    fn new(len: usize) -> Self {
        Self {
            state: (0..len).map(|i| i as u8).collect(),
            pool: SaveBufferPool::new(),
        }
    }
}

impl RollbackHandler<u8> for BenchMachine {
    fn save_frame(&mut self, frame: Frame) -> Result<SavedFrame, NetplayError> {
        let mut buffer = self.pool.checkout();
        buffer.data_mut().clear();
        buffer.data_mut().extend_from_slice(&self.state);
        let checksum = frame_checksum(frame, buffer.as_slice());
        Ok(SavedFrame { buffer, checksum })
    }

    fn load_frame(&mut self, saved: &SavedFrame, _frame: Frame) -> Result<(), NetplayError> {
        self.state.clear();
        self.state.extend_from_slice(saved.buffer.as_slice());
        Ok(())
    }

    fn free_frame(&mut self, buffer: SaveBuffer) {
        self.pool.checkin(buffer);
    }

    fn advance_frame(&mut self, inputs: &[u8], _disconnect_flags: u32) -> Result<(), NetplayError> {
        for (i, input) in inputs.iter().enumerate() {
            self.state[i] = self.state[i].wrapping_add(*input);
        }
        Ok(())
    }
}

fn bench_local_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("RollbackEngine");
    for state_len in [1024usize, 64 * 1024] {
        group.throughput(Throughput::Bytes(state_len as u64));
        group.bench_with_input(
            BenchmarkId::new("advance_frame_local", state_len),
            &state_len,
            |b, &state_len| {
                let config = NetplayConfig::default().with_input_delay(0);
                let mut engine: RollbackEngine<u8> =
                    RollbackEngine::new(1, PlayerHandle::new(0), &[], 1, &config).unwrap();
                let mut machine = BenchMachine::new(state_len);
                let mut input = 0u8;
                b.iter(|| {
                    input = input.wrapping_add(1);
                    engine.idle(&mut machine).unwrap();
                    engine.add_local_input(input).unwrap();
                    let (inputs, flags) = engine.synchronize_input().unwrap();
                    machine.advance_frame(&inputs, flags).unwrap();
                    engine.advance_frame(&mut machine).unwrap();
                    black_box(engine.current_frame());
                });
            },
        );
    }
    group.finish();
}

fn bench_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_checksum");
    for len in [4 * 1024usize, 2 * 1024 * 1024] {
        let state: Vec<u8> = (0..len).map(|i| (i * 31) as u8).collect();
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &state, |b, state| {
            let mut frame = 0;
            b.iter(|| {
                frame += 1;
                black_box(frame_checksum(Frame::new(frame), black_box(state)))
            });
        });
    }
    group.finish();
}

fn bench_reset_message(c: &mut Criterion) {
    let raw: Vec<u8> = (0..512 * 1024).map(|i: u32| (i % 251) as u8).collect();
    let mut roster = Roster::new();
    for player in 0..4 {
        roster.insert(
            PlayerId::new(player),
            RosterEntry {
                controller_port: player as u16,
                address: SocketAddr::from(([10, 0, 0, player as u8], 7000)),
                nickname: format!("player{player}"),
            },
        );
    }

    let mut group = c.benchmark_group("reset");
    group.throughput(Throughput::Bytes(raw.len() as u64));
    group.bench_function("snapshot_encode", |b| {
        b.iter(|| black_box(Snapshot::encode(1, black_box(&raw))));
    });
    let encoded = Snapshot::encode(1, &raw);
    group.bench_function("snapshot_decode", |b| {
        b.iter(|| black_box(Snapshot::decode(black_box(&encoded), 1).unwrap()));
    });
    let message = ControlMessage::Reset(ResetMessage {
        cookie: 7,
        roster,
        state: encoded,
    });
    let bytes = wire::encode(&message).unwrap();
    group.bench_function("wire_decode", |b| {
        b.iter(|| black_box(wire::decode(black_box(&bytes)).unwrap()));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_local_frames,
    bench_checksum,
    bench_reset_message
);
criterion_main!(benches);
