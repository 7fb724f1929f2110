use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use torrest_core::engine::EngineTorrent;
use torrest_core::engine::test_mocks::{MockTorrent, content_range};
use torrest_core::storage::PieceStorage;
use torrest_core::torrent::{PieceIndex, TorrentInfo};
use torrest_core::{InfoHash, MemoryStorage};

const PIECE: u32 = 256 * 1024;
const PIECES: u64 = 64;

fn storage(engine: &Arc<dyn EngineTorrent>, info: &TorrentInfo, buffers: u64) -> MemoryStorage {
    let storage = MemoryStorage::new(
        InfoHash::new([0x42; 20]),
        info,
        buffers * PIECE as u64,
        Arc::downgrade(engine),
    );
    storage.initialize();
    storage
}

fn bench_sequential_write_read(c: &mut Criterion) {
    let info = TorrentInfo::new("bench.bin", PIECE, vec![("bench.bin".to_string(), PIECES * PIECE as u64)]);
    let engine: Arc<dyn EngineTorrent> = MockTorrent::new(info.clone());
    let data = content_range(0, PIECE as u64);

    let mut group = c.benchmark_group("memory_storage");
    group.throughput(Throughput::Bytes(PIECES * PIECE as u64));

    group.bench_function("write_resident", |b| {
        let storage = storage(&engine, &info, PIECES);
        b.iter(|| {
            for piece in 0..PIECES as u32 {
                black_box(storage.write(PieceIndex(piece), 0, &data));
            }
        });
    });

    group.bench_function("write_with_eviction", |b| {
        let storage = storage(&engine, &info, 8);
        b.iter(|| {
            for piece in 0..PIECES as u32 {
                black_box(storage.write(PieceIndex(piece), 0, &data));
            }
        });
    });

    group.bench_function("read_resident", |b| {
        let storage = storage(&engine, &info, PIECES);
        for piece in 0..PIECES as u32 {
            storage.write(PieceIndex(piece), 0, &data);
        }
        let mut out = vec![0u8; 64 * 1024];
        b.iter(|| {
            for piece in 0..PIECES as u32 {
                for offset in (0..PIECE).step_by(out.len()) {
                    black_box(storage.read(PieceIndex(piece), offset, &mut out));
                }
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_sequential_write_read);
criterion_main!(benches);
