use criterion::{black_box, criterion_group, criterion_main, Criterion};

use veil_intercept::module::maps;
use veil_intercept::Signature;

fn haystack(len: usize) -> Vec<u8> {
    // Deterministic filler that never contains the needle.
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

fn bench_signature(c: &mut Criterion) {
    let sig = Signature::parse("FF 43 01 D1 ?? 7B ?? A9").unwrap();

    {
        let data = haystack(64 * 1024);
        c.bench_function("signature_miss_64k", |b| b.iter(|| sig.find(black_box(&data))));
    }

    {
        let mut data = haystack(1024 * 1024);
        let at = data.len() - 64;
        data[at..at + 8].copy_from_slice(&[0xFF, 0x43, 0x01, 0xD1, 0xFD, 0x7B, 0x01, 0xA9]);
        c.bench_function("signature_hit_tail_1m", |b| b.iter(|| sig.find(black_box(&data))));
    }

    c.bench_function("signature_parse", |b| {
        b.iter(|| Signature::parse(black_box("FF 43 01 D1 ?? 7B ?? A9 FD 43 00 91")))
    });
}

fn bench_maps(c: &mut Criterion) {
    let text: String = (0..400)
        .map(|i| {
            format!(
                "7a{:08x}-7a{:08x} r-xp 00000000 fd:05 {}   /data/app/~~x/lib/arm64/libmod{}.so\n",
                i * 0x10000,
                i * 0x10000 + 0x8000,
                i,
                i % 40
            )
        })
        .collect();

    c.bench_function("maps_parse_400", |b| b.iter(|| maps::parse(black_box(&text))));

    let parsed = maps::parse(&text);
    c.bench_function("maps_span_for_suffix", |b| {
        b.iter(|| maps::span_for_suffix(black_box(&parsed), black_box("libmod39.so")))
    });
}

criterion_group!(benches, bench_signature, bench_maps);
criterion_main!(benches);
