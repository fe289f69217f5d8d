use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io::Cursor;
use tachyon::shared::{encode_to_vec, Decode};
use tachyon::wire::frame::{AckFrame, AckRange, Frame, StreamFrame};
use tachyon::wire::varint::VarInt;

fn bench_varint(c: &mut Criterion) {
    let values: Vec<u64> = vec![37, 15_293, 494_878_333, 151_288_809_941_952_652];
    let encoded: Vec<Vec<u8>> = values
        .iter()
        .map(|&value| encode_to_vec(&VarInt::new(value).unwrap()))
        .collect();

    c.bench_function("varint_encode", |b| {
        b.iter(|| {
            for &value in &values {
                black_box(encode_to_vec(&VarInt::new(black_box(value)).unwrap()));
            }
        })
    });

    c.bench_function("varint_decode", |b| {
        b.iter(|| {
            for bytes in &encoded {
                let mut stream = Cursor::new(&bytes[..]);
                black_box(VarInt::decode(&mut stream).unwrap());
            }
        })
    });
}

fn bench_frames(c: &mut Criterion) {
    let frames = vec![
        Frame::Ack(AckFrame {
            largest: 100_000,
            delay: 311,
            first_range: 17,
            ranges: vec![
                AckRange { gap: 2, length: 40 },
                AckRange { gap: 0, length: 3 },
            ],
        }),
        Frame::Stream(StreamFrame {
            stream_id: 4,
            offset: 65_536,
            data: vec![0xa5; 1200],
            fin: false,
        }),
    ];

    let mut encoded = Vec::new();
    let mut stream = Cursor::new(Vec::new());
    for frame in &frames {
        frame.encode(&mut stream).unwrap();
    }
    encoded.extend_from_slice(&stream.into_inner());

    c.bench_function("frame_encode", |b| {
        b.iter(|| {
            let mut stream = Cursor::new(Vec::with_capacity(2048));
            for frame in &frames {
                frame.encode(&mut stream).unwrap();
            }
            black_box(stream.into_inner());
        })
    });

    c.bench_function("frame_decode", |b| {
        b.iter(|| {
            let mut stream = Cursor::new(&encoded[..]);
            black_box(Frame::decode_all(&mut stream).unwrap());
        })
    });
}

criterion_group!(benches, bench_varint, bench_frames);
criterion_main!(benches);
