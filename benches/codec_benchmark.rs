//! Benchmarks for the value codec and pooled round trips.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use evalcache::contract::serialize_to_string;
use evalcache::model::read_value;
use evalcache::{
    EvalError, EvalOptions, EvalType, EvalValue, ExternalCall, PoolConfig, ProcessPool,
    ResponseReader, Value,
};
use std::path::Path;

/// Token source over an encoded string.
struct SliceReader<'a> {
    data: &'a [u8],
}

impl ResponseReader for SliceReader<'_> {
    fn next_line(&mut self) -> evalcache::Result<String> {
        let end = self
            .data
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| EvalError::Transport("end of input".into()))?;
        let line = String::from_utf8_lossy(&self.data[..end]).into_owned();
        self.data = &self.data[end + 1..];
        Ok(line)
    }

    fn next_bytes(&mut self, len: usize) -> evalcache::Result<Vec<u8>> {
        if self.data.len() < len {
            return Err(EvalError::Transport("end of input".into()));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head.to_vec())
    }
}

fn real_vector(len: usize) -> EvalValue {
    EvalValue::vector((0..len).map(|i| EvalValue::Real(i as f64 * 0.25)).collect())
}

fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialize_real_vector");

    for size in [16, 1024, 65536].iter() {
        let value = real_vector(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            let mut buf = Vec::with_capacity(*size * 16);
            b.iter(|| {
                buf.clear();
                black_box(&value).serialize(&mut buf).unwrap();
                black_box(buf.len())
            });
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_real_vector");
    let ty = EvalType::Array(Box::new(EvalType::Real));

    for size in [16, 1024, 65536].iter() {
        let encoded = serialize_to_string([real_vector(*size)].iter()).unwrap();
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut reader = SliceReader {
                    data: black_box(encoded.as_bytes()),
                };
                black_box(read_value(&mut reader, Some(&ty)).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_decode_strings(c: &mut Criterion) {
    let value = EvalValue::Record(
        (0..64)
            .map(|i| EvalValue::String(format!("field number {}\nwith a line break", i)))
            .collect(),
    );
    let ty = value.value_type();
    let encoded = serialize_to_string([value].iter()).unwrap();

    c.bench_function("decode_string_record", |b| {
        b.iter(|| {
            let mut reader = SliceReader {
                data: black_box(encoded.as_bytes()),
            };
            black_box(read_value(&mut reader, Some(&ty)).unwrap())
        });
    });
}

fn bench_pool_round_trip(c: &mut Criterion) {
    let bin = Path::new(env!("CARGO_BIN_EXE_evalcache"));
    let Some(dir) = bin.parent() else {
        return;
    };
    let options = EvalOptions::new().with_process_limit(1);
    let pool = ProcessPool::new("bench", PoolConfig::from(&options));
    let site = ExternalCall::new("echo")
        .with_options(options)
        .with_library(dir, vec!["evalcache".into(), "worker".into()])
        .with_args([real_vector(256)])
        .with_results([EvalType::Array(Box::new(EvalType::Real))]);

    // Start the evaluator outside the measurement
    pool.evaluate(&site).unwrap();

    c.bench_function("pool_echo_256_reals", |b| {
        b.iter(|| pool.evaluate(black_box(&site)).unwrap());
    });

    pool.tear_down();
}

criterion_group!(
    benches,
    bench_serialize,
    bench_decode,
    bench_decode_strings,
    bench_pool_round_trip
);
criterion_main!(benches);
