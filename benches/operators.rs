//! Operator throughput benchmarks
//!
//! - Conv2d / ConvTranspose2d forward and backward
//! - MaxPool2d forward (argmax bookkeeping) and backward
//! - BatchNorm training step
//! - A small end-to-end pipeline in predict mode

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use layerwise::{
    BatchNorm, Conv2d, ConvTranspose2d, Dropout, MaxPool2d, Operator, Pipeline, Tensor,
};

/// Deterministic 4D-ish input: per-sample [c, h, w] with `batch` samples
fn input(c: usize, h: usize, w: usize, batch: usize) -> Tensor {
    let size = batch * c * h * w;
    let data: Vec<f32> = (0..size).map(|i| (i as f32 * 0.01).sin()).collect();
    Tensor::new(data, &[c, h, w], batch).unwrap()
}

// ===== CONVOLUTION =====

fn bench_conv(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv2d");

    for &(ch, size) in &[(3, 32), (16, 16), (32, 8)] {
        let label = format!("{ch}x{size}x{size}");
        let x = input(ch, size, size, 8);
        let mut conv = Conv2d::new(ch, ch * 2, 3, 1, 1, true).unwrap();
        let gy = Tensor::ones(&[ch * 2, size, size], 8);

        group.bench_with_input(BenchmarkId::new("predict", &label), &x, |b, x| {
            b.iter(|| black_box(&conv).predict(black_box(x)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("forward_backward", &label), &x, |b, x| {
            b.iter(|| {
                conv.forward(black_box(x)).unwrap();
                conv.backward(black_box(&gy)).unwrap()
            });
        });
    }
    group.finish();
}

fn bench_deconv(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv_transpose2d");
    let x = input(16, 8, 8, 8);
    let mut deconv = ConvTranspose2d::new(16, 8, 4, 2, 1, true).unwrap();
    let gy = Tensor::ones(&[8, 16, 16], 8);

    group.bench_function("predict_16x8x8", |b| {
        b.iter(|| black_box(&deconv).predict(black_box(&x)).unwrap());
    });
    group.bench_function("forward_backward_16x8x8", |b| {
        b.iter(|| {
            deconv.forward(black_box(&x)).unwrap();
            deconv.backward(black_box(&gy)).unwrap()
        });
    });
    group.finish();
}

// ===== POOLING =====

fn bench_max_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("max_pool2d");
    let x = input(16, 32, 32, 8);

    for &(kernel, stride) in &[(2, 2), (3, 2)] {
        let mut pool = MaxPool2d::new(kernel, stride, 0).unwrap();
        let out = pool.output_shape(&[16, 32, 32]).unwrap();
        let gy = Tensor::ones(&out, 8);
        let label = format!("k{kernel}s{stride}");

        group.bench_function(BenchmarkId::new("forward_backward", &label), |b| {
            b.iter(|| {
                pool.forward(black_box(&x)).unwrap();
                pool.backward(black_box(&gy)).unwrap()
            });
        });
    }
    group.finish();
}

// ===== NORMALIZATION =====

fn bench_batch_norm(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_norm");
    let x = input(32, 16, 16, 16);
    let gy = Tensor::ones(&[32, 16, 16], 16);
    let mut bn = BatchNorm::new(32).unwrap();

    group.bench_function("train_step_32x16x16", |b| {
        b.iter(|| {
            bn.forward(black_box(&x)).unwrap();
            bn.backward(black_box(&gy)).unwrap()
        });
    });
    group.bench_function("predict_32x16x16", |b| {
        b.iter(|| black_box(&bn).predict(black_box(&x)).unwrap());
    });
    group.finish();
}

// ===== PIPELINE =====

fn bench_pipeline(c: &mut Criterion) {
    let net: Pipeline = Pipeline::builder(&[3, 32, 32])
        .add(Box::new(Conv2d::new(3, 16, 3, 1, 1, true).unwrap()))
        .add(Box::new(BatchNorm::new(16).unwrap()))
        .add(Box::new(MaxPool2d::new(2, 2, 0).unwrap()))
        .add(Box::new(Dropout::new(0.5).unwrap()))
        .build()
        .unwrap();
    let x = input(3, 32, 32, 4);

    c.bench_function("pipeline_predict_3x32x32", |b| {
        b.iter(|| black_box(&net).predict(black_box(&x)).unwrap());
    });
}

criterion_group!(
    benches,
    bench_conv,
    bench_deconv,
    bench_max_pool,
    bench_batch_norm,
    bench_pipeline
);
criterion_main!(benches);
