use async_trait::async_trait;
use cacheflow::workflow::Workflow;
use cacheflow::{Callable, FunctionRegistry};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use std::borrow::Cow;
use tokio::runtime::Runtime;

/// Adds one to the first upstream number (or to the source input)
struct Increment {
    source: String,
}

#[async_trait]
impl Callable<()> for Increment {
    async fn call(&self, _ctx: &(), input: Value) -> anyhow::Result<Value> {
        let n = match &input {
            Value::Object(map) => map.values().next().and_then(Value::as_i64).unwrap_or(0),
            other => other.as_i64().unwrap_or(0),
        };
        Ok(json!(n + 1))
    }

    fn source(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.source)
    }
}

fn increment(version: usize) -> Increment {
    Increment {
        source: format!("increment v{}", version),
    }
}

/// Create a linear chain: op0 -> op1 -> ... -> op{count-1}
///
/// `changed` gives that one operation a different function hash.
fn create_linear_chain(count: usize, changed: Option<usize>) -> Workflow {
    let mut workflow = Workflow::new();
    let version = |i: usize| if Some(i) == changed { 1 } else { 0 };

    let mut previous = workflow.first("op0", increment(version(0))).unwrap();
    for i in 1..count {
        previous = workflow
            .link(&[&previous], format!("op{}", i), increment(version(i)))
            .unwrap();
    }
    workflow
}

/// Create a wide DAG: root -> N parallel operations -> sink
fn create_wide_parallel(width: usize) -> Workflow {
    let mut workflow = Workflow::new();
    let root = workflow.first("root", increment(0)).unwrap();
    let branches: Vec<_> = (0..width)
        .map(|i| {
            workflow
                .link(&[&root], format!("branch{}", i), increment(0))
                .unwrap()
        })
        .collect();
    let inputs: Vec<_> = branches.iter().collect();
    workflow.last(&inputs, "sink", increment(0)).unwrap();
    workflow
}

fn bench_cold_run(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("cold_run");

    for size in [10, 50, 100] {
        group.bench_with_input(BenchmarkId::new("linear_chain", size), &size, |b, &size| {
            b.iter_batched(
                || create_linear_chain(size, None),
                |workflow| rt.block_on(async { workflow.run(&(), black_box(json!(0))).await.unwrap() }),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    for width in [10, 50] {
        group.bench_with_input(BenchmarkId::new("wide_parallel", width), &width, |b, &width| {
            b.iter_batched(
                || create_wide_parallel(width),
                |workflow| rt.block_on(async { workflow.run(&(), black_box(json!(0))).await.unwrap() }),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_warm_run(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("warm_run");

    for size in [10, 100] {
        let workflow = create_linear_chain(size, None);
        rt.block_on(workflow.run(&(), json!(0))).unwrap();

        group.bench_with_input(BenchmarkId::new("linear_chain", size), &size, |b, _| {
            b.iter(|| rt.block_on(async { workflow.run(&(), black_box(json!(0))).await.unwrap() }));
        });
    }

    group.finish();
}

fn bench_sync(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("sync");

    for size in [10, 100] {
        group.bench_with_input(BenchmarkId::new("identical_chain", size), &size, |b, &size| {
            b.iter_batched(
                || (create_linear_chain(size, None), create_linear_chain(size, None)),
                |(mut workflow, revised)| workflow.sync(revised).unwrap(),
                criterion::BatchSize::SmallInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("changed_midpoint", size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let workflow = create_linear_chain(size, None);
                    rt.block_on(workflow.run(&(), json!(0))).unwrap();
                    (workflow, create_linear_chain(size, Some(size / 2)))
                },
                |(mut workflow, revised)| workflow.sync(revised).unwrap(),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("snapshot");

    let workflow = create_linear_chain(100, None);
    rt.block_on(workflow.run(&(), json!(0))).unwrap();
    let registry: FunctionRegistry = workflow.registry();
    let text = workflow.to_json().unwrap();

    group.bench_function("to_json_100", |b| {
        b.iter(|| black_box(workflow.to_json().unwrap()));
    });

    group.bench_function("from_json_100", |b| {
        b.iter(|| Workflow::from_json(black_box(&text), &registry).unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_cold_run,
    bench_warm_run,
    bench_sync,
    bench_snapshot
);
criterion_main!(benches);
