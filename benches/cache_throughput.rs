use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::runtime::Runtime;
use tower_tool_pipeline::{
    cache_key, handler_fn, BoxError, ExpiringCache, PipelineBuilder, PipelineOptions,
    ToolDefinition, ToolRequest,
};

fn bench_cache(c: &mut Criterion) {
    let cache: ExpiringCache<String, Value> = ExpiringCache::new(1_000, Duration::from_secs(300));
    for i in 0..1_000 {
        cache.set(format!("k{i}"), json!(i));
    }

    c.bench_function("cache_get_hit", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % 1_000;
            cache.get(&format!("k{i}"))
        })
    });

    // Every insert beyond capacity evicts the least recently used key.
    c.bench_function("cache_set_evicting", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i += 1;
            cache.set(format!("new{i}"), json!(i));
        })
    });

    let params = json!({ "id": "x", "filter": { "b": [1, 2, 3], "a": "z" } });
    c.bench_function("cache_key_nested", |b| b.iter(|| cache_key("get", &params)));
}

fn bench_pipeline(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let build = |caching: bool| {
        PipelineBuilder::new()
            .options(PipelineOptions::default().caching(caching))
            .tool(ToolDefinition::new(
                "echo",
                "Echo params",
                handler_fn(|req: ToolRequest| async move { Ok::<_, BoxError>(req.params) }),
            ))
            .build()
            .unwrap()
    };
    let cached = build(true);
    let uncached = build(false);

    c.bench_function("pipeline_call_cached", |b| {
        b.to_async(&rt).iter(|| async {
            cached.call("echo", json!({ "id": "x" })).await.unwrap();
        })
    });

    c.bench_function("pipeline_call_uncached", |b| {
        b.to_async(&rt).iter_batched(
            || json!({ "id": "x" }),
            |params| async {
                uncached.call("echo", params).await.unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_cache, bench_pipeline);
criterion_main!(benches);
