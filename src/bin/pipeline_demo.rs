//! Record-store tools behind the full pipeline, with a flaky lookup to show
//! retry and circuit breaking, and a command queue with undo.
//!
//! Run with `RUST_LOG=tower_tool_pipeline=debug` for per-layer logging.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use tower_tool_pipeline::{
    handler_fn, typed_tool, CallContext, CapabilityEnv, Command, CommandQueue,
    InMemoryRecordStore, PipelineBuilder, PipelineOptions, RecordStore, ToolDefinition, ToolError,
    ToolRequest,
};

#[derive(Debug, Deserialize, JsonSchema)]
struct GetArgs {
    id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CreateArgs {
    id: Option<String>,
    data: Value,
}

fn store_of(ctx: &CallContext) -> Result<Arc<InMemoryRecordStore>, ToolError> {
    ctx.env
        .capability::<InMemoryRecordStore>()
        .ok_or_else(|| ToolError::internal("record store capability missing"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let store = Arc::new(InMemoryRecordStore::new());
    let env = CapabilityEnv::builder().with_capability(store.clone()).build();

    let get = typed_tool("get_record", "Fetch a record by id", |args: GetArgs, ctx| async move {
        store_of(&ctx)?
            .get(&args.id)
            .await?
            .ok_or_else(|| ToolError::not_found("record", args.id))
    });
    let create = typed_tool(
        "create_record",
        "Create a record",
        |args: CreateArgs, ctx| async move { store_of(&ctx)?.create(args.id, args.data).await },
    )
    .options(PipelineOptions::default().caching(false));

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let flaky = ToolDefinition::new(
        "flaky_lookup",
        "Fails twice with a network error, then answers",
        handler_fn(move |_req: ToolRequest| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ToolError::network("connection reset"))
                } else {
                    Ok(json!({ "ok": true, "attempt": n + 1 }))
                }
            }
        }),
    );

    let pipeline = PipelineBuilder::new()
        .options(
            PipelineOptions::default()
                .max_retries(2)
                .retry_delay(Duration::from_millis(100))
                .timeout(Duration::from_secs(2))
                .failure_threshold(3),
        )
        .env(env)
        .tool(get)
        .tool(create)
        .tool(flaky)
        .require(["get_record", "create_record", "flaky_lookup"])
        .build()?;

    println!("=== Tools ===");
    println!("{}", serde_json::to_string_pretty(&*pipeline.list_tools())?);

    pipeline
        .call("create_record", json!({ "id": "x", "data": { "name": "widget" } }))
        .await?;
    let reads = join_all((0..3).map(|_| pipeline.call("get_record", json!({ "id": "x" })))).await;
    println!("\n=== Concurrent reads ===");
    for r in reads {
        println!("{}", r?);
    }

    println!("\n=== Retry ===");
    println!("{}", pipeline.call("flaky_lookup", json!({})).await?);

    println!("\n=== Failures ===");
    for params in [json!({}), json!({ "id": "missing" })] {
        if let Err(e) = pipeline.call("get_record", params).await {
            println!("{}", serde_json::to_string(&e.payload())?);
        }
    }

    println!("\n=== Command queue ===");
    let queue = CommandQueue::new(store.clone());
    queue.submit(Command::update("x", json!({ "name": "gadget" }))).await?;
    queue.submit(Command::delete("nope")).await?;
    let undone = queue.undo_last().await?;
    println!("undid {} of {:?}", undone.name(), undone.operation);
    println!("{}", serde_json::to_string_pretty(&queue.history().await?)?);

    println!("\n=== Metrics ===");
    println!(
        "{}",
        serde_json::to_string_pretty(&pipeline.metrics().snapshot_all())?
    );
    println!("{}", serde_json::to_string_pretty(&pipeline.cache_stats())?);
    Ok(())
}
