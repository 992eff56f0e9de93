//! Minimal worker exposing two functions.
//!
//! ```text
//! cargo run --example echo -- --host 127.0.0.1 --port 7071 --worker-id echo-1
//! ```

use clap::Parser;
use stratus_worker::prelude::*;

#[derive(Debug, Deserialize, Serialize)]
struct Order {
    id: u64,
    items: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    init_tracing();
    let options = WorkerOptions::load(&WorkerArgs::parse())?;

    let echo = handler_fn(|mut args| async move {
        let request: HttpRequestData = args.take(0)?;
        let context: FunctionContext = args.take(1)?;
        context
            .logger()
            .info(format!("{} {}", request.method, request.url));
        Ok::<_, FunctionError>(HttpResponseData::ok(request.body))
    });

    let orders = handler_fn(|mut args| async move {
        let Json(order): Json<Order> = args.take(0)?;
        let audit: OutputBinding<String> = args.take(1)?;
        audit.set(format!("order {} received", order.id))?;
        Ok::<_, FunctionError>(order.items)
    });

    let worker = Worker::builder(options)
        .function(
            CatalogEntry::new("echo", echo)
                .trigger::<HttpRequestData>("req", "httpTrigger")
                .context::<FunctionContext>("context")
                .returns("http"),
        )
        .function(
            CatalogEntry::new("orders", orders)
                .trigger::<Json<Order>>("order", "queueTrigger")
                .output::<String>("audit", "queue")
                .returns("queue"),
        )
        .build();

    run(worker).await
}
