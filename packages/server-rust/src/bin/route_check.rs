//! Resolves a request against a JSON service schema and reports the outcome.
//!
//! ```text
//! route-check --schema orders.json --method GET --path /orders/42 --accept 'text/plain;q=0.8'
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use courier_core::EncoderRegistry;
use courier_server::logging::init_tracing;
use courier_server::schema::load_service_schema;
use courier_server::service::RouteRegistry;

#[derive(Debug, Parser)]
#[command(name = "route-check", version, about)]
struct Cli {
    /// Service schema in JSON form.
    #[arg(long, value_name = "FILE")]
    schema: PathBuf,
    /// Request method.
    #[arg(long, default_value = "GET")]
    method: String,
    /// Request path.
    #[arg(long)]
    path: String,
    /// Accept header value; omitted means no preference.
    #[arg(long)]
    accept: Option<String>,
    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    let schema = load_service_schema(&cli.schema)?;
    let mut builder = RouteRegistry::builder(Arc::new(EncoderRegistry::with_defaults()));
    let errors = builder.register_schema(&schema);
    for e in &errors {
        eprintln!("skipped: {e}");
    }
    let registry = builder.build();

    let matched = registry
        .match_route(&cli.path, &cli.method)
        .with_context(|| format!("{} {}", cli.method, cli.path))?;
    let route = &matched.route;
    let encoder = route.ensure_find_encoder(cli.accept.as_deref())?;

    println!("operation: {}", route.operation_id());
    println!("route:     {} {}", route.http_method(), route.absolute_path());
    for (name, value) in matched.values.iter() {
        println!("  {name} = {value}");
    }
    println!("encoding:  {}", encoder.name());
    Ok(())
}
