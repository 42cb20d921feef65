mod cli;
mod context;
mod controller;
mod errors;
mod events;
mod members;
mod metrics;
mod namespaces;
mod observe;
mod ownership;
mod policy;
mod project;
mod rancher;
mod reconciler;
mod status;

use crate::context::Context;
use crate::rancher::client::HttpRancher;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use kube::client::Client;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::EnvFilter, fmt};

#[get("/metrics")]
async fn metrics_endpoint(ctx: Data<Arc<Context>>, _req: HttpRequest) -> impl Responder {
    match ctx.render_metrics() {
        Ok(body) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(body),
        Err(e) => {
            tracing::error!("Failed to render metrics: {:?}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    // setup logging
    let level_filter = cli.log_level;
    let filter_layer = EnvFilter::from_default_env()
        .add_directive(level_filter.into())
        .add_directive("rustls=off".parse().unwrap()) // this crate generates tracing events we don't care about
        .add_directive("hyper=off".parse().unwrap()) // this crate generates tracing events we don't care about
        .add_directive("tower=off".parse().unwrap()); // this crate generates tracing events we don't care about
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let rancher = HttpRancher::new(
        &cli.rancher_url,
        cli.rancher_auth()?,
        cli.rancher_allow_insecure_ssl,
    )?;
    let client = Client::try_default().await?;
    let ctx = Arc::new(Context::new(client, Arc::new(rancher), cli.settings()));

    info!(
        rancher_url = cli.rancher_url,
        observe_method = ?cli.observe_method,
        "starting operator"
    );

    let project_controller = controller::run(ctx.clone());
    let observe_loop = observe::run(ctx.clone());

    let server_ctx = ctx.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(server_ctx.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
            .service(metrics_endpoint)
    })
    .bind(("0.0.0.0", cli.metrics_port))?
    .shutdown_timeout(5);

    // All three runtimes implement graceful shutdown, so poll until done
    tokio::join!(project_controller, observe_loop, server.run()).2?;

    Ok(())
}
