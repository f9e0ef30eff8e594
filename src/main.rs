use actix_cors::Cors;
use actix_web::middleware::Condition;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::{Context, Result};
use imgclass::config::Settings;
use imgclass::server::{self, AppState};
use imgclass::torch::Classifier;
use imgclass::util::init_tracing;
use std::{env, process};

use tracing::info;

const USAGE: &str = "usage: ./imgclass [config file]";

fn get_args() -> Option<String> {
    let args: Vec<String> = env::args().collect();
    if args.len() > 2 || args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{USAGE}");
        process::exit(1);
    }
    args.get(1).cloned()
}

#[actix_web::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_file = get_args();
    let settings = Settings::load(config_file.as_deref())?;
    info!("loaded settings {settings:?}");

    let classifier = Classifier::from_settings(&settings)?;
    info!("loaded model {:?}", classifier.info());

    let state = web::Data::new(AppState::new(classifier, &settings));
    let max_upload_bytes = settings.server.max_upload_bytes;
    let cors = settings.server.cors;

    let addr = (settings.server.host.clone(), settings.server.port);
    let mut http = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(Condition::new(cors, Cors::permissive()))
            .wrap(middleware::Logger::default())
            .configure(server::configure(max_upload_bytes))
    });
    if let Some(workers) = settings.server.workers {
        http = http.workers(workers);
    }

    info!("listening on {}:{}", addr.0, addr.1);
    http.bind(&addr)
        .with_context(|| format!("failed to bind {}:{}", addr.0, addr.1))?
        .run()
        .await?;
    Ok(())
}
