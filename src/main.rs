#[macro_use]
extern crate diesel;

mod config;
mod error;
mod jobs;
mod links;
mod logger;
mod mailer;
mod models;
mod scheduler;
mod schema;
mod signing;
mod snapshot;
mod storage;
mod sweep;

use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;

use config::Config;
use logger::init_logger;
use mailer::{ConsoleMailer, Mailer};
use signing::LinkSigner;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub signer: Arc<LinkSigner>,
    pub mailer: Arc<dyn Mailer>,
}

#[tokio::main]
async fn main() {
    init_logger().unwrap();

    let config = Arc::new(Config::from_env());
    let signer = Arc::new(LinkSigner::new(&config.signing_secret));
    let mailer: Arc<dyn Mailer> = Arc::new(ConsoleMailer);

    let mut connection = storage::establish_connection(&config.database_url)
        .unwrap_or_else(|e| panic!("Error connecting to {}. {}", config.database_url, e));
    storage::ensure_schema(&mut connection).expect("Failed to apply database schema");

    let _sweeper = sweep::spawn_sweep_loop(config.clone(), signer.clone(), mailer.clone());

    let state = AppState {
        config: config.clone(),
        signer,
        mailer,
    };

    let app = Router::new()
        .route("/order-archived", post(scheduler::order_archived_handler))
        .route("/review-link", get(links::review_link_handler))
        .route("/review-submit", post(links::review_submit_handler))
        .route("/jobs", get(jobs::list_jobs_handler))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));

    log::info!("🚀 Server running on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();

    axum::serve(listener, app).await.unwrap();
}
