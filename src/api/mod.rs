//! JSON HTTP surface over the marketplace.
//!
//! Every route except user registration requires a bearer token issued at
//! registration.
pub mod auth;
pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, patch, post};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::marketplace::Marketplace;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub market: Arc<Marketplace>,
}

impl AppState {
    pub fn new(market: Marketplace) -> Self {
        Self {
            market: Arc::new(market),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/users", post(handlers::register_user))
        .route("/chats", post(handlers::open_chat))
        .route("/books", post(handlers::add_book))
        .route("/books/{id}", delete(handlers::remove_book))
        .route("/books/{id}/availability", patch(handlers::set_availability))
        .route("/books/{id}/scope", patch(handlers::set_scope))
        .route("/books/{id}/audit", get(handlers::book_audit))
        .route("/books/{id}/interests", get(handlers::book_interests))
        .route("/books/{id}/matches", get(handlers::book_matches))
        .route("/interests", get(handlers::my_interests))
        .route(
            "/matches",
            get(handlers::list_matches).delete(handlers::hide_all_matches),
        )
        .route("/matches/refresh", post(handlers::refresh_matches))
        .route("/matches/unhide", post(handlers::clear_hidden_matches))
        .route("/matches/{id}", delete(handlers::hide_match))
        .route(
            "/trades",
            get(handlers::list_trades).post(handlers::create_trade),
        )
        .route("/trades/{id}", get(handlers::get_trade))
        .route("/trades/{id}/accept", post(handlers::accept_trade))
        .route("/trades/{id}/reject", post(handlers::reject_trade))
        .route("/trades/{id}/cancel", post(handlers::cancel_trade))
        .route("/trades/{id}/counter", post(handlers::counter_trade))
        .route("/trades/{id}/extend-lock", post(handlers::extend_trade_locks))
        .route("/trades/{id}/locks", get(handlers::trade_locks))
        .route("/trades/{id}/audit", get(handlers::trade_audit))
        .route("/locks/mine", get(handlers::my_locks))
        .route("/locks/sweep", post(handlers::sweep_locks))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}
