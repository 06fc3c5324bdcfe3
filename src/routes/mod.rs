use crate::models::AppState;
use axum::Router;

pub mod appointment_routes;
pub mod auth_routes;
pub mod client_routes;
pub mod home_routes;
pub mod payment_routes;
pub mod service_routes;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/auth", auth_routes::router())
        .nest("/api/v1/services", service_routes::router())
        .nest("/api/v1", client_routes::router())
        .nest("/api/v1", appointment_routes::router())
        .nest("/api/v1", payment_routes::router())
        .merge(home_routes::router())
        .with_state(state)
}
