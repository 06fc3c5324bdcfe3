use axum::{Json, Router, extract::State, routing::get};
use chrono::{DateTime, Duration, Utc};

use crate::error::ApiError;
use crate::middleware::auth_context::AuthContext;
use crate::models::{AppState, PaymentStatus};

#[derive(serde::Serialize)]
pub struct HomeResponse {
    pub data: HomeData,
}

#[derive(serde::Serialize)]
pub struct HomeData {
    pub view: String,
    pub today_appointments: i64,
    pub pending_payments: i64,
    pub pending_total_cents: i64,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/home", get(home))
}

pub async fn home(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<HomeResponse>, ApiError> {
    // DB stores a single role (smallint):
    // 1 admin, 2 manager, 3 stylist, 4 receptionist
    let view = match auth.role {
        1 => "admin",
        2 => "manager",
        3 => "stylist",
        4 => "receptionist",
        _ => "unknown",
    };

    let start = Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap();
    let start_ts = DateTime::<Utc>::from_naive_utc_and_offset(start, Utc);
    let end_ts = start_ts + Duration::days(1);

    let today_appointments: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM appointment
        WHERE start_at >= $1
          AND start_at < $2
        "#,
    )
    .bind(start_ts)
    .bind(end_ts)
    .fetch_one(&state.db)
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    let (pending_payments, pending_total_cents): (i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*), COALESCE(SUM(final_price_cents), 0)::bigint
        FROM appointment
        WHERE payment_status = $1
        "#,
    )
    .bind(PaymentStatus::Pending)
    .fetch_one(&state.db)
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    Ok(Json(HomeResponse {
        data: HomeData {
            view: view.to_string(),
            today_appointments,
            pending_payments,
            pending_total_cents,
        },
    }))
}
