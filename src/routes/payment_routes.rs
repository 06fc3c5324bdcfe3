// src/routes/payment_routes.rs

use axum::{
    extract::{Path, State},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{AppState, AppointmentRow, AppointmentStatus, PaymentMethod, PaymentStatus},
    status::{is_consistent_pair, resolve_for_payment, resolve_for_status},
};

fn is_admin(auth: &AuthContext) -> bool {
    auth.role == 1
}
fn is_manager(auth: &AuthContext) -> bool {
    auth.role == 2
}
fn is_receptionist(auth: &AuthContext) -> bool {
    auth.role == 4
}

fn ensure_settle(auth: &AuthContext) -> Result<(), ApiError> {
    if is_admin(auth) || is_manager(auth) || is_receptionist(auth) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only admin/manager/receptionist can settle payments".into(),
        ))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/payments/pending", get(list_pending_by_client))
        .route("/payments/settle_batch", post(settle_batch))
        .route(
            "/payments/clients/{client_id}/settle_all",
            post(settle_all_for_client),
        )
        .route("/appointments/{appointment_id}/settle", post(settle_appointment))
        .route(
            "/appointments/{appointment_id}/price",
            patch(update_appointment_price),
        )
}

/* ============================================================
   Pending payments, grouped per client
   ============================================================ */

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PendingRow {
    pub appointment_id: Uuid,
    pub client_id: Uuid,
    pub client_name: String,
    pub start_at: DateTime<Utc>,
    pub final_price_cents: i32,
}

#[derive(Debug, Serialize)]
pub struct ClientPendingGroup {
    pub client_id: Uuid,
    pub client_name: String,
    pub total_due_cents: i64,
    pub appointments: Vec<PendingRow>,
}

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

/// Groups pending rows by client, in first-seen client order.
fn group_pending_by_client(rows: Vec<PendingRow>) -> Vec<ClientPendingGroup> {
    let mut groups: Vec<ClientPendingGroup> = Vec::new();

    for row in rows {
        match groups.iter_mut().find(|g| g.client_id == row.client_id) {
            Some(group) => {
                group.total_due_cents += i64::from(row.final_price_cents);
                group.appointments.push(row);
            }
            None => {
                groups.push(ClientPendingGroup {
                    client_id: row.client_id,
                    client_name: row.client_name.clone(),
                    total_due_cents: i64::from(row.final_price_cents),
                    appointments: vec![row],
                });
            }
        }
    }

    groups
}

pub async fn list_pending_by_client(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<ApiOk<Vec<ClientPendingGroup>>>, ApiError> {
    let rows: Vec<PendingRow> = sqlx::query_as::<_, PendingRow>(
        r#"
        SELECT
          a.appointment_id,
          a.client_id,
          c.name AS client_name,
          a.start_at,
          a.final_price_cents
        FROM appointment a
        JOIN client c ON c.client_id = a.client_id
        WHERE a.payment_status = $1
        ORDER BY a.start_at ASC
        "#,
    )
    .bind(PaymentStatus::Pending)
    .fetch_all(&state.db)
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    Ok(Json(ApiOk {
        data: group_pending_by_client(rows),
    }))
}

/* ============================================================
   Settlement
   ============================================================ */

#[derive(Debug, thiserror::Error)]
enum SettleFailure {
    #[error("appointment not found")]
    NotFound,
    #[error("db error: {0}")]
    Db(String),
}

#[derive(Debug, Serialize)]
pub struct FailedSettlement {
    pub appointment_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct BatchSettlementSummary {
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<FailedSettlement>,
    pub message: String,
}

fn summarize(results: Vec<(Uuid, Result<(), SettleFailure>)>) -> BatchSettlementSummary {
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    for (id, res) in results {
        match res {
            Ok(()) => succeeded.push(id),
            Err(e) => failed.push(FailedSettlement {
                appointment_id: id,
                reason: e.to_string(),
            }),
        }
    }
    let message = format!("settled {} of {}", succeeded.len(), succeeded.len() + failed.len());
    BatchSettlementSummary {
        succeeded,
        failed,
        message,
    }
}

/// Marks one appointment paid. Settlement completes the appointment, so
/// the pair comes from the resolver, never hand-assembled.
async fn settle_one(
    state: &AppState,
    appointment_id: Uuid,
    method: PaymentMethod,
    price_override_cents: Option<i32>,
    now: DateTime<Utc>,
) -> Result<(), SettleFailure> {
    let (status, payment_status) = resolve_for_status(AppointmentStatus::Completed);
    if !is_consistent_pair(status, payment_status) {
        return Err(SettleFailure::Db(format!(
            "refusing inconsistent pair {status:?}/{payment_status:?}"
        )));
    }

    let res = sqlx::query(
        r#"
        UPDATE appointment
        SET status = $2,
            payment_status = $3,
            payment_method = $4,
            payment_date = $5,
            final_price_cents = COALESCE($6, final_price_cents),
            updated_at = now()
        WHERE appointment_id = $1
        "#,
    )
    .bind(appointment_id)
    .bind(status)
    .bind(payment_status)
    .bind(method)
    .bind(now)
    .bind(price_override_cents)
    .execute(&state.db)
    .await
    .map_err(|e| SettleFailure::Db(format!("{e}")))?;

    if res.rows_affected() == 0 {
        return Err(SettleFailure::NotFound);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct SettleRequest {
    pub method: PaymentMethod,
    pub update_whole_series: Option<bool>,
    pub final_price_cents: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct SettleOutcome {
    pub appointment: AppointmentRow,
    /// Present only when whole-series propagation was requested.
    pub series: Option<BatchSettlementSummary>,
}

pub async fn settle_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<SettleRequest>,
) -> Result<Json<ApiOk<SettleOutcome>>, ApiError> {
    ensure_settle(&auth)?;

    if let Some(p) = req.final_price_cents {
        if p < 0 {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "final_price_cents must be >= 0".into(),
            ));
        }
    }

    let now = Utc::now();
    settle_one(&state, appointment_id, req.method, req.final_price_cents, now)
        .await
        .map_err(|e| match e {
            SettleFailure::NotFound => {
                ApiError::NotFound("NOT_FOUND", "appointment not found".into())
            }
            SettleFailure::Db(msg) => {
                ApiError::Internal(format!("settle {appointment_id}: {msg}"))
            }
        })?;

    // Optional whole-series propagation; sibling failures are reported,
    // never allowed to undo the primary settlement.
    let mut series = None;
    if req.update_whole_series.unwrap_or(false) {
        let group_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT recurrence_group_id
            FROM appointment
            WHERE appointment_id = $1
            "#,
        )
        .bind(appointment_id)
        .fetch_one(&state.db)
        .await
        .map_err(|e| ApiError::Internal(format!("settle {appointment_id}: db error: {e}")))?;

        if let Some(group_id) = group_id {
            let sibling_ids: Vec<Uuid> = sqlx::query_scalar(
                r#"
                SELECT appointment_id
                FROM appointment
                WHERE recurrence_group_id = $1
                  AND appointment_id <> $2
                ORDER BY start_at ASC
                "#,
            )
            .bind(group_id)
            .bind(appointment_id)
            .fetch_all(&state.db)
            .await
            .map_err(|e| ApiError::Internal(format!("settle {appointment_id}: db error: {e}")))?;

            let mut results = Vec::with_capacity(sibling_ids.len());
            for id in sibling_ids {
                // Siblings keep their own price; the override applies to
                // the primary appointment only.
                let res = settle_one(&state, id, req.method, None, now).await;
                if let Err(e) = &res {
                    tracing::warn!(appointment_id = %id, error = %e, "series settlement failed for sibling");
                }
                results.push((id, res));
            }
            series = Some(summarize(results));
        }
    }

    let sql = "SELECT appointment_id, client_id, start_at, end_at, status, payment_status, \
final_price_cents, notes, payment_method, payment_date, recurrence, recurrence_days, \
recurrence_count, recurrence_group_id, is_parent, parent_appointment_id, created_at, updated_at \
FROM appointment WHERE appointment_id = $1";
    let appointment: AppointmentRow = sqlx::query_as::<_, AppointmentRow>(sql)
        .bind(appointment_id)
        .fetch_one(&state.db)
        .await
        .map_err(|e| ApiError::Internal(format!("settle {appointment_id}: db error: {e}")))?;

    tracing::info!(appointment_id = %appointment_id, "appointment settled");

    Ok(Json(ApiOk {
        data: SettleOutcome { appointment, series },
    }))
}

/* ============================================================
   Batch settlement
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct SettleBatchRequest {
    pub appointment_ids: Vec<Uuid>,
    pub method: PaymentMethod,
}

pub async fn settle_batch(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<SettleBatchRequest>,
) -> Result<Json<ApiOk<BatchSettlementSummary>>, ApiError> {
    ensure_settle(&auth)?;

    if req.appointment_ids.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "appointment_ids must not be empty".into(),
        ));
    }

    let now = Utc::now();
    let mut results = Vec::with_capacity(req.appointment_ids.len());
    for id in req.appointment_ids {
        // Independent per-item writes: one failure never aborts the batch.
        let res = settle_one(&state, id, req.method, None, now).await;
        if let Err(e) = &res {
            tracing::warn!(appointment_id = %id, error = %e, "batch settlement item failed");
        }
        results.push((id, res));
    }

    let summary = summarize(results);
    tracing::info!(
        succeeded = summary.succeeded.len(),
        failed = summary.failed.len(),
        "batch settlement finished"
    );

    Ok(Json(ApiOk { data: summary }))
}

#[derive(Debug, Deserialize)]
pub struct SettleAllRequest {
    pub method: PaymentMethod,
}

pub async fn settle_all_for_client(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(client_id): Path<Uuid>,
    Json(req): Json<SettleAllRequest>,
) -> Result<Json<ApiOk<BatchSettlementSummary>>, ApiError> {
    ensure_settle(&auth)?;

    let pending_ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT appointment_id
        FROM appointment
        WHERE client_id = $1
          AND payment_status = $2
        ORDER BY start_at ASC
        "#,
    )
    .bind(client_id)
    .bind(PaymentStatus::Pending)
    .fetch_all(&state.db)
    .await
    .map_err(|e| ApiError::Internal(format!("settle_all {client_id}: db error: {e}")))?;

    if pending_ids.is_empty() {
        return Ok(Json(ApiOk {
            data: BatchSettlementSummary {
                succeeded: vec![],
                failed: vec![],
                message: "no pending appointments for this client".into(),
            },
        }));
    }

    let now = Utc::now();
    let mut results = Vec::with_capacity(pending_ids.len());
    for id in pending_ids {
        let res = settle_one(&state, id, req.method, None, now).await;
        if let Err(e) = &res {
            tracing::warn!(appointment_id = %id, error = %e, "client settlement item failed");
        }
        results.push((id, res));
    }

    Ok(Json(ApiOk {
        data: summarize(results),
    }))
}

/* ============================================================
   Price edit (re-opens payment state)
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct UpdatePriceRequest {
    pub final_price_cents: i32,
}

/// Editing the price re-opens the payment state: the appointment drops
/// back to pending_payment/pending and must be settled again. A
/// previously paid row must never keep `paid` against a changed total.
pub async fn update_appointment_price(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<UpdatePriceRequest>,
) -> Result<Json<ApiOk<AppointmentRow>>, ApiError> {
    ensure_settle(&auth)?;

    if req.final_price_cents < 0 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "final_price_cents must be >= 0".into(),
        ));
    }

    let sql = "SELECT appointment_id, client_id, start_at, end_at, status, payment_status, \
final_price_cents, notes, payment_method, payment_date, recurrence, recurrence_days, \
recurrence_count, recurrence_group_id, is_parent, parent_appointment_id, created_at, updated_at \
FROM appointment WHERE appointment_id = $1";
    let existing: AppointmentRow = sqlx::query_as::<_, AppointmentRow>(sql)
        .bind(appointment_id)
        .fetch_optional(&state.db)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
        .ok_or_else(|| ApiError::NotFound("NOT_FOUND", "appointment not found".into()))?;

    let (status, payment_status) =
        resolve_for_payment(Some(PaymentStatus::Pending), existing.status);
    if !is_consistent_pair(status, payment_status) {
        return Err(ApiError::consistency_violation(format!(
            "price edit would persist {status:?}/{payment_status:?}"
        )));
    }

    if existing.payment_status == Some(PaymentStatus::Paid) {
        tracing::warn!(
            appointment_id = %appointment_id,
            "price edit re-opened a paid appointment; re-settlement required"
        );
    }

    let updated: AppointmentRow = sqlx::query_as::<_, AppointmentRow>(
        "UPDATE appointment \
         SET final_price_cents = $2, \
             status = $3, \
             payment_status = $4, \
             updated_at = now() \
         WHERE appointment_id = $1 \
         RETURNING appointment_id, client_id, start_at, end_at, status, payment_status, \
final_price_cents, notes, payment_method, payment_date, recurrence, recurrence_days, \
recurrence_count, recurrence_group_id, is_parent, parent_appointment_id, created_at, updated_at",
    )
    .bind(appointment_id)
    .bind(req.final_price_cents)
    .bind(status)
    .bind(payment_status)
    .fetch_one(&state.db)
    .await
    .map_err(|e| ApiError::Internal(format!("update_price {appointment_id}: db error: {e}")))?;

    Ok(Json(ApiOk { data: updated }))
}

/* ============================================================
   Tests
   ============================================================ */

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, d, 9, 0, 0).unwrap()
    }

    fn pending(client_id: Uuid, client_name: &str, price: i32, day: u32) -> PendingRow {
        PendingRow {
            appointment_id: Uuid::new_v4(),
            client_id,
            client_name: client_name.into(),
            start_at: dt(day),
            final_price_cents: price,
        }
    }

    #[test]
    fn groups_keep_first_seen_client_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let rows = vec![
            pending(a, "Ana", 5000, 1),
            pending(b, "Bia", 3000, 2),
            pending(a, "Ana", 2000, 3),
        ];

        let groups = group_pending_by_client(rows);
        assert_eq!(groups.len(), 2);

        assert_eq!(groups[0].client_id, a);
        assert_eq!(groups[0].total_due_cents, 7000);
        assert_eq!(groups[0].appointments.len(), 2);

        assert_eq!(groups[1].client_id, b);
        assert_eq!(groups[1].total_due_cents, 3000);
        assert_eq!(groups[1].appointments.len(), 1);
    }

    #[test]
    fn empty_input_yields_no_groups() {
        assert!(group_pending_by_client(vec![]).is_empty());
    }

    #[test]
    fn summary_counts_partial_failures() {
        let ok1 = Uuid::new_v4();
        let ok2 = Uuid::new_v4();
        let bad = Uuid::new_v4();
        let summary = summarize(vec![
            (ok1, Ok(())),
            (bad, Err(SettleFailure::Db("connection reset".into()))),
            (ok2, Ok(())),
        ]);

        assert_eq!(summary.succeeded, vec![ok1, ok2]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].appointment_id, bad);
        assert!(summary.failed[0].reason.contains("connection reset"));
        assert_eq!(summary.message, "settled 2 of 3");
    }

    #[test]
    fn statuses_serialize_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&AppointmentStatus::PendingPayment).unwrap(),
            "\"pending_payment\""
        );
        assert_eq!(
            serde_json::to_string(&PaymentStatus::Paid).unwrap(),
            "\"paid\""
        );
        assert_eq!(
            serde_json::to_string(&PaymentMethod::Pix).unwrap(),
            "\"pix\""
        );
    }
}
