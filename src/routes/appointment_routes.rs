// src/routes/appointment_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{
        AppState, AppointmentRow, AppointmentStatus, PaymentMethod, PaymentStatus, Recurrence,
        ServiceCatalogRow, Weekday,
    },
    recurrence::generate_recurrence_dates,
    status::{is_consistent_pair, resolve_for_payment, resolve_for_status},
};

/*
Roles (salon_user.roles):
1 admin
2 manager
3 stylist
4 receptionist
*/

fn is_admin(auth: &AuthContext) -> bool {
    auth.role == 1
}
fn is_manager(auth: &AuthContext) -> bool {
    auth.role == 2
}
fn is_receptionist(auth: &AuthContext) -> bool {
    auth.role == 4
}

fn can_manage_appointments(auth: &AuthContext) -> bool {
    is_admin(auth) || is_manager(auth) || is_receptionist(auth)
}

fn ensure_manage(auth: &AuthContext) -> Result<(), ApiError> {
    if can_manage_appointments(auth) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only admin/manager/receptionist can manage appointments".into(),
        ))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/appointments/week", get(get_appointments_week))
        .route("/appointments/day", get(get_appointments_day))
        .route("/appointments", post(create_appointment))
        .route(
            "/appointments/{appointment_id}",
            get(get_appointment)
                .put(update_appointment)
                .delete(delete_appointment),
        )
        .route("/appointments/{appointment_id}/status", post(set_status))
        .route(
            "/appointments/{appointment_id}/payment_status",
            post(set_payment_status),
        )
        .route(
            "/appointments/{appointment_id}/delete_future",
            post(delete_future_in_series),
        )
        .route(
            "/appointments/{appointment_id}/delete_series",
            post(delete_all_in_series),
        )
}

const APPOINTMENT_COLS: &str = "appointment_id, client_id, start_at, end_at, status, \
payment_status, final_price_cents, notes, payment_method, payment_date, recurrence, \
recurrence_days, recurrence_count, recurrence_group_id, is_parent, parent_appointment_id, \
created_at, updated_at";

pub const DEFAULT_SERVICE_DURATION_MIN: i64 = 30;

/* ============================================================
   Response DTOs
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct ClientBrief {
    pub id: Uuid,
    pub name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AppointmentLineDto {
    pub service_id: Uuid,
    pub name: String,
    pub final_price_cents: i32,
}

#[derive(Debug, Serialize)]
pub struct AppointmentBlockDto {
    pub appointment_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub payment_status: Option<PaymentStatus>,
    pub final_price_cents: i32,
    pub notes: Option<String>,
    pub payment_method: Option<PaymentMethod>,
    pub payment_date: Option<DateTime<Utc>>,
    pub recurrence: Recurrence,
    pub recurrence_days: Vec<Weekday>,
    pub recurrence_count: i32,
    pub recurrence_group_id: Option<Uuid>,
    pub is_parent: bool,
    pub parent_appointment_id: Option<Uuid>,
    pub client: ClientBrief,
    pub services: Vec<AppointmentLineDto>,
    pub service_summary: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteOutcome {
    pub deleted: i64,
    pub promoted_parent: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SeriesDeleteOutcome {
    pub deleted: i64,
    pub settled_removed: i64,
    pub message: String,
}

/* ============================================================
   Query params
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct WeekQuery {
    // YYYY-MM-DD (local interpretation belongs to frontend; DB stores timestamptz)
    pub start: String,
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DayQuery {
    pub date: Option<String>,
}

/* ============================================================
   Request DTOs
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct ServiceSelection {
    pub service_id: Uuid,
    /// Per-appointment override; catalog price when absent.
    pub final_price_cents: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAppointmentRequest {
    pub client_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub services: Vec<ServiceSelection>,
    pub notes: Option<String>,
    pub status: Option<AppointmentStatus>,
    pub recurrence: Option<Recurrence>,
    pub recurrence_days: Option<Vec<Weekday>>,
    pub recurrence_count: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAppointmentRequest {
    pub client_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub services: Vec<ServiceSelection>,
    pub notes: Option<String>,
    pub status: Option<AppointmentStatus>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub payment_status: Option<Option<PaymentStatus>>,
}

#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    pub status: AppointmentStatus,
}

#[derive(Debug, Deserialize)]
pub struct SetPaymentStatusRequest {
    pub payment_status: Option<PaymentStatus>,
}

use serde::de::Deserializer;

fn deserialize_double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    // Called only when the field is present (even if it's `null`):
    // null => Some(None), value => Some(Some(value)).
    let inner = Option::<T>::deserialize(deserializer)?;
    Ok(Some(inner))
}

/* ============================================================
   Schedule computation (line items, totals, duration)
   ============================================================ */

#[derive(Debug, Clone)]
pub struct ScheduleLine {
    pub service_id: Uuid,
    pub final_price_cents: i32,
}

#[derive(Debug)]
pub struct Schedule {
    pub lines: Vec<ScheduleLine>,
    pub total_cents: i32,
    pub duration_min: i64,
}

fn compute_schedule(
    selections: &[ServiceSelection],
    catalog: &[ServiceCatalogRow],
) -> Result<Schedule, ApiError> {
    if selections.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "at least one service is required".into(),
        ));
    }

    let mut lines = Vec::with_capacity(selections.len());
    let mut total_cents: i32 = 0;
    let mut duration_min: i64 = 0;

    for sel in selections {
        let svc = catalog
            .iter()
            .find(|s| s.service_id == sel.service_id)
            .ok_or_else(|| {
                ApiError::BadRequest(
                    "VALIDATION_ERROR",
                    format!("unknown or inactive service: {}", sel.service_id),
                )
            })?;

        let final_price_cents = sel.final_price_cents.unwrap_or(svc.price_cents);
        if final_price_cents < 0 {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "final_price_cents must be >= 0".into(),
            ));
        }

        duration_min += svc
            .duration_min
            .map(i64::from)
            .unwrap_or(DEFAULT_SERVICE_DURATION_MIN);
        total_cents += final_price_cents;
        lines.push(ScheduleLine {
            service_id: sel.service_id,
            final_price_cents,
        });
    }

    Ok(Schedule {
        lines,
        total_cents,
        duration_min,
    })
}

async fn load_catalog_for(
    state: &AppState,
    selections: &[ServiceSelection],
) -> Result<Vec<ServiceCatalogRow>, ApiError> {
    let ids: Vec<Uuid> = selections.iter().map(|s| s.service_id).collect();
    let rows: Vec<ServiceCatalogRow> = sqlx::query_as::<_, ServiceCatalogRow>(
        r#"
        SELECT service_id, name, price_cents, duration_min, is_active, created_at, updated_at
        FROM service_catalog
        WHERE service_id = ANY($1)
          AND is_active = true
        "#,
    )
    .bind(&ids)
    .fetch_all(&state.db)
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    Ok(rows)
}

async fn ensure_client_exists(state: &AppState, client_id: Uuid) -> Result<(), ApiError> {
    let found: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT client_id
        FROM client
        WHERE client_id = $1
        "#,
    )
    .bind(client_id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    if found.is_none() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "client not found".into(),
        ));
    }
    Ok(())
}

/* ============================================================
   POST /appointments (create, with recurrence expansion)
   ============================================================ */

struct NewAppointment {
    client_id: Uuid,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    status: AppointmentStatus,
    payment_status: Option<PaymentStatus>,
    final_price_cents: i32,
    notes: Option<String>,
    recurrence: Recurrence,
    recurrence_days: Vec<i16>,
    recurrence_count: i32,
    recurrence_group_id: Option<Uuid>,
    is_parent: bool,
    parent_appointment_id: Option<Uuid>,
}

async fn insert_appointment(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    appt: &NewAppointment,
    lines: &[ScheduleLine],
) -> Result<Uuid, ApiError> {
    let row = sqlx::query(
        r#"
        INSERT INTO appointment (
          client_id,
          start_at,
          end_at,
          status,
          payment_status,
          final_price_cents,
          notes,
          recurrence,
          recurrence_days,
          recurrence_count,
          recurrence_group_id,
          is_parent,
          parent_appointment_id,
          created_at,
          updated_at
        )
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13, now(), now())
        RETURNING appointment_id
        "#,
    )
    .bind(appt.client_id)
    .bind(appt.start_at)
    .bind(appt.end_at)
    .bind(appt.status)
    .bind(appt.payment_status)
    .bind(appt.final_price_cents)
    .bind(appt.notes.as_deref())
    .bind(appt.recurrence)
    .bind(&appt.recurrence_days)
    .bind(appt.recurrence_count)
    .bind(appt.recurrence_group_id)
    .bind(appt.is_parent)
    .bind(appt.parent_appointment_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| ApiError::BadRequest("APPOINTMENT_CREATE_FAILED", format!("{e}")))?;

    let appointment_id: Uuid = row
        .try_get("appointment_id")
        .map_err(|e| ApiError::Internal(format!("row decode error: {e}")))?;

    for line in lines {
        sqlx::query(
            r#"
            INSERT INTO appointment_service (appointment_id, service_id, final_price_cents)
            VALUES ($1,$2,$3)
            "#,
        )
        .bind(appointment_id)
        .bind(line.service_id)
        .bind(line.final_price_cents)
        .execute(&mut **tx)
        .await
        .map_err(|e| ApiError::BadRequest("SERVICE_LINE_CREATE_FAILED", format!("{e}")))?;
    }

    Ok(appointment_id)
}

pub async fn create_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateAppointmentRequest>,
) -> Result<Json<ApiOk<AppointmentBlockDto>>, ApiError> {
    ensure_manage(&auth)?;

    ensure_client_exists(&state, req.client_id).await?;
    let catalog = load_catalog_for(&state, &req.services).await?;
    let schedule = compute_schedule(&req.services, &catalog)?;
    let end_at = req.start_at + Duration::minutes(schedule.duration_min);

    let (status, payment_status) =
        resolve_for_status(req.status.unwrap_or(AppointmentStatus::Scheduled));
    if !is_consistent_pair(status, payment_status) {
        return Err(ApiError::consistency_violation(format!(
            "create would persist {status:?}/{payment_status:?}"
        )));
    }

    let recurrence = req.recurrence.unwrap_or(Recurrence::None);
    let weekday_tags = req.recurrence_days.unwrap_or_default();
    let recurrence_count = req.recurrence_count.unwrap_or(1);

    let extra_dates =
        generate_recurrence_dates(req.start_at, recurrence, &weekday_tags, recurrence_count);
    let recurring = !extra_dates.is_empty();
    let recurrence_group_id = recurring.then(Uuid::new_v4);
    let recurrence_days: Vec<i16> = weekday_tags.iter().map(|w| w.index()).collect();

    let mut tx = state
        .db
        .begin()
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    let parent_id = insert_appointment(
        &mut tx,
        &NewAppointment {
            client_id: req.client_id,
            start_at: req.start_at,
            end_at,
            status,
            payment_status,
            final_price_cents: schedule.total_cents,
            notes: req.notes.clone(),
            recurrence,
            recurrence_days: recurrence_days.clone(),
            recurrence_count,
            recurrence_group_id,
            is_parent: recurring,
            parent_appointment_id: None,
        },
        &schedule.lines,
    )
    .await?;

    for date in &extra_dates {
        insert_appointment(
            &mut tx,
            &NewAppointment {
                client_id: req.client_id,
                start_at: *date,
                end_at: *date + Duration::minutes(schedule.duration_min),
                status,
                payment_status,
                final_price_cents: schedule.total_cents,
                notes: req.notes.clone(),
                recurrence,
                recurrence_days: recurrence_days.clone(),
                recurrence_count,
                recurrence_group_id,
                is_parent: false,
                parent_appointment_id: Some(parent_id),
            },
            &schedule.lines,
        )
        .await?;
    }

    tx.commit()
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    tracing::info!(
        appointment_id = %parent_id,
        generated = extra_dates.len(),
        "appointment created"
    );

    get_appointment(State(state), auth, Path(parent_id)).await
}

/* ============================================================
   PUT /appointments/{id} (full replace, line items included)
   ============================================================ */

async fn load_appointment(
    state: &AppState,
    appointment_id: Uuid,
) -> Result<AppointmentRow, ApiError> {
    let sql = format!("SELECT {APPOINTMENT_COLS} FROM appointment WHERE appointment_id = $1");
    sqlx::query_as::<_, AppointmentRow>(&sql)
        .bind(appointment_id)
        .fetch_optional(&state.db)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
        .ok_or_else(|| ApiError::NotFound("NOT_FOUND", "appointment not found".into()))
}

pub async fn update_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<UpdateAppointmentRequest>,
) -> Result<Json<ApiOk<AppointmentBlockDto>>, ApiError> {
    ensure_manage(&auth)?;

    let existing = load_appointment(&state, appointment_id).await?;
    ensure_client_exists(&state, req.client_id).await?;
    let catalog = load_catalog_for(&state, &req.services).await?;
    let schedule = compute_schedule(&req.services, &catalog)?;
    let end_at = req.start_at + Duration::minutes(schedule.duration_min);

    // Payment change wins over a simultaneous status change (the payment
    // side is the later edit); either way the resolver owns the pair.
    let (status, payment_status) = match req.payment_status {
        Some(new_payment) => {
            let current = match req.status {
                Some(s) => resolve_for_status(s).0,
                None => existing.status,
            };
            resolve_for_payment(new_payment, current)
        }
        None => match req.status {
            Some(s) => resolve_for_status(s),
            None => (existing.status, existing.payment_status),
        },
    };
    if !is_consistent_pair(status, payment_status) {
        return Err(ApiError::consistency_violation(format!(
            "update would persist {status:?}/{payment_status:?}"
        )));
    }

    let mut tx = state
        .db
        .begin()
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    sqlx::query(
        r#"
        UPDATE appointment
        SET client_id = $2,
            start_at = $3,
            end_at = $4,
            status = $5,
            payment_status = $6,
            final_price_cents = $7,
            notes = $8,
            updated_at = now()
        WHERE appointment_id = $1
        "#,
    )
    .bind(appointment_id)
    .bind(req.client_id)
    .bind(req.start_at)
    .bind(end_at)
    .bind(status)
    .bind(payment_status)
    .bind(schedule.total_cents)
    .bind(req.notes.as_deref())
    .execute(&mut *tx)
    .await
    .map_err(|e| ApiError::BadRequest("APPOINTMENT_UPDATE_FAILED", format!("{e}")))?;

    // Full replace of line items, never a diff.
    sqlx::query(r#"DELETE FROM appointment_service WHERE appointment_id = $1"#)
        .bind(appointment_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            ApiError::Internal(format!("update_appointment {appointment_id}: db error: {e}"))
        })?;

    for line in &schedule.lines {
        sqlx::query(
            r#"
            INSERT INTO appointment_service (appointment_id, service_id, final_price_cents)
            VALUES ($1,$2,$3)
            "#,
        )
        .bind(appointment_id)
        .bind(line.service_id)
        .bind(line.final_price_cents)
        .execute(&mut *tx)
        .await
        .map_err(|e| ApiError::BadRequest("SERVICE_LINE_CREATE_FAILED", format!("{e}")))?;
    }

    tx.commit()
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    get_appointment(State(state), auth, Path(appointment_id)).await
}

/* ============================================================
   Quick status actions
   ============================================================ */

pub async fn set_status(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<SetStatusRequest>,
) -> Result<Json<ApiOk<AppointmentBlockDto>>, ApiError> {
    ensure_manage(&auth)?;

    let (status, payment_status) = resolve_for_status(req.status);
    if !is_consistent_pair(status, payment_status) {
        return Err(ApiError::consistency_violation(format!(
            "status action would persist {status:?}/{payment_status:?}"
        )));
    }

    let res = sqlx::query(
        r#"
        UPDATE appointment
        SET status = $2,
            payment_status = $3,
            updated_at = now()
        WHERE appointment_id = $1
        "#,
    )
    .bind(appointment_id)
    .bind(status)
    .bind(payment_status)
    .execute(&state.db)
    .await
    .map_err(|e| ApiError::BadRequest("APPOINTMENT_UPDATE_FAILED", format!("{e}")))?;

    if res.rows_affected() == 0 {
        return Err(ApiError::NotFound("NOT_FOUND", "appointment not found".into()));
    }

    get_appointment(State(state), auth, Path(appointment_id)).await
}

pub async fn set_payment_status(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<SetPaymentStatusRequest>,
) -> Result<Json<ApiOk<AppointmentBlockDto>>, ApiError> {
    ensure_manage(&auth)?;

    let existing = load_appointment(&state, appointment_id).await?;
    let (status, payment_status) = resolve_for_payment(req.payment_status, existing.status);
    if !is_consistent_pair(status, payment_status) {
        return Err(ApiError::consistency_violation(format!(
            "payment action would persist {status:?}/{payment_status:?}"
        )));
    }

    sqlx::query(
        r#"
        UPDATE appointment
        SET status = $2,
            payment_status = $3,
            updated_at = now()
        WHERE appointment_id = $1
        "#,
    )
    .bind(appointment_id)
    .bind(status)
    .bind(payment_status)
    .execute(&state.db)
    .await
    .map_err(|e| ApiError::BadRequest("APPOINTMENT_UPDATE_FAILED", format!("{e}")))?;

    get_appointment(State(state), auth, Path(appointment_id)).await
}

/* ============================================================
   DELETE /appointments/{id} (single, with child promotion)
   ============================================================ */

/// The earliest-starting child becomes the new series parent.
fn pick_promotion(children: &[AppointmentRow]) -> Option<&AppointmentRow> {
    children.iter().min_by_key(|c| c.start_at)
}

pub async fn delete_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<DeleteOutcome>>, ApiError> {
    ensure_manage(&auth)?;

    let existing = load_appointment(&state, appointment_id).await?;

    let mut tx = state
        .db
        .begin()
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    let sql = format!(
        "SELECT {APPOINTMENT_COLS} FROM appointment WHERE parent_appointment_id = $1 ORDER BY start_at ASC"
    );
    let children: Vec<AppointmentRow> = sqlx::query_as::<_, AppointmentRow>(&sql)
        .bind(appointment_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| {
            ApiError::Internal(format!("delete_appointment {appointment_id}: db error: {e}"))
        })?;

    let mut promoted_parent = None;
    if existing.is_parent {
        if let Some(new_parent) = pick_promotion(&children) {
            let new_parent_id = new_parent.appointment_id;

            sqlx::query(
                r#"
                UPDATE appointment
                SET is_parent = true,
                    parent_appointment_id = NULL,
                    updated_at = now()
                WHERE appointment_id = $1
                "#,
            )
            .bind(new_parent_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                ApiError::Internal(format!(
                    "delete_appointment {appointment_id}: promote failed: {e}"
                ))
            })?;

            sqlx::query(
                r#"
                UPDATE appointment
                SET parent_appointment_id = $2,
                    updated_at = now()
                WHERE parent_appointment_id = $1
                  AND appointment_id <> $2
                "#,
            )
            .bind(appointment_id)
            .bind(new_parent_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                ApiError::Internal(format!(
                    "delete_appointment {appointment_id}: re-link failed: {e}"
                ))
            })?;

            promoted_parent = Some(new_parent_id);
        }
    }

    sqlx::query(r#"DELETE FROM appointment_service WHERE appointment_id = $1"#)
        .bind(appointment_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            ApiError::Internal(format!("delete_appointment {appointment_id}: db error: {e}"))
        })?;

    sqlx::query(r#"DELETE FROM appointment WHERE appointment_id = $1"#)
        .bind(appointment_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            ApiError::Internal(format!("delete_appointment {appointment_id}: db error: {e}"))
        })?;

    tx.commit().await.map_err(|e| {
        ApiError::Internal(format!("delete_appointment {appointment_id}: db error: {e}"))
    })?;

    tracing::info!(appointment_id = %appointment_id, promoted = ?promoted_parent, "appointment deleted");

    Ok(Json(ApiOk {
        data: DeleteOutcome {
            deleted: 1,
            promoted_parent,
        },
    }))
}

/* ============================================================
   Series deletion
   ============================================================ */

/// Upcoming rows that are safe to drop: settled work (completed or paid)
/// is never deletable on this path, future-dated or not.
fn future_deletable(group: &[AppointmentRow], now: DateTime<Utc>) -> Vec<&AppointmentRow> {
    group
        .iter()
        .filter(|a| {
            a.start_at >= now
                && a.status != AppointmentStatus::Completed
                && a.payment_status != Some(PaymentStatus::Paid)
        })
        .collect()
}

fn series_parent_id(row: &AppointmentRow) -> Uuid {
    if row.is_parent {
        row.appointment_id
    } else {
        row.parent_appointment_id.unwrap_or(row.appointment_id)
    }
}

async fn load_series(state: &AppState, parent_id: Uuid) -> Result<Vec<AppointmentRow>, ApiError> {
    let sql = format!(
        "SELECT {APPOINTMENT_COLS} FROM appointment \
         WHERE appointment_id = $1 OR parent_appointment_id = $1 \
         ORDER BY start_at ASC"
    );
    sqlx::query_as::<_, AppointmentRow>(&sql)
        .bind(parent_id)
        .fetch_all(&state.db)
        .await
        .map_err(|e| ApiError::Internal(format!("load_series {parent_id}: db error: {e}")))
}

async fn delete_rows_in_series(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ids: &[Uuid],
) -> Result<(), ApiError> {
    sqlx::query(r#"DELETE FROM appointment_service WHERE appointment_id = ANY($1)"#)
        .bind(ids)
        .execute(&mut **tx)
        .await
        .map_err(|e| ApiError::Internal(format!("series delete: db error: {e}")))?;

    sqlx::query(r#"DELETE FROM appointment WHERE appointment_id = ANY($1)"#)
        .bind(ids)
        .execute(&mut **tx)
        .await
        .map_err(|e| ApiError::Internal(format!("series delete: db error: {e}")))?;

    Ok(())
}

pub async fn delete_future_in_series(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<SeriesDeleteOutcome>>, ApiError> {
    ensure_manage(&auth)?;

    let row = load_appointment(&state, appointment_id).await?;
    let parent_id = series_parent_id(&row);
    let group = load_series(&state, parent_id).await?;

    let now = Utc::now();
    let eligible = future_deletable(&group, now);
    if eligible.is_empty() {
        return Ok(Json(ApiOk {
            data: SeriesDeleteOutcome {
                deleted: 0,
                settled_removed: 0,
                message: "no upcoming unpaid appointments to delete".into(),
            },
        }));
    }

    let ids: Vec<Uuid> = eligible.iter().map(|a| a.appointment_id).collect();
    let parent_goes = ids.contains(&parent_id);
    let survivors: Vec<&AppointmentRow> = group
        .iter()
        .filter(|a| !ids.contains(&a.appointment_id))
        .collect();

    let mut tx = state
        .db
        .begin()
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    // Keep the single-parent invariant when the parent is among the
    // deleted rows but settled siblings survive.
    if parent_goes && !survivors.is_empty() {
        let new_parent_id = survivors
            .iter()
            .min_by_key(|a| a.start_at)
            .map(|a| a.appointment_id)
            .unwrap();

        sqlx::query(
            r#"
            UPDATE appointment
            SET is_parent = true,
                parent_appointment_id = NULL,
                updated_at = now()
            WHERE appointment_id = $1
            "#,
        )
        .bind(new_parent_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            ApiError::Internal(format!("delete_future {parent_id}: promote failed: {e}"))
        })?;

        sqlx::query(
            r#"
            UPDATE appointment
            SET parent_appointment_id = $2,
                updated_at = now()
            WHERE parent_appointment_id = $1
              AND appointment_id <> $2
            "#,
        )
        .bind(parent_id)
        .bind(new_parent_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            ApiError::Internal(format!("delete_future {parent_id}: re-link failed: {e}"))
        })?;
    }

    delete_rows_in_series(&mut tx, &ids).await?;

    tx.commit()
        .await
        .map_err(|e| ApiError::Internal(format!("delete_future {parent_id}: db error: {e}")))?;

    let deleted = ids.len() as i64;
    tracing::info!(parent_id = %parent_id, deleted, "future appointments in series deleted");

    Ok(Json(ApiOk {
        data: SeriesDeleteOutcome {
            deleted,
            settled_removed: 0,
            message: format!("deleted {deleted} upcoming appointments"),
        },
    }))
}

pub async fn delete_all_in_series(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<SeriesDeleteOutcome>>, ApiError> {
    ensure_manage(&auth)?;

    let row = load_appointment(&state, appointment_id).await?;
    let parent_id = series_parent_id(&row);
    let group = load_series(&state, parent_id).await?;

    let settled = group
        .iter()
        .filter(|a| {
            a.status == AppointmentStatus::Completed
                || a.payment_status == Some(PaymentStatus::Paid)
        })
        .count() as i64;
    let ids: Vec<Uuid> = group.iter().map(|a| a.appointment_id).collect();

    let mut tx = state
        .db
        .begin()
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    delete_rows_in_series(&mut tx, &ids).await?;

    tx.commit()
        .await
        .map_err(|e| ApiError::Internal(format!("delete_series {parent_id}: db error: {e}")))?;

    let deleted = ids.len() as i64;
    if settled > 0 {
        tracing::warn!(parent_id = %parent_id, settled, "series delete removed settled appointments");
    }

    Ok(Json(ApiOk {
        data: SeriesDeleteOutcome {
            deleted,
            settled_removed: settled,
            message: if settled > 0 {
                format!("deleted {deleted} appointments, including {settled} completed/paid")
            } else {
                format!("deleted {deleted} appointments")
            },
        },
    }))
}

/* ============================================================
   Reads: GET /appointments/week, /appointments/day, /{id}
   ============================================================ */

const BLOCK_SELECT: &str = r#"
        SELECT
          a.appointment_id,
          a.client_id,
          a.start_at,
          a.end_at,
          a.status,
          a.payment_status,
          a.final_price_cents,
          a.notes,
          a.payment_method,
          a.payment_date,
          a.recurrence,
          a.recurrence_days,
          a.recurrence_count,
          a.recurrence_group_id,
          a.is_parent,
          a.parent_appointment_id,

          c.name  AS client_name,
          c.phone AS client_phone,

          aps.service_id AS svc_id,
          aps.final_price_cents AS svc_price,
          sc.name AS svc_name

        FROM appointment a
        JOIN client c ON c.client_id = a.client_id
        LEFT JOIN appointment_service aps ON aps.appointment_id = a.appointment_id
        LEFT JOIN service_catalog sc ON sc.service_id = aps.service_id
"#;

pub async fn get_appointments_week(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<WeekQuery>,
) -> Result<Json<ApiOk<Vec<AppointmentBlockDto>>>, ApiError> {
    let days = q.days.unwrap_or(7);
    if !(1..=14).contains(&days) {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "days must be between 1 and 14".into(),
        ));
    }

    let start_date = NaiveDate::parse_from_str(q.start.trim(), "%Y-%m-%d").map_err(|_| {
        ApiError::BadRequest("VALIDATION_ERROR", "start must be YYYY-MM-DD".into())
    })?;

    let start_ts =
        DateTime::<Utc>::from_naive_utc_and_offset(start_date.and_hms_opt(0, 0, 0).unwrap(), Utc);
    let end_ts = start_ts + Duration::days(days);

    let sql = format!(
        "{BLOCK_SELECT} WHERE a.start_at >= $1 AND a.start_at < $2 ORDER BY a.start_at ASC, sc.name ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(start_ts)
        .bind(end_ts)
        .fetch_all(&state.db)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    Ok(Json(ApiOk {
        data: fold_rows_into_blocks(rows)?,
    }))
}

pub async fn get_appointments_day(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<DayQuery>,
) -> Result<Json<ApiOk<Vec<AppointmentBlockDto>>>, ApiError> {
    let date = match q.date.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
            ApiError::BadRequest("VALIDATION_ERROR", "date must be YYYY-MM-DD".into())
        })?,
        _ => Utc::now().date_naive(),
    };

    let start_ts =
        DateTime::<Utc>::from_naive_utc_and_offset(date.and_hms_opt(0, 0, 0).unwrap(), Utc);
    let end_ts = start_ts + Duration::days(1);

    let sql = format!(
        "{BLOCK_SELECT} WHERE a.start_at >= $1 AND a.start_at < $2 ORDER BY a.start_at ASC, sc.name ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(start_ts)
        .bind(end_ts)
        .fetch_all(&state.db)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    Ok(Json(ApiOk {
        data: fold_rows_into_blocks(rows)?,
    }))
}

pub async fn get_appointment(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<AppointmentBlockDto>>, ApiError> {
    let sql = format!("{BLOCK_SELECT} WHERE a.appointment_id = $1 ORDER BY sc.name ASC");
    let rows = sqlx::query(&sql)
        .bind(appointment_id)
        .fetch_all(&state.db)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    if rows.is_empty() {
        return Err(ApiError::NotFound("NOT_FOUND", "appointment not found".into()));
    }

    let blocks = fold_rows_into_blocks(rows)?;
    let block = blocks.into_iter().next().unwrap();

    Ok(Json(ApiOk { data: block }))
}

/* ============================================================
   Helper: fold joined rows into appointment blocks
   ============================================================ */

fn fold_rows_into_blocks(
    rows: Vec<sqlx::postgres::PgRow>,
) -> Result<Vec<AppointmentBlockDto>, ApiError> {
    use std::collections::BTreeMap;

    // Keyed by (start_at, id) so iteration keeps schedule order.
    let mut map: BTreeMap<(DateTime<Utc>, Uuid), AppointmentBlockDto> = BTreeMap::new();

    for r in rows {
        let appointment_id: Uuid = r.try_get("appointment_id").map_err(internal_row)?;
        let client_id: Uuid = r.try_get("client_id").map_err(internal_row)?;
        let start_at: DateTime<Utc> = r.try_get("start_at").map_err(internal_row)?;
        let end_at: DateTime<Utc> = r.try_get("end_at").map_err(internal_row)?;
        let status: AppointmentStatus = r.try_get("status").map_err(internal_row)?;
        let payment_status: Option<PaymentStatus> =
            r.try_get("payment_status").map_err(internal_row)?;
        let final_price_cents: i32 = r.try_get("final_price_cents").map_err(internal_row)?;
        let notes: Option<String> = r.try_get("notes").map_err(internal_row)?;
        let payment_method: Option<PaymentMethod> =
            r.try_get("payment_method").map_err(internal_row)?;
        let payment_date: Option<DateTime<Utc>> =
            r.try_get("payment_date").map_err(internal_row)?;
        let recurrence: Recurrence = r.try_get("recurrence").map_err(internal_row)?;
        let recurrence_days: Vec<i16> = r.try_get("recurrence_days").map_err(internal_row)?;
        let recurrence_count: i32 = r.try_get("recurrence_count").map_err(internal_row)?;
        let recurrence_group_id: Option<Uuid> =
            r.try_get("recurrence_group_id").map_err(internal_row)?;
        let is_parent: bool = r.try_get("is_parent").map_err(internal_row)?;
        let parent_appointment_id: Option<Uuid> =
            r.try_get("parent_appointment_id").map_err(internal_row)?;

        let client_name: String = r.try_get("client_name").map_err(internal_row)?;
        let client_phone: Option<String> = r.try_get("client_phone").map_err(internal_row)?;

        let entry = map
            .entry((start_at, appointment_id))
            .or_insert_with(|| AppointmentBlockDto {
                appointment_id,
                start_at,
                end_at,
                status,
                payment_status,
                final_price_cents,
                notes: notes.clone(),
                payment_method,
                payment_date,
                recurrence,
                recurrence_days: recurrence_days
                    .iter()
                    .filter_map(|d| Weekday::from_index(*d))
                    .collect(),
                recurrence_count,
                recurrence_group_id,
                is_parent,
                parent_appointment_id,
                client: ClientBrief {
                    id: client_id,
                    name: client_name,
                    phone: client_phone,
                },
                services: vec![],
                service_summary: String::new(),
            });

        // collect line item if exists
        let svc_id: Option<Uuid> = r.try_get("svc_id").ok();
        if let Some(service_id) = svc_id {
            let price: i32 = r.try_get("svc_price").unwrap_or(0);
            let name: String = r.try_get("svc_name").unwrap_or_else(|_| "Service".into());
            entry.services.push(AppointmentLineDto {
                service_id,
                name,
                final_price_cents: price,
            });
        }
    }

    // build service_summary (e.g. "Cut + Color")
    for v in map.values_mut() {
        if v.services.is_empty() {
            v.service_summary = "(no services)".into();
        } else {
            let parts: Vec<String> = v.services.iter().map(|s| s.name.clone()).collect();
            v.service_summary = parts.join(" + ");
        }
    }

    Ok(map.into_values().collect())
}

fn internal_row(e: sqlx::Error) -> ApiError {
    ApiError::Internal(format!("row decode error: {e}"))
}

/* ============================================================
   Tests
   ============================================================ */

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    fn svc(id: Uuid, price_cents: i32, duration_min: Option<i32>) -> ServiceCatalogRow {
        ServiceCatalogRow {
            service_id: id,
            name: "Service".into(),
            price_cents,
            duration_min,
            is_active: true,
            created_at: dt(2024, 1, 1, 0),
            updated_at: dt(2024, 1, 1, 0),
        }
    }

    fn appt(
        id: Uuid,
        start_at: DateTime<Utc>,
        status: AppointmentStatus,
        payment_status: Option<PaymentStatus>,
        is_parent: bool,
        parent: Option<Uuid>,
    ) -> AppointmentRow {
        AppointmentRow {
            appointment_id: id,
            client_id: Uuid::new_v4(),
            start_at,
            end_at: start_at + Duration::minutes(30),
            status,
            payment_status,
            final_price_cents: 5000,
            notes: None,
            payment_method: None,
            payment_date: None,
            recurrence: Recurrence::Weekly,
            recurrence_days: vec![1],
            recurrence_count: 4,
            recurrence_group_id: Some(Uuid::new_v4()),
            is_parent,
            parent_appointment_id: parent,
            created_at: start_at,
            updated_at: start_at,
        }
    }

    #[test]
    fn schedule_sums_prices_and_durations() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let catalog = vec![svc(a, 5000, Some(45)), svc(b, 3000, None)];
        let selections = vec![
            ServiceSelection {
                service_id: a,
                final_price_cents: None,
            },
            ServiceSelection {
                service_id: b,
                final_price_cents: Some(2500),
            },
        ];

        let schedule = compute_schedule(&selections, &catalog).unwrap();
        assert_eq!(schedule.total_cents, 7500);
        // 45 explicit + 30 default
        assert_eq!(schedule.duration_min, 75);
        assert_eq!(
            schedule.total_cents,
            schedule
                .lines
                .iter()
                .map(|l| l.final_price_cents)
                .sum::<i32>()
        );
    }

    #[test]
    fn schedule_rejects_empty_and_unknown_services() {
        let a = Uuid::new_v4();
        let catalog = vec![svc(a, 5000, Some(45))];
        assert!(compute_schedule(&[], &catalog).is_err());

        let selections = vec![ServiceSelection {
            service_id: Uuid::new_v4(),
            final_price_cents: None,
        }];
        assert!(compute_schedule(&selections, &catalog).is_err());
    }

    #[test]
    fn future_delete_never_touches_settled_rows() {
        let now = dt(2024, 6, 1, 12);
        let group = vec![
            // past, unpaid: not eligible (not future)
            appt(
                Uuid::new_v4(),
                dt(2024, 5, 1, 9),
                AppointmentStatus::Scheduled,
                None,
                true,
                None,
            ),
            // future, scheduled: eligible
            appt(
                Uuid::new_v4(),
                dt(2024, 6, 8, 9),
                AppointmentStatus::Scheduled,
                None,
                false,
                None,
            ),
            // future, completed: never eligible
            appt(
                Uuid::new_v4(),
                dt(2024, 6, 15, 9),
                AppointmentStatus::Completed,
                Some(PaymentStatus::Paid),
                false,
                None,
            ),
            // future, pending payment: eligible
            appt(
                Uuid::new_v4(),
                dt(2024, 6, 22, 9),
                AppointmentStatus::PendingPayment,
                Some(PaymentStatus::Pending),
                false,
                None,
            ),
        ];

        let eligible = future_deletable(&group, now);
        assert_eq!(eligible.len(), 2);
        for a in eligible {
            assert_ne!(a.status, AppointmentStatus::Completed);
            assert_ne!(a.payment_status, Some(PaymentStatus::Paid));
            assert!(a.start_at >= now);
        }
    }

    #[test]
    fn promotion_picks_earliest_child() {
        let early = Uuid::new_v4();
        let parent = Uuid::new_v4();
        let children = vec![
            appt(
                Uuid::new_v4(),
                dt(2024, 6, 15, 9),
                AppointmentStatus::Scheduled,
                None,
                false,
                Some(parent),
            ),
            appt(
                early,
                dt(2024, 6, 8, 9),
                AppointmentStatus::Scheduled,
                None,
                false,
                Some(parent),
            ),
            appt(
                Uuid::new_v4(),
                dt(2024, 6, 22, 9),
                AppointmentStatus::Scheduled,
                None,
                false,
                Some(parent),
            ),
        ];
        assert_eq!(pick_promotion(&children).unwrap().appointment_id, early);
        assert!(pick_promotion(&[]).is_none());
    }

    #[test]
    fn series_parent_resolution_prefers_own_parent_pointer() {
        let parent = Uuid::new_v4();
        let child_id = Uuid::new_v4();
        let child = appt(
            child_id,
            dt(2024, 6, 8, 9),
            AppointmentStatus::Scheduled,
            None,
            false,
            Some(parent),
        );
        assert_eq!(series_parent_id(&child), parent);

        let root = appt(
            parent,
            dt(2024, 6, 1, 9),
            AppointmentStatus::Scheduled,
            None,
            true,
            None,
        );
        assert_eq!(series_parent_id(&root), parent);

        // standalone row resolves to itself
        let lone = appt(
            child_id,
            dt(2024, 6, 8, 9),
            AppointmentStatus::Scheduled,
            None,
            false,
            None,
        );
        assert_eq!(series_parent_id(&lone), child_id);
    }
}
