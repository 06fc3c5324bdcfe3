// src/routes/service_routes.rs

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{AppState, ServiceCatalogRow},
};

fn is_admin(auth: &AuthContext) -> bool {
    auth.role == 1
}
fn is_manager(auth: &AuthContext) -> bool {
    auth.role == 2
}

fn ensure_manage_catalog(auth: &AuthContext) -> Result<(), ApiError> {
    if is_admin(auth) || is_manager(auth) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only admin/manager can manage the service catalog".into(),
        ))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_services).post(create_service))
        .route("/{service_id}", axum::routing::patch(update_service))
}

pub async fn list_services(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<Vec<ServiceCatalogRow>>, ApiError> {
    let rows: Vec<ServiceCatalogRow> = sqlx::query_as::<_, ServiceCatalogRow>(
        r#"
        SELECT
          service_id,
          name,
          price_cents,
          duration_min,
          is_active,
          created_at,
          updated_at
        FROM service_catalog
        WHERE is_active = true
        ORDER BY name ASC
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub name: String,
    pub price_cents: i32,
    pub duration_min: Option<i32>,
}

pub async fn create_service(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateServiceRequest>,
) -> Result<Json<ServiceCatalogRow>, ApiError> {
    ensure_manage_catalog(&auth)?;

    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("VALIDATION_ERROR", "name is required".into()));
    }
    if req.price_cents < 0 {
        return Err(ApiError::BadRequest("VALIDATION_ERROR", "price_cents must be >= 0".into()));
    }
    if let Some(d) = req.duration_min {
        if d <= 0 {
            return Err(ApiError::BadRequest("VALIDATION_ERROR", "duration_min must be > 0".into()));
        }
    }

    let row: ServiceCatalogRow = sqlx::query_as::<_, ServiceCatalogRow>(
        r#"
        INSERT INTO service_catalog (name, price_cents, duration_min, is_active, created_at, updated_at)
        VALUES ($1, $2, $3, true, now(), now())
        RETURNING service_id, name, price_cents, duration_min, is_active, created_at, updated_at
        "#,
    )
    .bind(name)
    .bind(req.price_cents)
    .bind(req.duration_min)
    .fetch_one(&state.db)
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct UpdateServiceRequest {
    pub name: Option<String>,
    pub price_cents: Option<i32>,
    pub duration_min: Option<i32>,
    pub is_active: Option<bool>,
}

pub async fn update_service(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(service_id): Path<Uuid>,
    Json(req): Json<UpdateServiceRequest>,
) -> Result<Json<ServiceCatalogRow>, ApiError> {
    ensure_manage_catalog(&auth)?;

    let existing: ServiceCatalogRow = sqlx::query_as::<_, ServiceCatalogRow>(
        r#"
        SELECT service_id, name, price_cents, duration_min, is_active, created_at, updated_at
        FROM service_catalog
        WHERE service_id = $1
        "#,
    )
    .bind(service_id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
    .ok_or_else(|| ApiError::NotFound("NOT_FOUND", "service not found".into()))?;

    let name = match req.name.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => existing.name.clone(),
    };
    let price_cents = req.price_cents.unwrap_or(existing.price_cents);
    let duration_min = req.duration_min.or(existing.duration_min);
    let is_active = req.is_active.unwrap_or(existing.is_active);

    if price_cents < 0 {
        return Err(ApiError::BadRequest("VALIDATION_ERROR", "price_cents must be >= 0".into()));
    }
    if let Some(d) = duration_min {
        if d <= 0 {
            return Err(ApiError::BadRequest("VALIDATION_ERROR", "duration_min must be > 0".into()));
        }
    }

    let updated: ServiceCatalogRow = sqlx::query_as::<_, ServiceCatalogRow>(
        r#"
        UPDATE service_catalog
        SET name = $1,
            price_cents = $2,
            duration_min = $3,
            is_active = $4,
            updated_at = now()
        WHERE service_id = $5
        RETURNING service_id, name, price_cents, duration_min, is_active, created_at, updated_at
        "#,
    )
    .bind(name)
    .bind(price_cents)
    .bind(duration_min)
    .bind(is_active)
    .bind(service_id)
    .fetch_one(&state.db)
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    Ok(Json(updated))
}
