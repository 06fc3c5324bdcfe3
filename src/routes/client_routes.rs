// src/routes/client_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::AppState,
};

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ClientRow {
    pub client_id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub notes: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Quick-add only needs a name; the full form also carries phone/notes.
#[derive(Debug, Deserialize)]
pub struct CreateClientRequest {
    pub name: String,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/clients", get(search_clients).post(create_client))
        .route("/clients/{client_id}", get(get_client).patch(update_client))
}

use serde::de::Deserializer;

fn deserialize_double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    // Called only when the field is present (even if it's `null`):
    // null => Some(None) (explicit clear), value => Some(Some(value)).
    let inner = Option::<T>::deserialize(deserializer)?;
    Ok(Some(inner))
}

pub async fn create_client(
    State(state): State<AppState>,
    _auth: AuthContext,
    Json(req): Json<CreateClientRequest>,
) -> Result<Json<ClientRow>, ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "name is required".to_string(),
        ));
    }

    let phone = req.phone.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let notes = req.notes.as_deref().map(str::trim).filter(|s| !s.is_empty());

    let row: ClientRow = sqlx::query_as::<_, ClientRow>(
        r#"
        INSERT INTO client (name, phone, notes, created_at, updated_at)
        VALUES ($1, $2, $3, now(), now())
        RETURNING client_id, name, phone, notes, created_at, updated_at
        "#,
    )
    .bind(name)
    .bind(phone)
    .bind(notes)
    .fetch_one(&state.db)
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    Ok(Json(row))
}

pub async fn get_client(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(client_id): Path<Uuid>,
) -> Result<Json<ClientRow>, ApiError> {
    let row: ClientRow = sqlx::query_as::<_, ClientRow>(
        r#"
        SELECT client_id, name, phone, notes, created_at, updated_at
        FROM client
        WHERE client_id = $1
        "#,
    )
    .bind(client_id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
    .ok_or_else(|| ApiError::NotFound("NOT_FOUND", "client not found".to_string()))?;

    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub query: Option<String>,
}

pub async fn search_clients(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<SearchQuery>,
) -> Result<Json<Vec<ClientRow>>, ApiError> {
    let query = q.query.unwrap_or_default().trim().to_string();
    if query.is_empty() {
        // default: most recent
        let rows: Vec<ClientRow> = sqlx::query_as::<_, ClientRow>(
            r#"
            SELECT client_id, name, phone, notes, created_at, updated_at
            FROM client
            ORDER BY created_at DESC
            LIMIT 50
            "#,
        )
        .fetch_all(&state.db)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
        return Ok(Json(rows));
    }

    let like = format!("%{}%", query);

    let rows: Vec<ClientRow> = sqlx::query_as::<_, ClientRow>(
        r#"
        SELECT client_id, name, phone, notes, created_at, updated_at
        FROM client
        WHERE name ILIKE $1
           OR phone ILIKE $1
        ORDER BY created_at DESC
        LIMIT 50
        "#,
    )
    .bind(like)
    .fetch_all(&state.db)
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct UpdateClientRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub notes: Option<Option<String>>,
}

pub async fn update_client(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(client_id): Path<Uuid>,
    Json(req): Json<UpdateClientRequest>,
) -> Result<Json<ClientRow>, ApiError> {
    // Load existing
    let existing: ClientRow = sqlx::query_as::<_, ClientRow>(
        r#"
        SELECT client_id, name, phone, notes, created_at, updated_at
        FROM client
        WHERE client_id = $1
        "#,
    )
    .bind(client_id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
    .ok_or_else(|| ApiError::NotFound("NOT_FOUND", "client not found".to_string()))?;

    let name = match req.name.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => existing.name.clone(),
    };

    // Explicit null clears the field; absent field keeps the old value.
    let phone: Option<String> = match req.phone {
        None => existing.phone.clone(),
        Some(None) => None,
        Some(Some(p)) => {
            let t = p.trim();
            if t.is_empty() { None } else { Some(t.to_string()) }
        }
    };

    let notes: Option<String> = match req.notes {
        None => existing.notes.clone(),
        Some(None) => None,
        Some(Some(n)) => {
            let t = n.trim();
            if t.is_empty() { None } else { Some(t.to_string()) }
        }
    };

    let updated: ClientRow = sqlx::query_as::<_, ClientRow>(
        r#"
        UPDATE client
        SET name = $1,
            phone = $2,
            notes = $3,
            updated_at = now()
        WHERE client_id = $4
        RETURNING client_id, name, phone, notes, created_at, updated_at
        "#,
    )
    .bind(name)
    .bind(phone)
    .bind(notes)
    .bind(client_id)
    .fetch_one(&state.db)
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    Ok(Json(updated))
}
