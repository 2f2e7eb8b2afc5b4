use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::NaiveDate;
use roster_core::UserId;
use roster_store::{NewUser, RegisteredUser, UserUpdate};
use serde::Serialize;

use super::{Upload, DATE_FORMAT};
use crate::error::AppError;
use crate::extractors::{extract_json, extract_multipart, extract_path};
use crate::state::AppState;

/// Public projection of a registered user.
#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub gender: String,
    pub dob: String,
    /// Date part of the last attendance, `YYYY-MM-DD`.
    pub last_attendance: Option<String>,
}

impl From<RegisteredUser> for UserView {
    fn from(u: RegisteredUser) -> Self {
        Self {
            id: u.id,
            name: u.name,
            email: u.email,
            gender: u.gender,
            dob: u.dob.format(DATE_FORMAT).to_string(),
            last_attendance: u.last_attendance.map(|at| at.format(DATE_FORMAT).to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Registered {
    pub id: UserId,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Updated {
    pub message: &'static str,
    pub user: UserView,
}

/// POST /register: multipart {name, email, gender, dob, image}.
pub async fn register(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<impl IntoResponse, AppError> {
    let mut upload = Upload::read(extract_multipart(multipart)?).await?;
    let name = upload.required("name")?;
    let email = upload.required("email")?;
    let gender = upload.required("gender")?;
    let dob = parse_date(&upload.required("dob")?)?;
    let image = upload.take_image()?;

    if !email.contains('@') {
        return Err(AppError::Validation(format!("invalid email: {email}")));
    }

    let candidate_email = email.clone();
    let taken = state.with_store(move |s| Ok(s.email_exists(&candidate_email)?)).await?;
    if taken {
        return Err(AppError::AlreadyRegistered(email));
    }

    let embedding = state.engine.encode(image).await?;

    let user = NewUser { name, email, gender, dob, embedding };
    let now = state.clock.now();
    let id = state.with_store(move |s| Ok(s.create_user(&user, now)?)).await?;

    Ok((
        StatusCode::CREATED,
        Json(Registered { id, message: "Registration successful" }),
    ))
}

/// GET /users
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<UserView>>, AppError> {
    let users = state.with_store(|s| Ok(s.list_users()?)).await?;
    Ok(Json(users.into_iter().map(UserView::from).collect()))
}

/// GET /users/{id}
pub async fn get(
    State(state): State<AppState>,
    id: Result<Path<UserId>, PathRejection>,
) -> Result<Json<UserView>, AppError> {
    let id = extract_path(id)?;
    let user = state.with_store(move |s| Ok(s.get_user(id)?)).await?;
    Ok(Json(user.into()))
}

/// PUT /users/{id}: partial JSON update of name, email, gender, dob.
pub async fn update(
    State(state): State<AppState>,
    id: Result<Path<UserId>, PathRejection>,
    update: Result<Json<UserUpdate>, JsonRejection>,
) -> Result<Json<Updated>, AppError> {
    let id = extract_path(id)?;
    let update = extract_json(update)?;
    validate_update(&update)?;
    let user = state.with_store(move |s| Ok(s.update_user(id, &update)?)).await?;
    Ok(Json(Updated {
        message: "User updated successfully",
        user: user.into(),
    }))
}

/// DELETE /users/{id}
pub async fn remove(
    State(state): State<AppState>,
    id: Result<Path<UserId>, PathRejection>,
) -> Result<StatusCode, AppError> {
    let id = extract_path(id)?;
    state.with_store(move |s| Ok(s.delete_user(id)?)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Reject empty updates and blank or malformed fields.
fn validate_update(update: &UserUpdate) -> Result<(), AppError> {
    if update.is_empty() {
        return Err(AppError::Validation("no fields to update".into()));
    }
    for (field, value) in [("name", &update.name), ("email", &update.email), ("gender", &update.gender)] {
        if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
            return Err(AppError::Validation(format!("{field} must not be blank")));
        }
    }
    if let Some(email) = &update.email {
        if !email.contains('@') {
            return Err(AppError::Validation(format!("invalid email: {email}")));
        }
    }
    Ok(())
}

fn parse_date(raw: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|_| AppError::Validation(format!("invalid date {raw:?}, expected YYYY-MM-DD")))
}
