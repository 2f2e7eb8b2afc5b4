use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Multipart, Query, State};
use axum::Json;
use chrono::NaiveDate;
use roster_core::{mark_many, ManualMarkReport, UserId};
use roster_store::AttendanceRecord;
use serde::{Deserialize, Serialize};

use super::{Upload, DATE_FORMAT, TIME_FORMAT};
use crate::error::AppError;
use crate::extractors::{extract_json, extract_multipart, extract_query};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct Marked {
    pub user_id: UserId,
    pub name: String,
    pub date: String,
    pub time: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct RecordView {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub last_attendance_date: String,
    pub last_attendance_time: String,
}

impl From<AttendanceRecord> for RecordView {
    fn from(r: AttendanceRecord) -> Self {
        Self {
            id: r.id,
            name: r.name,
            email: r.email,
            last_attendance_date: r.last_attendance.format(DATE_FORMAT).to_string(),
            last_attendance_time: r.last_attendance.format(TIME_FORMAT).to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct ManualRequest {
    pub user_ids: Vec<UserId>,
}

/// POST /mark-attendance: multipart {image}.
pub async fn mark(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Marked>, AppError> {
    let mut upload = Upload::read(extract_multipart(multipart)?).await?;
    let image = upload.take_image()?;

    let embedding = state.engine.encode(image).await?;

    let rule = state.rule.clone();
    let now = state.clock.now();
    let attendance = state
        .with_store(move |s| Ok(rule.check_in(s, &embedding, now)?))
        .await?;

    Ok(Json(Marked {
        user_id: attendance.user_id,
        message: format!("Attendance marked for {}", attendance.name),
        name: attendance.name,
        date: attendance.at.format(DATE_FORMAT).to_string(),
        time: attendance.at.format(TIME_FORMAT).to_string(),
    }))
}

/// GET /attendance-records?date=YYYY-MM-DD
pub async fn records(
    State(state): State<AppState>,
    query: Result<Query<RecordsQuery>, QueryRejection>,
) -> Result<Json<Vec<RecordView>>, AppError> {
    let query = extract_query(query)?;
    let rows = state
        .with_store(move |s| Ok(s.attendance_records(query.date)?))
        .await?;
    Ok(Json(rows.into_iter().map(RecordView::from).collect()))
}

/// POST /attendance-records/manual: JSON {user_ids}.
pub async fn manual(
    State(state): State<AppState>,
    request: Result<Json<ManualRequest>, JsonRejection>,
) -> Result<Json<ManualMarkReport>, AppError> {
    let request = extract_json(request)?;
    if request.user_ids.is_empty() {
        return Err(AppError::Validation("user_ids must not be empty".into()));
    }
    let now = state.clock.now();
    let report = state
        .with_store(move |s| Ok(mark_many(s, &request.user_ids, now)?))
        .await?;
    Ok(Json(report))
}
