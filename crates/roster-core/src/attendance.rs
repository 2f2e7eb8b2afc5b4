//! Daily attendance rule.
//!
//! A user is either `NoAttendanceToday` or `AttendanceMarkedToday` relative
//! to "now". A successful match moves the first state to the second and
//! persists the full timestamp; everything else is rejected without mutation.
//! The state resets implicitly when the calendar date changes.
//!
//! The check and the write are one conditional update in the [`Registry`],
//! so concurrent matches for the same user record exactly one timestamp.

use crate::encoder::EncodeError;
use crate::matcher::{EuclideanMatcher, MatchResult, Matcher, DEFAULT_TOLERANCE};
use crate::types::{Embedding, Enrollment, UserId};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;

/// Source of "now" for the attendance rule. Naive local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("user {0} not found")]
    UserNotFound(UserId),
    /// A write conflict or lock timeout that may succeed on retry.
    #[error("registry busy: {0}")]
    Busy(String),
    #[error("registry failure: {0}")]
    Storage(String),
}

/// Result of the registry's date-guarded compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareAndSet {
    /// `last_attendance` was null or on an earlier date and now holds the new timestamp.
    Applied,
    /// The guard failed; `current` is the timestamp already stored.
    Unchanged { current: NaiveDateTime },
}

/// What the attendance rule needs from the user registry.
pub trait Registry {
    /// All reference embeddings in scan order (ascending user id).
    fn enrollments(&self) -> Result<Vec<Enrollment>, RegistryError>;

    /// Atomically set `last_attendance = now` for `user` if it is null or its
    /// date is strictly before `now.date()`.
    fn mark_if_new_day(&self, user: UserId, now: NaiveDateTime) -> Result<CompareAndSet, RegistryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceState {
    NoAttendanceToday,
    AttendanceMarkedToday,
}

impl AttendanceState {
    /// A stored date later than `today` (clock moved backwards) counts as
    /// marked so the date never decreases.
    pub fn evaluate(last_attendance: Option<NaiveDateTime>, today: NaiveDate) -> Self {
        match last_attendance {
            Some(at) if at.date() >= today => Self::AttendanceMarkedToday,
            _ => Self::NoAttendanceToday,
        }
    }
}

/// A recorded attendance event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attendance {
    pub user_id: UserId,
    pub name: String,
    pub at: NaiveDateTime,
    /// Query-to-reference distance of the match, when matched from an image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("face encoding failed: {0}")]
    Encoding(String),
    #[error("no matching face found")]
    NoMatch { closest: Option<f32> },
    #[error("attendance already marked today for {name}")]
    AlreadyMarkedToday {
        user_id: UserId,
        name: String,
        at: NaiveDateTime,
    },
    #[error("user {0} not found")]
    UserNotFound(UserId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<EncodeError> for AttendanceError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::NoFaceDetected => Self::NoFaceDetected,
            EncodeError::Decode(msg) => Self::Decode(msg),
            other => Self::Encoding(other.to_string()),
        }
    }
}

impl From<RegistryError> for AttendanceError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UserNotFound(id) => Self::UserNotFound(id),
            RegistryError::Busy(msg) | RegistryError::Storage(msg) => Self::Storage(msg),
        }
    }
}

/// Per-id outcome of marking a batch of users by hand.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManualMarkReport {
    pub marked: Vec<UserId>,
    pub already_marked: Vec<UserId>,
    pub not_found: Vec<UserId>,
}

/// Matcher + tolerance + the once-per-day rule.
#[derive(Debug, Clone)]
pub struct AttendanceRule<M = EuclideanMatcher> {
    matcher: M,
    tolerance: f32,
}

impl Default for AttendanceRule {
    fn default() -> Self {
        Self::new(EuclideanMatcher::default(), DEFAULT_TOLERANCE)
    }
}

impl<M: Matcher> AttendanceRule<M> {
    pub fn new(matcher: M, tolerance: f32) -> Self {
        Self { matcher, tolerance }
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    /// Scan the registry for the query embedding. Read-only.
    pub fn identify<R: Registry + ?Sized>(
        &self,
        registry: &R,
        query: &Embedding,
    ) -> Result<MatchResult, AttendanceError> {
        let gallery = registry.enrollments()?;
        let result = self.matcher.find(query, &gallery, self.tolerance);
        tracing::debug!(gallery = gallery.len(), matched = result.is_match(), "gallery scanned");
        Ok(result)
    }

    /// Match a query embedding and apply the daily rule to the matched user.
    pub fn check_in<R: Registry + ?Sized>(
        &self,
        registry: &R,
        query: &Embedding,
        now: NaiveDateTime,
    ) -> Result<Attendance, AttendanceError> {
        match self.identify(registry, query)? {
            MatchResult::Matched { user_id, name, distance } => {
                let mut attendance = mark_user(registry, user_id, &name, now)?;
                attendance.distance = Some(distance);
                Ok(attendance)
            }
            MatchResult::NoMatch { closest } => {
                tracing::info!(?closest, tolerance = self.tolerance, "no registered face within tolerance");
                Err(AttendanceError::NoMatch { closest })
            }
        }
    }
}

/// Apply the daily rule to one known user.
///
/// A busy registry is retried once; a second failure surfaces as `Storage`.
pub fn mark_user<R: Registry + ?Sized>(
    registry: &R,
    user_id: UserId,
    name: &str,
    now: NaiveDateTime,
) -> Result<Attendance, AttendanceError> {
    let outcome = match registry.mark_if_new_day(user_id, now) {
        Err(RegistryError::Busy(reason)) => {
            tracing::warn!(user_id, %reason, "attendance write conflict, retrying once");
            registry.mark_if_new_day(user_id, now)?
        }
        other => other?,
    };

    match outcome {
        CompareAndSet::Applied => {
            tracing::info!(user_id, name, at = %now, "attendance marked");
            Ok(Attendance {
                user_id,
                name: name.to_string(),
                at: now,
                distance: None,
            })
        }
        CompareAndSet::Unchanged { current } => {
            tracing::info!(user_id, name, at = %current, "attendance already marked today");
            Err(AttendanceError::AlreadyMarkedToday {
                user_id,
                name: name.to_string(),
                at: current,
            })
        }
    }
}

/// Mark a batch of users without an image (operator override).
pub fn mark_many<R: Registry + ?Sized>(
    registry: &R,
    user_ids: &[UserId],
    now: NaiveDateTime,
) -> Result<ManualMarkReport, AttendanceError> {
    let mut report = ManualMarkReport::default();
    for &id in user_ids {
        match mark_user(registry, id, "", now) {
            Ok(_) => report.marked.push(id),
            Err(AttendanceError::AlreadyMarkedToday { .. }) => report.already_marked.push(id),
            Err(AttendanceError::UserNotFound(_)) => report.not_found.push(id),
            Err(e) => return Err(e),
        }
    }
    tracing::info!(
        marked = report.marked.len(),
        already = report.already_marked.len(),
        missing = report.not_found.len(),
        "manual attendance batch applied"
    );
    Ok(report)
}
