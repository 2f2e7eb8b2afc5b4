use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use roster_core::{CompareAndSet, Embedding, Enrollment, Registry, RegistryError, UserId};

use crate::cipher::EmbeddingCipher;
use crate::error::{Result, StoreError};
use crate::schema;

/// Profile fields plus the reference embedding captured at registration.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub gender: String,
    pub dob: NaiveDate,
    pub embedding: Embedding,
}

/// A registry row without its embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredUser {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub gender: String,
    pub dob: NaiveDate,
    pub last_attendance: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

/// Partial profile edit. Absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub gender: Option<String>,
    pub dob: Option<NaiveDate>,
}

impl UserUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.gender.is_none() && self.dob.is_none()
    }
}

/// A user that has attended at least once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub last_attendance: NaiveDateTime,
}

const USER_COLUMNS: &str = "id, name, email, gender, dob, last_attendance, created_at";

pub struct Store {
    conn: Connection,
    cipher: Option<EmbeddingCipher>,
}

impl Store {
    pub fn open(path: &Path, cipher: Option<EmbeddingCipher>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::InvalidData(format!("cannot create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, cipher)
    }

    pub fn open_in_memory(cipher: Option<EmbeddingCipher>) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, cipher)
    }

    fn with_connection(conn: Connection, cipher: Option<EmbeddingCipher>) -> Result<Self> {
        schema::initialize(&conn)?;
        schema::check_cipher(&conn, cipher.as_ref())?;
        Ok(Self { conn, cipher })
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    // --- Registration / CRUD ---

    pub fn email_exists(&self, email: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM users WHERE email = ?1", [email.trim()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert a user. The UNIQUE email constraint is the arbiter, so two
    /// concurrent registrations of one address cannot both succeed.
    pub fn create_user(&self, user: &NewUser, created_at: NaiveDateTime) -> Result<UserId> {
        let email = user.email.trim();
        let blob = self.encode_embedding(&user.embedding)?;

        let inserted = self.conn.execute(
            "INSERT INTO users (name, email, gender, dob, face_encoding, model_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user.name,
                email,
                user.gender,
                user.dob,
                blob,
                user.embedding.model_version,
                created_at,
            ],
        );
        map_unique_violation(inserted, email)?;

        let id = self.conn.last_insert_rowid();
        tracing::info!(id, email, dim = user.embedding.dim(), "user registered");
        Ok(id)
    }

    pub fn list_users(&self) -> Result<Vec<RegisteredUser>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))?;
        let users = stmt
            .query_map([], row_to_user)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub fn get_user(&self, id: UserId) -> Result<RegisteredUser> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                [id],
                row_to_user,
            )
            .optional()?
            .ok_or(StoreError::UserNotFound(id))
    }

    pub fn update_user(&self, id: UserId, update: &UserUpdate) -> Result<RegisteredUser> {
        let tx = self.conn.unchecked_transaction()?;

        let exists: Option<i64> = tx
            .query_row("SELECT id FROM users WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::UserNotFound(id));
        }

        if let Some(name) = &update.name {
            tx.execute("UPDATE users SET name = ?1 WHERE id = ?2", params![name, id])?;
        }
        if let Some(email) = &update.email {
            let email = email.trim();
            let res = tx.execute("UPDATE users SET email = ?1 WHERE id = ?2", params![email, id]);
            map_unique_violation(res, email)?;
        }
        if let Some(gender) = &update.gender {
            tx.execute("UPDATE users SET gender = ?1 WHERE id = ?2", params![gender, id])?;
        }
        if let Some(dob) = &update.dob {
            tx.execute("UPDATE users SET dob = ?1 WHERE id = ?2", params![dob, id])?;
        }

        tx.commit()?;
        tracing::info!(id, "user updated");
        self.get_user(id)
    }

    pub fn delete_user(&self, id: UserId) -> Result<()> {
        let removed = self.conn.execute("DELETE FROM users WHERE id = ?1", [id])?;
        if removed == 0 {
            return Err(StoreError::UserNotFound(id));
        }
        tracing::info!(id, "user deleted");
        Ok(())
    }

    pub fn count_users(&self) -> Result<i64> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
    }

    /// Users with a recorded attendance, optionally only those whose last
    /// attendance fell on `on`.
    pub fn attendance_records(&self, on: Option<NaiveDate>) -> Result<Vec<AttendanceRecord>> {
        let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<AttendanceRecord> {
            Ok(AttendanceRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                last_attendance: row.get(3)?,
            })
        };

        let records = match on {
            Some(date) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, name, email, last_attendance FROM users
                     WHERE last_attendance IS NOT NULL AND substr(last_attendance, 1, 10) = ?1
                     ORDER BY id",
                )?;
                let rows = stmt.query_map([date], map)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, name, email, last_attendance FROM users
                     WHERE last_attendance IS NOT NULL ORDER BY id",
                )?;
                let rows = stmt.query_map([], map)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(records)
    }

    // --- Matching / attendance ---

    pub fn load_enrollments(&self) -> Result<Vec<Enrollment>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, face_encoding, model_version FROM users ORDER BY id")?;
        let rows: Vec<(UserId, String, Vec<u8>, Option<String>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(|(user_id, name, blob, model_version)| {
                let mut embedding = self.decode_embedding(&blob)?;
                embedding.model_version = model_version;
                Ok(Enrollment { user_id, name, embedding })
            })
            .collect()
    }

    /// Date-guarded compare-and-set of `last_attendance`.
    ///
    /// The guard compares the stored `YYYY-MM-DD` prefix with today's date,
    /// so the write happens in the same statement as the check.
    pub fn mark_attendance_if_new_day(&self, id: UserId, now: NaiveDateTime) -> Result<CompareAndSet> {
        let changed = self.conn.execute(
            "UPDATE users SET last_attendance = ?1
             WHERE id = ?2
               AND (last_attendance IS NULL OR substr(last_attendance, 1, 10) < ?3)",
            params![now, id, now.date()],
        )?;
        if changed == 1 {
            return Ok(CompareAndSet::Applied);
        }

        let current: Option<Option<NaiveDateTime>> = self
            .conn
            .query_row("SELECT last_attendance FROM users WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        match current {
            None => Err(StoreError::UserNotFound(id)),
            Some(Some(current)) => Ok(CompareAndSet::Unchanged { current }),
            Some(None) => Err(StoreError::InvalidData(format!(
                "attendance guard rejected user {id} without a stored timestamp"
            ))),
        }
    }

    // --- Embedding encoding ---

    fn encode_embedding(&self, embedding: &Embedding) -> Result<Vec<u8>> {
        let raw: Vec<u8> = embedding.values.iter().flat_map(|v| v.to_le_bytes()).collect();
        match &self.cipher {
            Some(c) => c.seal(&raw),
            None => Ok(raw),
        }
    }

    fn decode_embedding(&self, blob: &[u8]) -> Result<Embedding> {
        let raw = match &self.cipher {
            Some(c) => c.open(blob)?,
            None => blob.to_vec(),
        };
        if raw.len() % 4 != 0 {
            return Err(StoreError::InvalidData(format!(
                "embedding blob length {} is not a multiple of 4",
                raw.len()
            )));
        }
        let values = raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(Embedding::new(values))
    }
}

impl Registry for Store {
    fn enrollments(&self) -> std::result::Result<Vec<Enrollment>, RegistryError> {
        Ok(self.load_enrollments()?)
    }

    fn mark_if_new_day(&self, user: UserId, now: NaiveDateTime) -> std::result::Result<CompareAndSet, RegistryError> {
        Ok(self.mark_attendance_if_new_day(user, now)?)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegisteredUser> {
    Ok(RegisteredUser {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        gender: row.get(3)?,
        dob: row.get(4)?,
        last_attendance: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn map_unique_violation(res: rusqlite::Result<usize>, email: &str) -> Result<usize> {
    match res {
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Err(StoreError::DuplicateEmail(email.to_string()))
        }
        other => Ok(other?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use roster_core::{AttendanceError, AttendanceRule};

    fn ts(d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap().and_hms_milli_opt(h, 15, 30, 250).unwrap()
    }

    fn new_user(name: &str, email: &str, values: Vec<f32>) -> NewUser {
        NewUser {
            name: name.into(),
            email: email.into(),
            gender: "female".into(),
            dob: NaiveDate::from_ymd_opt(1990, 1, 31).unwrap(),
            embedding: Embedding { values, model_version: Some("w600k_r50".into()) },
        }
    }

    fn store_with_alice() -> (Store, UserId) {
        let store = Store::open_in_memory(None).unwrap();
        let id = store.create_user(&new_user("Alice", "alice@example.com", vec![0.25, -0.5, 1.0]), ts(1, 8)).unwrap();
        (store, id)
    }

    #[test]
    fn test_create_and_get() {
        let (store, id) = store_with_alice();
        let user = store.get_user(id).unwrap();
        assert_eq!(user.name, "Alice");
        assert_eq!(user.dob, NaiveDate::from_ymd_opt(1990, 1, 31).unwrap());
        assert_eq!(user.last_attendance, None);
        assert_eq!(user.created_at, ts(1, 8));
    }

    #[test]
    fn test_duplicate_email_rejected_without_touching_existing() {
        let (store, id) = store_with_alice();
        let err = store
            .create_user(&new_user("Impostor", "ALICE@example.com", vec![9.0, 9.0, 9.0]), ts(2, 8))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail(_)));
        assert_eq!(store.count_users().unwrap(), 1);
        assert_eq!(store.get_user(id).unwrap().name, "Alice");
        assert_eq!(store.load_enrollments().unwrap()[0].embedding.values, vec![0.25, -0.5, 1.0]);
        assert!(store.email_exists("alice@example.com").unwrap());
    }

    #[test]
    fn test_ids_ascend_in_scan_order() {
        let (store, first) = store_with_alice();
        let second = store.create_user(&new_user("Bob", "bob@example.com", vec![0.0, 0.0, 0.0]), ts(1, 9)).unwrap();
        assert!(second > first);
        let ids: Vec<_> = store.load_enrollments().unwrap().iter().map(|e| e.user_id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn test_embedding_roundtrip_preserves_values_and_version() {
        let (store, _) = store_with_alice();
        let e = &store.load_enrollments().unwrap()[0];
        assert_eq!(e.embedding.values, vec![0.25, -0.5, 1.0]);
        assert_eq!(e.embedding.model_version.as_deref(), Some("w600k_r50"));
    }

    #[test]
    fn test_mark_attendance_compare_and_set() {
        let (store, id) = store_with_alice();
        assert_eq!(store.mark_attendance_if_new_day(id, ts(3, 9)).unwrap(), CompareAndSet::Applied);
        assert_eq!(
            store.mark_attendance_if_new_day(id, ts(3, 17)).unwrap(),
            CompareAndSet::Unchanged { current: ts(3, 9) }
        );
        assert_eq!(store.get_user(id).unwrap().last_attendance, Some(ts(3, 9)));

        assert_eq!(store.mark_attendance_if_new_day(id, ts(4, 9)).unwrap(), CompareAndSet::Applied);
        assert_eq!(store.get_user(id).unwrap().last_attendance, Some(ts(4, 9)));
    }

    #[test]
    fn test_concurrent_marks_apply_exactly_once() {
        const WRITERS: usize = 8;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.db");
        let id = Store::open(&path, None)
            .unwrap()
            .create_user(&new_user("Alice", "alice@example.com", vec![1.0, 0.0]), ts(1, 8))
            .unwrap();

        // One connection per writer, as separate processes would have.
        let stores: Vec<Store> = (0..WRITERS).map(|_| Store::open(&path, None).unwrap()).collect();
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(WRITERS));
        let handles: Vec<_> = stores
            .into_iter()
            .enumerate()
            .map(|(i, store)| {
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store.mark_attendance_if_new_day(id, ts(3, 9) + Duration::seconds(i as i64)).unwrap()
                })
            })
            .collect();
        let outcomes: Vec<CompareAndSet> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let applied = outcomes.iter().filter(|o| **o == CompareAndSet::Applied).count();
        assert_eq!(applied, 1, "outcomes: {outcomes:?}");
        let stored = Store::open(&path, None).unwrap().get_user(id).unwrap().last_attendance.unwrap();
        for outcome in &outcomes {
            if let CompareAndSet::Unchanged { current } = outcome {
                assert_eq!(*current, stored);
            }
        }
    }

    #[test]
    fn test_mark_attendance_never_moves_date_backwards() {
        let (store, id) = store_with_alice();
        store.mark_attendance_if_new_day(id, ts(5, 9)).unwrap();
        assert!(matches!(
            store.mark_attendance_if_new_day(id, ts(4, 9)).unwrap(),
            CompareAndSet::Unchanged { .. }
        ));
    }

    #[test]
    fn test_mark_attendance_unknown_user() {
        let store = Store::open_in_memory(None).unwrap();
        assert!(matches!(store.mark_attendance_if_new_day(42, ts(3, 9)), Err(StoreError::UserNotFound(42))));
    }

    #[test]
    fn test_alice_scenario_against_sqlite() {
        let (store, id) = store_with_alice();
        let rule = AttendanceRule::default();
        let query = Embedding::new(vec![0.25, -0.5, 1.0]);

        let first = rule.check_in(&store, &query, ts(3, 9)).unwrap();
        assert_eq!(first.user_id, id);

        let again = rule.check_in(&store, &query, ts(3, 10)).unwrap_err();
        assert!(matches!(again, AttendanceError::AlreadyMarkedToday { .. }));

        let next = ts(3, 9) + Duration::hours(25);
        assert_eq!(rule.check_in(&store, &query, next).unwrap().at, next);
        assert_eq!(store.get_user(id).unwrap().last_attendance, Some(next));
    }

    #[test]
    fn test_update_user_partial() {
        let (store, id) = store_with_alice();
        let updated = store
            .update_user(id, &UserUpdate { name: Some("Alice B".into()), ..Default::default() })
            .unwrap();
        assert_eq!(updated.name, "Alice B");
        assert_eq!(updated.email, "alice@example.com");
        assert_eq!(updated.gender, "female");
    }

    #[test]
    fn test_update_user_email_conflict() {
        let (store, id) = store_with_alice();
        store.create_user(&new_user("Bob", "bob@example.com", vec![0.0; 3]), ts(1, 9)).unwrap();
        let err = store
            .update_user(id, &UserUpdate { email: Some("bob@example.com".into()), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail(_)));
        assert_eq!(store.get_user(id).unwrap().email, "alice@example.com");
    }

    #[test]
    fn test_update_and_delete_missing_user() {
        let store = Store::open_in_memory(None).unwrap();
        assert!(matches!(store.update_user(7, &UserUpdate::default()), Err(StoreError::UserNotFound(7))));
        assert!(matches!(store.delete_user(7), Err(StoreError::UserNotFound(7))));
    }

    #[test]
    fn test_delete_user() {
        let (store, id) = store_with_alice();
        store.delete_user(id).unwrap();
        assert_eq!(store.count_users().unwrap(), 0);
        assert!(store.load_enrollments().unwrap().is_empty());
    }

    #[test]
    fn test_attendance_records_filter() {
        let (store, alice) = store_with_alice();
        let bob = store.create_user(&new_user("Bob", "bob@example.com", vec![0.0; 3]), ts(1, 9)).unwrap();
        store.create_user(&new_user("Cara", "cara@example.com", vec![1.0; 3]), ts(1, 9)).unwrap();
        store.mark_attendance_if_new_day(alice, ts(3, 9)).unwrap();
        store.mark_attendance_if_new_day(bob, ts(4, 9)).unwrap();

        let all = store.attendance_records(None).unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![alice, bob]);

        let on_fourth = store.attendance_records(Some(ts(4, 0).date())).unwrap();
        assert_eq!(on_fourth.len(), 1);
        assert_eq!(on_fourth[0].name, "Bob");
        assert_eq!(on_fourth[0].last_attendance, ts(4, 9));
    }

    #[test]
    fn test_encrypted_store_roundtrip_and_key_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.db");

        {
            let key = EmbeddingCipher::from_passphrase("kiosk-secret").unwrap();
            let store = Store::open(&path, Some(key)).unwrap();
            assert!(store.is_encrypted());
            store.create_user(&new_user("Alice", "alice@example.com", vec![0.5, 0.5]), ts(1, 8)).unwrap();
        }

        let key = EmbeddingCipher::from_passphrase("kiosk-secret").unwrap();
        let store = Store::open(&path, Some(key)).unwrap();
        assert_eq!(store.load_enrollments().unwrap()[0].embedding.values, vec![0.5, 0.5]);
        drop(store);

        let wrong = EmbeddingCipher::from_passphrase("guess").unwrap();
        assert!(matches!(Store::open(&path, Some(wrong)), Err(StoreError::KeyMismatch(_))));
        assert!(matches!(Store::open(&path, None), Err(StoreError::KeyMismatch(_))));
    }

    #[test]
    fn test_registry_error_mapping() {
        assert!(matches!(RegistryError::from(StoreError::UserNotFound(3)), RegistryError::UserNotFound(3)));
        assert!(matches!(
            RegistryError::from(StoreError::InvalidData("x".into())),
            RegistryError::Storage(_)
        ));
    }
}
