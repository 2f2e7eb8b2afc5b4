use rusqlite::{params, Connection, OptionalExtension};

use crate::cipher::EmbeddingCipher;
use crate::error::{Result, StoreError};

pub const SCHEMA_VERSION: i64 = 1;

const CIPHER_NONE: &str = "none";
const CIPHER_AES_GCM: &str = "aes-256-gcm";
const KEY_CHECK_PLAINTEXT: &[u8] = b"roster-key-check";

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS key_check (
            id     INTEGER PRIMARY KEY CHECK (id = 1),
            sealed BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS users (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            name            TEXT NOT NULL,
            email           TEXT NOT NULL UNIQUE COLLATE NOCASE,
            gender          TEXT NOT NULL,
            dob             TEXT NOT NULL,
            face_encoding   BLOB NOT NULL,
            model_version   TEXT,
            last_attendance TEXT,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_users_last_attendance ON users(last_attendance);
        ",
    )?;

    let version: Option<String> = get_metadata(conn, "schema_version")?;
    match version {
        None => set_metadata(conn, "schema_version", &SCHEMA_VERSION.to_string())?,
        Some(v) if v == SCHEMA_VERSION.to_string() => {}
        Some(v) => {
            return Err(StoreError::InvalidData(format!(
                "unsupported schema version {v} (expected {SCHEMA_VERSION})"
            )))
        }
    }

    tracing::debug!(version = SCHEMA_VERSION, "schema ready");
    Ok(())
}

/// Pin the database to one embedding encoding and verify the supplied key.
///
/// The first open decides: a fresh database records whether embeddings are
/// sealed. Later opens must present a matching configuration.
pub fn check_cipher(conn: &Connection, cipher: Option<&EmbeddingCipher>) -> Result<()> {
    let wanted = if cipher.is_some() { CIPHER_AES_GCM } else { CIPHER_NONE };

    match get_metadata(conn, "embedding_cipher")? {
        None => {
            set_metadata(conn, "embedding_cipher", wanted)?;
            if let Some(c) = cipher {
                conn.execute(
                    "INSERT OR REPLACE INTO key_check (id, sealed) VALUES (1, ?1)",
                    params![c.seal(KEY_CHECK_PLAINTEXT)?],
                )?;
            }
            tracing::info!(cipher = wanted, "embedding encoding recorded");
            Ok(())
        }
        Some(stored) if stored != wanted => Err(StoreError::KeyMismatch(format!(
            "database embeddings use {stored:?} but the store was opened with {wanted:?}"
        ))),
        Some(_) => {
            let Some(c) = cipher else { return Ok(()) };
            let sealed: Vec<u8> = conn
                .query_row("SELECT sealed FROM key_check WHERE id = 1", [], |row| row.get(0))
                .optional()?
                .ok_or_else(|| StoreError::InvalidData("missing key check record".into()))?;
            match c.open(&sealed) {
                Ok(plain) if plain == KEY_CHECK_PLAINTEXT => Ok(()),
                _ => Err(StoreError::KeyMismatch("embedding key does not match this database".into())),
            }
        }
    }
}

pub fn get_metadata(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| row.get(0))
        .optional()?)
}

pub fn set_metadata(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
        assert_eq!(get_metadata(&conn, "schema_version").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_rejects_future_schema() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        set_metadata(&conn, "schema_version", "99").unwrap();
        assert!(matches!(initialize(&conn), Err(StoreError::InvalidData(_))));
    }

    #[test]
    fn test_cipher_mode_is_pinned() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        check_cipher(&conn, None).unwrap();

        let key = EmbeddingCipher::from_passphrase("k").unwrap();
        assert!(matches!(check_cipher(&conn, Some(&key)), Err(StoreError::KeyMismatch(_))));
    }

    #[test]
    fn test_wrong_key_detected() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        let right = EmbeddingCipher::from_passphrase("right").unwrap();
        check_cipher(&conn, Some(&right)).unwrap();
        check_cipher(&conn, Some(&right)).unwrap();

        let wrong = EmbeddingCipher::from_passphrase("wrong").unwrap();
        assert!(matches!(check_cipher(&conn, Some(&wrong)), Err(StoreError::KeyMismatch(_))));
        assert!(matches!(check_cipher(&conn, None), Err(StoreError::KeyMismatch(_))));
    }
}
