//! The persistent catalog: admins, rover users and mounts, backed by a
//! single SQLite file accessed through `rusqlite`.
//!
//! Every statement runs under one `Mutex`-guarded connection, mirroring the
//! original catalog's single global database lock (`database.py`): the
//! catalog is a small, rarely-written store, so serializing it is simpler
//! and just as fast as a connection pool would be here.

mod password;

pub use password::{hash_password, verify_password};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::error::CatalogError;
use crate::types::ProtocolVersion;

/// A mount's catalog row.
#[derive(Debug, Clone)]
pub struct MountRecord {
    pub name: String,
    pub mount_password: String,
    pub owner_user_id: Option<i64>,
}

/// A rover user's catalog row.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
}

pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    /// Open (creating if absent) the catalog at `path`, run schema
    /// migrations, and seed the default admin if the admins table is empty.
    pub fn open(
        path: impl AsRef<std::path::Path>,
        default_admin_user: &str,
        default_admin_password: &str,
    ) -> Result<Self, CatalogError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS admins (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 username TEXT UNIQUE NOT NULL,
                 password_hash TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS users (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 username TEXT UNIQUE NOT NULL,
                 password_hash TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS mounts (
                 name TEXT PRIMARY KEY,
                 mount_password TEXT NOT NULL,
                 owner_user_id INTEGER NULL REFERENCES users(id) ON DELETE SET NULL
             );",
        )?;

        let catalog = Catalog {
            conn: Mutex::new(conn),
        };
        catalog.seed_default_admin(default_admin_user, default_admin_password)?;
        Ok(catalog)
    }

    fn seed_default_admin(&self, username: &str, password: &str) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM admins", [], |r| r.get(0))?;
        if count == 0 {
            debug!(target: "caster::catalog", %username, "seeding default admin");
            conn.execute(
                "INSERT INTO admins (username, password_hash) VALUES (?1, ?2)",
                params![username, hash_password(password)],
            )?;
        }
        Ok(())
    }

    // ---- Admin ----------------------------------------------------------

    pub fn verify_admin(&self, username: &str, password: &str) -> Result<bool, CatalogError> {
        let conn = self.conn.lock();
        let stored: Option<String> = conn
            .query_row(
                "SELECT password_hash FROM admins WHERE username = ?1",
                params![username],
                |r| r.get(0),
            )
            .optional()?;
        let Some(stored) = stored else {
            warn!(target: "caster::catalog", %username, "admin auth: no such admin");
            return Ok(false);
        };
        let outcome = verify_password(&stored, password);
        if outcome.needs_upgrade {
            conn.execute(
                "UPDATE admins SET password_hash = ?1 WHERE username = ?2",
                params![hash_password(password), username],
            )?;
        }
        if !outcome.matches {
            warn!(target: "caster::catalog", %username, "admin auth: bad password");
        }
        Ok(outcome.matches)
    }

    pub fn update_admin_password(&self, username: &str, new_password: &str) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE admins SET password_hash = ?1 WHERE username = ?2",
            params![hash_password(new_password), username],
        )?;
        if updated == 0 {
            return Err(CatalogError::AdminNotFound);
        }
        Ok(())
    }

    // ---- Rover users ------------------------------------------------------

    pub fn add_user(&self, username: &str, password: &str) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row("SELECT id FROM users WHERE username = ?1", params![username], |r| r.get(0))
            .optional()?;
        if exists.is_some() {
            return Err(CatalogError::UserExists(username.to_string()));
        }
        conn.execute(
            "INSERT INTO users (username, password_hash) VALUES (?1, ?2)",
            params![username, hash_password(password)],
        )?;
        Ok(())
    }

    pub fn update_user_password(&self, username: &str, new_password: &str) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET password_hash = ?1 WHERE username = ?2",
            params![hash_password(new_password), username],
        )?;
        if updated == 0 {
            return Err(CatalogError::UserNotFound(username.to_string()));
        }
        Ok(())
    }

    /// Deletes the user. Any mount owned by this user has its owner nulled
    /// (`ON DELETE SET NULL`), never cascading to delete the mount itself.
    pub fn delete_user(&self, username: &str) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM users WHERE username = ?1", params![username])?;
        if deleted == 0 {
            return Err(CatalogError::UserNotFound(username.to_string()));
        }
        Ok(())
    }

    pub fn get_user(&self, username: &str) -> Result<Option<UserRecord>, CatalogError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username, password_hash FROM users WHERE username = ?1",
            params![username],
            |r| {
                Ok(UserRecord {
                    id: r.get(0)?,
                    username: r.get(1)?,
                    password_hash: r.get(2)?,
                })
            },
        )
        .optional()
        .map_err(CatalogError::from)
    }

    pub fn list_users(&self) -> Result<Vec<String>, CatalogError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT username FROM users ORDER BY username")?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- Mounts -----------------------------------------------------------

    pub fn add_mount(
        &self,
        name: &str,
        mount_password: &str,
        owner_username: Option<&str>,
    ) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        let exists: Option<String> = conn
            .query_row("SELECT name FROM mounts WHERE name = ?1", params![name], |r| r.get(0))
            .optional()?;
        if exists.is_some() {
            return Err(CatalogError::MountExists(name.to_string()));
        }
        let owner_id = match owner_username {
            Some(u) => Some(
                conn.query_row("SELECT id FROM users WHERE username = ?1", params![u], |r| {
                    r.get::<_, i64>(0)
                })
                .optional()?
                .ok_or_else(|| CatalogError::UserNotFound(u.to_string()))?,
            ),
            None => None,
        };
        conn.execute(
            "INSERT INTO mounts (name, mount_password, owner_user_id) VALUES (?1, ?2, ?3)",
            params![name, mount_password, owner_id],
        )?;
        Ok(())
    }

    pub fn update_mount(
        &self,
        name: &str,
        mount_password: Option<&str>,
        owner_username: Option<Option<&str>>,
    ) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        if let Some(pw) = mount_password {
            conn.execute(
                "UPDATE mounts SET mount_password = ?1 WHERE name = ?2",
                params![pw, name],
            )?;
        }
        if let Some(owner) = owner_username {
            let owner_id = match owner {
                Some(u) => Some(
                    conn.query_row("SELECT id FROM users WHERE username = ?1", params![u], |r| {
                        r.get::<_, i64>(0)
                    })
                    .optional()?
                    .ok_or_else(|| CatalogError::UserNotFound(u.to_string()))?,
                ),
                None => None,
            };
            conn.execute(
                "UPDATE mounts SET owner_user_id = ?1 WHERE name = ?2",
                params![owner_id, name],
            )?;
        }
        Ok(())
    }

    pub fn delete_mount(&self, name: &str) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM mounts WHERE name = ?1", params![name])?;
        if deleted == 0 {
            return Err(CatalogError::MountNotFound(name.to_string()));
        }
        Ok(())
    }

    pub fn get_mount(&self, name: &str) -> Result<Option<MountRecord>, CatalogError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT name, mount_password, owner_user_id FROM mounts WHERE name = ?1",
            params![name],
            |r| {
                Ok(MountRecord {
                    name: r.get(0)?,
                    mount_password: r.get(1)?,
                    owner_user_id: r.get(2)?,
                })
            },
        )
        .optional()
        .map_err(CatalogError::from)
    }

    pub fn list_mounts(&self) -> Result<Vec<MountRecord>, CatalogError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT name, mount_password, owner_user_id FROM mounts ORDER BY name")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(MountRecord {
                    name: r.get(0)?,
                    mount_password: r.get(1)?,
                    owner_user_id: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Implements `VerifyDownload` exactly per the two-version rule: NTRIP
    /// 2.0 requires a matching rover user bound (or unbound) to the mount's
    /// owner; NTRIP 1.0 only checks the mount password and never binds
    /// ownership.
    pub fn verify_download(
        &self,
        mount: &str,
        username: &str,
        password: &str,
        mount_password: Option<&str>,
        version: ProtocolVersion,
    ) -> Result<(), CatalogError> {
        let conn = self.conn.lock();
        let mount_row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT mount_password, owner_user_id FROM mounts WHERE name = ?1",
                params![mount],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((stored_mount_password, owner_user_id)) = mount_row else {
            return Err(CatalogError::MountNotFound(mount.to_string()));
        };

        match version {
            ProtocolVersion::Ntrip2_0 => {
                let user_row: Option<(i64, String)> = conn
                    .query_row(
                        "SELECT id, password_hash FROM users WHERE username = ?1",
                        params![username],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;
                let Some((user_id, stored_hash)) = user_row else {
                    return Err(CatalogError::UserNotFound(username.to_string()));
                };
                let outcome = verify_password(&stored_hash, password);
                if outcome.needs_upgrade {
                    conn.execute(
                        "UPDATE users SET password_hash = ?1 WHERE username = ?2",
                        params![hash_password(password), username],
                    )?;
                }
                if !outcome.matches {
                    return Err(CatalogError::BadPassword);
                }
                if let Some(owner) = owner_user_id {
                    if owner != user_id {
                        return Err(CatalogError::Forbidden);
                    }
                }
                Ok(())
            }
            ProtocolVersion::Ntrip1_0 => {
                match mount_password {
                    Some(pw) if pw == stored_mount_password => Ok(()),
                    _ => Err(CatalogError::BadPassword),
                }
            }
        }
    }
}
