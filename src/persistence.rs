use crate::config::Configuration;
use crate::snapshot::ConfigSnapshot;
use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

const SCHEMA_VERSION: i32 = 1;
const CONFIG_KEY: &str = "configuration";

enum WriteCommand {
    Update(Box<Configuration>),
    Shutdown,
}

/// `%APPDATA%/OverlayHost` on Windows, `$HOME/.config/overlay-host` elsewhere.
pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(app_data) = std::env::var("APPDATA") {
        return Ok(PathBuf::from(app_data).join("OverlayHost"));
    }
    let home = std::env::var("HOME").context("Neither APPDATA nor HOME is set")?;
    Ok(PathBuf::from(home).join(".config").join("overlay-host"))
}

/// SQLite-backed configuration storage. Reads happen on the caller's thread,
/// writes are queued to a background worker.
pub struct ConfigStore {
    data_dir: PathBuf,
    write_sender: Sender<WriteCommand>,
    write_thread: Option<thread::JoinHandle<()>>,
    saved_version: AtomicU64,
}

impl ConfigStore {
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let db_path = data_dir.join("config.db");
        let conn = Connection::open(&db_path).context("Failed to open database")?;
        Self::init_database(&conn)?;
        drop(conn);

        let (write_sender, write_receiver) = unbounded();
        let write_thread = thread::Builder::new()
            .name("config-writer".to_string())
            .spawn(move || Self::write_worker(db_path, write_receiver))
            .context("Failed to spawn config writer thread")?;

        Ok(Self {
            data_dir,
            write_sender,
            write_thread: Some(write_thread),
            saved_version: AtomicU64::new(0),
        })
    }

    fn init_database(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .ok();
        if current_version.is_none() {
            conn.execute("INSERT INTO schema_version (version) VALUES (?1)", params![SCHEMA_VERSION])?;
        }
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    fn db_path(&self) -> PathBuf {
        self.data_dir.join("config.db")
    }

    /// Stored configuration, or the default when nothing has been saved yet.
    pub fn load(&self) -> Result<Configuration> {
        let conn = Connection::open(self.db_path()).context("Failed to open database")?;
        let json = conn.query_row("SELECT value FROM settings WHERE key = ?1", params![CONFIG_KEY], |row| {
            row.get::<_, String>(0)
        });

        match json {
            Ok(json) => serde_json::from_str(&json).context("Failed to parse configuration JSON"),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Configuration::default()),
            Err(e) => Err(e).context("Failed to read configuration"),
        }
    }

    pub fn save(&self, config: &Configuration) {
        let _ = self.write_sender.send(WriteCommand::Update(Box::new(config.clone())));
    }

    /// Queues `snapshot` unless a snapshot at least this new was already queued.
    /// Returns true when a write was queued.
    pub fn save_snapshot(&self, snapshot: &ConfigSnapshot) -> bool {
        let version = snapshot.version();
        if self.saved_version.fetch_max(version, Ordering::AcqRel) >= version {
            return false;
        }
        self.save(snapshot.config());
        true
    }

    fn write_worker(db_path: PathBuf, receiver: Receiver<WriteCommand>) {
        let conn = match Connection::open(&db_path) {
            Ok(c) => c,
            Err(e) => {
                crate::log_error!("Failed to open database in write worker: {}", e);
                return;
            }
        };

        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");

        while let Ok(cmd) = receiver.recv() {
            match cmd {
                WriteCommand::Update(config) => match serde_json::to_string(&config) {
                    Ok(json) => {
                        if let Err(e) = conn.execute(
                            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                            params![CONFIG_KEY, json],
                        ) {
                            crate::log_error!("Failed to write configuration: {}", e);
                        }
                    }
                    Err(e) => crate::log_error!("Failed to serialize configuration: {}", e),
                },
                WriteCommand::Shutdown => break,
            }
        }

        let _ = conn.pragma_update(None, "wal_checkpoint", "TRUNCATE");
    }

    /// Flushes queued writes and waits for the worker to finish.
    pub fn close(mut self) {
        self.shutdown_worker();
    }

    fn shutdown_worker(&mut self) {
        let _ = self.write_sender.send(WriteCommand::Shutdown);
        if let Some(handle) = self.write_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConfigStore {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}
