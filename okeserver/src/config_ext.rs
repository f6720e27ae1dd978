//! okeconfig extension for the room server.

use std::path::PathBuf;

use serde_yaml::Value;

/// Extension trait for okeconfig::Config
pub trait ServerConfigExt {
    /// Path of the session/block database.
    fn session_db_path(&self) -> PathBuf;

    /// Path of the queue database.
    fn queue_db_path(&self) -> PathBuf;

    /// Length of the between-songs countdown window.
    fn countdown_seconds(&self) -> u32;

    /// Promote the first handshaken session to admin while none exists.
    fn bootstrap_admin(&self) -> bool;

    /// Library manifest path, if configured.
    fn library_manifest(&self) -> Option<PathBuf>;
}

impl ServerConfigExt for okeconfig::Config {
    fn session_db_path(&self) -> PathBuf {
        let dir = self
            .get_managed_dir(&["sessions", "directory"], "state")
            .expect("Failed to get or create the sessions directory");
        PathBuf::from(dir).join("sessions.db")
    }

    fn queue_db_path(&self) -> PathBuf {
        let dir = self
            .get_managed_dir(&["queue", "directory"], "state")
            .expect("Failed to get or create the queue directory");
        PathBuf::from(dir).join("queue.db")
    }

    fn countdown_seconds(&self) -> u32 {
        match self.get_value(&["room", "countdown_seconds"]) {
            Ok(Value::Number(n)) if n.is_u64() => n.as_u64().unwrap() as u32,
            Ok(Value::Number(n)) if n.is_i64() => n.as_i64().unwrap().max(0) as u32,
            _ => 10,
        }
    }

    fn bootstrap_admin(&self) -> bool {
        match self.get_value(&["room", "bootstrap_admin"]) {
            Ok(Value::Bool(b)) => b,
            _ => true,
        }
    }

    fn library_manifest(&self) -> Option<PathBuf> {
        match self.get_value(&["library", "manifest"]) {
            Ok(Value::String(path)) if !path.trim().is_empty() => Some(PathBuf::from(path)),
            _ => None,
        }
    }
}
