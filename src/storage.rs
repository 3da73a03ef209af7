//! Per-session file store.
//!
//! Layout: `<root>/<session_id>/<file_id>/<filename>`. Each stored file owns
//! its directory, so deleting one never touches its siblings and listing a
//! session is a directory scan. Slot allocation is an exclusive `create_dir`,
//! which fails if the directory already exists.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{ProxyError, Result};

/// Metadata describing one stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredFile {
    pub id: String,
    pub session_id: String,
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub path: PathBuf,
}

/// Limits enforced by the store.
#[derive(Debug, Clone, Copy)]
pub struct StorageLimits {
    pub max_file_size_bytes: u64,
    pub max_files_per_session: usize,
}

/// Filesystem-backed store for uploaded and generated files.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    limits: StorageLimits,
    /// Serializes slot allocation per session
    slot_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>, limits: StorageLimits) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            limits,
            slot_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub const fn limits(&self) -> StorageLimits {
        self.limits
    }

    /// Persist an uploaded file.
    pub async fn save_file(
        &self,
        session_id: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<StoredFile> {
        if content.len() as u64 > self.limits.max_file_size_bytes {
            return Err(ProxyError::validation(format!(
                "File too large. Max size: {} bytes",
                self.limits.max_file_size_bytes
            )));
        }

        let (file_id, path) = self.allocate_runtime_file(session_id, filename).await?;

        if let Err(e) = fs::write(&path, content).await {
            error!(session = %session_id, file = %file_id, error = %e, "Error saving file");
            self.release_slot(&path).await;
            return Err(e.into());
        }

        debug!(session = %session_id, file = %file_id, size = content.len(), "Saved file");
        Ok(self.metadata(session_id, &file_id, &path).await?)
    }

    /// Reserve a slot for a file whose content the caller writes afterwards.
    pub async fn allocate_runtime_file(
        &self,
        session_id: &str,
        filename: &str,
    ) -> Result<(String, PathBuf)> {
        let session_dir = self.session_dir(session_id)?;
        let filename = sanitize_filename(filename)?;

        let lock = self.slot_lock(session_id).await;
        let _guard = lock.lock().await;

        fs::create_dir_all(&session_dir).await?;
        self.assert_capacity(&session_dir).await?;

        let file_id = Uuid::new_v4().to_string();
        let file_dir = session_dir.join(&file_id);
        fs::create_dir(&file_dir).await?;
        Ok((file_id, file_dir.join(filename)))
    }

    async fn slot_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.slot_locks.lock().await;
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    /// Remove a file and its slot directory, if the directory is left empty.
    /// Never fails.
    pub async fn release_slot(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove file");
            }
        }
        if let Some(parent) = path.parent() {
            // remove_dir refuses non-empty directories
            let _ = fs::remove_dir(parent).await;
        }
    }

    /// Build metadata for a file already written to `path`.
    pub async fn metadata(
        &self,
        session_id: &str,
        file_id: &str,
        path: &Path,
    ) -> std::io::Result<StoredFile> {
        let meta = fs::metadata(path).await?;
        let created = meta.created().or_else(|_| meta.modified())?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(StoredFile {
            id: file_id.to_string(),
            session_id: session_id.to_string(),
            mime_type: mime_type_for(&filename).to_string(),
            filename,
            size: meta.len(),
            created_at: DateTime::<Utc>::from(created),
            path: path.to_path_buf(),
        })
    }

    /// Look up a file within a known session.
    pub async fn get_file(&self, session_id: &str, file_id: &str) -> Option<StoredFile> {
        let session_dir = self.session_dir(session_id).ok()?;
        check_component(file_id).ok()?;
        let path = first_file_in(&session_dir.join(file_id)).await?;
        self.metadata(session_id, file_id, &path).await.ok()
    }

    /// Look up a file by id alone, scanning every session.
    pub async fn find_file(&self, file_id: &str) -> Option<StoredFile> {
        check_component(file_id).ok()?;
        let mut sessions = fs::read_dir(&self.root).await.ok()?;
        while let Ok(Some(entry)) = sessions.next_entry().await {
            if !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }
            if let Some(path) = first_file_in(&entry.path().join(file_id)).await {
                let session_id = entry.file_name().to_string_lossy().into_owned();
                return self.metadata(&session_id, file_id, &path).await.ok();
            }
        }
        None
    }

    /// All files stored for a session. Unknown sessions yield an empty list.
    pub async fn list_files(&self, session_id: &str) -> Vec<StoredFile> {
        let mut files = Vec::new();
        let Ok(session_dir) = self.session_dir(session_id) else {
            return files;
        };
        let Ok(mut entries) = fs::read_dir(&session_dir).await else {
            return files;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            if !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let Some(path) = first_file_in(&entry.path()).await else {
                continue;
            };
            let file_id = entry.file_name().to_string_lossy().into_owned();
            if let Ok(meta) = self.metadata(session_id, &file_id, &path).await {
                files.push(meta);
            }
        }

        files.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        files
    }

    /// Delete a single file. Returns `false` if it did not exist or could
    /// not be removed.
    pub async fn delete_file(&self, session_id: &str, file_id: &str) -> bool {
        let Ok(session_dir) = self.session_dir(session_id) else {
            return false;
        };
        if check_component(file_id).is_err() {
            return false;
        }
        let file_dir = session_dir.join(file_id);
        if !fs::try_exists(&file_dir).await.unwrap_or(false) {
            return false;
        }
        match fs::remove_dir_all(&file_dir).await {
            Ok(()) => true,
            Err(e) => {
                error!(session = %session_id, file = %file_id, error = %e, "Error deleting file");
                false
            }
        }
    }

    /// Remove every file of a session. Returns `false` if nothing was stored.
    pub async fn cleanup_session(&self, session_id: &str) -> bool {
        let Ok(session_dir) = self.session_dir(session_id) else {
            return false;
        };
        let lock = self.slot_lock(session_id).await;
        let guard = lock.lock().await;
        let removed = fs::remove_dir_all(&session_dir).await;
        self.slot_locks.lock().await.remove(session_id);
        drop(guard);

        match removed {
            Ok(()) => {
                debug!(session = %session_id, "Removed session files");
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                error!(session = %session_id, error = %e, "Error cleaning up session");
                false
            }
        }
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        check_component(session_id)?;
        Ok(self.root.join(session_id))
    }

    async fn assert_capacity(&self, session_dir: &Path) -> Result<()> {
        let mut count = 0usize;
        let mut entries = fs::read_dir(session_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                count += 1;
            }
        }
        if count >= self.limits.max_files_per_session {
            return Err(ProxyError::validation(format!(
                "Session has too many files. Max: {}",
                self.limits.max_files_per_session
            )));
        }
        Ok(())
    }
}

/// Reject identifiers that could escape their directory.
fn check_component(value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(ProxyError::validation(format!("Invalid identifier '{value}'")))
    }
}

/// Keep only the final path component of a user-supplied filename.
fn sanitize_filename(filename: &str) -> Result<String> {
    let name = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    check_component(&name)
        .map_err(|_| ProxyError::validation(format!("Invalid filename '{filename}'")))?;
    Ok(name)
}

async fn first_file_in(dir: &Path) -> Option<PathBuf> {
    let mut entries = fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.is_ok_and(|t| t.is_file()) {
            return Some(entry.path());
        }
    }
    None
}

/// Content type guessed from the file extension.
pub fn mime_type_for(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "csv" => "text/csv",
        "tsv" => "text/tab-separated-values",
        "json" => "application/json",
        "xml" => "application/xml",
        "html" | "htm" => "text/html",
        "yaml" | "yml" => "application/yaml",
        "py" => "text/x-python",
        "js" => "text/javascript",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    async fn store_with(dir: &Path, max_size: u64, max_files: usize) -> FileStore {
        FileStore::open(
            dir,
            StorageLimits {
                max_file_size_bytes: max_size,
                max_files_per_session: max_files,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn save_and_get_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 1024, 10).await;

        let saved = store.save_file("s1", "data.csv", b"a,b\n1,2\n").await.unwrap();
        assert_eq!(saved.filename, "data.csv");
        assert_eq!(saved.size, 8);
        assert_eq!(saved.mime_type, "text/csv");
        assert_eq!(saved.session_id, "s1");
        assert_eq!(
            saved.path,
            dir.path().join("s1").join(&saved.id).join("data.csv")
        );

        let fetched = store.get_file("s1", &saved.id).await.unwrap();
        assert_eq!(fetched, saved);
        assert!(store.get_file("s2", &saved.id).await.is_none());
    }

    #[tokio::test]
    async fn oversized_upload_leaves_nothing_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 10, 10).await;

        let err = store.save_file("s1", "big.bin", &[0u8; 11]).await.unwrap_err();
        assert!(matches!(err, ProxyError::Validation(_)));
        assert!(!dir.path().join("s1").exists());
        assert!(store.list_files("s1").await.is_empty());
    }

    #[tokio::test]
    async fn session_capacity_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 1024, 2).await;

        assert_ok!(store.save_file("s1", "a.txt", b"a").await);
        assert_ok!(store.save_file("s1", "b.txt", b"b").await);
        let err = assert_err!(store.save_file("s1", "c.txt", b"c").await);
        assert!(matches!(err, ProxyError::Validation(_)));
        assert!(matches!(
            store.allocate_runtime_file("s1", "d.txt").await,
            Err(ProxyError::Validation(_))
        ));

        // other sessions have their own budget
        assert_ok!(store.save_file("s2", "a.txt", b"a").await);
        assert_eq!(store.list_files("s1").await.len(), 2);
    }

    #[tokio::test]
    async fn same_filename_gets_separate_slots() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 1024, 10).await;

        let first = store.save_file("s1", "out.txt", b"one").await.unwrap();
        let second = store.save_file("s1", "out.txt", b"two").await.unwrap();
        assert_ne!(first.id, second.id);

        assert!(store.delete_file("s1", &first.id).await);
        assert!(!first.path.exists());
        assert_eq!(tokio::fs::read(&second.path).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn find_file_scans_all_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 1024, 10).await;

        store.save_file("s1", "a.txt", b"a").await.unwrap();
        let saved = store.save_file("s2", "b.txt", b"b").await.unwrap();

        let found = store.find_file(&saved.id).await.unwrap();
        assert_eq!(found.session_id, "s2");
        assert_eq!(found.filename, "b.txt");
        assert!(store.find_file("missing").await.is_none());
    }

    #[tokio::test]
    async fn cleanup_session_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 1024, 10).await;

        let a = store.save_file("s1", "a.txt", b"a").await.unwrap();
        store.save_file("s1", "b.txt", b"b").await.unwrap();

        assert!(store.cleanup_session("s1").await);
        assert!(store.get_file("s1", &a.id).await.is_none());
        assert!(store.list_files("s1").await.is_empty());
        assert!(!store.cleanup_session("s1").await);
    }

    #[tokio::test]
    async fn missing_entries_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 1024, 10).await;

        assert!(store.get_file("nope", "nope").await.is_none());
        assert!(store.list_files("nope").await.is_empty());
        assert!(!store.delete_file("nope", "nope").await);
        assert!(!store.cleanup_session("nope").await);
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 1024, 10).await;

        assert!(matches!(
            store.save_file("../escape", "a.txt", b"a").await,
            Err(ProxyError::Validation(_))
        ));
        let saved = store.save_file("s1", "../../etc/passwd", b"x").await.unwrap();
        assert_eq!(saved.filename, "passwd");
        assert!(saved.path.starts_with(dir.path().join("s1")));
        assert!(store.get_file("s1", "..").await.is_none());
    }

    #[tokio::test]
    async fn release_slot_removes_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 1024, 10).await;

        let (_, path) = store.allocate_runtime_file("s1", "x.txt").await.unwrap();
        let slot = path.parent().unwrap().to_path_buf();
        assert!(slot.exists());

        store.release_slot(&path).await;
        assert!(!slot.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_respect_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_with(dir.path(), 1024, 1).await);

        for round in 0..20 {
            let session = format!("s{round}");
            let mut tasks = Vec::new();
            for i in 0..8 {
                let store = Arc::clone(&store);
                let session = session.clone();
                tasks.push(tokio::spawn(async move {
                    store.save_file(&session, &format!("f{i}.txt"), b"x").await
                }));
            }

            let mut accepted = 0;
            for task in tasks {
                match task.await.unwrap() {
                    Ok(_) => accepted += 1,
                    Err(e) => assert!(matches!(e, ProxyError::Validation(_))),
                }
            }
            assert_eq!(accepted, 1, "round {round}");
            assert_eq!(store.list_files(&session).await.len(), 1, "round {round}");
        }
    }

    #[tokio::test]
    async fn cleanup_resets_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 1024, 1).await;

        assert_ok!(store.save_file("s1", "a.txt", b"a").await);
        assert_err!(store.save_file("s1", "b.txt", b"b").await);
        assert!(store.cleanup_session("s1").await);
        assert_ok!(store.save_file("s1", "b.txt", b"b").await);
        assert!(store.slot_locks.lock().await.contains_key("s1"));
    }

    #[test]
    fn mime_types_by_extension() {
        assert_eq!(mime_type_for("report.CSV"), "text/csv");
        assert_eq!(mime_type_for("plot.png"), "image/png");
        assert_eq!(mime_type_for("noext"), "application/octet-stream");
    }
}
