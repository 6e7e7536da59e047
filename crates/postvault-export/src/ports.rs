//! Collaborators consumed by the export pipeline, injected so tests can use fakes.
//!
//! - [`ItemLister`]: archived posts matching a filter
//! - [`EventSink`]: operator-facing notifications
//! - [`SpaceGauge`]: size estimate and free bytes
//! - [`VolumeLister`]: mounted volumes

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{ExportError, ExportResult};
use crate::job::{ExportFilter, ExportStatus};

/// One archived post and the files that belong to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveItem {
    /// Post id.
    pub id: String,
    /// Author handle.
    pub author: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Post text.
    pub text: String,
    /// Full archived JSON document.
    pub raw: serde_json::Value,
    /// Avatar image on disk.
    pub avatar: Option<PathBuf>,
    /// Media files on disk.
    pub media: Vec<PathBuf>,
}

/// Lists archived items.
pub trait ItemLister: Send + Sync {
    /// Items matching `filter`, plus the total number of matches.
    fn list(&self, filter: &ExportFilter) -> ExportResult<(Vec<ArchiveItem>, u64)>;
}

/// Receives operator-facing notifications.
pub trait EventSink: Send + Sync {
    /// Informational event.
    fn emit_info(&self, message: &str);
    /// Something was skipped or degraded.
    fn emit_warning(&self, message: &str);
    /// An export failed.
    fn emit_error(&self, message: &str);
    /// An export completed.
    fn emit_success(&self, message: &str);

    /// Called after each item finishes, with a fresh status snapshot.
    fn progress(&self, _status: &ExportStatus) {}
}

/// Estimates export size and reports free space.
pub trait SpaceGauge: Send + Sync {
    /// Estimated bytes an export of `items` will occupy.
    fn estimate_bytes(&self, items: &[ArchiveItem]) -> u64;
    /// Free bytes available at `path` (or its nearest existing ancestor).
    fn available_bytes(&self, path: &Path) -> ExportResult<u64>;
}

/// A mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Mount point.
    pub mount_point: PathBuf,
    /// Backing device.
    pub device: String,
    /// Filesystem type.
    pub fs_type: String,
}

/// Enumerates mounted volumes.
pub trait VolumeLister: Send + Sync {
    /// All currently mounted volumes.
    fn list_volumes(&self) -> ExportResult<Vec<Volume>>;
}

/// Lister over a fixed set of items.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLister {
    items: Vec<ArchiveItem>,
}

impl InMemoryLister {
    /// Wraps a list of items.
    pub fn new(items: Vec<ArchiveItem>) -> Self {
        Self { items }
    }
}

impl ItemLister for InMemoryLister {
    fn list(&self, filter: &ExportFilter) -> ExportResult<(Vec<ArchiveItem>, u64)> {
        let items: Vec<ArchiveItem> = self
            .items
            .iter()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        let total = items.len() as u64;
        Ok((items, total))
    }
}

/// Lister reading an archive directory where each post lives in a directory
/// holding `tweet.json`, an optional `avatar.jpg` and an optional `media/`.
#[derive(Debug, Clone)]
pub struct ArchiveDirLister {
    root: PathBuf,
}

impl ArchiveDirLister {
    /// Lists posts below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn collect_dirs(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
        if dir.join("tweet.json").is_file() {
            out.push(dir.to_path_buf());
        }
        let mut children: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        children.sort();
        for child in children {
            Self::collect_dirs(&child, out)?;
        }
        Ok(())
    }

    fn load_item(dir: &Path) -> ExportResult<ArchiveItem> {
        let raw: serde_json::Value = serde_json::from_slice(&fs::read(dir.join("tweet.json"))?)?;
        let field = |names: &[&str]| -> Option<String> {
            names.iter().find_map(|n| match raw.get(*n) {
                Some(serde_json::Value::String(s)) => Some(s.clone()),
                Some(serde_json::Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
        };
        let id = field(&["id", "id_str"]).ok_or_else(|| {
            ExportError::InvalidOptions(format!("{}: tweet.json has no id", dir.display()))
        })?;
        let created_at = field(&["created_at"])
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc))
            .ok_or_else(|| {
                ExportError::InvalidOptions(format!(
                    "{}: tweet.json has no RFC 3339 created_at",
                    dir.display()
                ))
            })?;
        let author = field(&["author", "screen_name", "username"]).unwrap_or_default();
        let text = field(&["text", "full_text"]).unwrap_or_default();

        let avatar = Some(dir.join("avatar.jpg")).filter(|p| p.is_file());
        let media_dir = dir.join("media");
        let mut media = Vec::new();
        if media_dir.is_dir() {
            for entry in fs::read_dir(&media_dir)? {
                let path = entry?.path();
                if path.is_file() {
                    media.push(path);
                }
            }
            media.sort();
        }

        Ok(ArchiveItem {
            id,
            author,
            created_at,
            text,
            raw,
            avatar,
            media,
        })
    }
}

impl ItemLister for ArchiveDirLister {
    fn list(&self, filter: &ExportFilter) -> ExportResult<(Vec<ArchiveItem>, u64)> {
        let mut dirs = Vec::new();
        Self::collect_dirs(&self.root, &mut dirs)?;
        let mut items = Vec::with_capacity(dirs.len());
        for dir in dirs {
            match Self::load_item(&dir) {
                Ok(item) if filter.matches(&item) => items.push(item),
                Ok(_) => {}
                Err(e) => warn!(dir = %dir.display(), error = %e, "skipping unreadable archive entry"),
            }
        }
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let total = items.len() as u64;
        debug!(root = %self.root.display(), total, "listed archive items");
        Ok((items, total))
    }
}

/// Event sink that forwards notifications to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit_info(&self, message: &str) {
        info!(target: "postvault::events", "{}", message);
    }

    fn emit_warning(&self, message: &str) {
        warn!(target: "postvault::events", "{}", message);
    }

    fn emit_error(&self, message: &str) {
        error!(target: "postvault::events", "{}", message);
    }

    fn emit_success(&self, message: &str) {
        info!(target: "postvault::events", success = true, "{}", message);
    }

    fn progress(&self, status: &ExportStatus) {
        debug!(
            target: "postvault::events",
            exported = status.exported,
            total = status.total,
            bytes_written = status.bytes_written,
            "{}",
            status.current_item
        );
    }
}

/// Space gauge backed by file metadata and `statvfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSpaceGauge;

impl OsSpaceGauge {
    /// Fixed per-item allowance for generated files (README.md, directory entries).
    pub const PER_ITEM_OVERHEAD: u64 = 4096;
}

impl SpaceGauge for OsSpaceGauge {
    fn estimate_bytes(&self, items: &[ArchiveItem]) -> u64 {
        items
            .iter()
            .map(|item| {
                let files: u64 = item
                    .avatar
                    .iter()
                    .chain(item.media.iter())
                    .filter_map(|p| fs::metadata(p).ok())
                    .map(|m| m.len())
                    .sum();
                // The raw JSON lands twice: tweet.json and tweets-data.json.
                let json = item.raw.to_string().len() as u64 * 2;
                files + json + Self::PER_ITEM_OVERHEAD
            })
            .sum()
    }

    fn available_bytes(&self, path: &Path) -> ExportResult<u64> {
        let existing = path
            .ancestors()
            .find(|p| p.exists())
            .unwrap_or_else(|| Path::new("."));
        Ok(statvfs_available(existing)?)
    }
}

#[cfg(unix)]
fn statvfs_available(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is NUL-terminated and st is a valid out-pointer.
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::unnecessary_cast)]
    Ok(st.f_bavail as u64 * st.f_frsize as u64)
}

#[cfg(not(unix))]
fn statvfs_available(_path: &Path) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "free space query not supported on this platform",
    ))
}

/// Volume lister reading a Linux mount table (`/proc/mounts` format).
#[derive(Debug, Clone)]
pub struct MountTableLister {
    table: PathBuf,
}

impl Default for MountTableLister {
    fn default() -> Self {
        Self {
            table: PathBuf::from("/proc/mounts"),
        }
    }
}

impl MountTableLister {
    /// Reads an alternative mount table file.
    pub fn with_table(table: impl Into<PathBuf>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Parses mount-table text, skipping pseudo filesystems.
    pub fn parse(contents: &str) -> Vec<Volume> {
        const PSEUDO: &[&str] = &[
            "proc", "sysfs", "devpts", "cgroup", "cgroup2", "securityfs", "debugfs",
            "tracefs", "mqueue", "pstore", "bpf", "configfs", "fusectl", "autofs",
        ];
        contents
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let device = fields.next()?;
                let mount_point = fields.next()?;
                let fs_type = fields.next()?;
                if PSEUDO.contains(&fs_type) {
                    return None;
                }
                Some(Volume {
                    mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                    device: unescape_mount_field(device),
                    fs_type: fs_type.to_string(),
                })
            })
            .collect()
    }
}

/// Decodes the `\ooo` octal escapes used for spaces and tabs in mount tables.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let v = digits.iter().fold(0u16, |acc, d| acc * 8 + u16::from(d - b'0'));
                out.push(v as u8);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

impl VolumeLister for MountTableLister {
    fn list_volumes(&self) -> ExportResult<Vec<Volume>> {
        let contents = fs::read_to_string(&self.table)
            .map_err(|e| ExportError::Volume(format!("{}: {}", self.table.display(), e)))?;
        Ok(Self::parse(&contents))
    }
}

/// Volume lister over a fixed list.
#[derive(Debug, Clone, Default)]
pub struct StaticVolumeLister {
    volumes: Vec<Volume>,
}

impl StaticVolumeLister {
    /// Wraps a list of volumes.
    pub fn new(volumes: Vec<Volume>) -> Self {
        Self { volumes }
    }
}

impl VolumeLister for StaticVolumeLister {
    fn list_volumes(&self) -> ExportResult<Vec<Volume>> {
        Ok(self.volumes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn write_post(root: &Path, rel: &str, json: &str, media: &[&str]) -> PathBuf {
        let dir = root.join(rel);
        fs::create_dir_all(dir.join("media")).unwrap();
        fs::write(dir.join("tweet.json"), json).unwrap();
        fs::write(dir.join("avatar.jpg"), b"jpeg").unwrap();
        for m in media {
            fs::write(dir.join("media").join(m), b"media-bytes").unwrap();
        }
        dir
    }

    #[test]
    fn test_archive_dir_lister_reads_posts() {
        let root = tempfile::tempdir().unwrap();
        write_post(
            root.path(),
            "alice/2",
            r#"{"id":"2","author":"alice","created_at":"2024-03-01T10:00:00Z","text":"second"}"#,
            &["b.png", "a.mp4"],
        );
        write_post(
            root.path(),
            "alice/1",
            r#"{"id":1,"screen_name":"alice","created_at":"2024-01-01T10:00:00Z","full_text":"first"}"#,
            &[],
        );
        fs::create_dir_all(root.path().join("broken")).unwrap();
        fs::write(root.path().join("broken/tweet.json"), "{not json").unwrap();

        let lister = ArchiveDirLister::new(root.path());
        let (items, total) = lister.list(&ExportFilter::default()).unwrap();
        assert_eq!(total, 2);
        assert_eq!(items[0].id, "1");
        assert_eq!(items[0].text, "first");
        assert_eq!(items[1].media.len(), 2);
        assert!(items[1].media[0].ends_with("a.mp4"));
        assert!(items[1].avatar.is_some());
    }

    #[test]
    fn test_in_memory_lister_filters() {
        let item = ArchiveItem {
            id: "1".into(),
            author: "bob".into(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            text: "hello".into(),
            raw: serde_json::json!({"id": "1"}),
            avatar: None,
            media: vec![],
        };
        let lister = InMemoryLister::new(vec![item]);
        let filter = ExportFilter {
            authors: vec!["alice".into()],
            ..Default::default()
        };
        assert_eq!(lister.list(&filter).unwrap().1, 0);
        assert_eq!(lister.list(&ExportFilter::default()).unwrap().1, 1);
    }

    #[test]
    fn test_mount_table_parse() {
        let table = "\
proc /proc proc rw,nosuid 0 0
/dev/sda1 / ext4 rw,relatime 0 0
/dev/sdb1 /media/user/MY\\040USB exfat rw,nosuid 0 0
";
        let volumes = MountTableLister::parse(table);
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[1].mount_point, PathBuf::from("/media/user/MY USB"));
        assert_eq!(volumes[1].fs_type, "exfat");
    }

    #[test]
    fn test_mount_table_missing_file() {
        let lister = MountTableLister::with_table("/definitely/not/here");
        assert!(matches!(lister.list_volumes(), Err(ExportError::Volume(_))));
    }

    #[test]
    fn test_os_space_gauge_estimate_and_free() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("m.bin");
        fs::write(&media, vec![0u8; 1000]).unwrap();
        let item = ArchiveItem {
            id: "1".into(),
            author: "a".into(),
            created_at: Utc::now(),
            text: String::new(),
            raw: serde_json::json!({}),
            avatar: None,
            media: vec![media],
        };
        let gauge = OsSpaceGauge;
        assert_eq!(
            gauge.estimate_bytes(&[item]),
            1000 + 4 + OsSpaceGauge::PER_ITEM_OVERHEAD
        );
        let free = gauge
            .available_bytes(&dir.path().join("not/yet/created"))
            .unwrap();
        assert!(free > 0);
    }
}
