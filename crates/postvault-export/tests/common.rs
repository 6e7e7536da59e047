//! Common fakes and fixtures for the export integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{Duration, TimeZone, Utc};
use postvault_export::{
    layout, ArchiveDirLister, ArchiveItem, EventSink, ExportConfig, ExportOrchestrator,
    ExportPorts, ExportResult, ExportStatus, ItemLister, KdfParams, Phase, SpaceGauge, StaticVolumeLister,
    Volume,
};

pub const PASSWORD: &str = "correct horse battery staple";

/// Kind of a recorded notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Info,
    Warning,
    Error,
    Success,
}

type ProgressHook = Arc<dyn Fn(&ExportStatus) + Send + Sync>;

/// Event sink that records everything it receives.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(EventKind, String)>>,
    phases: Mutex<Vec<Phase>>,
    hook: Mutex<Option<ProgressHook>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, kind: EventKind, message: &str) {
        self.events.lock().unwrap().push((kind, message.to_string()));
    }

    /// Runs `hook` on every progress snapshot.
    pub fn set_hook<F>(&self, hook: F)
    where
        F: Fn(&ExportStatus) + Send + Sync + 'static,
    {
        *self.hook.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn messages(&self, kind: EventKind) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Observed phases with consecutive duplicates collapsed.
    pub fn phase_sequence(&self) -> Vec<Phase> {
        let mut seq = self.phases.lock().unwrap().clone();
        seq.dedup();
        seq
    }
}

impl EventSink for RecordingSink {
    fn emit_info(&self, message: &str) {
        self.record(EventKind::Info, message);
    }

    fn emit_warning(&self, message: &str) {
        self.record(EventKind::Warning, message);
    }

    fn emit_error(&self, message: &str) {
        self.record(EventKind::Error, message);
    }

    fn emit_success(&self, message: &str) {
        self.record(EventKind::Success, message);
    }

    fn progress(&self, status: &ExportStatus) {
        self.phases.lock().unwrap().push(status.phase);
        // Clone out so the hook may call back into the orchestrator.
        let hook = self.hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(status);
        }
    }
}

/// Space gauge with fixed answers.
pub struct FixedSpaceGauge {
    pub estimated: u64,
    pub available: u64,
}

impl FixedSpaceGauge {
    pub fn plenty() -> Arc<Self> {
        Arc::new(Self {
            estimated: 1024 * 1024,
            available: 1024 * 1024 * 1024 * 1024,
        })
    }
}

impl SpaceGauge for FixedSpaceGauge {
    fn estimate_bytes(&self, _items: &[ArchiveItem]) -> u64 {
        self.estimated
    }

    fn available_bytes(&self, _path: &Path) -> ExportResult<u64> {
        Ok(self.available)
    }
}

/// Archive directory with `n` posts laid out the way `ArchiveDirLister` reads them.
pub struct ArchiveFixture {
    pub root: PathBuf,
    pub count: usize,
}

impl ArchiveFixture {
    pub fn create(root: &Path, count: usize) -> Self {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        for i in 0..count {
            let created = start + Duration::days(i as i64 * 3);
            let dir = root.join(format!("post-{:04}", i));
            fs::create_dir_all(dir.join("media")).unwrap();
            let author = if i % 3 == 0 { "alice" } else { "bob" };
            let doc = serde_json::json!({
                "id": format!("{}", 1_000_000 + i),
                "author": author,
                "created_at": created.to_rfc3339(),
                "text": format!("post number {} about rust </script>", i),
            });
            fs::write(dir.join("tweet.json"), serde_json::to_vec(&doc).unwrap()).unwrap();
            if i % 2 == 0 {
                fs::write(dir.join("avatar.jpg"), vec![0xAB; 512 + i]).unwrap();
            }
            for m in 0..(i % 3) {
                let bytes: Vec<u8> = (0..(2048 + i * 97 + m * 13)).map(|b| (b % 251) as u8).collect();
                fs::write(dir.join("media").join(format!("photo{}.png", m)), bytes).unwrap();
            }
        }
        Self {
            root: root.to_path_buf(),
            count,
        }
    }

    /// Media path of post `i`, if it has at least one.
    pub fn media_path(&self, i: usize) -> PathBuf {
        self.root.join(format!("post-{:04}", i)).join("media/photo0.png")
    }

    /// Files each post turns into: tweet.json, README.md, avatar, media.
    pub fn expected_files(&self) -> usize {
        (0..self.count)
            .map(|i| 2 + usize::from(i % 2 == 0) + i % 3)
            .sum()
    }
}

pub fn test_config(state_dir: &Path) -> ExportConfig {
    ExportConfig {
        state_path: state_dir.join("export-state.json"),
        kdf: KdfParams::insecure_fast(),
        ..Default::default()
    }
}

pub fn orchestrator(
    config: ExportConfig,
    archive: &Path,
    sink: Arc<RecordingSink>,
    space: Arc<dyn SpaceGauge>,
) -> Arc<ExportOrchestrator> {
    orchestrator_with_lister(config, Arc::new(ArchiveDirLister::new(archive)), sink, space)
}

pub fn orchestrator_with_lister(
    config: ExportConfig,
    lister: Arc<dyn ItemLister>,
    sink: Arc<RecordingSink>,
    space: Arc<dyn SpaceGauge>,
) -> Arc<ExportOrchestrator> {
    Arc::new(ExportOrchestrator::new(
        config,
        ExportPorts {
            lister,
            events: sink,
            space,
            volumes: Arc::new(StaticVolumeLister::new(vec![Volume {
                mount_point: PathBuf::from("/media/usb"),
                device: "/dev/sdb1".to_string(),
                fs_type: "exfat".to_string(),
            }])),
        },
    ))
}

/// Well-known artifact names present at `dest`.
pub fn artifacts_present(dest: &Path) -> Vec<&'static str> {
    layout::ARTIFACT_NAMES
        .iter()
        .copied()
        .filter(|name| dest.join(name).exists())
        .collect()
}

/// Every regular file below `dir`.
pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if !dir.exists() {
        return out;
    }
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            out.extend(files_under(&path));
        } else {
            out.push(path);
        }
    }
    out.sort();
    out
}

pub fn total_size(files: &[PathBuf]) -> u64 {
    files.iter().map(|p| fs::metadata(p).unwrap().len()).sum()
}
