//! On-disk layout of an export: well-known names, item directories,
//! destination preparation/cleanup and the generated text artifacts.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ExportError, ExportResult};
use crate::job::ExportFilter;
use crate::ports::ArchiveItem;

/// Denormalized data of a plain export.
pub const TWEETS_DATA: &str = "tweets-data.json";
/// Encrypted replacement of `tweets-data.json`.
pub const DATA_ENC: &str = "data.enc";
/// Encrypted manifest.
pub const MANIFEST_ENC: &str = "manifest.enc";
/// Offline viewer.
pub const INDEX_HTML: &str = "index.html";
/// Human-readable instructions.
pub const README_TXT: &str = "README.txt";
/// Export metadata.
pub const METADATA_JSON: &str = "export-metadata.json";
/// Plain item tree.
pub const DATA_DIR: &str = "data";
/// Encrypted blob directory.
pub const ENCRYPTED_DIR: &str = "encrypted";
/// Viewer binaries.
pub const VIEWER_DIR: &str = "viewer";

/// Every name an export may create at the destination root.
pub const ARTIFACT_NAMES: &[&str] = &[
    TWEETS_DATA,
    DATA_ENC,
    MANIFEST_ENC,
    INDEX_HTML,
    README_TXT,
    METADATA_JSON,
    DATA_DIR,
    ENCRYPTED_DIR,
    VIEWER_DIR,
];

/// Entries operating systems drop on removable media; never treated as foreign.
const OS_NOISE: &[&str] = &[
    ".DS_Store",
    ".Trashes",
    ".Spotlight-V100",
    ".fseventsd",
    "System Volume Information",
    "$RECYCLE.BIN",
];

fn is_os_noise(name: &str) -> bool {
    OS_NOISE.contains(&name) || name.starts_with(".Trash-") || name.starts_with("._")
}

/// Relative directory of an item: `data/<YYYY>/<MM>/<author>_<YYYY-MM-DD>_<id>`.
pub fn item_dir(item: &ArchiveItem) -> String {
    format!(
        "{}/{}/{}_{}_{}",
        DATA_DIR,
        item.created_at.format("%Y/%m"),
        sanitize_component(&item.author),
        item.created_at.format("%Y-%m-%d"),
        sanitize_component(&item.id)
    )
}

/// Replaces characters that are unsafe on FAT/exFAT/NTFS with `_`.
pub fn sanitize_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Creates the destination if needed and removes artifacts of earlier runs,
/// including a `<dest>.zip` bundle next to it.
///
/// Fails with `DestinationConflict` when unrelated files are present, so
/// foreign data is never overwritten.
pub fn prepare_destination(dest: &Path) -> ExportResult<()> {
    fs::create_dir_all(dest).map_err(|e| ExportError::DestinationUnwritable {
        path: dest.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !dest.is_dir() {
        return Err(ExportError::DestinationUnwritable {
            path: dest.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    let mut foreign = Vec::new();
    for entry in fs::read_dir(dest)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if !ARTIFACT_NAMES.contains(&name.as_str()) && !is_os_noise(&name) {
            foreign.push(name);
        }
    }
    if !foreign.is_empty() {
        foreign.sort();
        return Err(ExportError::DestinationConflict {
            path: dest.to_path_buf(),
            foreign,
        });
    }

    let mut removed = remove_artifacts(dest)?;
    let bundle = bundle_path_for(dest);
    if bundle.is_file() {
        remove_if_exists(&bundle)?;
        removed += 1;
    }
    if removed > 0 {
        debug!(dest = %dest.display(), removed, "removed artifacts of a previous export");
    }
    check_writable(dest)
}

fn check_writable(dest: &Path) -> ExportResult<()> {
    let marker = dest.join(".postvault-write-check");
    let result = fs::File::create(&marker).and_then(|mut f| f.write_all(b"ok"));
    let _ = fs::remove_file(&marker);
    result.map_err(|e| ExportError::DestinationUnwritable {
        path: dest.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Removes every well-known artifact below `dest`. Idempotent; returns how many existed.
pub fn remove_artifacts(dest: &Path) -> ExportResult<usize> {
    let mut removed = 0;
    for name in ARTIFACT_NAMES {
        let path = dest.join(name);
        let meta = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        let result = if meta.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

/// Removes a file if present.
pub fn remove_if_exists(path: &Path) -> ExportResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not remove file");
            Err(e.into())
        }
    }
}

/// One item as it appears in `tweets-data.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedItem {
    /// Post id.
    pub id: String,
    /// Author handle.
    pub author: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Post text.
    pub text: String,
    /// Item directory relative to the export root.
    pub path: String,
    /// Avatar path relative to the export root.
    pub avatar: Option<String>,
    /// Media paths relative to the export root.
    pub media: Vec<String>,
    /// Full archived document.
    pub raw: serde_json::Value,
}

/// The `tweets-data.json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TweetsData {
    /// When the export was produced.
    pub exported_at: DateTime<Utc>,
    /// Number of items.
    pub count: usize,
    /// Exported items.
    pub items: Vec<ExportedItem>,
}

/// Contents of `export-metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    /// Export id.
    pub export_id: String,
    /// Crate version that produced the export.
    pub generator_version: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Finish time.
    pub finished_at: DateTime<Utc>,
    /// Whether the payload is encrypted.
    pub encrypted: bool,
    /// Items selected.
    pub total_items: u64,
    /// Items exported.
    pub exported_items: u64,
    /// Bytes written for item files.
    pub bytes_written: u64,
    /// Filters applied; omitted for encrypted exports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ExportFilter>,
}

/// Markdown summary written next to each item's `tweet.json`.
pub fn render_item_readme(item: &ArchiveItem) -> String {
    let mut out = format!(
        "# @{} ({})\n\n{}\n\n- id: {}\n",
        item.author,
        item.created_at.format("%Y-%m-%d %H:%M UTC"),
        item.text,
        item.id
    );
    if item.avatar.is_some() {
        out.push_str("- avatar: avatar.jpg\n");
    }
    for media in &item.media {
        if let Some(name) = media.file_name() {
            out.push_str(&format!("- media: media/{}\n", name.to_string_lossy()));
        }
    }
    out
}

/// Self-contained viewer with the export data injected.
pub fn render_index_html(data_json: &str) -> String {
    // "</" would close the script element early.
    let safe = data_json.replace("</", "<\\/");
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>PostVault export</title>
<style>
body {{ font-family: system-ui, sans-serif; max-width: 760px; margin: 2rem auto; padding: 0 1rem; }}
article {{ border-bottom: 1px solid #ddd; padding: 1rem 0; }}
.meta {{ color: #666; font-size: 0.85rem; }}
</style>
</head>
<body>
<h1>PostVault export</h1>
<input id="q" type="search" placeholder="Filter posts">
<div id="posts"></div>
<script type="application/json" id="postvault-data">{safe}</script>
<script>
const data = JSON.parse(document.getElementById('postvault-data').textContent);
const list = document.getElementById('posts');
function render(filter) {{
  list.replaceChildren();
  for (const item of data.items) {{
    const hay = (item.author + ' ' + item.text).toLowerCase();
    if (filter && !hay.includes(filter)) continue;
    const a = document.createElement('article');
    const meta = document.createElement('div');
    meta.className = 'meta';
    meta.textContent = '@' + item.author + ' · ' + item.created_at;
    const body = document.createElement('p');
    body.textContent = item.text;
    a.append(meta, body);
    for (const m of item.media) {{
      const link = document.createElement('a');
      link.href = m;
      link.textContent = m.split('/').pop();
      a.append(link, document.createTextNode(' '));
    }}
    list.append(a);
  }}
}}
document.getElementById('q').addEventListener('input', e => render(e.target.value.toLowerCase()));
render('');
</script>
</body>
</html>
"#
    )
}

/// Viewer placeholder for encrypted exports; carries no archive content.
pub fn render_encrypted_index_html() -> String {
    r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>PostVault export (encrypted)</title>
</head>
<body>
<h1>This PostVault export is encrypted</h1>
<p>The posts and media on this volume are protected with a password.
Open the archive with the PostVault viewer or restore it with
<code>pv-export restore</code> to read it.</p>
</body>
</html>
"#
    .to_string()
}

/// README for plain exports.
pub fn render_readme(item_count: u64, exported_at: DateTime<Utc>) -> String {
    format!(
        "PostVault export\n\
         ================\n\n\
         Exported {} posts on {}.\n\n\
         Open index.html in a browser to browse the archive offline.\n\
         tweets-data.json holds every post in machine-readable form.\n\
         data/<year>/<month>/<author>_<date>_<id>/ holds each post with its media.\n",
        item_count,
        exported_at.format("%Y-%m-%d %H:%M UTC")
    )
}

/// README for encrypted exports; mentions no archive content.
pub fn render_encrypted_readme(exported_at: DateTime<Utc>) -> String {
    format!(
        "PostVault export (encrypted)\n\
         ============================\n\n\
         Created on {}.\n\n\
         Everything in this export is encrypted with AES-256-GCM under a key\n\
         derived from your password with Argon2id. File names under encrypted/\n\
         are hashes and do not reveal the original structure.\n\n\
         To restore: pv-export restore --src <this directory> --out <directory>\n\
         The password is read from the PV_EXPORT_PASSWORD environment variable.\n",
        exported_at.format("%Y-%m-%d")
    )
}

/// Destination-relative path of the bundle for `dest` (`<dest>.zip`).
pub fn bundle_path_for(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "postvault-export".into());
    name.push(".zip");
    dest.with_file_name(name)
}
