//! 4.B Mount Table Inspector: parse `/sbin/mount` (and a `df -P` fallback)
//! into [`MountRecord`]s, keyed by normalized mount point.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::CoreError;
use crate::model::MountRecord;
use crate::path;
use crate::process::ProcessExecutor;

const MOUNT_PATH: &str = "/sbin/mount";
const DF_PATH: &str = "/bin/df";
const MOUNT_TIMEOUT: Duration = Duration::from_secs(3);
const DF_TIMEOUT: Duration = Duration::from_secs(3);

/// `<source> on <mount point> (<fs type>, <opt>, ...)`, macOS/BSD `mount(8)`
/// listing format.
static MOUNT_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.*) on (.*) \(([^,\)]+)").unwrap());

pub struct MountTableInspector {
    executor: Arc<dyn ProcessExecutor>,
}

impl MountTableInspector {
    pub fn new(executor: Arc<dyn ProcessExecutor>) -> Self {
        Self { executor }
    }

    /// All mount-table records, from the primary `mount` listing. Falls back
    /// to nothing if the command itself fails to run; callers needing
    /// per-path resilience should use [`Self::find`].
    pub async fn records(&self) -> Result<Vec<MountRecord>, CoreError> {
        let out = self.executor.run(MOUNT_PATH, &[], &[], MOUNT_TIMEOUT, None, None).await?;
        if out.timed_out || !out.success() {
            return Err(CoreError::classify_process_message(out.exit_code, &out.combined()));
        }
        Ok(parse_mount_listing(&out.stdout))
    }

    /// Look up the record for `path`, trying the primary listing first and
    /// falling back to `df -P <path>` when the primary times out or yields
    /// nothing parseable. Matches on the resolved (symlink-free) form of
    /// both sides when possible, since `path::normalize` is pure string
    /// manipulation and a mount point reached through a symlinked parent
    /// (e.g. a home directory alias) won't match a literal string compare.
    pub async fn find(&self, path: &str) -> Result<Option<MountRecord>, CoreError> {
        let normalized = path::normalize(path);
        let resolved = resolve_symlinks(&normalized).await;
        match self.executor.run(MOUNT_PATH, &[], &[], MOUNT_TIMEOUT, None, None).await {
            Ok(out) if !out.timed_out && out.success() => {
                for record in parse_mount_listing(&out.stdout) {
                    let candidate = path::normalize(&record.mount_point);
                    if candidate == normalized {
                        return Ok(Some(record));
                    }
                    if resolve_symlinks(&candidate).await == resolved {
                        return Ok(Some(record));
                    }
                }
            }
            _ => {}
        }
        self.find_via_df(&normalized).await
    }

    async fn find_via_df(&self, normalized_path: &str) -> Result<Option<MountRecord>, CoreError> {
        let out = self
            .executor
            .run(DF_PATH, &["-P".into(), normalized_path.into()], &[], DF_TIMEOUT, None, None)
            .await?;
        if out.timed_out || !out.success() {
            return Ok(None);
        }
        Ok(parse_df_output(&out.stdout))
    }
}

/// Best-effort symlink resolution: falls back to the input unchanged if the
/// path doesn't exist yet or `canonicalize` otherwise fails.
async fn resolve_symlinks(normalized_path: &str) -> String {
    match tokio::fs::canonicalize(normalized_path).await {
        Ok(resolved) => path::normalize(&resolved.to_string_lossy()),
        Err(_) => normalized_path.to_string(),
    }
}

/// Decode `mount(8)`'s octal-escaped whitespace (`\040` -> space, and so on).
pub fn decode_octal_escapes(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b)) {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap();
            if let Ok(value) = u8::from_str_radix(octal, 8) {
                out.push(value as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

pub fn parse_mount_listing(output: &str) -> Vec<MountRecord> {
    output
        .lines()
        .filter_map(|line| {
            let caps = MOUNT_LINE.captures(line)?;
            Some(MountRecord {
                source: decode_octal_escapes(caps.get(1)?.as_str().trim()),
                mount_point: path::normalize(&decode_octal_escapes(caps.get(2)?.as_str().trim())),
                fs_type: caps.get(3)?.as_str().trim().to_string(),
            })
        })
        .collect()
}

/// Parse `df -P <path>` output: a header line followed by exactly one data
/// line (or a data line wrapped onto a second line when the filesystem name
/// is long). Returns at most one record.
pub fn parse_df_output(output: &str) -> Option<MountRecord> {
    let mut lines = output.lines().filter(|l| !l.trim().is_empty());
    let _header = lines.next()?;
    let rest: Vec<&str> = lines.collect();
    let joined = rest.join(" ");
    let fields: Vec<&str> = joined.split_whitespace().collect();
    if fields.len() < 2 {
        return None;
    }
    let mount_point = fields[fields.len() - 1];
    let source = fields[0];
    Some(MountRecord {
        source: decode_octal_escapes(source),
        mount_point: path::normalize(&decode_octal_escapes(mount_point)),
        fs_type: "unknown".to_string(),
    })
}
