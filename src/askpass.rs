//! 4.C Askpass Helper: a scoped secret-delivery channel for `sshfs`/`ssh`'s
//! `SSH_ASKPASS` mechanism. The password never appears on a command line; it
//! is delivered through a process-group-private environment variable that a
//! tiny generated script echoes back to the caller.

use std::fs;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use rand::distr::Alphanumeric;
use rand::Rng;
use regex::Regex;

use crate::error::CoreError;

static VAR_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

/// Live handle to a scoped askpass script and its environment. Dropping it
/// removes the backing temp directory on every exit path, including panics
/// unwinding through `with_context`.
pub struct AskpassContext {
    pub script_path: PathBuf,
    pub env: Vec<(String, String)>,
    pub secrets: Vec<String>,
    _dir: tempfile::TempDir,
}

/// Create a scoped askpass context, invoke `f` with it, and guarantee
/// teardown of the temp directory once `f` resolves (successfully, with an
/// error, or via unwind).
pub async fn with_context<F, Fut, T>(password: &str, f: F) -> Result<T, CoreError>
where
    F: FnOnce(AskpassContext) -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let ctx = create_context(password)?;
    f(ctx).await
}

fn create_context(password: &str) -> Result<AskpassContext, CoreError> {
    let dir = tempfile::Builder::new()
        .prefix("mountkeepd-askpass-")
        .tempdir()
        .map_err(|e| CoreError::validation(format!("failed to create askpass temp dir: {e}")))?;
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700))
        .map_err(|e| CoreError::validation(format!("failed to set askpass dir permissions: {e}")))?;

    let var_name = random_var_name();
    debug_assert!(VAR_NAME_RE.is_match(&var_name));

    let script_path = dir.path().join("askpass.sh");
    let script = format!("#!/bin/sh\nprintf '%s' \"${var_name}\"\n");
    fs::write(&script_path, script)
        .map_err(|e| CoreError::validation(format!("failed to write askpass script: {e}")))?;
    fs::set_permissions(&script_path, fs::Permissions::from_mode(0o600))
        .map_err(|e| CoreError::validation(format!("failed to lock down askpass script: {e}")))?;
    fs::set_permissions(&script_path, fs::Permissions::from_mode(0o700))
        .map_err(|e| CoreError::validation(format!("failed to make askpass script executable: {e}")))?;

    let env = vec![
        ("SSH_ASKPASS".to_string(), script_path.to_string_lossy().to_string()),
        ("SSH_ASKPASS_REQUIRE".to_string(), "force".to_string()),
        ("DISPLAY".to_string(), "1".to_string()),
        (var_name, password.to_string()),
    ];

    Ok(AskpassContext { script_path, env, secrets: vec![password.to_string()], _dir: dir })
}

fn random_var_name() -> String {
    let suffix: String = rand::rng().sample_iter(&Alphanumeric).take(10).map(char::from).collect();
    format!("MK_ASKPASS_{suffix}")
}
