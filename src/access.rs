//! Identity and permission checks applied at every externally reachable entry.
//!
//! Checks read only the caller's [`CallerIdentity`] and the process-wide
//! [`BuildMode`]. The privileged identity ([`PRIVILEGED_UID`]) passes the uid
//! and context checks unconditionally; it is the only bypass.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::stats::DaemonStats;

pub const AID_ROOT: u32 = 0;
pub const AID_SYSTEM: u32 = 1000;
pub const AID_SHELL: u32 = 2000;

/// Identity exempt from uid and security-context checks.
pub const PRIVILEGED_UID: u32 = AID_ROOT;

/// Security context of the tracing probes allowed to manage live subscriptions.
pub const TRACED_PROBES_CONTEXT: &str = "u:r:traced_probes:s0";

pub const PERMISSION_DUMP: &str = "android.permission.DUMP";
pub const PERMISSION_REGISTER_PULL_ATOM: &str = "android.permission.REGISTER_STATS_PULL_ATOM";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("uid {actual} is not allowed; expected {expected}")]
    UidMismatch { expected: u32, actual: u32 },
    #[error("security context {actual:?} is not allowed; expected {expected}")]
    ContextMismatch {
        expected: String,
        actual: Option<String>,
    },
    #[error("uid {uid} (pid {pid}) lacks permission {permission}")]
    PermissionDenied {
        permission: String,
        pid: i32,
        uid: u32,
    },
    #[error("uid {0} may not run shell commands")]
    ShellRequired(u32),
    #[error("malformed uid {0:?}")]
    MalformedUid(String),
    #[error("uid {caller} may not act as uid {target}")]
    ImpersonationDenied { caller: u32, target: u32 },
}

/// Build flavor of the device; debuggable builds relax impersonation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    #[default]
    User,
    UserDebug,
    Eng,
}

impl BuildMode {
    pub fn is_debuggable(self) -> bool {
        matches!(self, BuildMode::UserDebug | BuildMode::Eng)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildMode::User => "user",
            BuildMode::UserDebug => "userdebug",
            BuildMode::Eng => "eng",
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is calling. Computed per call by the transport; never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub pid: i32,
    pub uid: u32,
    pub security_context: Option<String>,
}

impl CallerIdentity {
    pub fn new(pid: i32, uid: u32) -> Self {
        Self {
            pid,
            uid,
            security_context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.security_context = Some(context.into());
        self
    }

    pub fn is_privileged(&self) -> bool {
        self.uid == PRIVILEGED_UID
    }
}

/// Answers whether a process holds a named permission.
pub trait PermissionOracle: Send + Sync {
    fn check_permission(&self, permission: &str, pid: i32, uid: u32) -> bool;
}

/// Permission oracle backed by an explicit grant table.
#[derive(Debug, Clone, Default)]
pub struct GrantTable {
    grants: BTreeMap<String, BTreeSet<u32>>,
}

impl GrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, permission: impl Into<String>, uid: u32) -> Self {
        self.grants.entry(permission.into()).or_default().insert(uid);
        self
    }
}

impl PermissionOracle for GrantTable {
    fn check_permission(&self, permission: &str, _pid: i32, uid: u32) -> bool {
        self.grants
            .get(permission)
            .is_some_and(|uids| uids.contains(&uid))
    }
}

#[derive(Clone)]
pub struct AccessGate {
    build_mode: BuildMode,
    stats: Arc<DaemonStats>,
}

impl AccessGate {
    pub fn new(build_mode: BuildMode, stats: Arc<DaemonStats>) -> Self {
        Self { build_mode, stats }
    }

    pub fn build_mode(&self) -> BuildMode {
        self.build_mode
    }

    /// Passes iff the caller is `expected` or privileged.
    pub fn check_uid(&self, caller: &CallerIdentity, expected: u32) -> Result<(), AccessError> {
        if caller.uid == expected || caller.is_privileged() {
            return Ok(());
        }
        self.reject(AccessError::UidMismatch {
            expected,
            actual: caller.uid,
        })
    }

    /// Passes iff the caller's security context is `expected` or the caller is
    /// privileged.
    pub fn check_context(
        &self,
        caller: &CallerIdentity,
        expected: &str,
    ) -> Result<(), AccessError> {
        if caller.is_privileged() || caller.security_context.as_deref() == Some(expected) {
            return Ok(());
        }
        self.reject(AccessError::ContextMismatch {
            expected: expected.to_string(),
            actual: caller.security_context.clone(),
        })
    }

    pub fn check_permission(
        &self,
        caller: &CallerIdentity,
        permission: &str,
        oracle: &dyn PermissionOracle,
    ) -> Result<(), AccessError> {
        if oracle.check_permission(permission, caller.pid, caller.uid) {
            return Ok(());
        }
        self.reject(AccessError::PermissionDenied {
            permission: permission.to_string(),
            pid: caller.pid,
            uid: caller.uid,
        })
    }

    /// Only root and shell reach the command entry point.
    pub fn check_shell(&self, caller: &CallerIdentity) -> Result<(), AccessError> {
        if caller.uid == AID_ROOT || caller.uid == AID_SHELL {
            return Ok(());
        }
        self.reject(AccessError::ShellRequired(caller.uid))
    }

    /// Resolves a uid named on the command line, enforcing who may act as whom.
    pub fn resolve_target_uid(
        &self,
        caller: &CallerIdentity,
        raw: &str,
    ) -> Result<u32, AccessError> {
        let target = match parse_uid(raw) {
            Ok(target) => target,
            Err(err) => return self.reject(err),
        };
        let allowed = self.build_mode.is_debuggable()
            || target == caller.uid
            || (caller.uid == AID_ROOT && target == AID_SHELL);
        if allowed {
            return Ok(target);
        }
        self.reject(AccessError::ImpersonationDenied {
            caller: caller.uid,
            target,
        })
    }

    fn reject<T>(&self, err: AccessError) -> Result<T, AccessError> {
        self.stats.note_access_rejected();
        warn!(error = %err, "access check rejected caller");
        Err(err)
    }
}

/// Parses `raw` the way `strtol(raw, &end, 0)` would, accepting only a full,
/// non-negative value that fits a uid.
pub fn parse_uid(raw: &str) -> Result<u32, AccessError> {
    let malformed = || AccessError::MalformedUid(raw.to_string());
    let mut text = raw.trim_start();
    let mut negative = false;
    if let Some(rest) = text.strip_prefix('-') {
        negative = true;
        text = rest;
    } else if let Some(rest) = text.strip_prefix('+') {
        text = rest;
    }
    let (radix, digits) = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) if hex.starts_with(|c: char| c.is_ascii_hexdigit()) => (16, hex),
        _ if text.starts_with('0') => (8, text),
        _ => (10, text),
    };
    if digits.is_empty() {
        return Err(malformed());
    }
    let mut value: u64 = 0;
    for c in digits.chars() {
        let digit = c.to_digit(radix).ok_or_else(malformed)?;
        value = value
            .checked_mul(u64::from(radix))
            .and_then(|v| v.checked_add(u64::from(digit)))
            .filter(|v| *v <= u64::from(u32::MAX))
            .ok_or_else(malformed)?;
    }
    if negative && value != 0 {
        return Err(malformed());
    }
    u32::try_from(value).map_err(|_| malformed())
}
