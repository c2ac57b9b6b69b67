//! Process-wide notification of newly spawned workers.
//!
//! Controllers that need to know every worker pid (to drop privileges on it,
//! register it with a supervisor, or clean it up on a crash) install a hook
//! once at start-up. Every successful [`crate::launch`] then reports the new
//! id to it.

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::errors::HookError;
use crate::launcher::ProcessId;

const HOOK_TARGET: &str = "capchild::hook";

type PidHook = Box<dyn Fn(ProcessId) + Send + Sync + 'static>;

static WORKER_PID_HOOK: OnceCell<PidHook> = OnceCell::new();

/// Installs the hook called with the pid of every launched worker.
///
/// # Errors
///
/// Returns [`HookError::AlreadySet`] when a hook is already installed; the
/// existing hook stays in place.
pub fn set_worker_pid_hook<F>(hook: F) -> Result<(), HookError>
where
    F: Fn(ProcessId) + Send + Sync + 'static,
{
    WORKER_PID_HOOK
        .set(Box::new(hook))
        .map_err(|_| HookError::AlreadySet)
}

pub(crate) fn notify_worker_spawned(pid: ProcessId) {
    if let Some(hook) = WORKER_PID_HOOK.get() {
        debug!(target: HOOK_TARGET, pid = pid.as_u32(), "reporting worker pid");
        hook(pid);
    }
}
