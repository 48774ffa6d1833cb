//! Preflight check for the system ssh client.

use super::launcher::{Launcher, SystemLauncher};

/// Default ssh client binary
pub const SSH_PROGRAM: &str = "ssh";

/// Argument that makes ssh print its version and exit
const VERSION_ARG: &str = "-V";

/// Checks if `ssh` is installed on the system.
///
/// Runs `ssh -V` with all stdio discarded. Returns `false` rather than an
/// error when the binary is missing or fails to run.
pub async fn is_ssh_installed() -> bool {
    is_client_installed(&SystemLauncher, SSH_PROGRAM).await
}

/// Checks if `program` answers a version query successfully.
pub async fn is_client_installed(launcher: &dyn Launcher, program: &str) -> bool {
    let installed = launcher.probe(program, &[VERSION_ARG]).await;
    if !installed {
        tracing::debug!("{} is not installed or not runnable", program);
    }
    installed
}
