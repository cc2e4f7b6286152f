//! Trigger-file polling loop (spec §4.K): checks `.cimian.bootstrap` and
//! `.cimian.headless` every 10 seconds, spawning a `managedsoftwareupdate`
//! child process when either file's modification time has advanced since
//! the last observation (or the file newly appeared), then removing the
//! trigger on a successful spawn. Spawning never blocks the poll loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc::Receiver;
use std::time::{Duration, SystemTime};

use cimian_client_core::{selfupdate, trigger};

const POLL_INTERVAL: Duration = Duration::from_secs(10);

fn managedsoftwareupdate_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("managedsoftwareupdate.exe")))
        .unwrap_or_else(|| PathBuf::from("managedsoftwareupdate.exe"))
}

fn spawn_driver(args: &[&str]) {
    let exe = managedsoftwareupdate_path();
    match Command::new(&exe).args(args).spawn() {
        Ok(child) => log::info!("spawned {} {:?} (pid {})", exe.display(), args, child.id()),
        Err(e) => log::error!("could not spawn {}: {}", exe.display(), e),
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Checks one trigger's modification time against `last_seen`, spawning the
/// Driver with `args` and clearing the trigger if it has advanced.
fn check_trigger(
    root: &Path,
    name: &'static str,
    trigger_path: &Path,
    args: &[&str],
    last_seen: &mut HashMap<&'static str, SystemTime>,
) {
    let Some(modified) = mtime(trigger_path) else {
        return;
    };
    if last_seen.get(name) == Some(&modified) {
        return;
    }
    last_seen.insert(name, modified);
    spawn_driver(args);
    let cleared = if name == "bootstrap" {
        trigger::clear_bootstrap_mode(root)
    } else {
        trigger::clear_headless_mode(root)
    };
    if let Err(e) = cleared {
        log::warn!("could not clear {} trigger after spawning: {}", name, e);
    }
}

/// Runs the poll loop. With `shutdown` set (service mode), returns as soon
/// as a stop signal arrives; with `shutdown` absent (`debug` mode), runs
/// until the process is killed.
pub fn run_loop(root: &Path, shutdown: Option<&Receiver<()>>) {
    match selfupdate::apply_pending(root) {
        Ok(selfupdate::SelfUpdateOutcome::Applied) => log::info!("applied pending self-update on startup"),
        Ok(selfupdate::SelfUpdateOutcome::Failed) => log::error!("pending self-update failed on startup; restored previous installation"),
        Ok(selfupdate::SelfUpdateOutcome::NothingPending) => {}
        Err(e) => log::warn!("could not check for a pending self-update on startup: {}", e),
    }

    let mut last_seen: HashMap<&'static str, SystemTime> = HashMap::new();
    let bootstrap_path = root.join(trigger::BOOTSTRAP_TRIGGER_NAME);
    let headless_path = root.join(trigger::HEADLESS_TRIGGER_NAME);

    loop {
        if let Some(rx) = shutdown {
            if rx.recv_timeout(POLL_INTERVAL).is_ok() {
                log::info!("watcher received stop signal");
                return;
            }
        } else {
            std::thread::sleep(POLL_INTERVAL);
        }

        check_trigger(root, "bootstrap", &bootstrap_path, &["--auto", "--show-status"], &mut last_seen);
        check_trigger(root, "headless", &headless_path, &["--auto"], &mut last_seen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_trigger_spawns_only_once_per_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let trigger_path = root.join(trigger::BOOTSTRAP_TRIGGER_NAME);
        trigger::set_bootstrap_mode(root, "test").unwrap();

        let mut last_seen = HashMap::new();
        let modified = mtime(&trigger_path).unwrap();
        last_seen.insert("bootstrap", modified);

        // The trigger file's mtime hasn't advanced since `last_seen`, and
        // it was already removed by a prior spawn in this scenario, so a
        // second check should see no file and do nothing.
        std::fs::remove_file(&trigger_path).unwrap();
        check_trigger(root, "bootstrap", &trigger_path, &["--auto"], &mut last_seen);
        assert!(!trigger::is_bootstrap_set(root));
    }
}
