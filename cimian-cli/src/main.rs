mod cli;
mod status_channel;

use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Mutex;

use cimian_client_core::{catalog, config::Config, driver, facts, fetch::AnonymousCredentialProvider, plan, resolve, selfupdate, trigger};
use cimian_types::{EventRecord, RunType};
use structopt::StructOpt;

use cli::Opt;
use status_channel::StatusChannel;

const MANAGED_INSTALLS_ROOT: &str = r"C:\ProgramData\ManagedInstalls";
const DEFAULT_CONFIG_PATH: &str = r"C:\ProgramData\ManagedInstalls\Config.yaml";

fn main() {
    let opt = Opt::from_args();
    init_logging(opt.verbose);

    let root = PathBuf::from(MANAGED_INSTALLS_ROOT);
    let code = run(opt, &root);
    exit(code);
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();
}

fn run(opt: Opt, root: &Path) -> i32 {
    if opt.set_bootstrap_mode {
        return match trigger::set_bootstrap_mode(root, "managedsoftwareupdate") {
            Ok(()) => 0,
            Err(e) => fail(&e),
        };
    }
    if opt.clear_bootstrap_mode {
        return match trigger::clear_bootstrap_mode(root) {
            Ok(()) => 0,
            Err(e) => fail(&e),
        };
    }

    if opt.selfupdate_status || opt.check_selfupdate {
        return match selfupdate::read_marker(root) {
            Ok(Some(marker)) => {
                if opt.selfupdate_status {
                    for (key, value) in &marker {
                        println!("{}: {}", key, value);
                    }
                }
                0
            }
            Ok(None) => {
                if opt.selfupdate_status {
                    println!("no self-update pending");
                }
                1
            }
            Err(e) => fail(&e),
        };
    }

    if opt.clear_selfupdate {
        return match selfupdate::clear_marker(root) {
            Ok(()) => 0,
            Err(e) => fail(&e),
        };
    }

    let config_path = opt
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let cfg = match Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("configuration error: {}", e);
            return 2;
        }
    };

    if opt.show_config {
        return match serde_yaml::to_string(&cfg) {
            Ok(text) => {
                println!("{}", text);
                0
            }
            Err(e) => {
                log::error!("{}", e);
                1
            }
        };
    }

    if opt.perform_selfupdate {
        return match selfupdate::apply_pending(root) {
            Ok(selfupdate::SelfUpdateOutcome::NothingPending) => {
                println!("no self-update pending");
                1
            }
            Ok(selfupdate::SelfUpdateOutcome::Applied) => {
                println!("self-update applied");
                0
            }
            Ok(selfupdate::SelfUpdateOutcome::Failed) => {
                log::error!("self-update failed; restored previous installation");
                1
            }
            Err(e) => fail(&e),
        };
    }

    if opt.checkonly {
        return run_checkonly(&cfg);
    }

    let run_type = if opt.auto { RunType::Auto } else { RunType::Manual };
    let credentials = AnonymousCredentialProvider;

    let channel = if opt.show_status {
        Some(Mutex::new(StatusChannel::connect()))
    } else {
        None
    };
    let sink: Box<dyn Fn(&EventRecord)> = match &channel {
        Some(ch) => Box::new(move |event: &EventRecord| {
            if let Ok(mut ch) = ch.lock() {
                ch.forward_event(event);
            }
        }),
        None => Box::new(|_: &EventRecord| {}),
    };

    let result = driver::run_locked_with_sink(root, &cfg, run_type, &credentials, sink.as_ref());

    if let Some(ch) = &channel {
        if let Ok(mut ch) = ch.lock() {
            ch.quit();
        }
    }

    match result {
        Ok(summary) => {
            log::info!(
                "run {} complete: installed={} updated={} uninstalled={} failed={} warned={}",
                summary.session_id,
                summary.counters_installed,
                summary.counters_updated,
                summary.counters_uninstalled,
                summary.counters_failed,
                summary.counters_warned,
            );
            if summary.counters_failed > 0 {
                1
            } else {
                0
            }
        }
        Err(driver::DriverError::AlreadyRunning) => 4,
        Err(driver::DriverError::Plan(e)) => {
            log::error!("no plan could be produced: {}", e);
            3
        }
        Err(driver::DriverError::Manifest(e)) => {
            log::error!("configuration error resolving manifests: {}", e);
            2
        }
        Err(driver::DriverError::Catalog(e)) => {
            log::error!("configuration error loading catalogs: {}", e);
            2
        }
        Err(e) => {
            log::error!("run failed: {}", e);
            1
        }
    }
}

/// `--checkonly`: resolves the desired state and builds the dependency
/// plan without dispatching any installer, printing the candidate actions.
fn run_checkonly(cfg: &Config) -> i32 {
    let current_facts = facts::gather(cfg);
    let credentials = AnonymousCredentialProvider;

    let desired = match resolve::resolve_desired_state_blocking(cfg, &current_facts, &credentials) {
        Ok(d) => d,
        Err(e) => {
            log::error!("manifest resolution failed: {}", e);
            return 2;
        }
    };
    let catalog_index = match catalog::load_catalogs(cfg, &current_facts) {
        Ok(c) => c,
        Err(e) => {
            log::error!("catalog loading failed: {}", e);
            return 2;
        }
    };
    let candidates = match plan::build_plan(&desired, &catalog_index, &current_facts) {
        Ok(c) => c,
        Err(e) => {
            log::error!("no plan could be produced: {}", e);
            return 3;
        }
    };

    if candidates.is_empty() {
        println!("Nothing to do.");
    } else {
        for candidate in &candidates {
            println!("{:?} {}", candidate.action, candidate.name);
        }
    }
    0
}

fn fail<E: std::fmt::Display>(e: &E) -> i32 {
    log::error!("{}", e);
    1
}
