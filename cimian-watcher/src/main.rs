mod service;
mod watcher;

use std::path::PathBuf;

use structopt::StructOpt;

use service::MANAGED_INSTALLS_ROOT;

/// `CimianWatcher`: the long-lived service that polls trigger files and
/// spawns `managedsoftwareupdate` runs (spec §4.K). Register/unregister and
/// start/stop mirror the standard Windows service-control verbs; `debug`
/// runs the same poll loop in the foreground for interactive testing.
#[derive(Debug, StructOpt)]
#[structopt(name = "CimianWatcher")]
enum Opt {
    Install,
    Remove,
    Start,
    Stop,
    Debug,
}

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Info).init();

    // No recognized subcommand means the OS service manager launched us
    // directly; dispatch into the service entry point instead of erroring.
    match Opt::from_args_safe() {
        Ok(Opt::Install) => report(service::install(), "installed"),
        Ok(Opt::Remove) => report(service::remove(), "removed"),
        Ok(Opt::Start) => report(service::start(), "started"),
        Ok(Opt::Stop) => report(service::stop(), "stopped"),
        Ok(Opt::Debug) => watcher::run_loop(&PathBuf::from(MANAGED_INSTALLS_ROOT), None),
        Err(_) => {
            if let Err(e) = service::run_service_dispatcher() {
                log::error!("service dispatcher failed: {}", e);
            }
        }
    }
}

fn report<E: std::fmt::Display>(result: Result<(), E>, verb: &str) {
    match result {
        Ok(()) => println!("CimianWatcher {}.", verb),
        Err(e) => eprintln!("CimianWatcher {} failed: {}", verb, e),
    }
}
