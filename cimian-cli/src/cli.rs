use std::path::PathBuf;

use structopt::StructOpt;

/// Command-line surface for `managedsoftwareupdate` (spec §6 "Process
/// surface (CLI)"). Flat flag set, no subcommands: this tool runs exactly
/// one reconciliation pass (or one introspection action) per invocation.
#[derive(Debug, StructOpt)]
#[structopt(
    name = "managedsoftwareupdate",
    bin_name = "managedsoftwareupdate",
    about = "Reconciles installed software against Cimian catalogs and manifests."
)]
pub struct Opt {
    /// Scheduled/service run.
    #[structopt(long)]
    pub auto: bool,

    /// Plan only; no installs.
    #[structopt(long)]
    pub checkonly: bool,

    /// Open the local status channel on 127.0.0.1:19847.
    #[structopt(long = "show-status")]
    pub show_status: bool,

    /// Log verbosity: -v, -vv, or -vvv.
    #[structopt(short = "v", parse(from_occurrences))]
    pub verbose: u8,

    /// Create the bootstrap trigger file.
    #[structopt(long = "set-bootstrap-mode")]
    pub set_bootstrap_mode: bool,

    /// Delete the bootstrap trigger file.
    #[structopt(long = "clear-bootstrap-mode")]
    pub clear_bootstrap_mode: bool,

    /// Print the pending self-update marker, if any.
    #[structopt(long = "selfupdate-status")]
    pub selfupdate_status: bool,

    /// Alias of `--selfupdate-status`, exit 0 if a self-update is pending.
    #[structopt(long = "check-selfupdate")]
    pub check_selfupdate: bool,

    /// Delete the self-update marker without applying it.
    #[structopt(long = "clear-selfupdate")]
    pub clear_selfupdate: bool,

    /// Force the Watcher's deferred self-update to run now, in-process.
    #[structopt(long = "perform-selfupdate")]
    pub perform_selfupdate: bool,

    /// Print the effective configuration and exit.
    #[structopt(long = "show-config")]
    pub show_config: bool,

    /// Overrides the default `Config.yaml` search path.
    #[structopt(long = "config-path", parse(from_os_str))]
    pub config_path: Option<PathBuf>,
}
