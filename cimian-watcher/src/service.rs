//! OS service registration and control (spec §4.K, §6 "Watcher service"):
//! `install`/`remove`/`start`/`stop` register `CimianWatcher` with the OS
//! service manager; the no-argument invocation (how the service manager
//! itself launches the binary) dispatches into the service's main loop.
//!
//! No teacher module covers this — `divvun-pahkat` ships no service
//! binary — so this is grounded directly on the `windows-service` crate's
//! own dispatcher/control-handler idiom rather than adapted from teacher
//! code.

use std::fmt;

pub const SERVICE_NAME: &str = "CimianWatcher";
pub const MANAGED_INSTALLS_ROOT: &str = r"C:\ProgramData\ManagedInstalls";

#[derive(Debug)]
pub struct ServiceError(String);

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(windows)]
mod windows_impl {
    use std::ffi::OsString;
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::time::Duration;

    use windows_service::service::{
        ServiceAccess, ServiceControl, ServiceControlAccept, ServiceErrorControl, ServiceExitCode,
        ServiceInfo, ServiceStartType, ServiceState, ServiceStatus, ServiceType,
    };
    use windows_service::service_control_handler::{self, ServiceControlHandlerResult};
    use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};
    use windows_service::{define_windows_service, service_dispatcher};

    use super::{ServiceError, MANAGED_INSTALLS_ROOT, SERVICE_NAME};

    impl From<windows_service::Error> for ServiceError {
        fn from(e: windows_service::Error) -> Self {
            ServiceError(e.to_string())
        }
    }

    const SERVICE_TYPE: ServiceType = ServiceType::OWN_PROCESS;

    define_windows_service!(ffi_service_main, service_main);

    fn service_main(_arguments: Vec<OsString>) {
        let _ = eventlog::init(SERVICE_NAME, log::Level::Info);
        if let Err(e) = run_service() {
            log::error!("service exited with error: {}", e);
        }
    }

    fn run_service() -> windows_service::Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel();

        let event_handler = move |control_event| -> ServiceControlHandlerResult {
            match control_event {
                ServiceControl::Stop => {
                    let _ = shutdown_tx.send(());
                    ServiceControlHandlerResult::NoError
                }
                ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
                _ => ServiceControlHandlerResult::NotImplemented,
            }
        };

        let status_handle = service_control_handler::register(SERVICE_NAME, event_handler)?;

        status_handle.set_service_status(ServiceStatus {
            service_type: SERVICE_TYPE,
            current_state: ServiceState::Running,
            controls_accepted: ServiceControlAccept::STOP,
            exit_code: ServiceExitCode::Win32(0),
            checkpoint: 0,
            wait_hint: Duration::default(),
            process_id: None,
        })?;

        crate::watcher::run_loop(&PathBuf::from(MANAGED_INSTALLS_ROOT), Some(&shutdown_rx));

        status_handle.set_service_status(ServiceStatus {
            service_type: SERVICE_TYPE,
            current_state: ServiceState::Stopped,
            controls_accepted: ServiceControlAccept::empty(),
            exit_code: ServiceExitCode::Win32(0),
            checkpoint: 0,
            wait_hint: Duration::default(),
            process_id: None,
        })?;

        Ok(())
    }

    pub fn run_service_dispatcher() -> Result<(), ServiceError> {
        service_dispatcher::start(SERVICE_NAME, ffi_service_main).map_err(ServiceError::from)
    }

    pub fn install() -> Result<(), ServiceError> {
        let manager = ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CREATE_SERVICE)?;
        let exe_path = std::env::current_exe().map_err(|e| ServiceError(e.to_string()))?;

        let info = ServiceInfo {
            name: OsString::from(SERVICE_NAME),
            display_name: OsString::from("Cimian Watcher"),
            service_type: SERVICE_TYPE,
            start_type: ServiceStartType::AutoStart,
            error_control: ServiceErrorControl::Normal,
            executable_path: exe_path,
            launch_arguments: vec![],
            dependencies: vec![],
            account_name: None,
            account_password: None,
        };

        let service = manager.create_service(&info, ServiceAccess::CHANGE_CONFIG)?;
        service.set_description("Polls Cimian trigger files and dispatches reconciliation runs.")?;
        Ok(())
    }

    pub fn remove() -> Result<(), ServiceError> {
        let manager = ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)?;
        let service = manager.open_service(SERVICE_NAME, ServiceAccess::STOP | ServiceAccess::DELETE)?;
        let _ = service.stop();
        service.delete().map_err(ServiceError::from)
    }

    pub fn start() -> Result<(), ServiceError> {
        let manager = ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)?;
        let service = manager.open_service(SERVICE_NAME, ServiceAccess::START)?;
        service.start::<&str>(&[]).map_err(ServiceError::from)
    }

    pub fn stop() -> Result<(), ServiceError> {
        let manager = ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)?;
        let service = manager.open_service(SERVICE_NAME, ServiceAccess::STOP)?;
        service.stop()?;
        Ok(())
    }
}

#[cfg(windows)]
pub use windows_impl::{install, remove, run_service_dispatcher, start, stop};

#[cfg(not(windows))]
mod stub {
    use super::ServiceError;

    fn unsupported() -> ServiceError {
        ServiceError("OS service registration is only supported on Windows".to_string())
    }

    pub fn install() -> Result<(), ServiceError> {
        Err(unsupported())
    }

    pub fn remove() -> Result<(), ServiceError> {
        Err(unsupported())
    }

    pub fn start() -> Result<(), ServiceError> {
        Err(unsupported())
    }

    pub fn stop() -> Result<(), ServiceError> {
        Err(unsupported())
    }

    pub fn run_service_dispatcher() -> Result<(), ServiceError> {
        Err(unsupported())
    }
}

#[cfg(not(windows))]
pub use stub::{install, remove, run_service_dispatcher, start, stop};
