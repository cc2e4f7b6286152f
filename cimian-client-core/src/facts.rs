//! Host probing for the Config & Facts component (spec §4.A).
//!
//! `gather` never fails: each sub-probe that can fail independently is
//! wrapped so a failure degrades to the empty string / neutral value rather
//! than aborting the run, matching the teacher's tolerance for partial
//! platform-API failure.

use chrono::Utc;
use cimian_types::{BatteryState, JoinedType, MachineType, SystemFacts};
use log::warn;

use crate::config::Config;

pub fn gather(cfg: &Config) -> SystemFacts {
    SystemFacts {
        hostname: probe("hostname", hostname),
        arch: probe("arch", arch),
        os_vers_major: probe_or("os_vers_major", os_version_major, 0),
        os_vers_minor: probe_or("os_vers_minor", os_version_minor, 0),
        build_number: probe_or("build_number", build_number, 0),
        domain: probe("domain", domain),
        username: probe("username", username),
        machine_type: probe_or("machine_type", machine_type, MachineType::Desktop),
        machine_model: probe("machine_model", machine_model),
        serial_number: probe("serial_number", serial_number),
        joined_type: probe_or("joined_type", joined_type, JoinedType::Workgroup),
        catalogs: cfg.catalog_list(),
        enrolled_usage: String::new(),
        enrolled_area: String::new(),
        device_id: probe("device_id", device_id),
        battery_state: probe_or("battery_state", battery_state, BatteryState::Unknown),
        date: Utc::now(),
    }
}

fn probe<F: FnOnce() -> Option<String>>(name: &str, f: F) -> String {
    f().unwrap_or_else(|| {
        warn!("fact probe `{}` failed; using empty string", name);
        String::new()
    })
}

fn probe_or<T, F: FnOnce() -> Option<T>>(name: &str, f: F, default: T) -> T {
    f().unwrap_or_else(|| {
        warn!("fact probe `{}` failed; using default", name);
        default
    })
}

fn hostname() -> Option<String> {
    Some(whoami::hostname())
}

fn arch() -> Option<String> {
    Some(
        match whoami::arch() {
            whoami::Arch::X64 => "x64",
            whoami::Arch::X86 => "x86",
            whoami::Arch::Arm64 => "arm64",
            _ => "x64",
        }
        .to_string(),
    )
}

fn username() -> Option<String> {
    Some(whoami::username())
}

fn domain() -> Option<String> {
    #[cfg(windows)]
    {
        win::domain()
    }
    #[cfg(not(windows))]
    {
        None
    }
}

fn joined_type() -> Option<JoinedType> {
    #[cfg(windows)]
    {
        win::joined_type()
    }
    #[cfg(not(windows))]
    {
        None
    }
}

fn os_version_major() -> Option<u32> {
    #[cfg(windows)]
    {
        win::os_version().map(|(major, _, _)| major)
    }
    #[cfg(not(windows))]
    {
        None
    }
}

fn os_version_minor() -> Option<u32> {
    #[cfg(windows)]
    {
        win::os_version().map(|(_, minor, _)| minor)
    }
    #[cfg(not(windows))]
    {
        None
    }
}

fn build_number() -> Option<u32> {
    #[cfg(windows)]
    {
        win::os_version().map(|(_, _, build)| build)
    }
    #[cfg(not(windows))]
    {
        None
    }
}

fn machine_type() -> Option<MachineType> {
    #[cfg(windows)]
    {
        win::machine_type()
    }
    #[cfg(not(windows))]
    {
        None
    }
}

fn machine_model() -> Option<String> {
    #[cfg(windows)]
    {
        win::machine_model()
    }
    #[cfg(not(windows))]
    {
        None
    }
}

fn serial_number() -> Option<String> {
    #[cfg(windows)]
    {
        win::serial_number()
    }
    #[cfg(not(windows))]
    {
        None
    }
}

fn device_id() -> Option<String> {
    #[cfg(windows)]
    {
        win::device_id()
    }
    #[cfg(not(windows))]
    {
        None
    }
}

fn battery_state() -> Option<BatteryState> {
    #[cfg(windows)]
    {
        win::battery_state()
    }
    #[cfg(not(windows))]
    {
        None
    }
}

#[cfg(windows)]
mod win {
    use cimian_types::{BatteryState, JoinedType, MachineType};
    use winreg::enums::*;
    use winreg::RegKey;

    pub fn os_version() -> Option<(u32, u32, u32)> {
        let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
        let key = hklm
            .open_subkey(r"SOFTWARE\Microsoft\Windows NT\CurrentVersion")
            .ok()?;
        let major: u32 = key.get_value("CurrentMajorVersionNumber").ok()?;
        let minor: u32 = key.get_value("CurrentMinorVersionNumber").ok()?;
        let build: String = key.get_value("CurrentBuildNumber").ok()?;
        Some((major, minor, build.parse().ok()?))
    }

    pub fn domain() -> Option<String> {
        let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
        let key = hklm
            .open_subkey(r"SYSTEM\CurrentControlSet\Services\Tcpip\Parameters")
            .ok()?;
        key.get_value("Domain").ok().filter(|s: &String| !s.is_empty())
    }

    pub fn joined_type() -> Option<JoinedType> {
        let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
        if hklm
            .open_subkey(r"SYSTEM\CurrentControlSet\Control\CloudDomainJoin\JoinInfo")
            .is_ok()
        {
            return Some(JoinedType::Entra);
        }
        if domain().is_some() {
            return Some(JoinedType::Domain);
        }
        Some(JoinedType::Workgroup)
    }

    pub fn machine_type() -> Option<MachineType> {
        let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
        let key = hklm.open_subkey(r"SYSTEM\CurrentControlSet\Control\SystemInformation").ok()?;
        let model: String = key.get_value("SystemProductName").unwrap_or_default();
        if model.to_ascii_lowercase().contains("laptop") || model.to_ascii_lowercase().contains("book") {
            Some(MachineType::Laptop)
        } else {
            Some(MachineType::Desktop)
        }
    }

    pub fn machine_model() -> Option<String> {
        let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
        let key = hklm.open_subkey(r"SYSTEM\CurrentControlSet\Control\SystemInformation").ok()?;
        key.get_value("SystemProductName").ok()
    }

    pub fn serial_number() -> Option<String> {
        let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
        let key = hklm.open_subkey(r"SYSTEM\CurrentControlSet\Control\SystemInformation").ok()?;
        key.get_value("SystemSKU").ok()
    }

    pub fn device_id() -> Option<String> {
        let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
        let key = hklm
            .open_subkey(r"SOFTWARE\Microsoft\Cryptography")
            .ok()?;
        key.get_value("MachineGuid").ok()
    }

    pub fn battery_state() -> Option<BatteryState> {
        // No battery-state probe is wired to a real Windows power API here;
        // hosts without one simply report `Unknown` via the caller's default.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_falls_back_to_default_on_none() {
        let value = probe_or::<u32, _>("fake", || None, 42);
        assert_eq!(value, 42);
    }

    #[test]
    fn test_probe_falls_back_to_empty_string_on_none() {
        let value = probe::<_>("fake", || None);
        assert_eq!(value, "");
    }
}
