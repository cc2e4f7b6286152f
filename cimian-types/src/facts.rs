use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::predicate::FactValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    Laptop,
    Desktop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinedType {
    Domain,
    Hybrid,
    Entra,
    Workgroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryState {
    Charging,
    Discharging,
    Full,
    NoBattery,
    Unknown,
}

/// A read-only snapshot of the host taken once per Driver run. Every
/// sub-probe that gathers one of these fields is tolerant of partial
/// failure (see `cimian_client_core::facts::gather`): a failed probe
/// yields the empty string / neutral value rather than aborting the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemFacts {
    pub hostname: String,
    pub arch: String,
    pub os_vers_major: u32,
    pub os_vers_minor: u32,
    pub build_number: u32,
    pub domain: String,
    pub username: String,
    pub machine_type: MachineType,
    pub machine_model: String,
    pub serial_number: String,
    pub joined_type: JoinedType,
    pub catalogs: Vec<String>,
    pub enrolled_usage: String,
    pub enrolled_area: String,
    pub device_id: String,
    pub battery_state: BatteryState,
    pub date: DateTime<Utc>,
}

impl SystemFacts {
    /// Flattens this snapshot into the key/value space the predicate
    /// evaluator runs `ConditionExpression`s against. Keys match the field
    /// names used throughout manifest conditionals (`arch`, `catalogs`,
    /// `enrolled_usage`, ...).
    pub fn as_fact_map(&self) -> HashMap<String, FactValue> {
        let mut map = HashMap::new();
        map.insert("hostname".into(), FactValue::Str(self.hostname.clone()));
        map.insert("arch".into(), FactValue::Str(self.arch.clone()));
        map.insert(
            "os_vers_major".into(),
            FactValue::Number(self.os_vers_major as f64),
        );
        map.insert(
            "os_vers_minor".into(),
            FactValue::Number(self.os_vers_minor as f64),
        );
        map.insert(
            "build_number".into(),
            FactValue::Number(self.build_number as f64),
        );
        map.insert("domain".into(), FactValue::Str(self.domain.clone()));
        map.insert("username".into(), FactValue::Str(self.username.clone()));
        map.insert(
            "machine_type".into(),
            FactValue::Str(
                match self.machine_type {
                    MachineType::Laptop => "laptop",
                    MachineType::Desktop => "desktop",
                }
                .to_string(),
            ),
        );
        map.insert(
            "machine_model".into(),
            FactValue::Str(self.machine_model.clone()),
        );
        map.insert(
            "serial_number".into(),
            FactValue::Str(self.serial_number.clone()),
        );
        map.insert(
            "joined_type".into(),
            FactValue::Str(
                match self.joined_type {
                    JoinedType::Domain => "domain",
                    JoinedType::Hybrid => "hybrid",
                    JoinedType::Entra => "entra",
                    JoinedType::Workgroup => "workgroup",
                }
                .to_string(),
            ),
        );
        map.insert(
            "catalogs".into(),
            FactValue::List(self.catalogs.clone()),
        );
        map.insert(
            "enrolled_usage".into(),
            FactValue::Str(self.enrolled_usage.clone()),
        );
        map.insert(
            "enrolled_area".into(),
            FactValue::Str(self.enrolled_area.clone()),
        );
        map.insert("device_id".into(), FactValue::Str(self.device_id.clone()));
        map.insert(
            "battery_state".into(),
            FactValue::Str(
                match self.battery_state {
                    BatteryState::Charging => "charging",
                    BatteryState::Discharging => "discharging",
                    BatteryState::Full => "full",
                    BatteryState::NoBattery => "no_battery",
                    BatteryState::Unknown => "unknown",
                }
                .to_string(),
            ),
        );
        map.insert("date".into(), FactValue::Str(self.date.to_rfc3339()));
        map
    }
}
