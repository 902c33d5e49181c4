// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The typed projection of one journal entry.
//!
//! A journal entry is a bag of key/value strings. [`project`] turns the
//! current entry of a [`Journal`] into a [`Record`] by walking an explicit
//! field-mapping table: one row per journal key, naming the decode shape and
//! the record attribute it lands in. Per-field decode failures downgrade the
//! single attribute to its zero value and never abort the projection.

use std::fmt;

use serde::{Serialize, Serializer};
use tracing::warn;

use crate::journal::Journal;
use crate::policy::FieldPolicy;

/// Syslog-style severity. Lower is more severe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    #[default]
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl Priority {
    pub const ALL: [Priority; 8] = [
        Priority::Emergency,
        Priority::Alert,
        Priority::Critical,
        Priority::Error,
        Priority::Warning,
        Priority::Notice,
        Priority::Info,
        Priority::Debug,
    ];

    /// Parses the journal's numeric encoding. Out-of-range values map to
    /// `Debug`, the least severe level.
    pub fn from_number(value: i64) -> Priority {
        match value {
            0 => Priority::Emergency,
            1 => Priority::Alert,
            2 => Priority::Critical,
            3 => Priority::Error,
            4 => Priority::Warning,
            5 => Priority::Notice,
            6 => Priority::Info,
            _ => Priority::Debug,
        }
    }

    /// Parses the configuration forms: the numeric string or the syslog
    /// keyword.
    pub fn from_keyword(value: &str) -> Option<Priority> {
        match value {
            "0" | "emerg" => Some(Priority::Emergency),
            "1" | "alert" => Some(Priority::Alert),
            "2" | "crit" => Some(Priority::Critical),
            "3" | "err" => Some(Priority::Error),
            "4" | "warning" => Some(Priority::Warning),
            "5" | "notice" => Some(Priority::Notice),
            "6" | "info" => Some(Priority::Info),
            "7" | "debug" => Some(Priority::Debug),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        self as u8
    }

    /// The fixed uppercase label used in serialized payloads.
    pub fn label(self) -> &'static str {
        match self {
            Priority::Emergency => "EMERG",
            Priority::Alert => "ALERT",
            Priority::Critical => "CRITICAL",
            Priority::Error => "ERROR",
            Priority::Warning => "WARNING",
            Priority::Notice => "NOTICE",
            Priority::Info => "INFO",
            Priority::Debug => "DEBUG",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// One normalized log event.
///
/// Either a normally decoded journal entry or a synthetic error record from
/// [`error_record`]; the two share this shape and flow through the same
/// pipeline. Zero-valued attributes are omitted from the serialized payload,
/// except `priority` and `message` which are always present.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Record {
    #[serde(rename = "instanceId", skip_serializing_if = "String::is_empty")]
    pub instance_id: String,

    /// Event time in milliseconds since the epoch. Carried as the wire-event
    /// timestamp, never serialized into the payload body.
    #[serde(skip)]
    pub time_usec: i64,

    #[serde(rename = "pid", skip_serializing_if = "is_zero")]
    pub pid: i64,
    #[serde(rename = "uid", skip_serializing_if = "is_zero")]
    pub uid: i64,
    #[serde(rename = "gid", skip_serializing_if = "is_zero")]
    pub gid: i64,
    #[serde(rename = "cmdName", skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(rename = "exe", skip_serializing_if = "String::is_empty")]
    pub executable: String,
    #[serde(rename = "cmdLine", skip_serializing_if = "String::is_empty")]
    pub command_line: String,
    #[serde(rename = "systemdUnit", skip_serializing_if = "String::is_empty")]
    pub systemd_unit: String,
    #[serde(rename = "bootId", skip_serializing_if = "String::is_empty")]
    pub boot_id: String,
    #[serde(rename = "machineId", skip_serializing_if = "String::is_empty")]
    pub machine_id: String,
    #[serde(rename = "hostname", skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(rename = "transport", skip_serializing_if = "String::is_empty")]
    pub transport: String,

    pub priority: Priority,
    pub message: String,

    #[serde(rename = "messageId", skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    #[serde(rename = "errno", skip_serializing_if = "is_zero")]
    pub errno: i64,

    /// Stamped by the delivery engine just before serialization. The sink
    /// orders events by receive time, so this is for traceability only.
    #[serde(rename = "seq", skip_serializing_if = "is_zero")]
    pub seq_id: i64,

    #[serde(rename = "syslogFacility", skip_serializing_if = "is_zero")]
    pub facility: i64,
    #[serde(rename = "syslogIdent", skip_serializing_if = "String::is_empty")]
    pub identifier: String,
    #[serde(rename = "syslogPid", skip_serializing_if = "is_zero")]
    pub syslog_pid: i64,

    #[serde(rename = "kernelDevice", skip_serializing_if = "String::is_empty")]
    pub device: String,
    #[serde(rename = "kernelSubsystem", skip_serializing_if = "String::is_empty")]
    pub subsystem: String,
    #[serde(rename = "kernelSysName", skip_serializing_if = "String::is_empty")]
    pub sys_name: String,
    #[serde(rename = "kernelDevNode", skip_serializing_if = "String::is_empty")]
    pub dev_node: String,
}

/// How a journal value decodes into its record attribute.
enum Decode {
    /// Raw string, trimmed to the policy's maximum length.
    Text(fn(&mut Record, String)),
    /// Base-10 integer; parse failure leaves the zero value.
    Number(fn(&mut Record, i64)),
    /// Microsecond counter, normalized to milliseconds.
    UsecToMillis(fn(&mut Record, i64)),
}

struct FieldMapping {
    key: &'static str,
    decode: Decode,
}

/// Journal key to record attribute, one row per projected field.
static FIELD_MAP: &[FieldMapping] = &[
    FieldMapping {
        key: "__REALTIME_TIMESTAMP",
        decode: Decode::UsecToMillis(|record, value| record.time_usec = value),
    },
    FieldMapping {
        key: "_PID",
        decode: Decode::Number(|record, value| record.pid = value),
    },
    FieldMapping {
        key: "_UID",
        decode: Decode::Number(|record, value| record.uid = value),
    },
    FieldMapping {
        key: "_GID",
        decode: Decode::Number(|record, value| record.gid = value),
    },
    FieldMapping {
        key: "_COMM",
        decode: Decode::Text(|record, value| record.command = value),
    },
    FieldMapping {
        key: "_EXE",
        decode: Decode::Text(|record, value| record.executable = value),
    },
    FieldMapping {
        key: "_CMDLINE",
        decode: Decode::Text(|record, value| record.command_line = value),
    },
    FieldMapping {
        key: "_SYSTEMD_UNIT",
        decode: Decode::Text(|record, value| record.systemd_unit = value),
    },
    FieldMapping {
        key: "_BOOT_ID",
        decode: Decode::Text(|record, value| record.boot_id = value),
    },
    FieldMapping {
        key: "_MACHINE_ID",
        decode: Decode::Text(|record, value| record.machine_id = value),
    },
    FieldMapping {
        key: "_HOSTNAME",
        decode: Decode::Text(|record, value| record.hostname = value),
    },
    FieldMapping {
        key: "_TRANSPORT",
        decode: Decode::Text(|record, value| record.transport = value),
    },
    FieldMapping {
        key: "PRIORITY",
        decode: Decode::Number(|record, value| record.priority = Priority::from_number(value)),
    },
    FieldMapping {
        key: "MESSAGE",
        decode: Decode::Text(|record, value| record.message = value),
    },
    FieldMapping {
        key: "MESSAGE_ID",
        decode: Decode::Text(|record, value| record.message_id = value),
    },
    FieldMapping {
        key: "ERRNO",
        decode: Decode::Number(|record, value| record.errno = value),
    },
    FieldMapping {
        key: "SYSLOG_FACILITY",
        decode: Decode::Number(|record, value| record.facility = value),
    },
    FieldMapping {
        key: "SYSLOG_IDENTIFIER",
        decode: Decode::Text(|record, value| record.identifier = value),
    },
    FieldMapping {
        key: "SYSLOG_PID",
        decode: Decode::Number(|record, value| record.syslog_pid = value),
    },
    FieldMapping {
        key: "_KERNEL_DEVICE",
        decode: Decode::Text(|record, value| record.device = value),
    },
    FieldMapping {
        key: "_KERNEL_SUBSYSTEM",
        decode: Decode::Text(|record, value| record.subsystem = value),
    },
    FieldMapping {
        key: "_UDEV_SYSNAME",
        decode: Decode::Text(|record, value| record.sys_name = value),
    },
    FieldMapping {
        key: "_UDEV_DEVNODE",
        decode: Decode::Text(|record, value| record.dev_node = value),
    },
];

/// Projects the journal's current entry into a [`Record`].
///
/// Keys the policy disallows, and keys that are absent or empty, leave their
/// attribute at the zero value. Every returned record carries a non-zero
/// timestamp: if the entry had none, it is backfilled from the journal's
/// realtime clock, falling back to the ingestion wall clock.
pub fn project(journal: &dyn Journal, policy: &FieldPolicy) -> Record {
    let mut record = Record::default();

    for mapping in FIELD_MAP {
        if !policy.allows(mapping.key) {
            continue;
        }
        let value = match journal.get_data_value(mapping.key) {
            Ok(value) if !value.is_empty() => value,
            _ => continue,
        };
        match mapping.decode {
            Decode::Text(set) => set(&mut record, policy.trim(value)),
            Decode::Number(set) => match value.parse::<i64>() {
                Ok(number) => set(&mut record, number),
                Err(_) => warn!(field = mapping.key, "can't convert field to an integer"),
            },
            Decode::UsecToMillis(set) => match value.parse::<i64>() {
                Ok(usec) => set(&mut record, usec / 1000),
                Err(_) => warn!(field = mapping.key, "can't convert field to a 64-bit integer"),
            },
        }
    }

    if record.time_usec == 0 {
        record.time_usec = match journal.get_realtime_usec() {
            Ok(usec) => (usec / 1000) as i64,
            Err(err) => {
                warn!("unable to read the entry time: {err}");
                chrono::Utc::now().timestamp_millis()
            }
        };
    }

    record
}

/// Command value stamped on synthetic error records.
pub const ERROR_RECORD_COMMAND: &str = "journal-relay";

/// Builds the synthetic record emitted when the journal itself fails, so the
/// failure is visible downstream with a timestamp of its own.
pub fn error_record(instance_id: &str, message: impl Into<String>) -> Record {
    Record {
        instance_id: instance_id.to_string(),
        command: ERROR_RECORD_COMMAND.to_string(),
        priority: Priority::Error,
        message: message.into(),
        time_usec: chrono::Utc::now().timestamp_millis(),
        ..Record::default()
    }
}
