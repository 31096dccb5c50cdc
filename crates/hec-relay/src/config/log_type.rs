// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log stream types a listener can be dedicated to.

use std::fmt;
use std::str::FromStr;

/// The eight streaming log types producers can point at a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogType {
    UserActivity,
    UserStatus,
    AppConnectorStatus,
    PseStatus,
    BrowserAccess,
    Audit,
    AppConnectorMetrics,
    PseMetrics,
}

impl LogType {
    pub const ALL: [LogType; 8] = [
        LogType::UserActivity,
        LogType::UserStatus,
        LogType::AppConnectorStatus,
        LogType::PseStatus,
        LogType::BrowserAccess,
        LogType::Audit,
        LogType::AppConnectorMetrics,
        LogType::PseMetrics,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogType::UserActivity => "user-activity",
            LogType::UserStatus => "user-status",
            LogType::AppConnectorStatus => "app-connector-status",
            LogType::PseStatus => "pse-status",
            LogType::BrowserAccess => "browser-access",
            LogType::Audit => "audit",
            LogType::AppConnectorMetrics => "app-connector-metrics",
            LogType::PseMetrics => "pse-metrics",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLogType(pub String);

impl FromStr for LogType {
    type Err = UnknownLogType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        LogType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| UnknownLogType(s.to_string()))
    }
}
