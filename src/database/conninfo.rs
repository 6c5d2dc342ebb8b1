/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Connection-string normalization.
//!
//! The agent accepts libpq-style `keyword=value` connection strings,
//! tolerating whitespace around the `=`. Parsing restricts the keywords to
//! the set the agent understands, validates the normalized string through
//! the driver's own parser, and re-emits the options in a fixed order so
//! that equivalent strings compare equal. The pool keys its sessions on that
//! canonical form; without a stable order, equivalent connections would miss
//! in the pool.
//!
//! `dbname` is extracted and held separately so the pool can substitute a
//! different database while keeping every other parameter.

use std::str::FromStr;

use crate::error::AgentError;

/// A parsed connection string: the canonical base (no `dbname`) plus the
/// default database it named, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    user: Option<String>,
    host: Option<String>,
    hostaddr: Option<String>,
    port: Option<u16>,
    password: Option<String>,
    connect_timeout: Option<u32>,
    dbname: Option<String>,
}

impl ConnectionInfo {
    /// Parses and validates a `keyword=value` connection string.
    ///
    /// Recognized keywords (case-insensitive): `user`, `host`, `hostaddr`,
    /// `port`, `password`, `connection_timeout` (accepted as an alias of the
    /// driver's `connect_timeout`), `dbname`. Anything else, a malformed
    /// pair, or a string naming none of user/host/dbname fails with
    /// [`AgentError::InvalidConnectionString`].
    pub fn parse(raw: &str) -> Result<Self, AgentError> {
        let normalized = normalize_whitespace(raw);

        let mut info = ConnectionInfo {
            user: None,
            host: None,
            hostaddr: None,
            port: None,
            password: None,
            connect_timeout: None,
            dbname: None,
        };

        for token in normalized.split(' ').filter(|t| !t.is_empty()) {
            let parts: Vec<&str> = token.split('=').collect();
            if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
                return Err(AgentError::InvalidConnectionString(format!(
                    "malformed option '{}'",
                    token
                )));
            }
            let (key, value) = (parts[0].to_ascii_lowercase(), parts[1]);

            match key.as_str() {
                "user" => info.user = Some(value.to_string()),
                "host" => info.host = Some(value.to_string()),
                "hostaddr" => info.hostaddr = Some(value.to_string()),
                "port" => {
                    let port = value.parse::<u16>().map_err(|_| {
                        AgentError::InvalidConnectionString(format!(
                            "port must be an unsigned integer, got '{}'",
                            value
                        ))
                    })?;
                    info.port = Some(port);
                }
                "password" => info.password = Some(value.to_string()),
                "connection_timeout" | "connect_timeout" => {
                    let secs = value.parse::<u32>().map_err(|_| {
                        AgentError::InvalidConnectionString(format!(
                            "connection timeout must be an unsigned integer, got '{}'",
                            value
                        ))
                    })?;
                    info.connect_timeout = Some(secs);
                }
                "dbname" => info.dbname = Some(value.to_string()),
                other => {
                    return Err(AgentError::InvalidConnectionString(format!(
                        "unknown keyword '{}'",
                        other
                    )));
                }
            }
        }

        if info.user.is_none() && info.host.is_none() && info.dbname.is_none() {
            return Err(AgentError::InvalidConnectionString(
                "no user, host or dbname specified".to_string(),
            ));
        }

        // Round the canonical form through the driver's parser; it is the
        // authority on what constitutes a connectable string.
        let canonical = info.connect_string(None);
        tokio_postgres::Config::from_str(&canonical)
            .map_err(|e| AgentError::InvalidConnectionString(e.to_string()))?;

        Ok(info)
    }

    /// The canonical base connection string, without `dbname`.
    pub fn base(&self) -> String {
        let mut out = String::new();
        let mut push = |key: &str, value: &str| {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        };

        if let Some(user) = &self.user {
            push("user", user);
        }
        if let Some(port) = self.port {
            if port != 0 {
                push("port", &port.to_string());
            }
        }
        if let Some(host) = &self.host {
            push("host", host);
        }
        if let Some(hostaddr) = &self.hostaddr {
            push("hostaddr", hostaddr);
        }
        if let Some(timeout) = self.connect_timeout {
            if timeout != 0 {
                push("connect_timeout", &timeout.to_string());
            }
        }
        if let Some(password) = &self.password {
            push("password", password);
        }
        out
    }

    /// The database named by the connection string, if any.
    pub fn dbname(&self) -> Option<&str> {
        self.dbname.as_deref()
    }

    /// The database a session will actually land in: the named `dbname`, or
    /// the user name by libpq convention.
    pub fn effective_dbname(&self) -> Option<&str> {
        self.dbname.as_deref().or(self.user.as_deref())
    }

    /// A full connect string targeting `dbname` (falling back to this
    /// string's own database, then to the driver default).
    pub fn connect_string(&self, dbname: Option<&str>) -> String {
        let mut out = self.base();
        if let Some(db) = dbname.or(self.dbname.as_deref()) {
            if !db.is_empty() {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str("dbname=");
                out.push_str(db);
            }
        }
        out
    }
}

/// Collapses whitespace runs so `prop = value` parses as `prop=value`, and
/// separates the remaining tokens with single spaces.
fn normalize_whitespace(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i].is_whitespace() {
            let mut j = i;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            let next_is_eq = j < chars.len() && chars[j] == '=';
            if !next_is_eq && !out.ends_with('=') && !out.is_empty() && j < chars.len() {
                out.push(' ');
            }
            i = j;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}
