//! Broker configuration.
//!
//! Loaded from the [XML configuration files] of the reference bus. Only the
//! elements the engine itself consumes are interpreted — the quota
//! `<limit>`s — the rest of the vocabulary is accepted and ignored.
//! Policy loading is the embedder's concern.
//!
//! [XML configuration files]: https://dbus.freedesktop.org/doc/dbus-daemon.1.html#configuration_file

use std::{fs::read_to_string, path::Path};

use anyhow::{Error, Result};
use serde::Deserialize;
use tracing::warn;

use crate::user::Limits;

/// The broker configuration.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Config {
    /// Per-user quota caps.
    pub limits: Limits,
}

impl Config {
    pub fn parse(s: &str) -> Result<Self> {
        quick_xml::de::from_str::<Document>(s)
            .map_err(Error::msg)?
            .try_into()
    }

    pub fn read_file(file_path: impl AsRef<Path>) -> Result<Self> {
        Self::parse(&read_to_string(file_path)?)
    }
}

impl TryFrom<Document> for Config {
    type Error = Error;

    fn try_from(value: Document) -> Result<Self> {
        let mut config = Config::default();
        for element in value.busconfig {
            if let Element::Limit(limit) = element {
                apply_limit(&mut config.limits, &limit);
            }
        }
        Ok(config)
    }
}

fn apply_limit(limits: &mut Limits, limit: &LimitElement) {
    match limit.name.as_str() {
        "max_outgoing_bytes" => limits.max_bytes = limit.value,
        "max_incoming_unix_fds" | "max_outgoing_unix_fds" => limits.max_fds = limit.value,
        "max_match_rules_per_connection" => limits.max_matches = limit.value,
        "max_connections_per_user" => limits.max_objects = limit.value,
        "max_names_per_connection" => limits.max_names = limit.value,
        "max_replies_per_connection" => limits.max_replies = limit.value,
        name => warn!("ignoring unsupported limit `{name}`"),
    }
}

#[derive(Debug, Default, Deserialize)]
struct Document {
    #[serde(rename = "$value", default)]
    busconfig: Vec<Element>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Element {
    AllowAnonymous,
    Auth(String),
    Fork,
    Include(AnyElement),
    Includedir(String),
    KeepUmask,
    Limit(LimitElement),
    Listen(String),
    Pidfile(String),
    Policy(AnyElement),
    Servicedir(String),
    Servicehelper(String),
    StandardSessionServicedirs,
    StandardSystemServicedirs,
    Syslog,
    Type(AnyElement),
    User(String),
}

/// An element whose attributes and content are accepted but not
/// interpreted here.
#[derive(Debug, Default, Deserialize)]
struct AnyElement {}

#[derive(Debug, Deserialize)]
struct LimitElement {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "$text")]
    value: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parse_with_dtd_and_root_element_ok() {
        let input = r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
        "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
        <busconfig></busconfig>
        "#;
        let config = Config::parse(input).expect("should parse XML input");
        assert_eq!(config.limits, Limits::default());
    }

    #[test]
    fn config_parse_applies_limits() {
        let input = r#"<busconfig>
            <limit name="max_match_rules_per_connection">64</limit>
            <limit name="max_names_per_connection">4</limit>
            <limit name="max_outgoing_bytes">1048576</limit>
            <limit name="max_replies_per_connection">8</limit>
        </busconfig>"#;
        let config = Config::parse(input).unwrap();
        assert_eq!(config.limits.max_matches, 64);
        assert_eq!(config.limits.max_names, 4);
        assert_eq!(config.limits.max_bytes, 1024 * 1024);
        assert_eq!(config.limits.max_replies, 8);
        assert_eq!(config.limits.max_fds, Limits::default().max_fds);
    }

    #[test]
    fn config_parse_ignores_foreign_elements() {
        let input = r#"<busconfig>
            <type>session</type>
            <auth>EXTERNAL</auth>
            <listen>unix:path=/tmp/bus</listen>
            <policy context="default">
                <allow own="*"/>
                <deny send_interface="com.x.Secret"/>
            </policy>
            <limit name="max_names_per_connection">2</limit>
        </busconfig>"#;
        let config = Config::parse(input).unwrap();
        assert_eq!(config.limits.max_names, 2);
    }

    #[test]
    fn config_parse_with_unknown_limit_name_keeps_defaults() {
        let input = r#"<busconfig>
            <limit name="service_start_timeout">120000</limit>
        </busconfig>"#;
        let config = Config::parse(input).unwrap();
        assert_eq!(config.limits, Limits::default());
    }

    #[test]
    fn config_parse_with_malformed_limit_value_fails() {
        let input = r#"<busconfig>
            <limit name="max_names_per_connection">lots</limit>
        </busconfig>"#;
        assert!(Config::parse(input).is_err());
    }
}
