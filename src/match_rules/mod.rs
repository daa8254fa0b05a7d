//! The match-rule engine.
//!
//! A match rule is a client-supplied filter expression over message fields
//! (`type='signal',interface='org.x',arg0namespace='a.b'`). This module
//! parses rule strings into canonical [`MatchRuleKeys`], serializes them
//! back, and evaluates them against the [`MatchFilter`] computed from a
//! message. The dispatch-side containers live in [`registry`].

pub mod registry;

use std::{cmp::Ordering, fmt};

use thiserror::Error;

use crate::{
    address::Address,
    message::{Arg, Message, MessageType},
    user::QuotaExceeded,
};

/// Highest body argument a rule can refer to, exclusive.
pub const MAX_ARGS: usize = 64;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum MatchError {
    #[error("invalid match rule")]
    Invalid,
    #[error("no such match rule")]
    NotFound,
    #[error(transparent)]
    Quota(#[from] QuotaExceeded),
}

/// The fields of one message a rule is filtered against.
///
/// Borrowed from the message for the duration of one dispatch. String args
/// fill both `args` and `argpaths`; object paths only `argpaths`.
#[derive(Clone, Copy, Debug)]
pub struct MatchFilter<'m> {
    pub ty: Option<MessageType>,
    pub sender: Option<u64>,
    pub destination: Option<u64>,
    pub interface: Option<&'m str>,
    pub member: Option<&'m str>,
    pub path: Option<&'m str>,
    pub args: [Option<&'m str>; MAX_ARGS],
    pub argpaths: [Option<&'m str>; MAX_ARGS],
}

impl<'m> MatchFilter<'m> {
    pub fn for_message(
        msg: &'m Message,
        sender: Option<u64>,
        destination: Option<u64>,
    ) -> Self {
        let mut args = [None; MAX_ARGS];
        let mut argpaths = [None; MAX_ARGS];
        for (i, arg) in msg.args.iter().take(MAX_ARGS).enumerate() {
            match arg {
                Arg::Str(s) => {
                    args[i] = Some(s.as_str());
                    argpaths[i] = Some(s.as_str());
                }
                Arg::ObjectPath(p) => argpaths[i] = Some(p.as_str()),
                Arg::Other => (),
            }
        }
        Self {
            ty: Some(msg.header.ty),
            sender,
            destination,
            interface: msg.header.interface.as_deref(),
            member: msg.header.member.as_deref(),
            path: msg.header.path.as_deref(),
            args,
            argpaths,
        }
    }
}

/// The canonicalized, parsed form of a match rule string.
#[derive(Clone, Debug)]
pub struct MatchRuleKeys {
    pub ty: Option<MessageType>,
    pub sender: Option<String>,
    /// Resolved id when `sender` is a unique id. Filled at link time, so
    /// that rules naming a not-yet-allocated id can wait in the wildcard
    /// registry until it is assigned.
    pub sender_id: Option<u64>,
    pub destination: Option<String>,
    /// Resolved id when `destination` is a unique id.
    pub destination_id: Option<u64>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub path_namespace: Option<String>,
    pub arg0namespace: Option<String>,
    pub eavesdrop: bool,
    pub args: Box<[Option<String>; MAX_ARGS]>,
    pub argpaths: Box<[Option<String>; MAX_ARGS]>,
}

fn empty_args() -> Box<[Option<String>; MAX_ARGS]> {
    Box::new(std::array::from_fn(|_| None))
}

fn type_rank(ty: Option<MessageType>) -> u8 {
    match ty {
        None => 0,
        Some(MessageType::MethodCall) => 1,
        Some(MessageType::MethodReturn) => 2,
        Some(MessageType::Error) => 3,
        Some(MessageType::Signal) => 4,
    }
}

// The ordering deduplicates rules per owner, so it covers exactly the
// client-supplied keys; the resolved ids are derived (and `sender_id` is
// rewritten at link time) and must not take part.
impl Ord for MatchRuleKeys {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.sender, &self.destination, &self.interface, &self.member, &self.path)
            .cmp(&(&other.sender, &other.destination, &other.interface, &other.member, &other.path))
            .then_with(|| self.path_namespace.cmp(&other.path_namespace))
            .then_with(|| self.arg0namespace.cmp(&other.arg0namespace))
            .then_with(|| type_rank(self.ty).cmp(&type_rank(other.ty)))
            .then_with(|| self.eavesdrop.cmp(&other.eavesdrop))
            .then_with(|| self.args.cmp(&other.args))
            .then_with(|| self.argpaths.cmp(&other.argpaths))
    }
}

impl PartialOrd for MatchRuleKeys {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MatchRuleKeys {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MatchRuleKeys {}

impl Default for MatchRuleKeys {
    fn default() -> Self {
        Self {
            ty: None,
            sender: None,
            sender_id: None,
            destination: None,
            destination_id: None,
            interface: None,
            member: None,
            path: None,
            path_namespace: None,
            arg0namespace: None,
            eavesdrop: false,
            args: empty_args(),
            argpaths: empty_args(),
        }
    }
}

impl MatchRuleKeys {
    /// Parses a rule string.
    ///
    /// Grammar: comma-separated `key=value` pairs. Values may be
    /// single-quoted; outside quotes `\'` is a literal apostrophe and any
    /// other backslash stands for itself, inside quotes a backslash stands
    /// for itself and an apostrophe closes the quoted span.
    pub fn parse(rule_string: &str) -> Result<Self, MatchError> {
        let mut keys = Self::default();
        let mut rest = rule_string;
        loop {
            // leading whitespace and stray equal signs
            rest = rest.trim_start_matches([' ', '\t', '\n', '\r', '=']);
            if rest.is_empty() {
                break;
            }
            let n_key = rest.find([' ', '\t', '\n', '\r', '=']).ok_or(MatchError::Invalid)?;
            let key = &rest[..n_key];
            rest = rest[n_key..].trim_start_matches([' ', '\t', '\n', '\r']);
            rest = rest.strip_prefix('=').ok_or(MatchError::Invalid)?;

            let (value, tail, balanced) = unquote_value(rest);
            if !balanced {
                return Err(MatchError::Invalid);
            }
            rest = tail;
            keys.assign(key, value)?;
        }
        Ok(keys)
    }

    fn assign(&mut self, key: &str, value: String) -> Result<(), MatchError> {
        match key {
            "type" => {
                if self.ty.is_some() {
                    return Err(MatchError::Invalid);
                }
                self.ty = Some(match value.as_str() {
                    "signal" => MessageType::Signal,
                    "method_call" => MessageType::MethodCall,
                    "method_return" => MessageType::MethodReturn,
                    "error" => MessageType::Error,
                    _ => return Err(MatchError::Invalid),
                });
            }
            "sender" => set_once(&mut self.sender, value)?,
            "destination" => {
                let id = Address::from_str(&value).id();
                set_once(&mut self.destination, value)?;
                self.destination_id = id;
            }
            "interface" => set_once(&mut self.interface, value)?,
            "member" => set_once(&mut self.member, value)?,
            "path" => {
                if self.path_namespace.is_some() {
                    return Err(MatchError::Invalid);
                }
                set_once(&mut self.path, value)?;
            }
            "path_namespace" => {
                if self.path.is_some() {
                    return Err(MatchError::Invalid);
                }
                set_once(&mut self.path_namespace, value)?;
            }
            "eavesdrop" => {
                self.eavesdrop = match value.as_str() {
                    "true" => true,
                    "false" => false,
                    _ => return Err(MatchError::Invalid),
                };
            }
            "arg0namespace" => {
                if self.args[0].is_some() || self.argpaths[0].is_some() {
                    return Err(MatchError::Invalid);
                }
                set_once(&mut self.arg0namespace, value)?;
            }
            _ => {
                let suffix = key.strip_prefix("arg").ok_or(MatchError::Invalid)?;
                self.assign_arg(suffix, value)?;
            }
        }
        Ok(())
    }

    fn assign_arg(&mut self, suffix: &str, value: String) -> Result<(), MatchError> {
        let bytes = suffix.as_bytes();
        let mut n = 0;
        let mut digits = 0;
        while digits < 2 && digits < bytes.len() && bytes[digits].is_ascii_digit() {
            n = n * 10 + (bytes[digits] - b'0') as usize;
            digits += 1;
        }
        if digits == 0 || n >= MAX_ARGS {
            return Err(MatchError::Invalid);
        }
        if n == 0 && self.arg0namespace.is_some() {
            return Err(MatchError::Invalid);
        }
        if self.args[n].is_some() || self.argpaths[n].is_some() {
            return Err(MatchError::Invalid);
        }
        match &suffix[digits..] {
            "" => self.args[n] = Some(value),
            "path" => self.argpaths[n] = Some(value),
            _ => return Err(MatchError::Invalid),
        }
        Ok(())
    }

    /// Whether every constraint of this rule is satisfied by `filter`.
    pub fn matches_filter(&self, filter: &MatchFilter<'_>) -> bool {
        if self.ty.is_some() && self.ty != filter.ty {
            return false;
        }
        if self.destination_id.is_some() && self.destination_id != filter.destination {
            return false;
        }
        if self.sender_id.is_some() && self.sender_id != filter.sender {
            return false;
        }
        if !opt_matches(&self.interface, filter.interface) {
            return false;
        }
        if !opt_matches(&self.member, filter.member) {
            return false;
        }
        if !opt_matches(&self.path, filter.path) {
            return false;
        }
        if let Some(ns) = &self.path_namespace {
            match filter.path {
                Some(path) if string_prefix(path, ns, '/', false) => (),
                _ => return false,
            }
        }
        // XXX: arg0 is not verified to be a (potentially single-label) bus name
        if let Some(ns) = &self.arg0namespace {
            match filter.args[0] {
                Some(arg0) if string_prefix(arg0, ns, '.', false) => (),
                _ => return false,
            }
        }
        for i in 0..MAX_ARGS {
            if !opt_matches(&self.args[i], filter.args[i]) {
                return false;
            }
            if let Some(want) = &self.argpaths[i] {
                let Some(have) = filter.argpaths[i] else {
                    return false;
                };
                if !string_prefix(have, want, '/', true) && !string_prefix(want, have, '/', true) {
                    return false;
                }
            }
        }
        true
    }
}

fn set_once(slot: &mut Option<String>, value: String) -> Result<(), MatchError> {
    if slot.is_some() {
        return Err(MatchError::Invalid);
    }
    *slot = Some(value);
    Ok(())
}

fn opt_matches(key: &Option<String>, field: Option<&str>) -> bool {
    match key {
        None => true,
        Some(want) => field == Some(want.as_str()),
    }
}

/// Whether `prefix` is a `delimiter`-bounded prefix of `string`.
///
/// With `delimiter_included`, the delimiter belongs to the prefix itself
/// (`/a/b/` prefixes `/a/b/c`); otherwise it must follow it (`/a/b`
/// prefixes `/a/b/c`). Equal strings always match.
fn string_prefix(string: &str, prefix: &str, delimiter: char, delimiter_included: bool) -> bool {
    let Some(tail) = string.strip_prefix(prefix) else {
        return false;
    };
    if tail.is_empty() {
        return true;
    }
    if delimiter_included {
        !prefix.is_empty() && prefix.ends_with(delimiter)
    } else {
        tail.starts_with(delimiter)
    }
}

/// Removes quoting from one value, stopping at the first unquoted comma.
/// Returns the value, the unconsumed remainder, and whether all quotes were
/// balanced.
fn unquote_value(s: &str) -> (String, &str, bool) {
    let mut value = String::new();
    let mut quoted = false;
    let mut rest = s;
    loop {
        while let Some(r) = rest.strip_prefix('\'') {
            rest = r;
            quoted = !quoted;
        }
        let Some(c) = rest.chars().next() else {
            break;
        };
        match c {
            ',' => {
                rest = &rest[1..];
                if quoted {
                    value.push(',');
                } else {
                    break;
                }
            }
            '\\' => {
                rest = &rest[1..];
                if !quoted && rest.starts_with('\'') {
                    rest = &rest[1..];
                    value.push('\'');
                } else {
                    value.push('\\');
                }
            }
            c => {
                rest = &rest[c.len_utf8()..];
                value.push(c);
            }
        }
    }
    (value, rest, !quoted)
}

fn write_pair(f: &mut fmt::Formatter<'_>, first: &mut bool, key: &str, value: &str) -> fmt::Result {
    if !*first {
        f.write_str(",")?;
    }
    *first = false;
    write!(f, "{key}='")?;
    let mut chunks = value.split('\'');
    if let Some(chunk) = chunks.next() {
        f.write_str(chunk)?;
    }
    for chunk in chunks {
        write!(f, "'\\''{chunk}")?;
    }
    f.write_str("'")
}

/// Canonical serialization; parsing it yields the same keys back.
impl fmt::Display for MatchRuleKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        if let Some(ty) = self.ty {
            let ty = match ty {
                MessageType::Signal => "signal",
                MessageType::MethodCall => "method_call",
                MessageType::MethodReturn => "method_return",
                MessageType::Error => "error",
            };
            write_pair(f, &mut first, "type", ty)?;
        }
        for (key, value) in [
            ("sender", &self.sender),
            ("destination", &self.destination),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("path_namespace", &self.path_namespace),
            ("arg0namespace", &self.arg0namespace),
        ] {
            if let Some(value) = value {
                write_pair(f, &mut first, key, value)?;
            }
        }
        if self.eavesdrop {
            write_pair(f, &mut first, "eavesdrop", "true")?;
        }
        for i in 0..MAX_ARGS {
            if let Some(value) = &self.args[i] {
                write_pair(f, &mut first, &format!("arg{i}"), value)?;
            }
            if let Some(value) = &self.argpaths[i] {
                write_pair(f, &mut first, &format!("arg{i}path"), value)?;
            }
        }
        Ok(())
    }
}
