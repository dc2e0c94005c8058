//! Line-oriented validation of SSH config text.
//!
//! Every problem is reported as `line N: <message>`; the store refuses to
//! persist content that fails validation.

use once_cell::sync::Lazy;
use std::collections::HashSet;

use super::parser::{split_directive, unquote};
use crate::error::{Error, Result};

/// Longest hostname accepted for `HostName` values (RFC 1035 ceiling).
pub const MAX_HOSTNAME_LEN: usize = 253;

static BOOLEAN_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "batchmode",
        "checkhostip",
        "clearallforwardings",
        "compression",
        "exitonforwardfailure",
        "forwardagent",
        "forwardx11",
        "forwardx11trusted",
        "gatewayports",
        "hashknownhosts",
        "identitiesonly",
        "permitlocalcommand",
        "tcpkeepalive",
        "visualhostkey",
    ]
    .into_iter()
    .collect()
});

static NUMERIC_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    ["serveraliveinterval", "serveralivemaxcount", "connecttimeout"]
        .into_iter()
        .collect()
});

static VALUE_REQUIRED_KEYS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["identityfile", "hostname", "user", "proxycommand"].into_iter().collect());

const MATCH_VALUE_CRITERIA: [&str; 6] =
    ["user", "host", "address", "localaddress", "localport", "rdomain"];
const MATCH_FLAG_CRITERIA: [&str; 2] = ["canonical", "all"];

/// Validates config text; returns all problems joined into one
/// [`Error::Validation`].
pub fn validate(text: &str) -> Result<()> {
    let mut errors = Vec::new();
    for (idx, raw) in text.split('\n').enumerate() {
        let line_no = idx + 1;
        if let Some(problem) = check_line(raw) {
            errors.push(format!("line {line_no}: {problem}"));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(errors.join("; ")))
    }
}

fn is_quoted_empty(token: &str) -> bool {
    token.trim() == "\"\""
}

fn check_line(raw: &str) -> Option<String> {
    let body = raw.trim_end_matches('\r');
    if body.trim().is_empty() || body.trim_start().starts_with('#') {
        return None;
    }

    let indented = body.starts_with(' ') || body.starts_with('\t');
    let (key, rest) = split_directive(body)?;
    let lower = key.to_ascii_lowercase();

    if !indented {
        return match lower.as_str() {
            "host" => check_host_decl(&rest),
            "match" => check_match_decl(&rest),
            "include" => check_include(&rest),
            _ => Some(format!("parameter '{key}' must be indented")),
        };
    }

    check_param(&key, &lower, &rest)
}

fn check_host_decl(rest: &str) -> Option<String> {
    if rest.trim().is_empty() {
        return Some("Host requires an argument".to_string());
    }
    for token in rest.split_whitespace() {
        if is_quoted_empty(token) {
            return Some("Host pattern must not be an empty quoted string".to_string());
        }
    }
    None
}

fn check_include(rest: &str) -> Option<String> {
    let value = unquote(rest);
    if value.is_empty() {
        return Some("Include requires a path".to_string());
    }
    if value.contains('\n') {
        return Some("Include path must not contain a newline".to_string());
    }
    None
}

fn check_match_decl(rest: &str) -> Option<String> {
    let mut tokens = rest.split_whitespace().peekable();
    let mut valid_criteria = 0usize;
    while let Some(token) = tokens.next() {
        let lower = token.to_ascii_lowercase();
        if MATCH_FLAG_CRITERIA.contains(&lower.as_str()) {
            valid_criteria += 1;
            continue;
        }
        if MATCH_VALUE_CRITERIA.contains(&lower.as_str()) {
            match tokens.next() {
                Some(value) if !unquote(value).is_empty() => valid_criteria += 1,
                _ => return Some(format!("Match criterion '{token}' requires a value")),
            }
            continue;
        }
        return Some(format!("invalid Match criterion '{token}'"));
    }
    if valid_criteria == 0 {
        return Some("Match requires at least one criterion".to_string());
    }
    None
}

fn check_param(key: &str, lower: &str, rest: &str) -> Option<String> {
    let value = unquote(rest);

    if rest.trim().is_empty() || is_quoted_empty(rest) {
        return Some(format!("parameter '{key}' requires a value"));
    }

    match lower {
        "port" => {
            let port: u64 = match value.parse() {
                Ok(port) => port,
                Err(_) => return Some("Port must be a number between 1 and 65535".to_string()),
            };
            if !(1..=65535).contains(&port) {
                return Some("Port must be a number between 1 and 65535".to_string());
            }
        }
        "protocol" => {
            if value != "1" && value != "2" {
                return Some("Protocol must be 1 or 2".to_string());
            }
        }
        "hostname" => {
            if value.is_empty() {
                return Some(format!("parameter '{key}' requires a value"));
            }
            if value.len() > MAX_HOSTNAME_LEN {
                return Some(format!(
                    "hostname too long (max {MAX_HOSTNAME_LEN} characters)"
                ));
            }
        }
        _ if NUMERIC_KEYS.contains(lower) => {
            if value.parse::<u64>().is_err() {
                return Some(format!("{key} must be a number"));
            }
        }
        _ if BOOLEAN_KEYS.contains(lower) => {
            let normalized = value.to_ascii_lowercase();
            if !matches!(normalized.as_str(), "yes" | "no" | "true" | "false") {
                return Some(format!("{key} must be yes or no"));
            }
        }
        _ if VALUE_REQUIRED_KEYS.contains(lower) => {
            if value.is_empty() {
                return Some(format!("parameter '{key}' requires a value"));
            }
        }
        _ => {}
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err_of(text: &str) -> String {
        match validate(text) {
            Err(Error::Validation(msg)) => msg,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn valid_config_passes() {
        let text = "# comment\nHost web\n  HostName example.com\n  Port 22\n  Compression yes\n\nMatch User deploy\n  IdentityFile ~/.ssh/id\n";
        assert!(validate(text).is_ok());
    }

    #[test]
    fn unindented_parameter_is_rejected() {
        let msg = err_of("Host a\nHostName x\n");
        assert!(msg.contains("line 2: parameter 'HostName' must be indented"));
    }

    #[test]
    fn host_without_argument() {
        assert!(err_of("Host\n").contains("line 1: Host requires an argument"));
        assert!(err_of("Host \"\"\n").contains("empty quoted"));
    }

    #[test]
    fn include_requires_path() {
        assert!(err_of("Include\n").contains("line 1: Include requires a path"));
    }

    #[test]
    fn port_bounds() {
        assert!(validate("Host a\n  Port 1\n").is_ok());
        assert!(validate("Host a\n  Port 22\n").is_ok());
        assert!(validate("Host a\n  Port 65535\n").is_ok());
        assert!(err_of("Host a\n  Port 0\n").contains("between 1 and 65535"));
        assert!(err_of("Host a\n  Port 65536\n").contains("between 1 and 65535"));
        assert!(err_of("Host a\n  Port ssh\n").contains("between 1 and 65535"));
    }

    #[test]
    fn protocol_must_be_1_or_2() {
        assert!(validate("Host a\n  Protocol 2\n").is_ok());
        assert!(err_of("Host a\n  Protocol 3\n").contains("Protocol must be 1 or 2"));
    }

    #[test]
    fn boolean_keys_accept_yes_no_true_false() {
        for value in ["yes", "No", "TRUE", "false"] {
            assert!(validate(&format!("Host a\n  Compression {value}\n")).is_ok());
        }
        assert!(err_of("Host a\n  Compression maybe\n").contains("must be yes or no"));
    }

    #[test]
    fn keepalive_keys_must_be_numeric() {
        assert!(validate("Host a\n  ServerAliveInterval 30\n").is_ok());
        assert!(err_of("Host a\n  ServerAliveInterval soon\n")
            .contains("ServerAliveInterval must be a number"));
        assert!(err_of("Host a\n  ConnectTimeout x\n").contains("ConnectTimeout must be a number"));
    }

    #[test]
    fn hostname_length_boundary() {
        let ok = "a".repeat(MAX_HOSTNAME_LEN);
        assert!(validate(&format!("Host a\n  HostName {ok}\n")).is_ok());
        let long = "a".repeat(MAX_HOSTNAME_LEN + 1);
        assert!(err_of(&format!("Host a\n  HostName {long}\n")).contains("hostname too long"));
    }

    #[test]
    fn wildcard_hostname_is_allowed() {
        assert!(validate("Host a\n  HostName *\n").is_ok());
    }

    #[test]
    fn empty_quoted_values_are_rejected() {
        assert!(err_of("Host a\n  HostName \"\"\n").contains("requires a value"));
        assert!(err_of("Host a\n  User \"\"\n").contains("requires a value"));
    }

    #[test]
    fn match_criterion_without_value() {
        let msg = err_of("Match User");
        assert!(msg.contains("line 1: Match criterion 'User' requires a value"));
    }

    #[test]
    fn match_with_unknown_criterion() {
        assert!(err_of("Match Vibe good\n").contains("invalid Match criterion 'Vibe'"));
    }

    #[test]
    fn match_flag_criteria_take_no_value() {
        assert!(validate("Match Canonical\n  User x\n").is_ok());
        assert!(validate("Match All\n").is_ok());
    }

    #[test]
    fn match_requires_some_criterion() {
        assert!(err_of("Match\n").contains("Match requires at least one criterion"));
    }

    #[test]
    fn multiple_errors_are_all_reported() {
        let msg = err_of("Host\nHostName x\n");
        assert!(msg.contains("line 1:"));
        assert!(msg.contains("line 2:"));
    }
}
