// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Transport encoding for commands that have to survive more than one layer of shell quoting.
//!
//! A command is carried as base64 text, which contains no quote, backtick, dollar or newline
//! characters, and is decoded by the remote shell immediately before it runs.

use base64::{engine::general_purpose::STANDARD, Engine as _};

pub fn encode(command: &str) -> String {
    STANDARD.encode(command.as_bytes())
}

pub fn decode(encoded: &str) -> Option<String> {
    let bytes = STANDARD.decode(encoded.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

/// Build a pipeline that decodes `command` on the remote side and feeds it to bash.
pub fn decode_pipeline(command: &str) -> String {
    format!("echo {} | base64 -d | bash", encode(command))
}

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c)
}

/// Quote `s` so that a POSIX shell reads it back as exactly one word.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars().all(is_safe) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// Wrap `command` to run as root without prompting for a password.
///
/// Commands spanning several lines or containing single quotes are transport encoded, everything
/// else is quoted directly.
pub fn escalate(command: &str) -> String {
    if command.contains('\n') || command.contains('\'') {
        format!("sudo -n bash -c '{}'", decode_pipeline(command))
    } else {
        format!("sudo -n bash -c {}", shell_quote(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_leaves_safe_words_alone() {
        assert_eq!(shell_quote("/etc/hosts"), "/etc/hosts");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn hostile_command_survives_encoding() {
        let command = "echo 'single' \"double\" `uname` $HOME\nprintf '%s\\n' done";
        let encoded = encode(command);
        assert!(!encoded.contains('\''));
        assert!(!encoded.contains('\n'));
        assert!(!encoded.contains('$'));
        assert_eq!(decode(&encoded).as_deref(), Some(command));
    }

    #[test]
    fn escalation_picks_encoding_only_when_needed() {
        assert_eq!(
            escalate("systemctl restart k3s"),
            "sudo -n bash -c 'systemctl restart k3s'"
        );
        let wrapped = escalate("echo 'hi'");
        assert!(wrapped.starts_with("sudo -n bash -c 'echo "));
        assert!(wrapped.ends_with(" | base64 -d | bash'"));
    }
}
