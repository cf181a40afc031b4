//! Classification of terminal output.
//!
//! A chunk of shell output is matched against ordered pattern tables and tagged with
//! the first class that hits:
//!
//! | Priority | Class | Examples |
//! |----------|-------|----------|
//! | 1 | Credential | `[sudo] password for bob:`, `Password:`, `密码：` |
//! | 2 | Confirmation | `[y/n]`, `(yes/no)`, `continue?`, `are you sure` |
//! | 3 | Error | `command not found`, `permission denied`, `Error:` |
//! | 4 | Success | `successfully`, `completed`, `成功` |
//! | 5 | PromptReturn | last line looks like `user@host:~$` or `C:\>` |
//!
//! Matching is case-insensitive and runs on text with ANSI escape sequences removed.
//! The module also hosts the small text heuristics the decision loop needs: OS
//! fingerprinting, error-line extraction, and post-command hints.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use crate::mcp::types::{OsFingerprint, UNKNOWN};

/// Result of classifying one window of output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Credential,
    Confirmation,
    Error,
    Success,
    PromptReturn,
    None,
}

const CREDENTIAL_PATTERNS: &[&str] = &[
    r"\[sudo\].*?密码.*?[:：]",
    r"\[sudo\].*?password.*?:",
    r"password.*?:",
    r"密码.*?[:：]",
    r"password for.*?:",
    r"authentication password.*?:",
    r"passphrase.*?:",
];

const CONFIRMATION_PATTERNS: &[&str] = &[
    r"\[y/n\]",
    r"\(yes/no(/\[fingerprint\])?\)",
    r"\(y/n\)",
    r"continue\?",
    r"proceed\?",
    r"are you sure",
    r"confirmation",
];

const ERROR_PATTERNS: &[&str] = &[
    r"command not found",
    r"没有那个文件或目录",
    r"no such file or directory",
    r"permission denied",
    r"权限不够",
    r"权限不足",
    r"cannot access",
    r"错误[:：]",
    r"error:",
    r"failed",
];

const SUCCESS_PATTERNS: &[&str] = &[r"successfully", r"成功", r"已完成", r"completed"];

const PROMPT_PATTERNS: &[&str] = &[
    // user@host:path$ / # / >
    r"[\w\-.]+@[\w\-.]+:[~\w/.\-]*[$#>]\s*$",
    // [user@host path]$
    r"^\[[\w\-.]+@[\w\-.]+ [^\]]*\][$#]\s*$",
    // C:\path>
    r"^[A-Za-z]:\\.*>\s*$",
    // PS C:\path>
    r"^PS [A-Za-z]:\\.*>\s*$",
];

const YES_NO_MARKERS: &[&str] = &["[y/n]", "(y/n)", "(yes/no", "continue?"];

/// ANSI CSI / OSC sequences emitted by colored prompts and terminal titles.
static ANSI_ESCAPE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)|\x1b[()][A-Za-z0-9]").ok()
});

static VERSION: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(\d+\.\d+\.\d+)").ok());

static CREDENTIAL: Lazy<Vec<Regex>> = Lazy::new(|| compile(CREDENTIAL_PATTERNS));
static CONFIRMATION: Lazy<Vec<Regex>> = Lazy::new(|| compile(CONFIRMATION_PATTERNS));
static ERROR: Lazy<Vec<Regex>> = Lazy::new(|| compile(ERROR_PATTERNS));
static SUCCESS: Lazy<Vec<Regex>> = Lazy::new(|| compile(SUCCESS_PATTERNS));
static PROMPT: Lazy<Vec<Regex>> = Lazy::new(|| compile(PROMPT_PATTERNS));

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
        .collect()
}

fn any_match(table: &[Regex], text: &str) -> bool {
    table.iter().any(|re| re.is_match(text))
}

/// Remove ANSI escape sequences and carriage returns.
pub fn strip_ansi(text: &str) -> String {
    let cleaned = match ANSI_ESCAPE.as_ref() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    };
    cleaned.replace('\r', "")
}

/// Classify a window of output. First match wins.
pub fn classify(text: &str) -> Classification {
    let clean = strip_ansi(text);

    if any_match(&CREDENTIAL, &clean) {
        Classification::Credential
    } else if any_match(&CONFIRMATION, &clean) {
        Classification::Confirmation
    } else if any_match(&ERROR, &clean) {
        Classification::Error
    } else if any_match(&SUCCESS, &clean) {
        Classification::Success
    } else if ends_with_prompt(&clean) {
        Classification::PromptReturn
    } else {
        Classification::None
    }
}

/// Whether the last non-blank line of `text` is a shell prompt.
pub fn ends_with_prompt(text: &str) -> bool {
    let clean = strip_ansi(text);
    match clean.trim().lines().last() {
        Some(last_line) => any_match(&PROMPT, last_line.trim_start()),
        None => false,
    }
}

/// Whether the prompt only accepts a yes/no style answer.
pub fn is_yes_no_prompt(text: &str) -> bool {
    let lower = text.to_lowercase();
    YES_NO_MARKERS.iter().any(|m| lower.contains(m))
}

/// Guess the remote OS from output such as `uname -a` or `/etc/os-release`.
pub fn detect_os(text: &str) -> Option<OsFingerprint> {
    let lower = text.to_lowercase();

    let os_type = if lower.contains("linux") {
        if lower.contains("ubuntu") {
            "Ubuntu"
        } else if lower.contains("centos") {
            "CentOS"
        } else if lower.contains("debian") {
            "Debian"
        } else if lower.contains("fedora") {
            "Fedora"
        } else {
            "Linux"
        }
    } else if lower.contains("darwin") || lower.contains("macos") {
        "macOS"
    } else if lower.contains("windows") {
        "Windows"
    } else if lower.contains("bsd") {
        "BSD"
    } else {
        return None;
    };

    let version = VERSION
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| UNKNOWN.to_string());

    Some(OsFingerprint {
        os_type: os_type.to_string(),
        version,
    })
}

/// Up to the last three lines that look like error reports.
pub fn extract_error_message(text: &str) -> Option<String> {
    const MARKERS: &[&str] = &["error", "failed", "fatal", "denied", "not found", "错误", "失败"];

    let clean = strip_ansi(text);
    let lines: Vec<&str> = clean
        .lines()
        .map(str::trim)
        .filter(|line| {
            let lower = line.to_lowercase();
            MARKERS.iter().any(|m| lower.contains(m))
        })
        .collect();

    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(3);
    Some(lines[start..].join("\n"))
}

/// Remediation hint for a finished command, if its output suggests one.
pub fn analyze_result(command: &str, output: &str) -> Option<String> {
    let lower = strip_ansi(output).to_lowercase();

    if lower.contains("permission denied") || output.contains("权限不够") {
        if command.trim_start().starts_with("sudo ") {
            return Some(format!(
                "`{}` was denied even with sudo; check the account's sudo rights",
                command
            ));
        }
        return Some(format!(
            "`{}` hit a permission error; retry with `sudo {}`",
            command, command
        ));
    }

    if lower.contains("command not found") || output.contains("未找到命令") {
        let program = command.split_whitespace().next().unwrap_or(command);
        return Some(format!(
            "`{}` is not installed; install the package that provides it and retry",
            program
        ));
    }

    None
}
