//! Safety layer
//!
//! The only layer whose failure can never be overridden. Three pattern
//! tables, checked in order:
//!
//! * blocked: fail immediately, nothing else is looked at
//! * dangerous: flag for approval (fatal under `strict`)
//! * sensitive: flag for approval (skipped under `permissive`)
//!
//! Session counters for sudo use and total operations live on the
//! verifier itself; `reset` clears them.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

use super::{compile_table, SafetyLevel, Verifier, VerificationContext};
use crate::models::{
    Destination, Operation, Semantics, VerificationLayer, VerificationResult,
};

pub const MAX_OPERATIONS_PER_WINDOW: u32 = 60;
pub const MAX_SUDO_PER_SESSION: u32 = 10;

const LAYER: VerificationLayer = VerificationLayer::Safety;

const BLOCKED_PATTERNS: &[(&str, &str)] = &[
    (r"rm\s+(-rf?|--recursive)\s+[/~]$", "Recursive delete of root or home"),
    (r"rm\s+(-rf?|--recursive)\s+/\s*$", "Recursive delete of root"),
    (r"rm\s+(-rf?|--recursive)\s+~\s*$", "Recursive delete of home"),
    (r"rm\s+(-rf?|--recursive)\s+/home\s*$", "Recursive delete of /home"),
    (r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&", "Fork bomb pattern"),
    (r">\s*/dev/sd[a-z]", "Direct write to block device"),
    (r"dd\s+.*of=/dev/sd[a-z]", "dd to block device"),
    (r"mkfs", "Filesystem creation"),
    (r"fdisk|parted|gdisk", "Partition manipulation"),
    (r"chmod\s+(-R\s+)?777\s+/", "Recursive chmod 777 on root paths"),
    (r"chown\s+-R\s+.*\s+/", "Recursive chown on root paths"),
    (r"/etc/passwd|/etc/shadow", "Accessing password files"),
    (r"curl\s+.*\|\s*(ba)?sh", "Pipe curl to shell"),
    (r"wget\s+.*\|\s*(ba)?sh", "Pipe wget to shell"),
    (r"eval\s+.*\$", "Eval with variable expansion"),
];

const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    (r"rm\s+-rf?\s", "Recursive delete"),
    (r"rm\s+--force", "Force delete"),
    (r"rm\s+-r\s", "Recursive delete"),
    (r"sudo\s+rm", "Root delete"),
    (r"sudo\s+dd", "Root direct disk"),
    (r">\s*/etc/", "Write to /etc"),
    (r">>\s*/etc/", "Append to /etc"),
    (r"crontab", "Cron manipulation"),
    (r"systemctl\s+(disable|mask|stop)", "Disable/stop services"),
    (r"kill\s+-9", "Force kill"),
    (r"killall", "Kill all processes"),
    (r"pkill", "Pattern kill"),
    (r"reboot|shutdown|poweroff", "System power control"),
    (r"iptables|ufw|firewalld", "Firewall manipulation"),
    (r"useradd|userdel|usermod", "User manipulation"),
    (r"groupadd|groupdel|groupmod", "Group manipulation"),
    (r"visudo|sudoers", "Sudo configuration"),
    (r"ssh-keygen.*-f", "SSH key generation"),
];

const SENSITIVE_PATTERNS: &[(&str, &str)] = &[
    (
        r"password|passwd|secret|token|api.?key|credential",
        "Sensitive data reference",
    ),
    (r"\.env\b", "Environment file"),
    (r"\.ssh/", "SSH directory"),
    (r"\.gnupg/", "GPG directory"),
    (r"\.aws/", "AWS credentials"),
    (r"\.kube/", "Kubernetes config"),
];

lazy_static! {
    static ref BLOCKED: Vec<(Regex, &'static str)> = compile_table(BLOCKED_PATTERNS);
    static ref DANGEROUS: Vec<(Regex, &'static str)> = compile_table(DANGEROUS_PATTERNS);
    static ref SENSITIVE: Vec<(Regex, &'static str)> = compile_table(SENSITIVE_PATTERNS);
}

struct SafetyIssue {
    message: String,
    fatal: bool,
}

impl SafetyIssue {
    fn advisory(message: String) -> Self {
        Self {
            message,
            fatal: false,
        }
    }

    fn fatal(message: String) -> Self {
        Self {
            message,
            fatal: true,
        }
    }
}

pub struct SafetyVerifier {
    sudo_count: AtomicU32,
    operation_count: AtomicU32,
}

impl SafetyVerifier {
    pub fn new() -> Self {
        Self {
            sudo_count: AtomicU32::new(0),
            operation_count: AtomicU32::new(0),
        }
    }

    /// Clear the session counters.
    pub fn reset(&self) {
        self.sudo_count.store(0, Ordering::SeqCst);
        self.operation_count.store(0, Ordering::SeqCst);
        debug!("Safety counters reset");
    }

    pub fn operation_count(&self) -> u32 {
        self.operation_count.load(Ordering::SeqCst)
    }

    pub fn sudo_count(&self) -> u32 {
        self.sudo_count.load(Ordering::SeqCst)
    }

    pub fn check(&self, operation: &Operation, context: &VerificationContext) -> VerificationResult {
        let request = operation.user_request.as_str();

        if let Some((description, fragment)) = first_blocked(request) {
            warn!(operation_id = %operation.id, reason = description, "Blocked operation");
            return VerificationResult::fail(
                LAYER,
                vec![format!("BLOCKED: {} (matched '{}')", description, fragment)],
                "This operation is not allowed for safety reasons",
            );
        }

        let mut issues: Vec<SafetyIssue> = Vec::new();
        let strict = context.safety_level == SafetyLevel::Strict;

        for (pattern, description) in DANGEROUS.iter() {
            if pattern.is_match(request) {
                let message = format!("Dangerous operation: {}", description);
                issues.push(if strict {
                    SafetyIssue::fatal(message)
                } else {
                    SafetyIssue::advisory(message)
                });
            }
        }

        if context.safety_level != SafetyLevel::Permissive {
            for (pattern, description) in SENSITIVE.iter() {
                if pattern.is_match(request) {
                    issues.push(SafetyIssue::advisory(format!(
                        "Sensitive access: {}",
                        description
                    )));
                }
            }
        }

        issues.extend(self.process_execution_issues(operation, context));

        let count = self.operation_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count > MAX_OPERATIONS_PER_WINDOW {
            issues.push(SafetyIssue::advisory(format!(
                "Rate limit exceeded ({} operations)",
                count
            )));
        }

        issues.extend(level_issues(operation, context));

        let fatal = issues.iter().any(|issue| issue.fatal);
        let messages: Vec<String> = issues.into_iter().map(|issue| issue.message).collect();

        if fatal {
            warn!(operation_id = %operation.id, issues = ?messages, "Safety check failed");
            return VerificationResult::fail(LAYER, messages, "Operation refused by safety policy");
        }

        if !messages.is_empty() {
            let confidence = (1.0 - messages.len() as f64 * 0.2).max(0.3);
            return VerificationResult::warn(
                LAYER,
                messages,
                confidence,
                "Requires user approval due to safety concerns",
            );
        }

        VerificationResult::pass(LAYER, "Operation passed safety checks")
    }

    fn process_execution_issues(
        &self,
        operation: &Operation,
        context: &VerificationContext,
    ) -> Vec<SafetyIssue> {
        let mut issues = Vec::new();
        if !is_axes(operation, Destination::Process, Semantics::Execute) {
            return issues;
        }

        if operation.user_request.to_lowercase().contains("sudo") {
            let count = self.sudo_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count > MAX_SUDO_PER_SESSION {
                issues.push(SafetyIssue::advisory(format!(
                    "Too many sudo operations ({} > {})",
                    count, MAX_SUDO_PER_SESSION
                )));
            }
        }

        let blocked = context.blocked_words_in(&operation.user_request);
        if !blocked.is_empty() {
            issues.push(SafetyIssue::fatal(format!(
                "Command blocked by configuration: {}",
                blocked.join(", ")
            )));
        }

        issues
    }
}

impl Default for SafetyVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Verifier for SafetyVerifier {
    async fn verify(&self, operation: &Operation, context: &VerificationContext) -> VerificationResult {
        self.check(operation, context)
    }
}

fn first_blocked(request: &str) -> Option<(&'static str, &str)> {
    BLOCKED.iter().find_map(|(pattern, description)| {
        pattern.find(request).map(|m| (*description, m.as_str()))
    })
}

fn is_axes(operation: &Operation, destination: Destination, semantics: Semantics) -> bool {
    operation
        .classification
        .as_ref()
        .is_some_and(|c| c.destination == destination && c.semantics == semantics)
}

fn level_issues(operation: &Operation, context: &VerificationContext) -> Vec<SafetyIssue> {
    let mut issues = Vec::new();
    match context.safety_level {
        SafetyLevel::Strict => {
            if is_axes(operation, Destination::Process, Semantics::Execute) {
                issues.push(SafetyIssue::advisory(
                    "Process execution requires approval in strict mode".to_string(),
                ));
            }
            if is_axes(operation, Destination::File, Semantics::Execute) {
                issues.push(SafetyIssue::advisory(
                    "File modification requires approval in strict mode".to_string(),
                ));
            }
        }
        SafetyLevel::Standard => {
            if operation.user_request.to_lowercase().contains("sudo") {
                issues.push(SafetyIssue::advisory(
                    "Root operation requires approval".to_string(),
                ));
            }
        }
        SafetyLevel::Permissive => {}
    }
    issues
}
