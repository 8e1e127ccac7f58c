//! Static security validation of submitted Python source
//!
//! The validator is a pattern scanner, not a parser. It looks for imports
//! outside a fixed allow-list, calls to builtins that evaluate or load code,
//! and attribute names used to walk object internals out of a sandbox. It
//! never runs the code it inspects.
//!
//! This is a defense-in-depth layer. Obfuscated access (string building,
//! encoded payloads) can slip past a pattern scan; the container backend is the
//! boundary that actually holds.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::errors::EngineError;

/// Modules user code may import.
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    // numbers and math
    "math", "cmath", "decimal", "fractions", "statistics", "numbers", "random",
    // date and time
    "datetime", "time", "calendar", "zoneinfo",
    // structured data
    "json", "csv",
    // strings
    "re", "string", "textwrap", "unicodedata", "difflib",
    // collections and functional helpers
    "collections", "itertools", "functools", "operator", "heapq", "bisect", "copy",
    "enum", "dataclasses", "typing", "abc", "pprint",
    // identifiers, hashing and encodings
    "uuid", "hashlib", "hmac", "base64", "binascii", "struct",
];

/// Modules that stay forbidden even when configuration tries to allow them.
pub const DENIED_MODULES: &[&str] = &[
    "os", "sys", "subprocess", "shutil", "glob", "pathlib", "io", "tempfile", "fileinput",
    "socket", "ssl", "select", "selectors", "asyncio", "urllib", "http", "ftplib", "smtplib",
    "poplib", "imaplib", "telnetlib", "xmlrpc", "requests", "ctypes", "cffi", "mmap",
    "multiprocessing", "threading", "_thread", "concurrent", "signal", "pty", "fcntl",
    "resource", "posix", "nt", "pwd", "grp", "platform", "importlib", "builtins", "pickle",
    "marshal", "shelve", "code", "codeop", "inspect", "gc", "runpy", "pkgutil", "zipimport",
];

const BLOCKED_CALLS: &[&str] = &[
    "eval", "exec", "compile", "open", "globals", "locals", "vars", "breakpoint", "execfile",
    "reload",
];

/// Category of a rule hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationRule {
    EmptySource,
    SourceTooLarge,
    BlockedImport,
    UnlistedImport,
    DynamicImport,
    BlockedCall,
    InternalsAccess,
}

impl ViolationRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationRule::EmptySource => "empty_source",
            ViolationRule::SourceTooLarge => "source_too_large",
            ViolationRule::BlockedImport => "blocked_import",
            ViolationRule::UnlistedImport => "unlisted_import",
            ViolationRule::DynamicImport => "dynamic_import",
            ViolationRule::BlockedCall => "blocked_call",
            ViolationRule::InternalsAccess => "internals_access",
        }
    }
}

impl std::fmt::Display for ViolationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: ViolationRule,
    pub matched_fragment: String,
}

/// Outcome of validating one submission. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityVerdict {
    safe: bool,
    violations: Vec<Violation>,
}

impl SecurityVerdict {
    fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            safe: violations.is_empty(),
            violations,
        }
    }

    pub fn is_safe(&self) -> bool {
        self.safe
    }

    /// Violations in the order they occur in the source.
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| format!("{}: {}", v.rule_id, v.matched_fragment))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub struct SecurityValidator {
    allowed_modules: BTreeSet<String>,
    denied_modules: BTreeSet<String>,
    max_source_bytes: usize,
    import_re: Regex,
    from_import_re: Regex,
    call_re: Regex,
    dunder_re: Regex,
    module_attr_re: Regex,
}

impl SecurityValidator {
    pub fn new(extra_allowed_modules: &[String], max_source_bytes: usize) -> Result<Self, EngineError> {
        let denied_modules: BTreeSet<String> =
            DENIED_MODULES.iter().map(|m| m.to_string()).collect();

        let mut allowed_modules: BTreeSet<String> =
            DEFAULT_ALLOWED_MODULES.iter().map(|m| m.to_string()).collect();
        for module in extra_allowed_modules {
            let module = module.trim();
            if module.is_empty() {
                continue;
            }
            if denied_modules.contains(module) {
                log::warn!("Ignoring allow-list entry '{}': module is on the deny-list", module);
                continue;
            }
            allowed_modules.insert(module.to_string());
        }

        let calls = BLOCKED_CALLS.join("|");

        Ok(Self {
            allowed_modules,
            denied_modules,
            max_source_bytes,
            import_re: compile(r"(?m)(?:^|[;:])[ \t]*import[ \t]+([^;#\n]+)")?,
            from_import_re: compile(r"(?m)(?:^|[;:])[ \t]*from[ \t]+([\w.]+)[ \t]+import\b")?,
            call_re: compile(&format!(r"(?m)(?:^|[^.\w])({}|__import__)\s*\(", calls))?,
            dunder_re: compile(
                r"__(?:class|bases|base|subclasses|mro|globals|builtins|code|closure|func|self|getattribute|loader|spec|reduce|reduce_ex|init_subclass|traceback|frame)__",
            )?,
            module_attr_re: compile(r"\.(?:_?os|_?sys|subprocess|_posixsubprocess|builtins|_bootstrap)\b")?,
        })
    }

    /// Allow-list as seen by the runner harness, sorted.
    pub fn allowed_modules(&self) -> Vec<String> {
        self.allowed_modules.iter().cloned().collect()
    }

    pub fn is_module_allowed(&self, module: &str) -> bool {
        let top = module.split('.').next().unwrap_or(module);
        !self.denied_modules.contains(top) && self.allowed_modules.contains(top)
    }

    pub fn validate(&self, source: &str) -> SecurityVerdict {
        if source.trim().is_empty() {
            return SecurityVerdict::from_violations(vec![Violation {
                rule_id: ViolationRule::EmptySource,
                matched_fragment: String::new(),
            }]);
        }
        if source.len() > self.max_source_bytes {
            return SecurityVerdict::from_violations(vec![Violation {
                rule_id: ViolationRule::SourceTooLarge,
                matched_fragment: format!("{} bytes", source.len()),
            }]);
        }

        let mut hits: Vec<(usize, Violation)> = Vec::new();

        // Import statements never live inside a literal or comment. Calls and
        // dunders are still scanned in the raw text: f-strings evaluate code.
        let code = blank_literals(source);

        for caps in self.import_re.captures_iter(&code) {
            let (Some(whole), Some(names)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            for item in names.as_str().split(',') {
                let name = item.split_whitespace().next().unwrap_or("");
                if name.is_empty() {
                    continue;
                }
                if let Some(v) = self.check_module(name) {
                    hits.push((whole.start(), v));
                }
            }
        }

        for caps in self.from_import_re.captures_iter(&code) {
            let (Some(whole), Some(module)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if let Some(v) = self.check_module(module.as_str()) {
                hits.push((whole.start(), v));
            }
        }

        for caps in self.call_re.captures_iter(source) {
            let Some(name) = caps.get(1) else { continue };
            let rule = if name.as_str() == "__import__" {
                ViolationRule::DynamicImport
            } else {
                ViolationRule::BlockedCall
            };
            hits.push((
                name.start(),
                Violation {
                    rule_id: rule,
                    matched_fragment: format!("{}(", name.as_str()),
                },
            ));
        }

        for m in self.dunder_re.find_iter(source).chain(self.module_attr_re.find_iter(source)) {
            hits.push((
                m.start(),
                Violation {
                    rule_id: ViolationRule::InternalsAccess,
                    matched_fragment: m.as_str().to_string(),
                },
            ));
        }

        hits.sort_by_key(|(offset, _)| *offset);

        let mut violations: Vec<Violation> = Vec::with_capacity(hits.len());
        for (_, v) in hits {
            if !violations.contains(&v) {
                violations.push(v);
            }
        }

        if !violations.is_empty() {
            log::debug!("Static validation found {} violation(s)", violations.len());
        }
        SecurityVerdict::from_violations(violations)
    }

    fn check_module(&self, module: &str) -> Option<Violation> {
        if module.starts_with('.') {
            return Some(Violation {
                rule_id: ViolationRule::UnlistedImport,
                matched_fragment: module.to_string(),
            });
        }
        let top = module.split('.').next().unwrap_or(module);
        if self.denied_modules.contains(top) {
            return Some(Violation {
                rule_id: ViolationRule::BlockedImport,
                matched_fragment: module.to_string(),
            });
        }
        if !self.allowed_modules.contains(top) {
            return Some(Violation {
                rule_id: ViolationRule::UnlistedImport,
                matched_fragment: module.to_string(),
            });
        }
        None
    }
}

/// Replace the contents of string literals and comments with spaces. Quotes,
/// newlines and byte offsets are preserved.
fn blank_literals(source: &str) -> String {
    fn blank(out: &mut String, c: char) {
        if c == '\n' {
            out.push('\n');
        } else {
            out.extend(std::iter::repeat(' ').take(c.len_utf8()));
        }
    }

    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '#' => {
                blank(&mut out, c);
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    blank(&mut out, next);
                    chars.next();
                }
            }
            '\'' | '"' => {
                out.push(c);
                let triple = {
                    let mut ahead = chars.clone();
                    ahead.next() == Some(c) && ahead.next() == Some(c)
                };
                if triple {
                    out.push(c);
                    out.push(c);
                    chars.next();
                    chars.next();
                }
                // Quotes seen so far towards a closing triple quote.
                let mut run = 0;
                let mut closed = false;
                while let Some(next) = chars.next() {
                    if next == c {
                        if !triple {
                            out.push(next);
                            closed = true;
                            break;
                        }
                        run += 1;
                        if run == 3 {
                            out.push_str(&c.to_string().repeat(3));
                            closed = true;
                            break;
                        }
                        continue;
                    }
                    for _ in 0..run {
                        blank(&mut out, c);
                    }
                    run = 0;
                    if next == '\\' {
                        blank(&mut out, next);
                        if let Some(escaped) = chars.next() {
                            blank(&mut out, escaped);
                        }
                    } else if next == '\n' && !triple {
                        // Unterminated single-line literal.
                        out.push(next);
                        closed = true;
                        break;
                    } else {
                        blank(&mut out, next);
                    }
                }
                if !closed {
                    for _ in 0..run {
                        blank(&mut out, c);
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn compile(pattern: &str) -> Result<Regex, EngineError> {
    Regex::new(pattern)
        .map_err(|e| EngineError::ValidationError(format!("Invalid validator pattern: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> SecurityValidator {
        SecurityValidator::new(&[], 256 * 1024).unwrap()
    }

    fn rules(verdict: &SecurityVerdict) -> Vec<ViolationRule> {
        verdict.violations().iter().map(|v| v.rule_id).collect()
    }

    #[test]
    fn test_benign_code_is_safe() {
        let source = r#"
import math
from collections import Counter
import json, re as regex
from datetime import datetime

def area(r):
    return math.pi * r ** 2

pattern = regex.compile(r"\d+")
print(json.dumps({"area": area(2), "count": Counter("hello")["l"]}))
if __name__ == "__main__":
    print(datetime(2024, 1, 1).isoformat())
"#;
        let verdict = validator().validate(source);
        assert!(verdict.is_safe(), "unexpected violations: {}", verdict.summary());
    }

    #[test]
    fn test_process_import_is_blocked() {
        let verdict = validator().validate("import subprocess\nsubprocess.run(['ls'])");
        assert!(!verdict.is_safe());
        assert_eq!(verdict.violations()[0].rule_id, ViolationRule::BlockedImport);
        assert_eq!(verdict.violations()[0].matched_fragment, "subprocess");
    }

    #[test]
    fn test_dotted_and_from_imports_use_top_level_module() {
        let verdict = validator().validate("from os.path import join\nimport urllib.request");
        let fragments: Vec<_> = verdict
            .violations()
            .iter()
            .map(|v| v.matched_fragment.as_str())
            .collect();
        assert_eq!(fragments, vec!["os.path", "urllib.request"]);
        assert!(rules(&verdict).iter().all(|r| *r == ViolationRule::BlockedImport));
    }

    #[test]
    fn test_unknown_module_is_unlisted() {
        let verdict = validator().validate("import numpy as np");
        assert_eq!(rules(&verdict), vec![ViolationRule::UnlistedImport]);
        assert_eq!(verdict.violations()[0].matched_fragment, "numpy");
    }

    #[test]
    fn test_import_after_semicolon_or_colon_is_found() {
        let verdict = validator().validate("x = 1; import socket\nif True: import ctypes");
        let fragments: Vec<_> = verdict
            .violations()
            .iter()
            .map(|v| v.matched_fragment.clone())
            .collect();
        assert_eq!(fragments, vec!["socket".to_string(), "ctypes".to_string()]);
    }

    #[test]
    fn test_blocked_builtin_calls() {
        let verdict = validator().validate("eval('1+1')\nexec ('x=1')\nf = open('/etc/passwd')");
        assert_eq!(
            rules(&verdict),
            vec![ViolationRule::BlockedCall, ViolationRule::BlockedCall, ViolationRule::BlockedCall]
        );
        assert_eq!(verdict.violations()[2].matched_fragment, "open(");
    }

    #[test]
    fn test_method_named_like_builtin_is_allowed() {
        let verdict = validator().validate("import re\np = re.compile('a')\nprint(p.pattern)");
        assert!(verdict.is_safe(), "{}", verdict.summary());
    }

    #[test]
    fn test_dunder_import_is_dynamic_import() {
        let verdict = validator().validate("m = __import__('os')");
        assert_eq!(rules(&verdict), vec![ViolationRule::DynamicImport]);
    }

    #[test]
    fn test_internals_traversal_is_blocked() {
        let verdict = validator().validate("().__class__.__bases__[0].__subclasses__()");
        assert_eq!(verdict.violations().len(), 3);
        assert!(rules(&verdict).iter().all(|r| *r == ViolationRule::InternalsAccess));
    }

    #[test]
    fn test_module_private_attribute_escape() {
        let verdict = validator().validate("import random\nrandom._os.system('id')");
        assert_eq!(rules(&verdict), vec![ViolationRule::InternalsAccess]);
        assert_eq!(verdict.violations()[0].matched_fragment, "._os");
    }

    #[test]
    fn test_violations_are_ordered_and_deduplicated() {
        let verdict = validator().validate("eval('1')\nimport os\neval('2')\nimport os");
        assert_eq!(verdict.violations().len(), 2);
        assert_eq!(verdict.violations()[0].rule_id, ViolationRule::BlockedCall);
        assert_eq!(verdict.violations()[1].rule_id, ViolationRule::BlockedImport);
    }

    #[test]
    fn test_commented_import_is_ignored() {
        let verdict = validator().validate("# import os\nprint('ok')  # import sys");
        assert!(verdict.is_safe(), "{}", verdict.summary());
    }

    #[test]
    fn test_import_words_inside_strings_are_ignored() {
        let v = validator();
        for source in [
            "print(\"Step 1: import the data\")",
            "msg = 'done; import os next'",
            "doc = \"\"\"\nNotes:\nimport socket\nfrom os import path\n\"\"\"\nprint(doc)",
            "s = 'it\\'s: import sys'",
        ] {
            let verdict = v.validate(source);
            assert!(verdict.is_safe(), "{:?}: {}", source, verdict.summary());
        }
    }

    #[test]
    fn test_imports_after_literals_are_still_found() {
        let verdict = validator().validate("x = \"a:b\"; import os\nif x: import ctypes");
        let fragments: Vec<_> = verdict
            .violations()
            .iter()
            .map(|v| v.matched_fragment.as_str())
            .collect();
        assert_eq!(fragments, vec!["os", "ctypes"]);

        let verdict = validator().validate("print(f\"{eval('1')}\")");
        assert_eq!(rules(&verdict), vec![ViolationRule::BlockedCall]);
    }

    #[test]
    fn test_blanking_keeps_offsets() {
        let source = "a = 'héllo' # ünïcode\nb = \"\"\"x\ny\"\"\"";
        let blanked = blank_literals(source);
        assert_eq!(blanked.len(), source.len());
        assert_eq!(blanked.lines().count(), source.lines().count());
        assert!(blanked.starts_with("a = '"));
        assert!(!blanked.contains('h'));
    }

    #[test]
    fn test_empty_and_oversized_sources() {
        let verdict = validator().validate("   \n\t");
        assert_eq!(rules(&verdict), vec![ViolationRule::EmptySource]);

        let small = SecurityValidator::new(&[], 8).unwrap();
        let verdict = small.validate("print('too long')");
        assert_eq!(rules(&verdict), vec![ViolationRule::SourceTooLarge]);
    }

    #[test]
    fn test_extra_modules_cannot_override_deny_list() {
        let validator =
            SecurityValidator::new(&["os".to_string(), "array".to_string()], 1024).unwrap();
        assert!(validator.is_module_allowed("array"));
        assert!(!validator.is_module_allowed("os"));
        assert!(!validator.validate("import os").is_safe());
        assert!(validator.validate("import array").is_safe());
    }

    #[test]
    fn test_verdict_serializes_rule_ids() {
        let verdict = validator().validate("import os");
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["safe"], false);
        assert_eq!(json["violations"][0]["rule_id"], "blocked_import");
        assert_eq!(json["violations"][0]["matched_fragment"], "os");
    }
}
