/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/model/namespace.rs
*
* Namespace name patterns (spec §3): a comma-separated list of glob
* patterns, where a leading `!` marks an exclusion. A name is accepted if
* any inclusion matches it and no later exclusion does; a pattern list made
* entirely of exclusions implies an implicit catch-all inclusion (`*`)
* first, so "just exclude kube-system" behaves as "everything but
* kube-system" rather than matching nothing.
*
* SPDX-License-Identifier: Apache-2.0
*/

use glob::Pattern;

#[derive(Debug, Clone)]
enum Clause {
    Include(Pattern),
    Exclude(Pattern),
}

/// A parsed, ready-to-match namespace pattern list.
#[derive(Debug, Clone)]
pub struct NamespacePattern {
    clauses: Vec<Clause>,
    raw: String,
}

impl NamespacePattern {
    /// Parses a comma-separated pattern list. Malformed glob fragments are
    /// treated as literal strings (glob::Pattern::new falls back to an
    /// escaped literal match on error, which is the conservative choice for
    /// an operator configuration value).
    pub fn parse(raw: &str) -> Self {
        let mut clauses = Vec::new();
        let mut any_inclusion = false;
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if let Some(rest) = part.strip_prefix('!') {
                clauses.push(Clause::Exclude(Self::compile(rest)));
            } else {
                clauses.push(Clause::Include(Self::compile(part)));
                any_inclusion = true;
            }
        }
        if !any_inclusion && !clauses.is_empty() {
            clauses.insert(0, Clause::Include(Self::compile("*")));
        }
        NamespacePattern {
            clauses,
            raw: raw.to_string(),
        }
    }

    fn compile(pattern: &str) -> Pattern {
        Pattern::new(pattern).unwrap_or_else(|_| Pattern::new(&Pattern::escape(pattern)).expect("escaped pattern is always valid"))
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// A name is accepted if any inclusion matches and no *later* exclusion
    /// also matches (exclusions apply in order from where they appear,
    /// matching "later exclusion wins" semantics).
    pub fn matches(&self, name: &str) -> bool {
        let mut accepted = false;
        for clause in &self.clauses {
            match clause {
                Clause::Include(p) => {
                    if p.matches(name) {
                        accepted = true;
                    }
                }
                Clause::Exclude(p) => {
                    if accepted && p.matches(name) {
                        accepted = false;
                    }
                }
            }
        }
        accepted
    }

    /// Extracts the literal (non-glob) namespace names this pattern names
    /// exactly, for the degraded "no discovery permission" fallback (§4.3):
    /// patterns containing glob metacharacters are skipped since they
    /// cannot be turned into an exact namespace list.
    pub fn literal_names(&self) -> Vec<String> {
        self.clauses
            .iter()
            .filter_map(|c| match c {
                Clause::Include(p) => {
                    let s = p.as_str();
                    if s.chars().any(|c| matches!(c, '*' | '?' | '[' | ']')) {
                        None
                    } else {
                        Some(s.to_string())
                    }
                }
                Clause::Exclude(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_star_matches_empty_string() {
        let p = NamespacePattern::parse("*");
        assert!(p.matches(""));
    }

    #[test]
    fn pure_exclusion_implies_catch_all() {
        let p = NamespacePattern::parse("!kube-system");
        assert!(p.matches("default"));
        assert!(!p.matches("kube-system"));
    }

    #[test]
    fn inclusion_then_exclusion() {
        let p = NamespacePattern::parse("team-*,!team-secret");
        assert!(p.matches("team-a"));
        assert!(!p.matches("team-secret"));
        assert!(!p.matches("other"));
    }

    #[test]
    fn literal_names_skips_globs() {
        let p = NamespacePattern::parse("default,team-*,!excluded");
        assert_eq!(p.literal_names(), vec!["default".to_string()]);
    }
}
