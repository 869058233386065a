//! The declarative policy: an ordered rule list of `(matcher, action)`
//! pairs plus a default action.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use syscalls::Sysno;

use crate::error::{EngineError, Result};
use crate::tracee::Arch;

/// Relational operators usable in an argument predicate, matching the
/// comparisons `seccompiler` can compile (`SeccompCmpOp`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    MaskedEq(u64),
}

/// Either a bare (architecture-qualified) syscall number, or a structured
/// predicate on syscall number and one of up to six arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Matcher {
    Syscall(Sysno),
    /// A syscall number tagged with the architecture it was written
    /// against; used when a rule intentionally targets an architecture
    /// other than the one this policy compiles for (e.g. blocking a
    /// 32-bit-only syscall number on an otherwise 64-bit policy).
    Number { arch: Arch, number: i64 },
    Arg { syscall: Sysno, arg: u8, op: CmpOp, value: u64 },
}

/// What the kernel does when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Allow,
    Kill,
    Errno(u16),
    Trace(u32),
}

impl Action {
    /// Ordinal severity used to validate that a policy's default isn't
    /// weaker than what its rules imply it needs to be (see
    /// `Policy::compile`'s arch check).
    fn is_allow(&self) -> bool {
        matches!(self, Action::Allow)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub matcher: Matcher,
    pub action: Action,
}

impl Rule {
    pub fn new(matcher: Matcher, action: Action) -> Self {
        Rule { matcher, action }
    }
}

/// An ordered rule list plus a default action and the architecture it was
/// written against. Rules are walked in declared order; the first
/// matching rule wins; no match falls through to `default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub arch: Arch,
    pub rules: Vec<Rule>,
    pub default: Action,
}

impl Policy {
    pub fn new(arch: Arch, default: Action) -> Self {
        Policy { arch, rules: Vec::new(), default }
    }

    pub fn allow(arch: Arch) -> Self {
        Policy::new(arch, Action::Allow)
    }

    pub fn push(&mut self, rule: Rule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    /// Rejects a policy whose default is `Allow` and that contains a rule
    /// targeting a syscall number tagged for an architecture other than
    /// this policy's -- such a rule can never fire under this policy's
    /// compiled BPF program, so a default-allow would silently admit
    /// exactly the syscall the rule was meant to restrict.
    pub fn validate(&self) -> Result<()> {
        if !self.default.is_allow() {
            return Ok(());
        }
        for rule in &self.rules {
            if let Matcher::Number { arch, .. } = rule.matcher {
                if arch != self.arch {
                    return Err(EngineError::config(format!(
                        "rule targets architecture {arch:?} but policy compiles for {:?} with a default-allow action",
                        self.arch
                    )));
                }
            }
        }
        Ok(())
    }

    /// Groups rules by raw syscall number in declared order. A concrete
    /// syscall invocation can only ever match rules declared against its
    /// own number, so flattening into per-number buckets preserves the
    /// policy's "first matching rule in declared order wins" semantics as
    /// long as each bucket's internal order is kept, which this does.
    pub(super) fn rules_by_syscall(&self) -> Result<BTreeMap<i64, Vec<&Rule>>> {
        let mut grouped: BTreeMap<i64, Vec<&Rule>> = BTreeMap::new();
        for rule in &self.rules {
            let number = match &rule.matcher {
                Matcher::Syscall(sysno) => *sysno as i64,
                Matcher::Number { number, .. } => *number,
                Matcher::Arg { syscall, .. } => *syscall as i64,
            };
            grouped.entry(number).or_default().push(rule);
        }
        Ok(grouped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_default_allow_with_foreign_arch_rule() {
        let mut policy = Policy::allow(Arch::X86_64);
        policy.push(Rule::new(Matcher::Number { arch: Arch::X86, number: 11 }, Action::Kill));
        assert!(policy.validate().is_err());
    }

    #[test]
    fn accepts_default_kill_with_foreign_arch_rule() {
        let mut policy = Policy::new(Arch::X86_64, Action::Kill);
        policy.push(Rule::new(Matcher::Number { arch: Arch::X86, number: 11 }, Action::Allow));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn groups_preserve_declaration_order_within_a_syscall() {
        let mut policy = Policy::new(Arch::X86_64, Action::Kill);
        policy.push(Rule::new(Matcher::Syscall(Sysno::open), Action::Allow));
        policy.push(Rule::new(
            Matcher::Arg { syscall: Sysno::open, arg: 1, op: CmpOp::Eq, value: 0 },
            Action::Kill,
        ));
        let grouped = policy.rules_by_syscall().unwrap();
        let open_rules = &grouped[&(Sysno::open as i64)];
        assert_eq!(open_rules.len(), 2);
        assert_eq!(open_rules[0].action, Action::Allow);
    }
}
