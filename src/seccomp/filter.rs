//! Compiles a `Policy` to a loadable BPF program via `seccompiler`, the
//! real crate the wider example pack reaches for when it needs to compile
//! (rather than hand-assemble) a seccomp-bpf filter.

use std::collections::BTreeMap;

use seccompiler::{
    apply_filter, BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCondition, SeccompFilter,
    SeccompRule,
};

use crate::error::{EngineError, Result};
use crate::seccomp::policy::{Action, CmpOp, Matcher, Policy};
use crate::tracee::Arch;

/// The compiled artifact plus the set of `Trace` user-data codes the
/// policy can emit, so callers can sanity-check their listener's code
/// table against what the policy actually produces.
pub struct CompiledFilter {
    program: BpfProgram,
    pub trace_codes: Vec<u32>,
}

impl CompiledFilter {
    /// Loads the filter into the *current* process. Must be called in the
    /// child, after `on_post_fork_child` and before `execv`; `apply_filter`
    /// sets no-new-privileges so the kernel accepts the load without
    /// `CAP_SYS_ADMIN`.
    pub fn load(&self) -> Result<()> {
        apply_filter(&self.program).map_err(|err| EngineError::protocol(format!("seccomp apply_filter: {err}")))
    }
}

fn target_arch(arch: Arch) -> Result<seccompiler::TargetArch> {
    match arch {
        Arch::X86_64 => Ok(seccompiler::TargetArch::x86_64),
        Arch::X86 => Err(EngineError::config(
            "32-bit x86 seccomp filter compilation is not supported by the seccompiler backend",
        )),
        Arch::Unknown => Err(EngineError::config("can't compile a seccomp filter for an unknown architecture")),
    }
}

fn native_action(action: Action) -> SeccompAction {
    match action {
        Action::Allow => SeccompAction::Allow,
        Action::Kill => SeccompAction::KillProcess,
        Action::Errno(errno) => SeccompAction::Errno(u32::from(errno)),
        Action::Trace(code) => SeccompAction::Trace(code),
    }
}

fn native_cmp_op(op: CmpOp) -> seccompiler::SeccompCmpOp {
    use seccompiler::SeccompCmpOp::*;
    match op {
        CmpOp::Eq => Eq,
        CmpOp::Ne => Ne,
        CmpOp::Lt => Lt,
        CmpOp::Le => Le,
        CmpOp::Gt => Gt,
        CmpOp::Ge => Ge,
        CmpOp::MaskedEq(mask) => MaskedEq(mask),
    }
}

fn compile_rule(matcher: &Matcher, action: Action) -> Result<SeccompRule> {
    let conditions = match matcher {
        Matcher::Syscall(_) | Matcher::Number { .. } => vec![],
        Matcher::Arg { arg, op, value, .. } => {
            vec![SeccompCondition::new(*arg, SeccompCmpArgLen::Qword, native_cmp_op(*op), *value)
                .map_err(|err| EngineError::protocol(format!("seccomp condition: {err}")))?]
        }
    };
    SeccompRule::new(conditions, native_action(action)).map_err(|err| EngineError::protocol(format!("seccomp rule: {err}")))
}

impl Policy {
    /// Validates the policy, then compiles it to a loadable BPF program.
    /// Rules are grouped by raw syscall number (see
    /// `rules_by_syscall`'s doc comment for why that preserves the
    /// policy's flat first-match-wins ordering).
    pub fn compile(&self) -> Result<CompiledFilter> {
        self.validate()?;
        let arch = target_arch(self.arch)?;

        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
        let mut trace_codes = Vec::new();
        for (number, group) in self.rules_by_syscall()? {
            let mut compiled = Vec::with_capacity(group.len());
            for rule in group {
                compiled.push(compile_rule(&rule.matcher, rule.action)?);
                if let Action::Trace(code) = rule.action {
                    trace_codes.push(code);
                }
            }
            rules.insert(number, compiled);
        }

        // A syscall issued through an ABI entry point this filter wasn't
        // compiled for (e.g. the 32-bit `int $0x80` path under an
        // `x86_64` filter) must not bypass the policy: it gets the same
        // severity as the policy's own default action, never a bare allow.
        let filter = SeccompFilter::new(rules, native_action(self.default), native_action(self.default), arch)
            .map_err(|err| EngineError::protocol(format!("seccomp filter: {err}")))?;
        let program: BpfProgram =
            filter.try_into().map_err(|err| EngineError::protocol(format!("seccomp bpf compile: {err}")))?;

        Ok(CompiledFilter { program, trace_codes })
    }
}
