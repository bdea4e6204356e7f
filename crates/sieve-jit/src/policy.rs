//! Hardening and visibility policy
//!
//! Policy is a plain value handed to every load call. [`JitPolicy::from_env`]
//! builds one from `SIEVE_JIT_*` variables for binaries that want
//! process-wide knobs.

/// Constant blinding level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Harden {
    /// Never blind
    #[default]
    Off,
    /// Blind programs loaded by callers without admin capability
    Unprivileged,
    /// Blind every program
    Always,
}

impl Harden {
    /// Parse `0|off`, `1|unprivileged`, `2|always`
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        match value {
            "0" => Some(Self::Off),
            "1" => Some(Self::Unprivileged),
            "2" => Some(Self::Always),
            _ if value.eq_ignore_ascii_case("off") => Some(Self::Off),
            _ if value.eq_ignore_ascii_case("unprivileged") => Some(Self::Unprivileged),
            _ if value.eq_ignore_ascii_case("always") => Some(Self::Always),
            _ => None,
        }
    }
}

/// Capabilities of the caller loading a program
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caps {
    /// Administrative capability; bypasses unprivileged hardening and the JIT
    /// memory limit
    pub sys_admin: bool,
}

impl Caps {
    /// Caller with administrative capability
    pub const ADMIN: Caps = Caps { sys_admin: true };
    /// Caller without capabilities
    pub const UNPRIVILEGED: Caps = Caps { sys_admin: false };
}

/// Default global budget for compiled code, in bytes
pub const DEFAULT_JIT_LIMIT: usize = 256 << 20;

/// JIT knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitPolicy {
    /// Attempt compilation at all
    pub jit_enable: bool,
    /// Constant blinding level
    pub harden: Harden,
    /// Export compiled symbols
    pub jit_kallsyms: bool,
    /// Hide code addresses from unprivileged observers
    pub restrict_addresses: bool,
    /// Refuse to load a program that cannot be compiled
    pub jit_always_on: bool,
    /// Global compiled-code budget in bytes
    pub jit_limit: usize,
}

impl Default for JitPolicy {
    fn default() -> Self {
        Self {
            jit_enable: true,
            harden: Harden::Off,
            jit_kallsyms: false,
            restrict_addresses: false,
            jit_always_on: false,
            jit_limit: DEFAULT_JIT_LIMIT,
        }
    }
}

/// Whether an environment value means "on"
pub fn parse_env_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0")
        && !value.trim().eq_ignore_ascii_case("false")
        && !value.trim().eq_ignore_ascii_case("off")
        && !value.trim().eq_ignore_ascii_case("no")
}

impl JitPolicy {
    /// Policy that interprets everything
    pub fn interpreter_only() -> Self {
        Self {
            jit_enable: false,
            ..Self::default()
        }
    }

    /// Build from `SIEVE_JIT_ENABLE`, `SIEVE_JIT_HARDEN`, `SIEVE_JIT_KALLSYMS`,
    /// `SIEVE_JIT_RESTRICT`, `SIEVE_JIT_ALWAYS_ON` and `SIEVE_JIT_LIMIT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset or malformed values keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let flag = |name: &str, default: bool| {
            lookup(name)
                .map(|v| parse_env_truthy(&v))
                .unwrap_or(default)
        };
        Self {
            jit_enable: flag("SIEVE_JIT_ENABLE", defaults.jit_enable),
            harden: lookup("SIEVE_JIT_HARDEN")
                .and_then(|v| Harden::parse(&v))
                .unwrap_or(defaults.harden),
            jit_kallsyms: flag("SIEVE_JIT_KALLSYMS", defaults.jit_kallsyms),
            restrict_addresses: flag("SIEVE_JIT_RESTRICT", defaults.restrict_addresses),
            jit_always_on: flag("SIEVE_JIT_ALWAYS_ON", defaults.jit_always_on),
            jit_limit: lookup("SIEVE_JIT_LIMIT")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(defaults.jit_limit),
        }
    }

    /// Whether a program should be blinded before compilation
    pub fn blinding_enabled(&self, jit_supported: bool, jit_requested: bool, caps: Caps) -> bool {
        if !jit_supported || !jit_requested {
            return false;
        }
        match self.harden {
            Harden::Off => false,
            Harden::Unprivileged => !caps.sys_admin,
            Harden::Always => true,
        }
    }

    /// Whether compiled symbols and raw code may be exposed
    pub fn symbols_visible(&self) -> bool {
        self.harden == Harden::Off && self.jit_kallsyms && !self.restrict_addresses
    }
}
