use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::error::SandboxError;
use super::host::HostFacts;
use super::intent::Intent;
use super::rule::{MountKind, MountRule};

/// Host variables copied into the sandbox when set.
pub const DEFAULT_ENV_ALLOW: [&str; 4] = ["HOME", "TERM", "USER", "WINEDEBUG"];

/// Keeps wineserver alive for the whole program run and shuts it down
/// afterwards (it otherwise lingers for 3 seconds).
const WINESERVER_WRAPPER: &str =
    r#"wineserver -p0 && "$0" "$@" ; ret=$? ; wineserver -k ; exit ${ret}"#;

const WINECFG_WRAPPER: &str = r#"winecfg && exec "$0" "$@""#;

/// Whether a bind source has to exist on the host at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Missing source aborts compilation with `InvalidPath`.
    Required,
    /// Missing source drops the rule.
    Optional,
    /// Source is created later by an auxiliary service (e.g. an X11 socket).
    Deferred,
}

/// A rule as requested by one layer, before host checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRequest {
    pub rule: MountRule,
    pub presence: Presence,
}

impl RuleRequest {
    pub fn required(rule: MountRule) -> Self {
        Self {
            rule,
            presence: Presence::Required,
        }
    }

    pub fn optional(rule: MountRule) -> Self {
        Self {
            rule,
            presence: Presence::Optional,
        }
    }

    pub fn deferred(rule: MountRule) -> Self {
        Self {
            rule,
            presence: Presence::Deferred,
        }
    }
}

/// Rules and variables an auxiliary service needs inside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceContribution {
    pub rules: Vec<RuleRequest>,
    pub env: BTreeMap<String, String>,
}

/// Compiler knobs that come from configuration rather than the intent.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Host variables copied in addition to [`DEFAULT_ENV_ALLOW`].
    pub extra_env: Vec<String>,
}

/// Fully resolved sandbox: what the backend mounts, sets and runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxPlan {
    /// Parents always precede their children; targets are unique.
    pub rules: Vec<MountRule>,
    pub env: BTreeMap<String, String>,
    pub share_network: bool,
    pub command: Vec<String>,
}

/// Rules keyed by target. Inserting an existing target replaces it, and
/// iteration follows path-component order, so parents come first.
#[derive(Debug, Default)]
struct RuleSet {
    rules: BTreeMap<PathBuf, RuleRequest>,
}

impl RuleSet {
    fn insert(&mut self, request: RuleRequest) {
        self.rules.insert(request.rule.target.clone(), request);
    }

    fn extend(&mut self, requests: impl IntoIterator<Item = RuleRequest>) {
        for request in requests {
            self.insert(request);
        }
    }

    fn resolve<H: HostFacts + ?Sized>(self, host: &H) -> Result<Vec<MountRule>, SandboxError> {
        let mut resolved = Vec::with_capacity(self.rules.len());
        for (target, request) in self.rules {
            request.rule.validate()?;
            if let Some(source) = request.rule.source_path()
                && !host.exists(source)
            {
                match request.presence {
                    Presence::Required => {
                        return Err(SandboxError::InvalidPath(source.to_path_buf()));
                    }
                    Presence::Optional => {
                        debug!(
                            "Path {} does not exist on the host, dropped from mounts",
                            target.display()
                        );
                        continue;
                    }
                    Presence::Deferred => {}
                }
            }
            resolved.push(request.rule);
        }
        Ok(resolved)
    }
}

/// Rules applied to every sandbox, lowest priority.
fn default_rules<H: HostFacts + ?Sized>(host: &H, network: bool) -> Vec<RuleRequest> {
    let home = host.home_dir();
    let mut rules = vec![
        RuleRequest::required(MountRule::tmpfs("/")),
        RuleRequest::required(MountRule::read_only("/bin")),
        RuleRequest::required(MountRule::fresh("/dev", MountKind::FreshDeviceDir)),
        RuleRequest::optional(MountRule::device("/dev/dri")),
        RuleRequest::required(MountRule::read_only("/etc")),
        RuleRequest::required(MountRule::read_only("/lib")),
        RuleRequest::optional(MountRule::read_only("/lib32")),
        RuleRequest::optional(MountRule::read_only("/lib64")),
        RuleRequest::required(MountRule::fresh("/proc", MountKind::FreshProcDir)),
        RuleRequest::required(MountRule::read_only("/sys")),
        RuleRequest::required(MountRule::tmpfs("/tmp")),
        RuleRequest::required(MountRule::read_only("/usr")),
        RuleRequest::required(MountRule::tmpfs(&home)),
        RuleRequest::required(MountRule::tmpfs(home.join(".wine"))),
    ];
    if network {
        rules.push(RuleRequest::optional(MountRule::read_only(
            "/run/NetworkManager/resolv.conf",
        )));
    }
    rules
}

/// Read-only binds for the program file itself (and its `.exe` siblings) when
/// it is given by path rather than looked up in `PATH`.
fn program_rules<H: HostFacts + ?Sized>(host: &H, program: &[String]) -> Vec<RuleRequest> {
    let Some(argv0) = program.first().filter(|a| a.contains('/')) else {
        return Vec::new();
    };
    let real = host.canonicalize(Path::new(argv0));
    let mut rules = vec![RuleRequest::optional(MountRule::read_only(&real))];
    for suffix in [".exe", ".EXE"] {
        let mut sibling = real.clone().into_os_string();
        sibling.push(suffix);
        rules.push(RuleRequest::optional(MountRule::read_only(PathBuf::from(
            sibling,
        ))));
    }
    rules
}

/// Keep only `PATH` entries that resolve to a bind inside the sandbox.
///
/// The deepest rule covering an entry decides: entries under a fresh
/// filesystem (or outside every rule) would be empty or missing in the
/// sandbox and are dropped.
fn filter_search_path<H: HostFacts + ?Sized>(
    host: &H,
    host_path: &str,
    rules: &[MountRule],
) -> String {
    let mut kept = Vec::new();
    for entry in host_path.split(':').filter(|e| !e.is_empty()) {
        let real = host.canonicalize(Path::new(entry));
        let covering = rules
            .iter()
            .filter(|rule| real.starts_with(&rule.target))
            .max_by_key(|rule| rule.target.components().count());
        match covering {
            Some(rule) if rule.kind.is_bind() => kept.push(real.to_string_lossy().into_owned()),
            _ => debug!(
                "Path {} will not exist in sandbox mount stack, dropped from $PATH",
                real.display()
            ),
        }
    }
    kept.join(":")
}

fn command_vector(intent: &Intent) -> Vec<String> {
    let mut command: Vec<String> = Vec::new();
    let shell = |script: &str| ["sh".to_string(), "-c".to_string(), script.to_string()];

    if intent.with_wine {
        command.extend(shell(WINESERVER_WRAPPER));
        let fresh_profile = intent.runtime_prefix.is_none();
        if intent.x11.is_enabled() && (intent.configure || fresh_profile) {
            command.extend(shell(WINECFG_WRAPPER));
        }
    }

    match intent.program.split_first() {
        Some((program, args)) => {
            if intent.with_wine {
                command.push("wine".to_string());
            }
            command.push(program.clone());
            command.extend(args.iter().cloned());
        }
        None => command.push("true".to_string()),
    }
    command
}

/// Compile an intent into a sandbox plan.
///
/// Layers, lowest priority first: defaults, auxiliary services, runtime
/// prefix, program binds, user pass-throughs. A later layer replaces an
/// earlier rule for the same target.
pub fn compile<H: HostFacts + ?Sized>(
    intent: &Intent,
    host: &H,
    services: &ServiceContribution,
    options: &CompileOptions,
) -> Result<SandboxPlan, SandboxError> {
    let mut rules = RuleSet::default();
    rules.extend(default_rules(host, intent.network));
    rules.extend(services.rules.iter().cloned());

    if let Some(prefix) = &intent.runtime_prefix {
        let target = host.home_dir().join(".wine");
        let rule = MountRule::bind_at(&prefix.path, target, prefix.access.bind_kind());
        // A fresh prefix is created right before launch.
        rules.insert(if prefix.fresh {
            RuleRequest::deferred(rule)
        } else {
            RuleRequest::required(rule)
        });
    }

    rules.extend(program_rules(host, &intent.program));

    for pass in &intent.passes {
        rules.insert(RuleRequest::required(MountRule::bind(
            &pass.path,
            pass.access.bind_kind(),
        )));
    }

    let rules = rules.resolve(host)?;

    let mut env = BTreeMap::new();
    let allow = DEFAULT_ENV_ALLOW
        .iter()
        .copied()
        .chain(options.extra_env.iter().map(String::as_str));
    for name in allow {
        if let Some(value) = host.env_var(name) {
            env.insert(name.to_string(), value);
        }
    }
    env.extend(services.env.clone());
    if let Some(host_path) = host.env_var("PATH") {
        env.insert(
            "PATH".to_string(),
            filter_search_path(host, &host_path, &rules),
        );
    }

    Ok(SandboxPlan {
        rules,
        env,
        share_network: intent.network,
        command: command_vector(intent),
    })
}
