//! Capability profiles.
//!
//! A [`CapabilityProfile`] is everything that decides how a worker process is
//! invoked: role, working directory, argument list, environment and
//! executable. Its `signature` hashes exactly those inputs, so two sessions
//! whose profiles hash equal can share one worker. The session key is never
//! part of the hash.
//!
//! Resource lists (skills, extensions, prompt templates) are merged from
//! layers with precedence role > gateway > base. Entries are normalized to
//! absolute paths and the first occurrence wins.

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use switchyard_core::SessionKey;
use switchyard_settings::{GatewaySettings, RoleCapabilities, expand_home};
use tracing::debug;

/// Resource merge strategy recorded in the signature.
const MERGE_MODE: &str = "append";

/// Tools enabled when only a deny list is configured.
const KNOWN_TOOLS: &[&str] = &["read", "bash", "edit", "write", "grep", "find", "ls"];

/// Number of merged resources of each kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCounts {
    /// Skills.
    pub skills: usize,
    /// Extensions.
    pub extensions: usize,
    /// Prompt templates.
    pub prompt_templates: usize,
}

/// Worker invocation profile and its reuse key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityProfile {
    /// Role the worker serves.
    pub role: String,
    /// Working directory.
    pub cwd: PathBuf,
    /// Executable.
    pub executable: String,
    /// Arguments (excluding the per-worker `--session-dir`).
    pub args: Vec<String>,
    /// Extra environment, sorted.
    pub env: BTreeMap<String, String>,
    /// Hex SHA-256 over the fields above.
    pub signature: String,
    /// Merged resource counts.
    pub resource_counts: ResourceCounts,
}

/// Per-dispatch inputs to [`CapabilityProfile::build`].
#[derive(Clone, Copy, Debug)]
pub struct ProfileRequest<'a> {
    /// Role resolved for the session.
    pub role: &'a str,
    /// Working directory for the role.
    pub cwd: &'a Path,
    /// Session being served. Logged, never hashed.
    pub session_key: Option<&'a SessionKey>,
    /// Model override (`provider/model`), e.g. from the agent definition.
    pub model: Option<&'a str>,
}

impl<'a> ProfileRequest<'a> {
    /// Request for a role and working directory with no session or model override.
    pub fn new(role: &'a str, cwd: &'a Path) -> Self {
        Self {
            role,
            cwd,
            session_key: None,
            model: None,
        }
    }
}

impl CapabilityProfile {
    /// Build the profile for a role. Pure apart from reading the process cwd
    /// to absolutize relative resource paths.
    pub fn build(settings: &GatewaySettings, request: &ProfileRequest<'_>) -> Self {
        let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Self::build_in(settings, request, &base_dir)
    }

    /// [`build`](Self::build) with an explicit base for relative paths.
    pub fn build_in(settings: &GatewaySettings, request: &ProfileRequest<'_>, base_dir: &Path) -> Self {
        let agent = &settings.agent;
        let empty = RoleCapabilities::default();
        let role_caps = settings.roles.capabilities.get(request.role).unwrap_or(&empty);

        let extensions = merge_layers(&[&role_caps.extensions, &agent.extensions], base_dir);
        let skills = resolve_skills(
            &role_caps.skills,
            &agent.skills_gateway,
            &agent.skills_base,
            &agent.skills,
            base_dir,
        );
        let templates = merge_layers(&[&role_caps.prompt_templates, &agent.prompt_templates], base_dir);

        let mut args: Vec<String> = vec!["--mode".into(), "rpc".into()];

        // Model selection and thinking level
        // A bare model name leaves the worker on its own default
        let model = request.model.or(agent.model.as_deref()).map(str::trim);
        if let Some((provider, id)) = model.and_then(|m| m.split_once('/')) {
            if !provider.is_empty() && !id.is_empty() {
                args.extend(["--provider".into(), provider.into(), "--model".into(), id.into()]);
            }
        }
        let thinking = agent.thinking_level.trim();
        if !thinking.is_empty() && thinking != "off" {
            args.extend(["--thinking".into(), thinking.into()]);
        }

        // Tool policy
        if !agent.tools.allow.is_empty() {
            args.extend(["--tools".into(), agent.tools.allow.join(",")]);
        } else if !agent.tools.deny.is_empty() {
            let allowed: Vec<&str> = KNOWN_TOOLS
                .iter()
                .copied()
                .filter(|t| !agent.tools.deny.iter().any(|d| d == t))
                .collect();
            args.extend(["--tools".into(), allowed.join(",")]);
        }

        // Prompts
        if let Some(prompt) = agent.system_prompt.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            args.extend(["--system-prompt".into(), expand_home(prompt).display().to_string()]);
        }
        if let Some(append) = agent
            .append_system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            args.extend(["--append-system-prompt".into(), append.into()]);
        }

        // Discovery
        if agent.no_extensions {
            args.push("--no-extensions".into());
        }
        if agent.no_skills {
            args.push("--no-skills".into());
        }
        if agent.no_prompt_templates {
            args.push("--no-prompt-templates".into());
        }

        push_repeated(&mut args, "--extension", &extensions);
        push_repeated(&mut args, "--skill", &skills);
        push_repeated(&mut args, "--prompt-template", &templates);

        let mut env = agent.env.clone();
        if let Some(dir) = agent.runtime.agent_dir.as_deref() {
            let _ = env.insert("WORKER_AGENT_DIR".into(), normalize_path(dir, base_dir));
        }
        if let Some(dir) = agent.runtime.package_dir.as_deref() {
            let _ = env.insert("WORKER_PACKAGE_DIR".into(), normalize_path(dir, base_dir));
        }

        let cwd = PathBuf::from(normalize_path(&request.cwd.display().to_string(), base_dir));
        let mut profile = Self::from_parts(request.role, cwd, &agent.executable, args, env);
        profile.resource_counts = ResourceCounts {
            skills: skills.len(),
            extensions: extensions.len(),
            prompt_templates: templates.len(),
        };
        debug!(
            role = request.role,
            session_key = request.session_key.map(SessionKey::as_str),
            signature = %profile.short_signature(),
            skills = skills.len(),
            extensions = extensions.len(),
            "built capability profile"
        );
        profile
    }

    /// Assemble a profile from explicit parts and compute its signature.
    pub fn from_parts(
        role: &str,
        cwd: PathBuf,
        executable: &str,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        let signature = compute_signature(role, &cwd, executable, &args, &env);
        Self {
            role: role.to_string(),
            cwd,
            executable: executable.to_string(),
            args,
            env,
            signature,
            resource_counts: ResourceCounts::default(),
        }
    }

    /// First 12 hex characters of the signature, for logs.
    pub fn short_signature(&self) -> &str {
        &self.signature[..self.signature.len().min(12)]
    }
}

/// Hex SHA-256 of the canonical JSON encoding of the invocation.
fn compute_signature(
    role: &str,
    cwd: &Path,
    executable: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
) -> String {
    let env_pairs: Vec<[&str; 2]> = env.iter().map(|(k, v)| [k.as_str(), v.as_str()]).collect();
    let canonical = serde_json::json!({
        "role": role,
        "cwd": cwd.display().to_string(),
        "args": args,
        "env": env_pairs,
        "executable": executable,
        "mergeMode": MERGE_MODE,
    });
    format!("{:x}", Sha256::digest(canonical.to_string().as_bytes()))
}

/// Skills from role > gateway > base layers, or the legacy list verbatim
/// when no layer is populated.
pub fn resolve_skills(
    role: &[String],
    gateway: &[String],
    base: &[String],
    legacy: &[String],
    base_dir: &Path,
) -> Vec<String> {
    if role.is_empty() && gateway.is_empty() && base.is_empty() {
        return legacy.to_vec();
    }
    merge_layers(&[role, gateway, base], base_dir)
}

/// Concatenate layers in precedence order, keeping the first occurrence of
/// each normalized path.
pub fn merge_layers(layers: &[&[String]], base_dir: &Path) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for layer in layers {
        for entry in *layer {
            let trimmed = entry.trim();
            if trimmed.is_empty() {
                continue;
            }
            let normalized = normalize_path(trimmed, base_dir);
            if seen.insert(normalized.clone()) {
                merged.push(normalized);
            }
        }
    }
    merged
}

/// Expand `~`, absolutize against `base_dir` and remove `.`/`..` components.
/// URI-like specifiers (`npm:pkg`, `https://...`) are returned untouched.
pub fn normalize_path(input: &str, base_dir: &Path) -> String {
    if is_uri_like(input) {
        return input.to_string();
    }
    let expanded = expand_home(input);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out.display().to_string()
}

fn is_uri_like(value: &str) -> bool {
    let bytes = value.as_bytes();
    // Windows drive paths like C:\foo are paths, not URIs
    if bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && matches!(bytes[2], b'\\' | b'/') {
        return false;
    }
    let Some(colon) = value.find(':') else {
        return false;
    };
    let scheme = &value[..colon];
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'))
}

fn push_repeated(args: &mut Vec<String>, flag: &str, values: &[String]) {
    for value in values {
        args.push(flag.to_string());
        args.push(value.clone());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
