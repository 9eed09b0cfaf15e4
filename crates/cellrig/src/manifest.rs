//! Group manifests
//!
//! A manifest is a JSON document describing one group:
//!
//! ```json
//! {
//!   "style": "staged",
//!   "config": { "readiness_timeout_ms": 10000 },
//!   "members": [
//!     { "name": "db", "command": ["./db", "--port", "5432"], "ready": { "tcp": "127.0.0.1:5432" } },
//!     { "name": "api", "command": ["./api"], "ready": { "output": "listening" } },
//!     { "name": "seed", "command": ["./seed"], "critical": false }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cellrig_core::{HarnessConfig, HarnessError, Pattern, Result};
use cellrig_process::{GroupStyle, MemberSpec, TcpProbe};

/// How the group is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    #[default]
    Staged,
    Parallel,
}

impl From<Style> for GroupStyle {
    fn from(style: Style) -> Self {
        match style {
            Style::Staged => GroupStyle::Staged,
            Style::Parallel => GroupStyle::Parallel,
        }
    }
}

/// Readiness condition of a member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ready {
    /// Literal text on stdout
    Output(String),
    /// Regular expression on stdout
    Regex(String),
    /// Successful TCP connect
    Tcp(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemberManifest {
    pub name: String,
    /// Program followed by its arguments
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub ready: Option<Ready>,
    /// Whether an unrequested exit brings the group down
    #[serde(default = "default_critical")]
    pub critical: bool,
    #[serde(default)]
    pub readiness_timeout_ms: Option<u64>,
    #[serde(default)]
    pub mirror: Option<bool>,
}

fn default_critical() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub config: HarnessConfig,
    #[serde(default)]
    pub style: Style,
    pub members: Vec<MemberManifest>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;

        if self.members.is_empty() {
            return Err(HarnessError::Config("manifest has no members".into()));
        }

        let mut seen = HashSet::new();
        for member in &self.members {
            if member.name.trim().is_empty() {
                return Err(HarnessError::Config("member name must not be empty".into()));
            }
            if !seen.insert(member.name.as_str()) {
                return Err(HarnessError::Config(format!(
                    "duplicate member name `{}`",
                    member.name
                )));
            }
            if member.command.is_empty() {
                return Err(HarnessError::Config(format!(
                    "member `{}` has an empty command",
                    member.name
                )));
            }
            if let Some(Ready::Regex(expr)) = &member.ready {
                Pattern::regex(expr)?;
            }
        }
        Ok(())
    }

    /// Build member specs in manifest order
    pub fn member_specs(&self) -> Result<Vec<MemberSpec>> {
        self.members.iter().map(MemberManifest::to_spec).collect()
    }
}

impl MemberManifest {
    fn to_spec(&self) -> Result<MemberSpec> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            HarnessError::Config(format!("member `{}` has an empty command", self.name))
        })?;

        let mut spec = MemberSpec::new(&self.name, program).args(args.iter().cloned());
        for (key, value) in &self.env {
            spec = spec.env(key, value);
        }
        if let Some(dir) = &self.dir {
            spec = spec.current_dir(dir);
        }
        spec = match &self.ready {
            None => spec,
            Some(Ready::Output(text)) => spec.ready_on_output(Pattern::literal(text)),
            Some(Ready::Regex(expr)) => spec.ready_on_output(Pattern::regex(expr)?),
            Some(Ready::Tcp(address)) => spec.ready_on_probe(TcpProbe::new(address)),
        };
        if !self.critical {
            spec = spec.tolerate_exit();
        }
        if let Some(ms) = self.readiness_timeout_ms {
            spec = spec.readiness_timeout(Duration::from_millis(ms));
        }
        if let Some(mirror) = self.mirror {
            spec = spec.mirror(mirror);
        }
        Ok(spec)
    }
}
