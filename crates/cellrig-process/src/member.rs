//! Group member specifications and readiness checks

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info};

use cellrig_core::{HarnessConfig, HarnessError, Pattern, Result};
use cellrig_poll::{be_true, eventually, say, Observe, Observed};

use crate::session::Session;
use crate::sink::{OutputSink, PrefixedWriter};

/// External check that a member is serving
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// One attempt; `false` means "not yet"
    async fn probe(&self) -> bool;

    fn describe(&self) -> String;
}

/// Ready once a TCP connection to `address` succeeds
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn probe(&self) -> bool {
        match TcpStream::connect(&self.address).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Probe connect to {} failed: {}", self.address, e);
                false
            }
        }
    }

    fn describe(&self) -> String {
        format!("tcp connect to {}", self.address)
    }
}

/// When a freshly started member counts as ready
#[derive(Clone, Default)]
pub enum Readiness {
    /// As soon as the process is spawned
    #[default]
    Immediate,
    /// Once stdout matches the pattern
    Output(Pattern),
    /// Once the probe succeeds
    Probe(Arc<dyn ReadinessProbe>),
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Immediate => write!(f, "Immediate"),
            Readiness::Output(pattern) => write!(f, "Output({})", pattern),
            Readiness::Probe(probe) => write!(f, "Probe({})", probe.describe()),
        }
    }
}

/// What an unrequested exit of a member means for its group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitPolicy {
    /// The group tears down
    #[default]
    Fatal,
    /// The exit is recorded and the group keeps running
    Tolerated,
}

/// Everything needed to launch and check one member
#[derive(Debug, Clone)]
pub struct MemberSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
    pub readiness: Readiness,
    pub exit_policy: ExitPolicy,
    /// Overrides the configured readiness timeout
    pub readiness_timeout: Option<Duration>,
    /// Overrides the configured output mirroring
    pub mirror: Option<bool>,
}

impl MemberSpec {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
            readiness: Readiness::Immediate,
            exit_policy: ExitPolicy::Fatal,
            readiness_timeout: None,
            mirror: None,
        }
    }

    /// Member that runs `script` through `sh -c`
    pub fn shell(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(name, "sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn ready_on_output(mut self, pattern: impl Into<Pattern>) -> Self {
        self.readiness = Readiness::Output(pattern.into());
        self
    }

    pub fn ready_on_probe(mut self, probe: impl ReadinessProbe + 'static) -> Self {
        self.readiness = Readiness::Probe(Arc::new(probe));
        self
    }

    pub fn tolerate_exit(mut self) -> Self {
        self.exit_policy = ExitPolicy::Tolerated;
        self
    }

    pub fn readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = Some(timeout);
        self
    }

    pub fn mirror(mut self, mirror: bool) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }

    /// Spawn the member, mirroring its output to stderr when configured
    pub(crate) fn launch(&self, config: &HarnessConfig) -> Result<Session> {
        let (out_sink, err_sink): (Option<Box<dyn OutputSink>>, Option<Box<dyn OutputSink>>) =
            if self.mirror.unwrap_or(config.mirror_output) {
                (
                    Some(Box::new(PrefixedWriter::new(
                        format!("[o][{}] ", self.name),
                        std::io::stderr(),
                    ))),
                    Some(Box::new(PrefixedWriter::new(
                        format!("[e][{}] ", self.name),
                        std::io::stderr(),
                    ))),
                )
            } else {
                (None, None)
            };
        Session::start(self.command(), out_sink, err_sink)
    }

    /// Block until the member's readiness condition holds
    ///
    /// Fails with `ReadinessTimeout` when the condition does not hold in
    /// time, or `MemberFault` when the member exits first.
    pub(crate) async fn await_ready(&self, session: &Session, config: &HarnessConfig) -> Result<()> {
        let timeout = self.readiness_timeout.unwrap_or(config.readiness_timeout());
        let interval = config.poll_interval().min(timeout);

        let outcome = match &self.readiness {
            Readiness::Immediate => return Ok(()),
            Readiness::Output(pattern) => eventually(session.clone())
                .within(timeout)
                .every(interval)
                .should(say(pattern.clone()))
                .await
                .map(|_| ()),
            Readiness::Probe(probe) => eventually(ProbeTarget {
                session: session.clone(),
                probe: probe.clone(),
            })
            .within(timeout)
            .every(interval)
            .should(be_true())
            .await
            .map(|_| ()),
        };

        match outcome {
            Ok(()) => {
                info!(member = %self.name, "Member ready");
                Ok(())
            }
            Err(_) if session.has_exited() => Err(HarnessError::MemberFault {
                member: self.name.clone(),
                code: session.exit_code(),
            }),
            Err(e) => Err(HarnessError::ReadinessTimeout {
                member: self.name.clone(),
                timeout,
                reason: e.to_string(),
            }),
        }
    }
}

/// Probe results paired with the liveness of the probed member
struct ProbeTarget {
    session: Session,
    probe: Arc<dyn ReadinessProbe>,
}

#[async_trait]
impl Observe for ProbeTarget {
    type Output = bool;

    async fn observe(&mut self) -> Result<Observed<bool>> {
        if self.session.has_exited() {
            return Ok(Observed::settled(
                false,
                format!("member exited with code {}", self.session.exit_code()),
            ));
        }
        Ok(Observed::open(self.probe.probe().await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let spec = MemberSpec::shell("rep", "echo ready")
            .env("PORT", "8080")
            .ready_on_output("ready")
            .tolerate_exit()
            .readiness_timeout(Duration::from_millis(250));

        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, vec!["-c".to_string(), "echo ready".to_string()]);
        assert_eq!(spec.env.get("PORT").map(String::as_str), Some("8080"));
        assert_eq!(spec.exit_policy, ExitPolicy::Tolerated);
        assert!(matches!(spec.readiness, Readiness::Output(_)));
        assert_eq!(spec.readiness_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_readiness_debug() {
        let readiness = Readiness::Probe(Arc::new(TcpProbe::new("127.0.0.1:1")));
        assert_eq!(format!("{:?}", readiness), "Probe(tcp connect to 127.0.0.1:1)");
        assert_eq!(format!("{:?}", Readiness::default()), "Immediate");
    }

    #[test]
    fn test_exit_policy_serde() {
        let policy: ExitPolicy = serde_json::from_str("\"tolerated\"").unwrap();
        assert_eq!(policy, ExitPolicy::Tolerated);
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        assert!(TcpProbe::new(address.clone()).probe().await);

        drop(listener);
        assert!(!TcpProbe::new(address).probe().await);
    }
}
