//! Supervised process groups
//!
//! A [`Group`] launches several members, waits until each is ready, and
//! then supervises them from a coordinator task. The coordinator reacts to
//! two things: member exits and teardown requests from the [`Group`]
//! handle.
//!
//! - A member exiting before teardown is a fault (unless its exit policy
//!   tolerates it). The group records it and forwards the configured fault
//!   signal to every survivor.
//! - The first teardown request wins; later ones are ignored.
//! - Members still alive after the teardown grace period are killed.
//!
//! Staged groups start members one after another, each waiting for the
//! previous one to be ready, and signal them in reverse start order.
//! Parallel groups start everything at once and check readiness
//! concurrently. In both styles, a member that must not exit dying before
//! the group is up fails the start.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use cellrig_core::{HarnessConfig, HarnessError, Result, Signal};

use crate::member::{ExitPolicy, MemberSpec};
use crate::session::Session;

/// How members are started and torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStyle {
    /// All at once
    Parallel,
    /// One at a time, in order; torn down in reverse
    Staged,
}

/// A started member
#[derive(Debug, Clone)]
pub struct Member {
    name: String,
    session: Session,
    exit_policy: ExitPolicy,
}

impl Member {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn exit_policy(&self) -> ExitPolicy {
        self.exit_policy
    }
}

/// Exit code of one member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberExit {
    pub name: String,
    pub code: i32,
}

/// Outcome of a group run, available once every member has exited
#[derive(Debug, Clone, Default)]
pub struct GroupReport {
    /// One entry per member, in start order
    pub exits: Vec<MemberExit>,
    /// Signal the group was torn down with, if any
    pub teardown_signal: Option<Signal>,
    /// Member whose exit triggered teardown
    pub fault: Option<MemberExit>,
    /// Whether survivors had to be killed after the grace period
    pub escalated: bool,
}

impl GroupReport {
    pub fn code(&self, member: &str) -> Option<i32> {
        self.exits
            .iter()
            .find(|exit| exit.name == member)
            .map(|exit| exit.code)
    }

    /// Fail with `MemberFault` if a member brought the group down
    pub fn check(&self) -> Result<()> {
        match &self.fault {
            Some(fault) => Err(HarnessError::MemberFault {
                member: fault.name.clone(),
                code: fault.code,
            }),
            None => Ok(()),
        }
    }
}

/// Requests from the handle to the coordinator
#[derive(Debug)]
enum GroupCommand {
    Teardown(Signal),
}

/// Handle to a running group
///
/// Dropping the handle kills any member that is still running.
pub struct Group {
    style: GroupStyle,
    members: Arc<[Member]>,
    torn_down: Arc<AtomicBool>,
    command_tx: mpsc::Sender<GroupCommand>,
    fault_rx: watch::Receiver<Option<MemberExit>>,
    report_rx: watch::Receiver<Option<GroupReport>>,
}

impl Group {
    /// Start every member at once and wait until all are ready
    ///
    /// If any member fails to start, exits, or does not become ready,
    /// every started member is killed and the first failure is returned.
    pub async fn start_parallel(config: &HarnessConfig, specs: Vec<MemberSpec>) -> Result<Self> {
        validate(&specs)?;
        info!("Starting parallel group of {} members", specs.len());

        let mut members = Vec::with_capacity(specs.len());
        for spec in &specs {
            match spec.launch(config) {
                Ok(session) => members.push(Member::started(spec, session)),
                Err(e) => {
                    abort(&members, config).await;
                    return Err(e);
                }
            }
        }

        let checks = specs
            .iter()
            .zip(&members)
            .map(|(spec, member)| spec.await_ready(&member.session, config));
        let ready = async { try_join_all(checks).await.map(drop) };
        if let Err(e) = guard_startup(GroupStyle::Parallel, &members, ready).await {
            warn!("Parallel group failed to come up: {}", e);
            abort(&members, config).await;
            return Err(e);
        }

        Self::come_up(GroupStyle::Parallel, members, config).await
    }

    /// Start members in order, each once the previous one is ready
    ///
    /// An earlier member with a fatal exit policy that exits while a later
    /// one is starting fails the whole start. On failure the members
    /// already started are killed and the remaining members are never
    /// launched.
    pub async fn start_staged(config: &HarnessConfig, specs: Vec<MemberSpec>) -> Result<Self> {
        validate(&specs)?;
        info!("Starting staged group of {} members", specs.len());

        let mut members: Vec<Member> = Vec::with_capacity(specs.len());
        for spec in &specs {
            let session = match spec.launch(config) {
                Ok(session) => session,
                Err(e) => {
                    abort(&members, config).await;
                    return Err(e);
                }
            };
            members.push(Member::started(spec, session.clone()));

            let ready = spec.await_ready(&session, config);
            if let Err(e) = guard_startup(GroupStyle::Staged, &members, ready).await {
                warn!(member = %spec.name, "Staged group failed to come up: {}", e);
                abort(&members, config).await;
                return Err(e);
            }
        }

        Self::come_up(GroupStyle::Staged, members, config).await
    }

    /// Hand a started group to the coordinator, unless a member already died
    async fn come_up(style: GroupStyle, members: Vec<Member>, config: &HarnessConfig) -> Result<Self> {
        let dead = members
            .iter()
            .find(|member| is_fatal(style, member) && member.session.has_exited());
        if let Some(member) = dead {
            let fault = HarnessError::MemberFault {
                member: member.name.clone(),
                code: member.session.exit_code(),
            };
            error!(member = %member.name, "Member exited before the group was up");
            abort(&members, config).await;
            return Err(fault);
        }

        Ok(Self::supervise(style, members, config))
    }

    fn supervise(style: GroupStyle, members: Vec<Member>, config: &HarnessConfig) -> Self {
        let members: Arc<[Member]> = members.into();
        let torn_down = Arc::new(AtomicBool::new(false));
        let (command_tx, command_rx) = mpsc::channel(8);
        let (fault_tx, fault_rx) = watch::channel(None);
        let (report_tx, report_rx) = watch::channel(None);

        let coordinator = Coordinator {
            style,
            members: members.clone(),
            torn_down: torn_down.clone(),
            fault_signal: config.fault_signal,
            grace: config.teardown_grace(),
        };
        tokio::spawn(coordinator.run(command_rx, fault_tx, report_tx));

        info!("Group is up with {} members", members.len());

        Self {
            style,
            members,
            torn_down,
            command_tx,
            fault_rx,
            report_rx,
        }
    }

    pub fn style(&self) -> GroupStyle {
        self.style
    }

    /// Members in start order
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, name: &str) -> Option<&Session> {
        self.members
            .iter()
            .find(|member| member.name == name)
            .map(|member| &member.session)
    }

    /// Begin teardown with `signal`
    ///
    /// Only the first call (or fault) takes effect.
    pub fn signal(&self, signal: Signal) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            info!(%signal, "Group already tearing down, ignoring signal");
            return;
        }
        if let Err(e) = self.command_tx.try_send(GroupCommand::Teardown(signal)) {
            // The coordinator only goes away once every member has exited
            warn!("Failed to request teardown: {}", e);
        }
    }

    /// The fault that triggered teardown, if one happened
    pub fn fault(&self) -> Option<HarnessError> {
        self.fault_rx
            .borrow()
            .as_ref()
            .map(|fault| HarnessError::MemberFault {
                member: fault.name.clone(),
                code: fault.code,
            })
    }

    /// Receiver that flips to `Some` when a member faults
    pub fn subscribe_faults(&self) -> watch::Receiver<Option<MemberExit>> {
        self.fault_rx.clone()
    }

    /// Wait up to `timeout` for every member to exit
    pub async fn wait(&self, timeout: Duration) -> Result<GroupReport> {
        let mut rx = self.report_rx.clone();
        let report = tokio::time::timeout(timeout, async move {
            rx.wait_for(Option::is_some).await.map(|report| (*report).clone())
        })
        .await
        .map_err(|_| HarnessError::timeout("group wait", timeout))?;

        report
            .ok()
            .flatten()
            .ok_or_else(|| HarnessError::Internal("group coordinator stopped without a report".into()))
    }

    /// Signal the group and wait for it to come down
    pub async fn stop(&self, signal: Signal, timeout: Duration) -> Result<GroupReport> {
        self.signal(signal);
        self.wait(timeout).await
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        // A teardown already in flight may be waiting out its grace period
        self.torn_down.store(true, Ordering::SeqCst);
        if let Err(e) = self.command_tx.try_send(GroupCommand::Teardown(Signal::Kill)) {
            debug!("Coordinator not listening on drop: {}", e);
        }
        for member in self.members.iter().rev() {
            if let Err(e) = member.session.kill() {
                warn!(member = %member.name, "Failed to kill member on drop: {}", e);
            }
        }
    }
}

impl Member {
    fn started(spec: &MemberSpec, session: Session) -> Self {
        Self {
            name: spec.name.clone(),
            session,
            exit_policy: spec.exit_policy,
        }
    }
}

/// Watches member exits and drives teardown
struct Coordinator {
    style: GroupStyle,
    members: Arc<[Member]>,
    torn_down: Arc<AtomicBool>,
    fault_signal: Signal,
    grace: Duration,
}

impl Coordinator {
    async fn run(
        self,
        mut command_rx: mpsc::Receiver<GroupCommand>,
        fault_tx: watch::Sender<Option<MemberExit>>,
        report_tx: watch::Sender<Option<GroupReport>>,
    ) {
        let mut exits: FuturesUnordered<_> = self
            .members
            .iter()
            .enumerate()
            .map(|(index, member)| {
                let session = member.session.clone();
                async move { (index, session.exited().await) }
            })
            .collect();

        let mut codes: Vec<Option<i32>> = vec![None; self.members.len()];
        let mut report = GroupReport::default();
        let mut escalate_at: Option<Instant> = None;
        let mut commands_open = true;
        // Only exits seen after the coordinator itself signalled count as teardown exits
        let mut tearing_down = false;

        while !exits.is_empty() {
            tokio::select! {
                biased;
                command = command_rx.recv(), if commands_open => match command {
                    Some(GroupCommand::Teardown(signal)) if tearing_down => {
                        debug!(%signal, "Group already tearing down, ignoring signal");
                    }
                    Some(GroupCommand::Teardown(signal)) => {
                        info!(%signal, "Tearing down group");
                        tearing_down = true;
                        escalate_at = Some(self.forward(signal, &mut report));
                    }
                    None => commands_open = false,
                },
                Some((index, code)) = exits.next() => {
                    codes[index] = Some(code);
                    let member = &self.members[index];

                    if tearing_down {
                        info!(member = %member.name, code, "Member exited during teardown");
                    } else if is_fatal(self.style, member) {
                        error!(member = %member.name, code, "Member exited unexpectedly, tearing down group");
                        tearing_down = true;
                        self.torn_down.store(true, Ordering::SeqCst);
                        let fault = MemberExit { name: member.name.clone(), code };
                        report.fault = Some(fault.clone());
                        fault_tx.send_replace(Some(fault));
                        escalate_at = Some(self.forward(self.fault_signal, &mut report));
                    } else {
                        warn!(member = %member.name, code, "Member exited, group keeps running");
                    }
                }
                _ = sleep_until(escalate_at.unwrap_or_else(Instant::now)), if escalate_at.is_some() => {
                    warn!("Teardown grace of {:?} expired, killing remaining members", self.grace);
                    escalate_at = None;
                    report.escalated = true;
                    for member in self.members.iter() {
                        if let Err(e) = member.session.kill() {
                            warn!(member = %member.name, "Failed to kill member: {}", e);
                        }
                    }
                }
            }
        }

        report.exits = self
            .members
            .iter()
            .zip(codes)
            .map(|(member, code)| MemberExit {
                name: member.name.clone(),
                code: code.unwrap_or(-1),
            })
            .collect();

        info!("All {} group members exited", report.exits.len());
        report_tx.send_replace(Some(report));
    }

    /// Send `signal` to every member and return the escalation deadline
    fn forward(&self, signal: Signal, report: &mut GroupReport) -> Instant {
        report.teardown_signal = Some(signal);

        let mut order: Vec<&Member> = self.members.iter().collect();
        if self.style == GroupStyle::Staged {
            order.reverse();
        }
        for member in order {
            if let Err(e) = member.session.signal(signal) {
                warn!(member = %member.name, "Failed to forward {}: {}", signal, e);
            }
        }

        Instant::now() + self.grace
    }
}

/// Whether an unrequested exit of `member` brings the group down
fn is_fatal(style: GroupStyle, member: &Member) -> bool {
    match style {
        GroupStyle::Parallel => true,
        GroupStyle::Staged => member.exit_policy == ExitPolicy::Fatal,
    }
}

/// Run a readiness check, failing early if a started member exits fatally
async fn guard_startup<F>(style: GroupStyle, members: &[Member], ready: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let mut exits: FuturesUnordered<_> = members
        .iter()
        .filter(|member| is_fatal(style, member))
        .map(|member| async move { (member, member.session.exited().await) })
        .collect();

    tokio::select! {
        biased;
        result = ready => result,
        Some((member, code)) = exits.next() => {
            error!(member = %member.name, code, "Member exited during group startup");
            Err(HarnessError::MemberFault { member: member.name.clone(), code })
        }
    }
}

/// Kill already started members after a failed start
async fn abort(members: &[Member], config: &HarnessConfig) {
    let grace = config.teardown_grace();
    let waits = members.iter().rev().map(|member| async move {
        if let Err(e) = member.session.kill_and_wait(grace).await {
            warn!(member = %member.name, "Failed to stop member: {}", e);
        }
    });
    futures::future::join_all(waits).await;
}

fn validate(specs: &[MemberSpec]) -> Result<()> {
    if specs.is_empty() {
        return Err(HarnessError::Config("a group needs at least one member".into()));
    }
    for (index, spec) in specs.iter().enumerate() {
        if specs[..index].iter().any(|other| other.name == spec.name) {
            return Err(HarnessError::Config(format!(
                "duplicate member name `{}`",
                spec.name
            )));
        }
    }
    Ok(())
}
