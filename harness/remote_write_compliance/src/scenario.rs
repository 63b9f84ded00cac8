//! One scenario run: serve scrape text, start the sender under test against a
//! scripted receiver, wait for the script to finish or the deadline, tear it
//! all down and hand back what was captured.

use std::fmt;
use std::future::{self, Future};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::Serialize;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::ScenarioConfig;
use crate::endpoint::{MockEndpoint, ResponseScript, RunningServer};
use crate::error::ComplianceError;
use crate::exposition::{ExpositionFormat, ScrapeTarget};
use crate::retry;
use crate::store::{CapturedRequest, RequestStore};
use crate::transport::ProtocolVersion;
use crate::validate::{self, Expectations, Report};
use crate::Result;

/// Addresses handed to a launcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LaunchContext {
    pub remote_write_url: String,
    pub scrape_url: String,
    pub scrape_address: SocketAddr,
    pub protocol_version: ProtocolVersion,
}

impl LaunchContext {
    /// Replace `{remote_write_url}`, `{scrape_url}`, `{scrape_address}` and
    /// `{protocol_version}` in `template`.
    pub fn substitute(&self, template: &str) -> String {
        template
            .replace("{remote_write_url}", &self.remote_write_url)
            .replace("{scrape_url}", &self.scrape_url)
            .replace("{scrape_address}", &self.scrape_address.to_string())
            .replace("{protocol_version}", &self.protocol_version.to_string())
    }
}

/// Starts a sender (or receiver) under test.
#[async_trait]
pub trait Launcher: Send + Sync {
    fn name(&self) -> &str;

    async fn launch(&self, ctx: &LaunchContext) -> Result<Box<dyn RunningTarget>>;
}

/// A started sender. `stop` must return within roughly `grace`.
#[async_trait]
pub trait RunningTarget: Send {
    async fn stop(self: Box<Self>, grace: Duration) -> Result<()>;
}

/// Launchers by name. Built by the caller and passed in, never global.
#[derive(Clone, Default)]
pub struct LauncherRegistry {
    launchers: HashMap<String, Arc<dyn Launcher>>,
}

impl fmt::Debug for LauncherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LauncherRegistry")
            .field("launchers", &self.names())
            .finish()
    }
}

impl LauncherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a launcher under its own name, returning any it replaced.
    pub fn register(&mut self, launcher: Arc<dyn Launcher>) -> Option<Arc<dyn Launcher>> {
        self.launchers.insert(launcher.name().to_string(), launcher)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Launcher>> {
        self.launchers
            .get(name)
            .cloned()
            .ok_or_else(|| ComplianceError::Launch(format!("no launcher registered as '{name}'")))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.launchers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Runs an external binary, with launch placeholders substituted into its
/// arguments and environment.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl ProcessLauncher {
    pub fn new(name: &str, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn launch(&self, ctx: &LaunchContext) -> Result<Box<dyn RunningTarget>> {
        let args: Vec<String> = self.args.iter().map(|a| ctx.substitute(a)).collect();

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            command.env(key, ctx.substitute(value));
        }

        let child = command.spawn().map_err(|e| {
            ComplianceError::Launch(format!("failed to start {}: {e}", self.program.display()))
        })?;
        info!(launcher = %self.name, pid = child.id(), ?args, "sender started");

        Ok(Box::new(ProcessTarget {
            name: self.name.clone(),
            child,
        }))
    }
}

struct ProcessTarget {
    name: String,
    child: Child,
}

#[async_trait]
impl RunningTarget for ProcessTarget {
    async fn stop(self: Box<Self>, grace: Duration) -> Result<()> {
        let ProcessTarget { name, mut child } = *self;

        if let Ok(Some(status)) = child.try_wait() {
            debug!(launcher = %name, %status, "sender already exited");
            return Ok(());
        }

        interrupt(&child);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                let status = status.map_err(|e| ComplianceError::io("wait for sender", e))?;
                info!(launcher = %name, %status, "sender stopped");
                Ok(())
            }
            Err(_) => {
                warn!(launcher = %name, ?grace, "sender ignored interrupt, killing");
                child
                    .kill()
                    .await
                    .map_err(|e| ComplianceError::io("kill sender", e))
            }
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(id) = child.id() else {
        return;
    };
    // CAST: pids fit an i32 on every unix.
    if let Err(err) = kill(Pid::from_raw(id as i32), Signal::SIGINT) {
        warn!(%err, pid = id, "failed to interrupt sender");
    }
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) {}

/// The inputs of one run.
#[derive(Clone, Debug)]
pub struct Scenario {
    pub name: String,
    pub scrape_text: String,
    pub scrape_format: ExpositionFormat,
    pub script: ResponseScript,
}

impl Scenario {
    pub fn new(name: &str, scrape_text: &str, script: ResponseScript) -> Self {
        Self {
            name: name.to_string(),
            scrape_text: scrape_text.to_string(),
            scrape_format: ExpositionFormat::default(),
            script,
        }
    }

    pub fn with_format(mut self, format: ExpositionFormat) -> Self {
        self.scrape_format = format;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Completion {
    /// The last script entry was served.
    ScriptFinished,
    /// The deadline passed first. Not a failure by itself.
    TimedOut,
    /// The caller asked the run to stop.
    Stopped,
}

#[derive(Clone, Debug)]
pub struct ScenarioOutcome {
    pub name: String,
    pub version: ProtocolVersion,
    pub script: ResponseScript,
    pub requests: Vec<Arc<CapturedRequest>>,
    pub completion: Completion,
    /// Calls answered after the script was exhausted.
    pub late_requests: usize,
    pub elapsed: Duration,
}

impl ScenarioOutcome {
    pub fn timed_out(&self) -> bool {
        self.completion == Completion::TimedOut
    }

    /// Protocol checks over every captured request, plus retry checks when
    /// the script answered with anything but success.
    pub fn validate(&self, expect: &Expectations) -> Report {
        let mut report = validate::validate_requests(&self.requests, expect);
        if self.script.entries().iter().any(|e| !e.is_success()) {
            retry::check_retry_policy(&self.requests, &self.script, &mut report);
            retry::check_backoff(&self.requests, &mut report);
        }
        report
    }
}

/// Run `scenario` against `launcher`.
///
/// Returns whatever was captured whether the script finished or the deadline
/// passed. Only failing to start the servers or the launcher is an error.
pub async fn run_scenario(
    scenario: &Scenario,
    launcher: &dyn Launcher,
    config: &ScenarioConfig,
) -> Result<ScenarioOutcome> {
    run_scenario_until(scenario, launcher, config, future::pending()).await
}

/// Like [`run_scenario`], but also ends when `stop` resolves. A stopped run
/// tears down the same way as one that finished or timed out: the sender is
/// interrupted and given the grace period before anything is killed.
pub async fn run_scenario_until(
    scenario: &Scenario,
    launcher: &dyn Launcher,
    config: &ScenarioConfig,
    stop: impl Future<Output = ()> + Send,
) -> Result<ScenarioOutcome> {
    let started = Instant::now();
    let store = RequestStore::with_poll_interval(config.poll_interval);
    let endpoint = MockEndpoint::new(scenario.script.clone(), config.protocol_version, store.clone());

    let receiver = RunningServer::start(&config.bind_address, endpoint.router()).await?;
    let scrape_target = ScrapeTarget::new(&scenario.scrape_text, scenario.scrape_format);
    let scrape = match RunningServer::start(&config.bind_address, scrape_target.router(&config.scrape_path)).await {
        Ok(scrape) => scrape,
        Err(err) => {
            receiver.stop_within(config.stop_grace_period).await;
            return Err(err);
        }
    };

    let ctx = LaunchContext {
        remote_write_url: receiver.url(&config.write_path),
        scrape_url: scrape.url(&config.scrape_path),
        scrape_address: scrape.addr,
        protocol_version: config.protocol_version,
    };
    info!(
        scenario = %scenario.name,
        launcher = launcher.name(),
        remote_write_url = %ctx.remote_write_url,
        scrape_url = %ctx.scrape_url,
        "starting scenario"
    );

    let target = match launcher.launch(&ctx).await {
        Ok(target) => target,
        Err(err) => {
            receiver.stop_within(config.stop_grace_period).await;
            scrape.stop_within(config.stop_grace_period).await;
            return Err(err);
        }
    };

    let completion = tokio::select! {
        _ = endpoint.done() => Completion::ScriptFinished,
        _ = tokio::time::sleep(config.timeout) => Completion::TimedOut,
        _ = stop => Completion::Stopped,
    };

    if let Err(err) = target.stop(config.stop_grace_period).await {
        warn!(scenario = %scenario.name, %err, "failed to stop sender");
    }
    receiver.stop_within(config.stop_grace_period).await;
    scrape.stop_within(config.stop_grace_period).await;

    let requests = store.snapshot();
    let elapsed = started.elapsed();
    match completion {
        Completion::ScriptFinished => {
            info!(scenario = %scenario.name, requests = requests.len(), ?elapsed, "scenario finished")
        }
        Completion::TimedOut => warn!(
            scenario = %scenario.name,
            requests = requests.len(),
            timeout = ?config.timeout,
            "scenario timed out"
        ),
        Completion::Stopped => {
            info!(scenario = %scenario.name, requests = requests.len(), ?elapsed, "scenario stopped")
        }
    }

    Ok(ScenarioOutcome {
        name: scenario.name.clone(),
        version: config.protocol_version,
        script: scenario.script.clone(),
        requests,
        completion,
        late_requests: endpoint.late_requests(),
        elapsed,
    })
}

/// Runs scenarios against launchers looked up by name.
#[derive(Debug)]
pub struct Orchestrator {
    registry: LauncherRegistry,
    config: ScenarioConfig,
}

impl Orchestrator {
    pub fn new(registry: LauncherRegistry, config: ScenarioConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    pub fn registry(&self) -> &LauncherRegistry {
        &self.registry
    }

    pub async fn run(&self, scenario: &Scenario, launcher: &str) -> Result<ScenarioOutcome> {
        let launcher = self.registry.get(launcher)?;
        run_scenario(scenario, launcher.as_ref(), &self.config).await
    }

    pub async fn run_until(
        &self,
        scenario: &Scenario,
        launcher: &str,
        stop: impl Future<Output = ()> + Send,
    ) -> Result<ScenarioOutcome> {
        let launcher = self.registry.get(launcher)?;
        run_scenario_until(scenario, launcher.as_ref(), &self.config, stop).await
    }
}
