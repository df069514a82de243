//! Local daemon transport: libnfc or PC/SC tooling run as subprocesses.
//!
//! Each poll spawns one short-lived scanning process with a hard wall-clock
//! limit. The process is killed when the limit elapses or when the poll
//! future is dropped, so cancelling a scan never waits for the tool.
//!
//! # Detection
//!
//! 1. `nfc-list` exits 0 and mentions an `NFC device` → libnfc
//! 2. `pcsc_scan -n` mentions a `Reader` or `Card` within the probe limit → PC/SC
//! 3. otherwise no daemon transport is available
//!
//! With the `hardware-pcsc` feature, step 2 asks the PC/SC service directly.

use crate::error::{HardwareError, Result};
use crate::traits::{PolledTransport, Transport};
use crate::types::{DeviceHandle, DeviceInfo};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tagbridge_core::{RawReadEvent, TransportKind, constants::DEFAULT_SCAN_TIMEOUT_MS};
use tagbridge_protocol::DaemonOutput;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Placeholder in poll arguments replaced by the poll limit in whole seconds.
pub const TIMEOUT_PLACEHOLDER: &str = "{timeout_secs}";

/// External program invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Arguments with [`TIMEOUT_PLACEHOLDER`] substituted.
    ///
    /// ```
    /// use std::time::Duration;
    /// use tagbridge_hardware::drivers::daemon::CommandSpec;
    ///
    /// let spec = CommandSpec::new("nfc-poll", ["-t", "{timeout_secs}", "-k"]);
    /// assert_eq!(spec.render_args(Duration::from_millis(30_000)), ["-t", "30", "-k"]);
    /// assert_eq!(spec.render_args(Duration::from_millis(200)), ["-t", "1", "-k"]);
    /// ```
    pub fn render_args(&self, limit: Duration) -> Vec<String> {
        let secs = limit.as_secs().max(1).to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(TIMEOUT_PLACEHOLDER, &secs))
            .collect()
    }
}

/// Reader stack found by detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonReader {
    Libnfc,
    Pcsc,
}

impl DaemonReader {
    /// Output format of this stack's poll tool.
    pub fn output(self) -> DaemonOutput {
        match self {
            DaemonReader::Libnfc => DaemonOutput::Lines,
            DaemonReader::Pcsc => DaemonOutput::Json,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DaemonReader::Libnfc => "libnfc",
            DaemonReader::Pcsc => "pcsc",
        }
    }
}

/// Result of a successful detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonProbe {
    pub reader: DaemonReader,
    pub name: String,
}

/// Daemon transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub libnfc_probe: CommandSpec,
    pub pcsc_probe: CommandSpec,
    pub libnfc_poll: CommandSpec,
    pub pcsc_poll: CommandSpec,

    /// Force a decoder instead of the one implied by the detected stack.
    pub output: Option<DaemonOutput>,

    /// Wall-clock limit of each probe.
    pub probe_timeout_ms: u64,

    /// Wall-clock limit of each poll process.
    pub poll_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            libnfc_probe: CommandSpec::new("nfc-list", ["-t", "0.5"]),
            pcsc_probe: CommandSpec::new("pcsc_scan", ["-n"]),
            libnfc_poll: CommandSpec::new("nfc-poll", ["-t", TIMEOUT_PLACEHOLDER, "-k"]),
            pcsc_poll: CommandSpec::new("nfc-poll", ["-t", TIMEOUT_PLACEHOLDER, "-k"]),
            output: None,
            probe_timeout_ms: 3_000,
            poll_timeout_ms: DEFAULT_SCAN_TIMEOUT_MS,
        }
    }
}

impl DaemonConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Bound each poll by the scan deadline so no poll outlives its scan.
    ///
    /// ```
    /// use std::time::Duration;
    /// use tagbridge_hardware::drivers::daemon::DaemonConfig;
    ///
    /// let config = DaemonConfig::default().capped_to(Duration::from_secs(5));
    /// assert_eq!(config.poll_timeout(), Duration::from_secs(5));
    /// ```
    pub fn capped_to(mut self, scan_timeout: Duration) -> Self {
        let cap = u64::try_from(scan_timeout.as_millis()).unwrap_or(u64::MAX);
        self.poll_timeout_ms = self.poll_timeout_ms.min(cap);
        self
    }

    fn poll_command(&self, reader: DaemonReader) -> &CommandSpec {
        match reader {
            DaemonReader::Libnfc => &self.libnfc_poll,
            DaemonReader::Pcsc => &self.pcsc_poll,
        }
    }
}

/// What a bounded subprocess run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Exit code; `None` if the process was killed or died by signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Run `spec` for at most `limit`, keeping whatever it printed before the
/// limit elapsed.
///
/// # Errors
///
/// Returns `HardwareError::Io` only if the process cannot be spawned or its
/// pipes fail. Timeouts are reported through [`ProcessOutcome::timed_out`].
pub async fn run_bounded(
    spec: &CommandSpec,
    args: &[String],
    limit: Duration,
) -> Result<ProcessOutcome> {
    let mut command = Command::new(&spec.program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;
    let mut group = GroupKill::new(child.id());

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| HardwareError::communication("stdout not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| HardwareError::communication("stderr not captured"))?;

    let mut out = Vec::new();
    let mut err = Vec::new();
    let collect = async {
        let (read_out, read_err) =
            tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
        read_out?;
        read_err?;
        Ok::<_, std::io::Error>(child.wait().await?)
    };
    let finished = tokio::time::timeout(limit, collect).await;

    let (exit_code, timed_out) = match finished {
        Ok(status) => {
            group.disarm();
            (status?.code(), false)
        }
        Err(_) => {
            // Reaped by the runtime once killed.
            drop(group);
            let _ = child.start_kill();
            (None, true)
        }
    };

    Ok(ProcessOutcome {
        exit_code,
        stdout: String::from_utf8_lossy(&out).into_owned(),
        stderr: String::from_utf8_lossy(&err).into_owned(),
        timed_out,
    })
}

/// Kills the process group of a spawned tool when dropped.
///
/// Wrapper scripts fork the real reader utility; killing only the direct
/// child would leave it holding the reader.
struct GroupKill {
    pgid: Option<u32>,
}

impl GroupKill {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) on a negative pid only signals that process group.
    unsafe { libc::kill(-pgid, libc::SIGKILL) };
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Find a usable daemon stack.
///
/// Missing tools are not errors; detection simply moves on.
pub async fn detect(config: &DaemonConfig) -> Option<DaemonProbe> {
    let limit = config.probe_timeout();

    match run_bounded(&config.libnfc_probe, &config.libnfc_probe.args, limit).await {
        Ok(outcome) if outcome.success() && outcome.stdout.contains("NFC device") => {
            return Some(DaemonProbe {
                reader: DaemonReader::Libnfc,
                name: libnfc_device_name(&outcome.stdout),
            });
        }
        Ok(outcome) => debug!(
            exit_code = ?outcome.exit_code,
            timed_out = outcome.timed_out,
            "libnfc probe found no device"
        ),
        Err(e) => debug!(error = %e, program = %config.libnfc_probe.program, "libnfc probe unavailable"),
    }

    detect_pcsc(config).await
}

#[cfg(not(feature = "hardware-pcsc"))]
async fn detect_pcsc(config: &DaemonConfig) -> Option<DaemonProbe> {
    match run_bounded(&config.pcsc_probe, &config.pcsc_probe.args, config.probe_timeout()).await {
        Ok(outcome) if outcome.stdout.contains("Reader") || outcome.stdout.contains("Card") => {
            Some(DaemonProbe {
                reader: DaemonReader::Pcsc,
                name: "PC/SC reader".to_string(),
            })
        }
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, program = %config.pcsc_probe.program, "PC/SC probe unavailable");
            None
        }
    }
}

#[cfg(feature = "hardware-pcsc")]
async fn detect_pcsc(_config: &DaemonConfig) -> Option<DaemonProbe> {
    let readers = tokio::task::spawn_blocking(|| {
        let ctx = pcsc::Context::establish(pcsc::Scope::User).ok()?;
        ctx.list_readers_owned().ok()
    })
    .await
    .ok()
    .flatten()?;

    let name = readers.first()?.to_string_lossy().into_owned();
    Some(DaemonProbe {
        reader: DaemonReader::Pcsc,
        name,
    })
}

/// Extract the device name from `nfc-list` output.
///
/// `NFC device: ACS / ACR122U PICC Interface opened` → `ACS / ACR122U PICC Interface`.
fn libnfc_device_name(output: &str) -> String {
    output
        .lines()
        .find_map(|line| {
            let (_, rest) = line.split_once("NFC device:")?;
            let name = rest.trim().trim_end_matches("opened").trim();
            (!name.is_empty()).then(|| name.to_string())
        })
        .unwrap_or_else(|| "libnfc reader".to_string())
}

/// Polled daemon driver.
#[derive(Debug)]
pub struct DaemonDriver {
    config: DaemonConfig,
    reader: Option<DaemonReader>,
    probe: Option<DaemonProbe>,
}

impl DaemonDriver {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            reader: None,
            probe: None,
        }
    }

    /// Reuse a detection result for the next `open` instead of probing again.
    pub fn with_probe(mut self, probe: DaemonProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }
}

impl Transport for DaemonDriver {
    fn kind(&self) -> TransportKind {
        TransportKind::Daemon
    }

    async fn open(&mut self) -> Result<DeviceHandle> {
        if self.reader.is_some() {
            return Err(HardwareError::initialization_failed(
                "daemon transport already open",
            ));
        }

        let probe = match self.probe.take() {
            Some(probe) => probe,
            None => detect(&self.config)
                .await
                .ok_or_else(|| HardwareError::not_found("daemon"))?,
        };

        info!(reader = %probe.name, stack = probe.reader.as_str(), "Daemon reader detected");

        let output = self.config.output.unwrap_or(probe.reader.output());
        self.reader = Some(probe.reader);
        Ok(DeviceHandle::new(
            TransportKind::Daemon,
            DeviceInfo::new(probe.name, probe.reader.as_str()),
        )
        .with_output(output))
    }

    async fn close(&mut self, _handle: DeviceHandle) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

impl PolledTransport for DaemonDriver {
    async fn poll_once(&mut self, _handle: &DeviceHandle) -> Result<Option<RawReadEvent>> {
        let reader = self
            .reader
            .ok_or_else(|| HardwareError::disconnected("daemon transport not open"))?;

        let spec = self.config.poll_command(reader);
        let limit = self.config.poll_timeout();
        let outcome = run_bounded(spec, &spec.render_args(limit), limit).await?;

        if outcome.timed_out {
            debug!(program = %spec.program, "Daemon poll timed out, treating as no card");
            return Ok(None);
        }

        match outcome.exit_code {
            Some(0) if !outcome.stdout.trim().is_empty() => Ok(Some(RawReadEvent::text(
                TransportKind::Daemon,
                outcome.stdout,
            ))),
            Some(0) => Ok(None),
            code if outcome.stdout.trim().is_empty() && outcome.stderr.trim().is_empty() => {
                Err(HardwareError::communication(format!(
                    "{} exited with {code:?} and no output",
                    spec.program
                )))
            }
            code => {
                debug!(
                    program = %spec.program,
                    exit_code = ?code,
                    stderr = %outcome.stderr.trim(),
                    "Daemon poll failed, treating as no card"
                );
                Ok(None)
            }
        }
    }
}
