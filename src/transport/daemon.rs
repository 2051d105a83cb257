//! Transport daemon processes
//!
//! Each half of a transport runs detached as
//! `textroute transport run <name> <purpose> [--config <file>]`, in its own
//! process group so a terminal interrupt only reaches the router. Its files
//! live in `{process_dir}/{name}/`:
//!
//! ```text
//! {purpose}.pid      {purpose}_stdout
//! {purpose}_stdin    {purpose}_stderr
//! ```
//!
//! Stopping sends `SIGTERM`, waits up to [`STOP_TIMEOUT`] for the process
//! to exit, then kills it.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::utils::error::DaemonError;

use super::Purpose;

pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One transport process, started by this process or found through its
/// pidfile.
#[derive(Debug)]
pub struct Daemon {
    transport: String,
    purpose: Purpose,
    dir: PathBuf,
    program: PathBuf,
    config: Option<PathBuf>,
    child: Option<Child>,
}

impl Daemon {
    /// A daemon running the current executable.
    pub fn new(settings: &Settings, transport: &str, purpose: Purpose) -> Result<Self, DaemonError> {
        Ok(Self::with_program(
            settings,
            transport,
            purpose,
            env::current_exe()?,
        ))
    }

    pub fn with_program(
        settings: &Settings,
        transport: &str,
        purpose: Purpose,
        program: impl Into<PathBuf>,
    ) -> Self {
        Self {
            transport: transport.to_string(),
            purpose,
            dir: settings.process_dir.join(transport),
            program: program.into(),
            config: settings.source.clone(),
            child: None,
        }
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn pidfile(&self) -> PathBuf {
        self.dir.join(format!("{}.pid", self.purpose))
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.dir.join(format!("{}_stdout", self.purpose))
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.dir.join(format!("{}_stderr", self.purpose))
    }

    pub fn stdin_path(&self) -> PathBuf {
        self.dir.join(format!("{}_stdin", self.purpose))
    }

    /// Pid recorded in the pidfile, if any.
    pub fn pid(&self) -> Result<Option<u32>, DaemonError> {
        match fs::read_to_string(self.pidfile()) {
            Ok(content) => Ok(content.trim().parse().ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_running(&mut self) -> bool {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(None) => return true,
                Ok(Some(status)) => debug!("{} exited: {status}", self.label()),
                Err(e) => warn!("Cannot check {}: {e}", self.label()),
            }
            self.child = None;
            if let Err(e) = self.remove_pidfile() {
                warn!("Cannot remove pidfile of {}: {e}", self.label());
            }
            return false;
        }

        matches!(self.pid(), Ok(Some(pid)) if process_alive(pid))
    }

    /// Spawn the process unless it is already running. Returns whether it
    /// was spawned.
    pub fn start(&mut self) -> Result<bool, DaemonError> {
        if self.is_running() {
            debug!("{} is already running", self.label());
            return Ok(false);
        }

        self.create_files()?;
        let stdin = File::open(self.stdin_path())?;
        let stdout = append(&self.stdout_path())?;
        let stderr = append(&self.stderr_path())?;

        let mut command = Command::new(&self.program);
        command
            .arg("transport")
            .arg("run")
            .arg(&self.transport)
            .arg(self.purpose.as_str());
        if let Some(config) = &self.config {
            command.arg("--config").arg(config);
        }
        command
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn().map_err(|source| DaemonError::Spawn {
            name: self.label(),
            source,
        })?;
        fs::write(self.pidfile(), format!("{}\n", child.id()))?;
        info!("Started {} (pid {})", self.label(), child.id());
        self.child = Some(child);
        Ok(true)
    }

    /// Terminate the process. Stopping a daemon that is not running is not
    /// an error; returns whether there was one to stop.
    pub fn stop(&mut self) -> Result<bool, DaemonError> {
        let pid = match (&self.child, self.pid()?) {
            (Some(child), _) => Some(child.id()),
            (None, pid) => pid,
        };
        let Some(pid) = pid.filter(|_| self.is_running()) else {
            self.remove_pidfile()?;
            debug!("{} is not running", self.label());
            return Ok(false);
        };

        signal(pid, "TERM")?;
        let deadline = Instant::now() + STOP_TIMEOUT;
        while self.is_running() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }

        if self.is_running() {
            warn!("{} ignored SIGTERM, killing it", self.label());
            match self.child.take() {
                Some(mut child) => {
                    child.kill()?;
                    child.wait()?;
                }
                None => signal(pid, "KILL")?,
            }
        }

        self.child = None;
        self.remove_pidfile()?;
        info!("Stopped {} (pid {pid})", self.label());
        Ok(true)
    }

    pub fn restart(&mut self) -> Result<(), DaemonError> {
        self.stop()?;
        self.start()?;
        Ok(())
    }

    fn label(&self) -> String {
        format!("{}/{}", self.transport, self.purpose)
    }

    /// Creates the process directory and the stdin and stdout files.
    fn create_files(&self) -> Result<(), DaemonError> {
        fs::create_dir_all(&self.dir)?;
        append(&self.stdout_path())?;
        append(&self.stdin_path())?;
        Ok(())
    }

    fn remove_pidfile(&self) -> Result<(), DaemonError> {
        match fs::remove_file(self.pidfile()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn process_alive(pid: u32) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

fn signal(pid: u32, name: &str) -> Result<(), DaemonError> {
    let status = Command::new("kill")
        .arg("-s")
        .arg(name)
        .arg(pid.to_string())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| DaemonError::Signal {
            pid,
            reason: e.to_string(),
        })?;

    // Exiting between the check and the signal is fine.
    if status.success() || !process_alive(pid) {
        Ok(())
    } else {
        Err(DaemonError::Signal {
            pid,
            reason: format!("kill -s {name} exited with {status}"),
        })
    }
}

/// Both daemons of one transport.
#[derive(Debug)]
pub struct TransportDaemons {
    name: String,
    daemons: Vec<Daemon>,
}

impl TransportDaemons {
    pub fn new(settings: &Settings, name: &str) -> Result<Self, DaemonError> {
        Ok(Self::with_program(settings, name, env::current_exe()?))
    }

    pub fn with_program(settings: &Settings, name: &str, program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        Self {
            name: name.to_string(),
            daemons: Purpose::ALL
                .iter()
                .map(|purpose| Daemon::with_program(settings, name, *purpose, program.clone()))
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn daemons(&self) -> &[Daemon] {
        &self.daemons
    }

    /// Number of daemons currently running, out of two.
    pub fn running(&mut self) -> usize {
        self.daemons
            .iter_mut()
            .map(|daemon| daemon.is_running())
            .filter(|running| *running)
            .count()
    }

    /// Start whichever daemon is not running. Returns how many were spawned.
    pub fn start(&mut self) -> Result<usize, DaemonError> {
        let mut started = 0;
        for daemon in &mut self.daemons {
            if daemon.start()? {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Stop both daemons, even if stopping the first one fails. Returns how
    /// many were running.
    pub fn stop(&mut self) -> Result<usize, DaemonError> {
        let mut stopped = 0;
        let mut failure = None;
        for daemon in &mut self.daemons {
            match daemon.stop() {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => {
                    error!("Cannot stop {}/{}: {e}", daemon.transport(), daemon.purpose());
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(stopped),
        }
    }

    pub fn restart(&mut self) -> Result<(), DaemonError> {
        self.stop()?;
        self.start()?;
        Ok(())
    }
}
