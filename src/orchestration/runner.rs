//! External process execution.
//!
//! Commands are typed argument vectors and are never passed through a
//! shell. Output is streamed line by line into the task's log file while a
//! bounded tail is kept in memory for the manifest.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::config::CampaignConfig;
use crate::core::task::{Task, TaskKind};
use crate::error::{Error, Result};
use crate::{plog_debug, plog_trace};

/// Lines of stdout/stderr kept in a [`TaskResult`].
pub const DEFAULT_TAIL_LINES: usize = 40;

/// Environment variable the reconstructor reads its plugin directory from.
pub const PLUGIN_PATH_ENV: &str = "EICrecon_MY";

/// A fully materialized command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_string(), value.into()));
        self
    }

    /// Value following `flag` in the argument list.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        let pos = self.args.iter().position(|a| a == flag)?;
        self.args.get(pos + 1).map(String::as_str)
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Outcome of one attempt of one task (or of the merge).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub attempt: u32,
    /// `None` when the process was killed by a signal or never started.
    pub exit_code: Option<i32>,
    /// Tail of stdout; the full stream is in the log file.
    pub stdout: String,
    /// Tail of stderr; the full stream is in the log file.
    pub stderr: String,
    pub duration_ms: u64,
    pub output_size_bytes: u64,
    pub valid: bool,
    pub error: Option<String>,
}

impl TaskResult {
    /// Result for an attempt that never produced a process, e.g. a spawn
    /// failure.
    pub fn not_started(error: impl std::fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    /// Label the result with the task and attempt it belongs to.
    pub fn attach(mut self, task_id: &str, attempt: u32) -> Self {
        self.task_id = task_id.to_string();
        self.attempt = attempt;
        self
    }

    pub fn exited_ok(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs one external command to completion.
pub trait ProcessRunner: Send + Sync {
    /// Run `cmd` in `work_dir`, writing its output to `log_path`.
    ///
    /// Only spawn and I/O problems are errors. A non-zero exit is reported
    /// through [`TaskResult::exit_code`].
    fn run(&self, cmd: &CommandSpec, work_dir: &Path, log_path: &Path) -> Result<TaskResult>;
}

/// [`ProcessRunner`] backed by `std::process::Command`.
#[derive(Debug, Clone)]
pub struct SystemProcessRunner {
    tail_lines: usize,
}

impl SystemProcessRunner {
    pub fn new() -> Self {
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn with_tail_lines(tail_lines: usize) -> Self {
        Self { tail_lines }
    }
}

impl Default for SystemProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for SystemProcessRunner {
    fn run(&self, cmd: &CommandSpec, work_dir: &Path, log_path: &Path) -> Result<TaskResult> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(work_dir)?;

        let mut log = OpenOptions::new().create(true).append(true).open(log_path)?;
        writeln!(
            log,
            "# {} $ {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            cmd
        )?;

        plog_debug!("exec: {} (cwd={})", cmd, work_dir.display());
        let started = Instant::now();
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let log = Arc::new(Mutex::new(log));
        let stdout = child
            .stdout
            .take()
            .map(|s| stream_to_log(s, "", Arc::clone(&log), self.tail_lines));
        let stderr = child
            .stderr
            .take()
            .map(|s| stream_to_log(s, "[stderr] ", Arc::clone(&log), self.tail_lines));

        let status = child.wait()?;
        let stdout = join_tail(stdout);
        let stderr = join_tail(stderr);
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Ok(mut log) = log.lock() {
            writeln!(log, "# exit {:?} after {} ms", status.code(), duration_ms)?;
        }

        let exit_code = status.code();
        let error = match exit_code {
            Some(0) => None,
            Some(code) => Some(format!("exited with code {}", code)),
            None => Some("terminated by signal".to_string()),
        };

        Ok(TaskResult {
            exit_code,
            stdout,
            stderr,
            duration_ms,
            error,
            ..TaskResult::default()
        })
    }
}

/// Copy a child stream into the shared log on its own thread, returning
/// the last `tail_lines` lines.
fn stream_to_log<R: Read + Send + 'static>(
    stream: R,
    prefix: &'static str,
    log: Arc<Mutex<File>>,
    tail_lines: usize,
) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut tail: VecDeque<String> = VecDeque::with_capacity(tail_lines);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = String::from_utf8_lossy(&buf).trim_end().to_string();
            plog_trace!("{}{}", prefix, line);
            if let Ok(mut log) = log.lock() {
                let _ = writeln!(log, "{}{}", prefix, line);
            }
            if tail_lines > 0 {
                if tail.len() == tail_lines {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
        Vec::from(tail).join("\n")
    })
}

fn join_tail(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Materializes the external tool invocations of a campaign.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    cfg: Arc<CampaignConfig>,
    /// Prepared compact file per variant key.
    compact_files: HashMap<String, PathBuf>,
}

impl CommandBuilder {
    pub fn new(cfg: Arc<CampaignConfig>) -> Self {
        Self {
            cfg,
            compact_files: HashMap::new(),
        }
    }

    /// Record the prepared compact file simulations of `variant_key` use.
    pub fn register_variant(&mut self, variant_key: &str, compact_file: PathBuf) {
        self.compact_files.insert(variant_key.to_string(), compact_file);
    }

    pub fn compact_file(&self, variant_key: &str) -> Option<&Path> {
        self.compact_files.get(variant_key).map(PathBuf::as_path)
    }

    /// `<sim> --inputFiles <in> --outputFile <out> --compactFile <prepared> -N <n>`
    pub fn simulate(&self, task: &Task, compact_file: &Path) -> CommandSpec {
        CommandSpec::new(&self.cfg.simulator_binary)
            .arg("--inputFiles")
            .path_arg(&task.input_path)
            .arg("--outputFile")
            .path_arg(&task.output_path)
            .arg("--compactFile")
            .path_arg(compact_file)
            .arg("-N")
            .arg(self.cfg.particle_count.to_string())
    }

    /// `<recon> -Pplugins=<p1,p2> -Phistsfile=<out> <in>`
    pub fn reconstruct(&self, task: &Task) -> CommandSpec {
        let mut cmd = CommandSpec::new(&self.cfg.reconstructor_binary)
            .arg(format!("-Pplugins={}", self.cfg.plugins.join(",")))
            .arg(format!("-Phistsfile={}", task.output_path.display()))
            .path_arg(&task.input_path);
        if let Some(plugin_path) = &self.cfg.plugin_path {
            cmd = cmd.env(PLUGIN_PATH_ENV, plugin_path.to_string_lossy());
        }
        cmd
    }

    /// `<merge> <merged> <inputs...>`
    pub fn merge(&self, merged: &Path, inputs: &[PathBuf]) -> CommandSpec {
        inputs
            .iter()
            .fold(CommandSpec::new(&self.cfg.merge_binary).path_arg(merged), |cmd, input| {
                cmd.path_arg(input)
            })
    }

    /// Command for a DAG task.
    ///
    /// # Errors
    ///
    /// A simulation whose variant has no prepared compact file is an error.
    pub fn for_task(&self, task: &Task) -> Result<CommandSpec> {
        match task.kind {
            TaskKind::Simulate => {
                let compact = self.compact_file(&task.variant_key).ok_or_else(|| {
                    Error::prepare(&task.variant_key, "variant was not prepared")
                })?;
                Ok(self.simulate(task, compact))
            }
            TaskKind::Reconstruct => Ok(self.reconstruct(task)),
        }
    }
}
