//! Encoder process management
//!
//! A [`Transcoder`] owns one ffmpeg child and its standard streams from
//! `start` to `close`. The child is reaped on every exit path: a supervisor
//! task waits on it and kills it when the session token is cancelled, and
//! `kill_on_drop` covers the case where the runtime itself goes away.

use crate::transcode::profile::TranscodingProfile;
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

/// Exit code ffmpeg uses when its output pipe goes away mid-stream
pub const EXPECTED_EXIT_CODE: i32 = 255;

/// Output sink: the child's standard output
pub const OUTPUT_SINK: &str = "pipe:1";

const GLOBAL_FLAGS: &[&str] = &["-hide_banner", "-loglevel", "warning", "-stats"];

const FIXED_INPUT_FLAGS: &[(&str, &str)] = &[
    ("-fflags", "+genpts+discardcorrupt+nobuffer"),
    ("-err_detect", "ignore_err"),
];

const DEVICE_INIT_FLAGS: &[&str] = &[
    "-init_hw_device",
    "-filter_hw_device",
    "-vaapi_device",
    "-hwaccel",
    "-hwaccel_device",
    "-hwaccel_output_format",
];

const INPUT_FLAGS: &[&str] = &[
    "-fflags",
    "-err_detect",
    "-reconnect",
    "-reconnect_at_eof",
    "-reconnect_streamed",
    "-reconnect_delay_max",
    "-analyzeduration",
    "-probesize",
    "-max_delay",
    "-rw_timeout",
];

const VIDEO_FLAGS: &[&str] = &[
    "-gpu",
    "-c:v",
    "-b:v",
    "-preset",
    "-tune",
    "-profile:v",
    "-level",
    "-pix_fmt",
    "-maxrate",
    "-bufsize",
    "-g",
    "-bf",
    "-deadline",
    "-cpu-used",
    "-rc",
    "-rc-lookahead",
    "-b_ref_mode",
    "-usage",
    "-quality",
];

const AUDIO_FLAGS: &[&str] = &["-c:a", "-b:a", "-ar", "-ac"];

/// Error type for encoder process operations
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("transcoder is closed")]
    Closed,

    #[error("transcoder already started")]
    AlreadyStarted,

    #[error("stdin not available")]
    StdinNotAvailable,

    #[error("stdout not available")]
    StdoutNotAvailable,

    #[error("failed to start encoder: {0}")]
    Spawn(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("encoder exited with {0}")]
    ExitStatus(ExitStatus),

    #[error("encoder stderr still open after {0:?}")]
    StderrOpen(Duration),
}

/// Every failure collected while closing a transcoder
#[derive(Debug)]
pub struct CloseError {
    pub errors: Vec<TranscodeError>,
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "encoder close failed: ")?;
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscoderState {
    Created,
    Started,
    Running,
    Closed,
}

impl TranscoderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscoderState::Created => "created",
            TranscoderState::Started => "started",
            TranscoderState::Running => "running",
            TranscoderState::Closed => "closed",
        }
    }
}

/// How the encoder is launched
#[derive(Debug, Clone)]
pub struct TranscoderOptions {
    pub program: String,
    /// Inserted before the generated arguments, e.g. for a wrapper script
    pub leading_args: Vec<String>,
    /// Time allowed for a clean exit once stdin is closed
    pub close_grace: Duration,
}

impl Default for TranscoderOptions {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            leading_args: Vec::new(),
            close_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Global,
    Input,
    Filter,
    Video,
    Audio,
    Output,
}

#[derive(Debug, Clone)]
struct Flag {
    name: String,
    value: Option<String>,
}

impl Flag {
    fn section(&self) -> Section {
        let name = self.name.as_str();
        if DEVICE_INIT_FLAGS.contains(&name) {
            Section::Global
        } else if INPUT_FLAGS.contains(&name) {
            Section::Input
        } else if name == "-vf" || name == "-filter:v" {
            Section::Filter
        } else if VIDEO_FLAGS.contains(&name) {
            Section::Video
        } else if AUDIO_FLAGS.contains(&name) {
            Section::Audio
        } else {
            Section::Output
        }
    }

    fn is_reconnect(&self) -> bool {
        self.name.starts_with("-reconnect")
    }

    fn push_to(&self, args: &mut Vec<String>) {
        args.push(self.name.clone());
        if let Some(value) = &self.value {
            args.push(value.clone());
        }
    }
}

/// Split a flat argument list into flag/value pairs.
fn parse_flags(args: &[String]) -> Vec<Flag> {
    let mut flags = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        let value = if arg.starts_with('-') {
            iter.next_if(|next| !next.starts_with('-')).cloned()
        } else {
            None
        };
        flags.push(Flag {
            name: arg.clone(),
            value,
        });
    }
    flags
}

fn is_http(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Full encoder argument list for one stream.
///
/// Order: global flags and device init, input flags, `-i <url>`, filters,
/// video, audio, output flags, sink. A flag already supplied by
/// `device_args` or by the fixed input flags is never repeated from the
/// profile; the first producer wins.
pub fn build_command_args(
    input_url: &str,
    device_args: &[String],
    profile: &TranscodingProfile,
) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut sections: Vec<(Section, Vec<String>)> = [
        Section::Global,
        Section::Input,
        Section::Filter,
        Section::Video,
        Section::Audio,
        Section::Output,
    ]
    .into_iter()
    .map(|s| (s, Vec::new()))
    .collect();

    let mut place = |flag: &Flag, seen: &mut HashSet<String>| {
        if !seen.insert(flag.name.clone()) {
            return;
        }
        let section = flag.section();
        if let Some((_, args)) = sections.iter_mut().find(|(s, _)| *s == section) {
            flag.push_to(args);
        }
    };

    for flag in parse_flags(device_args) {
        place(&flag, &mut seen);
    }
    for (name, value) in FIXED_INPUT_FLAGS {
        let flag = Flag {
            name: name.to_string(),
            value: Some(value.to_string()),
        };
        place(&flag, &mut seen);
    }

    let remote = is_http(input_url);
    for flag in parse_flags(&profile.arguments()) {
        if flag.is_reconnect() && !remote {
            continue;
        }
        place(&flag, &mut seen);
    }

    let mut args: Vec<String> = GLOBAL_FLAGS.iter().map(|s| s.to_string()).collect();
    for (section, section_args) in sections {
        args.extend(section_args);
        if section == Section::Input {
            args.push("-i".to_string());
            args.push(input_url.to_string());
        }
    }
    if !seen.contains("-f") {
        args.push("-f".to_string());
        args.push(profile.container.clone());
    }
    args.push(OUTPUT_SINK.to_string());
    args
}

/// Result of the supervisor task: exit status and whether it was killed
type Supervised = io::Result<(ExitStatus, bool)>;

/// Owner of one encoder subprocess
#[derive(Debug)]
pub struct Transcoder {
    input_url: String,
    args: Vec<String>,
    options: TranscoderOptions,
    state: TranscoderState,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    kill: Option<CancellationToken>,
    supervisor: Option<JoinHandle<Supervised>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl Transcoder {
    pub fn new(
        input_url: &str,
        device_args: &[String],
        profile: &TranscodingProfile,
        options: TranscoderOptions,
    ) -> Self {
        Self {
            input_url: input_url.to_string(),
            args: build_command_args(input_url, device_args, profile),
            options,
            state: TranscoderState::Created,
            pid: None,
            stdin: None,
            stdout: None,
            kill: None,
            supervisor: None,
            stderr_task: None,
        }
    }

    /// Arguments passed to the encoder after any leading args
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn state(&self) -> TranscoderState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Spawn the encoder. Cancelling `cancel` kills and reaps it.
    pub fn start(&mut self, cancel: &CancellationToken) -> Result<(), TranscodeError> {
        match self.state {
            TranscoderState::Created => {}
            TranscoderState::Closed => return Err(TranscodeError::Closed),
            TranscoderState::Started | TranscoderState::Running => {
                return Err(TranscodeError::AlreadyStarted)
            }
        }

        let stdin = if self.input_url == "-" {
            Stdio::piped()
        } else {
            Stdio::null()
        };

        let mut cmd = Command::new(&self.options.program);
        cmd.args(&self.options.leading_args)
            .args(&self.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.options.program, args = ?self.args, "Starting encoder");
        let mut child = cmd.spawn().map_err(TranscodeError::Spawn)?;

        // Dropping `child` on these paths kills it
        let stdout = child.stdout.take().ok_or(TranscodeError::StdoutNotAvailable)?;
        let stderr = child.stderr.take();
        self.stdin = child.stdin.take();
        self.stdout = Some(stdout);
        self.pid = child.id();

        let kill = cancel.child_token();
        self.supervisor = Some(tokio::spawn(supervise(child, kill.clone())));
        self.kill = Some(kill);
        if let Some(stderr) = stderr {
            self.stderr_task = Some(tokio::spawn(log_stderr(stderr).in_current_span()));
        }

        self.state = TranscoderState::Started;
        debug!(pid = ?self.pid, "Encoder started");
        Ok(())
    }

    /// Read encoded bytes from the encoder's stdout
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TranscodeError> {
        if self.state == TranscoderState::Closed {
            return Err(TranscodeError::Closed);
        }
        let stdout = self.stdout.as_mut().ok_or(TranscodeError::StdoutNotAvailable)?;
        self.state = TranscoderState::Running;
        Ok(stdout.read(buf).await?)
    }

    /// Feed source bytes to the encoder; only available for `-` input
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, TranscodeError> {
        if self.state == TranscoderState::Closed {
            return Err(TranscodeError::Closed);
        }
        let stdin = self.stdin.as_mut().ok_or(TranscodeError::StdinNotAvailable)?;
        stdin.write_all(buf).await?;
        Ok(buf.len())
    }

    /// Hand the encoder's stdout to another owner, e.g. a buffer manager.
    pub fn take_output(
        &mut self,
    ) -> Result<impl AsyncRead + Send + Unpin + 'static, TranscodeError> {
        if self.state == TranscoderState::Closed {
            return Err(TranscodeError::Closed);
        }
        let stdout = self.stdout.take().ok_or(TranscodeError::StdoutNotAvailable)?;
        self.state = TranscoderState::Running;
        Ok(stdout)
    }

    /// Kill the encoder without waiting for a clean exit. `close` still reaps
    /// it and releases the streams.
    pub fn kill(&self) {
        if let Some(kill) = &self.kill {
            kill.cancel();
        }
    }

    /// Shut the encoder down and release its streams.
    ///
    /// Idempotent. stdin is closed first so the encoder can finish; if it has
    /// not exited within the grace period it is killed. Failures from every
    /// phase are reported together.
    pub async fn close(&mut self) -> Result<(), CloseError> {
        if self.state == TranscoderState::Closed {
            return Ok(());
        }
        self.state = TranscoderState::Closed;
        let mut errors = Vec::new();

        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.shutdown().await {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    errors.push(TranscodeError::Io(e));
                }
            }
        }

        if let Some(mut supervisor) = self.supervisor.take() {
            let grace = self.options.close_grace;
            let joined = match tokio::time::timeout(grace, &mut supervisor).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(pid = ?self.pid, ?grace, "Encoder did not exit in time, killing");
                    self.kill();
                    supervisor.await
                }
            };
            match joined {
                Ok(Ok((status, killed))) => {
                    if !exit_ok(status, killed) {
                        errors.push(TranscodeError::ExitStatus(status));
                    } else {
                        debug!(pid = ?self.pid, %status, killed, "Encoder exited");
                    }
                }
                Ok(Err(e)) => errors.push(TranscodeError::Io(e)),
                Err(join) => errors.push(TranscodeError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    join.to_string(),
                ))),
            }
        }

        self.stdout = None;

        // A descendant of the encoder can hold stderr open past its exit
        if let Some(mut stderr_task) = self.stderr_task.take() {
            if tokio::time::timeout(self.options.close_grace, &mut stderr_task)
                .await
                .is_err()
            {
                stderr_task.abort();
                errors.push(TranscodeError::StderrOpen(self.options.close_grace));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CloseError { errors })
        }
    }
}

impl Drop for Transcoder {
    fn drop(&mut self) {
        if self.state != TranscoderState::Closed {
            self.kill();
        }
    }
}

fn exit_ok(status: ExitStatus, killed: bool) -> bool {
    status.success()
        || status.code() == Some(EXPECTED_EXIT_CODE)
        || (killed && status.code().is_none())
}

async fn supervise(mut child: Child, kill: CancellationToken) -> Supervised {
    tokio::select! {
        status = child.wait() => status.map(|s| (s, false)),
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Kill signal failed");
            }
            child.wait().await.map(|s| (s, true))
        }
    }
}

const MAX_LOG_LINE: usize = 4096;

/// Forward encoder diagnostics to the log, one line at a time.
///
/// Progress lines end in `\r`, so both separators split.
async fn log_stderr(mut stderr: ChildStderr) {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for &byte in &chunk[..n] {
                    if byte == b'\n' || byte == b'\r' || pending.len() >= MAX_LOG_LINE {
                        emit_line(&pending);
                        pending.clear();
                        if byte == b'\n' || byte == b'\r' {
                            continue;
                        }
                    }
                    pending.push(byte);
                }
            }
        }
    }
    emit_line(&pending);
}

fn emit_line(raw: &[u8]) {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    if line.starts_with("frame=") || line.starts_with("size=") {
        debug!(target: "ffmpeg", "{}", line);
    } else {
        warn!(target: "ffmpeg", "{}", line);
    }
}
