//! Media relay: one FFmpeg subprocess per session
//!
//! The transcoder reads whatever the backend produced (RTP forwarded over
//! loopback UDP, raw frames on stdin, or a stream URL) and writes SRTP to
//! the prepared destination, or a single JPEG to stdout for snapshots.
//!
//! "Started" is reported only after the first stderr line or stdout byte.
//! Shutdown closes input before signalling the process.

pub mod args;

pub use args::{
    build_args, loopback_sdp, AudioCodec, AudioOutput, InputSpec, OutputSpec, SrtpDestination,
    TranscoderSpec, VideoOutput, SRTP_SUITE,
};

use crate::config::TranscoderConfig;
use crate::media::{FrameSource, MediaPacket, MediaSource, RtpSource};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UdpSocket;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// FFmpeg's exit code after a clean shutdown on SIGTERM/SIGINT
pub const EXIT_CODE_SIGNALLED: i32 = 255;

/// Stderr lines kept for error reports
const STDERR_TAIL: usize = 8;

/// SSRC stamped on forwarded loopback RTP
const LOOPBACK_SSRC: u32 = 0x4341_4d31;

/// How an exit is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Exit before output with a normal code; nothing to report
    Normal,
    /// Exit before output with any other code; start fails
    StartFailure,
    /// Exit after output; owning session is stopped
    ForceStop,
}

/// Classify a transcoder exit
///
/// `code` is `None` when the process was killed by a signal.
pub fn classify_exit(code: Option<i32>, saw_output: bool) -> ExitDisposition {
    if saw_output {
        return ExitDisposition::ForceStop;
    }
    match code {
        None | Some(0) | Some(EXIT_CODE_SIGNALLED) => ExitDisposition::Normal,
        Some(_) => ExitDisposition::StartFailure,
    }
}

/// Exit as observed by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscoderExit {
    pub code: Option<i32>,
    pub saw_output: bool,
    pub disposition: ExitDisposition,
    /// Last stderr lines before exit
    pub stderr_tail: Vec<String>,
}

impl TranscoderExit {
    pub fn describe(&self) -> String {
        let code = match self.code {
            Some(code) => format!("code {}", code),
            None => "signal".to_string(),
        };
        match self.stderr_tail.last() {
            Some(line) => format!("{} ({})", code, line),
            None => code,
        }
    }
}

/// Resolves once; later attempts are no-ops
pub struct ReadySignal {
    tx: Mutex<Option<oneshot::Sender<()>>>,
    fired: AtomicBool,
}

impl ReadySignal {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
                fired: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Returns true only for the call that actually resolved the signal
    pub fn fire(&self) -> bool {
        let tx = self.tx.lock().take();
        match tx {
            Some(tx) => {
                self.fired.store(true, Ordering::SeqCst);
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Relay throughput counters
#[derive(Debug, Default)]
pub struct RelayCounters {
    pub forwarded: AtomicU64,
    pub dropped: AtomicU64,
}

/// A running transcoder and the tasks feeding and watching it
pub struct Transcoder {
    session_id: String,

    pid: Option<u32>,

    ready: Arc<ReadySignal>,

    ready_rx: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,

    exit_rx: watch::Receiver<Option<TranscoderExit>>,

    /// Cancels the input feed (closes stdin / stops forwarding)
    input_cancel: CancellationToken,

    input_task: Mutex<Option<JoinHandle<()>>>,

    kill_tx: Mutex<Option<oneshot::Sender<()>>>,

    supervisor: Mutex<Option<JoinHandle<()>>>,

    stdout_task: Mutex<Option<JoinHandle<Vec<u8>>>>,

    counters: Arc<RelayCounters>,

    stopping: AtomicBool,

    config: TranscoderConfig,
}

/// Input side prepared before spawn
enum Feed {
    Rtp {
        source: RtpSource,
        video_port: u16,
        audio_port: Option<u16>,
        sdp: String,
    },
    Frames {
        first: crate::media::VideoFrame,
        source: FrameSource,
    },
    None,
}

impl Transcoder {
    /// Spawn a transcoder fed by `source`.
    ///
    /// For frame sources the first frame is awaited (up to `input_timeout`)
    /// to learn the raw frame geometry.
    pub async fn spawn(
        session_id: &str,
        source: MediaSource,
        output: OutputSpec,
        config: &TranscoderConfig,
        input_timeout: Duration,
    ) -> Result<Self> {
        let (input, feed) = Self::plan_input(source, &output, input_timeout).await?;
        let spec = TranscoderSpec { input, output };
        let args = build_args(&spec, config);

        info!(
            "Session {} spawning transcoder: {} {}",
            session_id,
            config.path.display(),
            redact(&args).join(" ")
        );

        let needs_stdin = !matches!(feed, Feed::None);
        let capture_stdout = matches!(spec.output, OutputSpec::Jpeg { .. });

        let mut child = Command::new(&config.path)
            .args(&args)
            .stdin(if needs_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::TranscoderSpawn(format!("Failed to spawn {}: {}", config.path.display(), e))
            })?;

        let pid = child.id();
        let (ready, ready_rx) = ReadySignal::new();
        let ready = Arc::new(ready);
        let counters = Arc::new(RelayCounters::default());
        let input_cancel = CancellationToken::new();
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL)));

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(Self::read_stderr(
                session_id.to_string(),
                stderr,
                Arc::clone(&ready),
                Arc::clone(&tail),
            ));
        }

        let stdout_task = child.stdout.take().map(|stdout| {
            tokio::spawn(Self::read_stdout(stdout, Arc::clone(&ready)))
        });

        let stdin = child.stdin.take();
        let input_task = match (feed, stdin) {
            (Feed::Rtp { source, video_port, audio_port, sdp }, Some(mut stdin)) => {
                // SDP goes in whole, then stdin is closed
                if let Err(e) = stdin.write_all(sdp.as_bytes()).await {
                    debug!("Session {} SDP write ignored: {}", session_id, e);
                }
                drop(stdin);
                Some(tokio::spawn(Self::forward_rtp(
                    source,
                    video_port,
                    audio_port,
                    Arc::clone(&counters),
                    input_cancel.clone(),
                )))
            }
            (Feed::Frames { first, source }, Some(stdin)) => Some(tokio::spawn(Self::write_frames(
                stdin,
                first,
                source,
                Arc::clone(&counters),
                input_cancel.clone(),
            ))),
            _ => None,
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        let supervisor = tokio::spawn(Self::supervise(
            session_id.to_string(),
            child,
            kill_rx,
            exit_tx,
            Arc::clone(&ready),
            tail,
            config.stop_grace(),
        ));

        Ok(Self {
            session_id: session_id.to_string(),
            pid,
            ready,
            ready_rx: tokio::sync::Mutex::new(Some(ready_rx)),
            exit_rx,
            input_cancel,
            input_task: Mutex::new(input_task),
            kill_tx: Mutex::new(Some(kill_tx)),
            supervisor: Mutex::new(Some(supervisor)),
            stdout_task: Mutex::new(stdout_task),
            counters,
            stopping: AtomicBool::new(false),
            config: config.clone(),
        })
    }

    async fn plan_input(
        source: MediaSource,
        output: &OutputSpec,
        input_timeout: Duration,
    ) -> Result<(InputSpec, Feed)> {
        let wants_audio = matches!(output, OutputSpec::Srtp { audio: Some(_), .. });

        match source {
            MediaSource::Rtp(mut source) => {
                let video_port = reserve_udp_port().await?;
                let audio_port = match (&source.audio, wants_audio) {
                    (Some(_), true) => Some(reserve_udp_port().await?),
                    _ => None,
                };
                if audio_port.is_none() {
                    source.audio = None;
                }
                let sdp = loopback_sdp(
                    video_port,
                    source.video_payload_type,
                    audio_port.map(|port| (port, source.audio_payload_type)),
                );
                Ok((
                    InputSpec::RtpSdp {
                        sdp: sdp.clone(),
                        has_audio: audio_port.is_some(),
                    },
                    Feed::Rtp {
                        source,
                        video_port,
                        audio_port,
                        sdp,
                    },
                ))
            }
            MediaSource::Frames(mut source) => {
                let first = tokio::time::timeout(input_timeout, source.frames.recv())
                    .await
                    .map_err(|_| {
                        Error::TranscoderSpawn(format!(
                            "No decoded frame within {:?}",
                            input_timeout
                        ))
                    })?
                    .ok_or_else(|| {
                        Error::TranscoderSpawn("Frame source ended before first frame".to_string())
                    })?;
                let fps = match output {
                    OutputSpec::Srtp { video, .. } => video.settings.fps,
                    OutputSpec::Jpeg { .. } => 1,
                };
                Ok((
                    InputSpec::RawFrames {
                        format: first.format,
                        width: first.width,
                        height: first.height,
                        fps,
                    },
                    Feed::Frames { first, source },
                ))
            }
            MediaSource::Url(direct) => Ok((
                InputSpec::Url {
                    url: direct.url,
                    authorization: direct.authorization,
                },
                Feed::None,
            )),
        }
    }

    /// Forward RTP packets to the loopback ports named in the SDP
    async fn forward_rtp(
        mut source: RtpSource,
        video_port: u16,
        audio_port: Option<u16>,
        counters: Arc<RelayCounters>,
        cancel: CancellationToken,
    ) {
        let socket = match UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Failed to bind relay socket: {}", e);
                return;
            }
        };
        let video_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, video_port));
        let audio_addr = audio_port.map(|port| SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
        let video_pt = source.video_payload_type;
        let audio_pt = source.audio_payload_type;

        let mut video_open = true;
        let mut audio_open = source.audio.is_some();

        while video_open || audio_open {
            let (packet, addr, pt): (MediaPacket, SocketAddr, u8) = tokio::select! {
                _ = cancel.cancelled() => break,
                packet = source.video.recv(), if video_open => match packet {
                    Some(packet) => (packet, video_addr, video_pt),
                    None => {
                        video_open = false;
                        continue;
                    }
                },
                packet = recv_optional(&mut source.audio), if audio_open => match (packet, audio_addr) {
                    (Some(packet), Some(addr)) => (packet, addr, audio_pt),
                    _ => {
                        audio_open = false;
                        continue;
                    }
                },
            };

            let mut packet = packet;
            packet.payload_type = pt;
            match socket.send_to(&packet.to_rtp(LOOPBACK_SSRC), addr).await {
                Ok(_) => {
                    counters.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("Relay send to {} failed: {}", addr, e);
                }
            }
        }

        debug!("RTP forwarder stopped");
    }

    /// Write raw frames to stdin; a closed pipe ends the writer quietly
    async fn write_frames(
        mut stdin: ChildStdin,
        first: crate::media::VideoFrame,
        mut source: FrameSource,
        counters: Arc<RelayCounters>,
        cancel: CancellationToken,
    ) {
        let (width, height, format) = (first.width, first.height, first.format);
        let mut next = Some(first);

        loop {
            let frame = match next.take() {
                Some(frame) => frame,
                None => tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = source.frames.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                },
            };

            if frame.width != width || frame.height != height || frame.format != format {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let raw = frame.to_raw();
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = stdin.write_all(&raw) => {
                    if let Err(e) = result {
                        debug!("Transcoder input closed: {}", e);
                        break;
                    }
                    counters.forwarded.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let _ = stdin.shutdown().await;
        debug!("Frame writer stopped");
    }

    async fn read_stderr(
        session_id: String,
        stderr: tokio::process::ChildStderr,
        ready: Arc<ReadySignal>,
        tail: Arc<Mutex<VecDeque<String>>>,
    ) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if ready.fire() {
                info!("Session {} transcoder produced first output", session_id);
            }
            debug!("[ffmpeg {}] {}", session_id, line);
            let mut tail = tail.lock();
            if tail.len() == STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }

    async fn read_stdout(mut stdout: tokio::process::ChildStdout, ready: Arc<ReadySignal>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    ready.fire();
                    out.extend_from_slice(&buf[..n]);
                }
            }
        }
        out
    }

    /// Own the child: wait for exit, or terminate it on request
    async fn supervise(
        session_id: String,
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        exit_tx: watch::Sender<Option<TranscoderExit>>,
        ready: Arc<ReadySignal>,
        tail: Arc<Mutex<VecDeque<String>>>,
        stop_grace: Duration,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => terminate(&mut child, stop_grace).await,
        };

        let code = match &status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("Session {} failed to wait for transcoder: {}", session_id, e);
                None
            }
        };
        let saw_output = ready.has_fired();
        let exit = TranscoderExit {
            code,
            saw_output,
            disposition: classify_exit(code, saw_output),
            stderr_tail: tail.lock().iter().cloned().collect(),
        };

        match exit.disposition {
            ExitDisposition::Normal => debug!("Session {} transcoder exited normally", session_id),
            ExitDisposition::StartFailure => {
                warn!("Session {} transcoder failed to start: {}", session_id, exit.describe())
            }
            ExitDisposition::ForceStop => {
                info!("Session {} transcoder exited: {}", session_id, exit.describe())
            }
        }

        let _ = exit_tx.send(Some(exit));
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn counters(&self) -> &RelayCounters {
        &self.counters
    }

    pub fn has_output(&self) -> bool {
        self.ready.has_fired()
    }

    /// Whether [`Transcoder::stop`] has been called
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Exit details, once the process is gone
    pub fn exit(&self) -> Option<TranscoderExit> {
        self.exit_rx.borrow().clone()
    }

    /// Wait for the first output.
    ///
    /// # Errors
    ///
    /// - [`Error::TranscoderSpawn`] if the process exits with a failure code first,
    ///   or nothing is produced within `timeout`
    /// - [`Error::SessionStopped`] if it exits normally first (typically a stop)
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let ready_rx = self.ready_rx.lock().await.take();
        let Some(mut ready_rx) = ready_rx else {
            return if self.has_output() {
                Ok(())
            } else {
                Err(Error::TranscoderSpawn("readiness already consumed".to_string()))
            };
        };

        let mut exit_rx = self.exit_rx.clone();
        let exited = async {
            loop {
                if let Some(exit) = exit_rx.borrow_and_update().clone() {
                    return exit;
                }
                if exit_rx.changed().await.is_err() {
                    return TranscoderExit {
                        code: None,
                        saw_output: false,
                        disposition: ExitDisposition::Normal,
                        stderr_tail: Vec::new(),
                    };
                }
            }
        };

        tokio::select! {
            biased;
            result = &mut ready_rx => match result {
                Ok(()) => Ok(()),
                Err(_) => Err(Error::TranscoderSpawn("readiness signal dropped".to_string())),
            },
            exit = exited => {
                // Output and exit can race; a fired signal still counts
                if self.has_output() {
                    return Ok(());
                }
                match exit.disposition {
                    ExitDisposition::StartFailure => Err(Error::TranscoderSpawn(format!(
                        "exited before output with {}",
                        exit.describe()
                    ))),
                    _ => Err(Error::SessionStopped(format!(
                        "transcoder for {} exited before output",
                        self.session_id
                    ))),
                }
            },
            _ = tokio::time::sleep(timeout) => Err(Error::TranscoderSpawn(format!(
                "no output within {:?}",
                timeout
            ))),
        }
    }

    /// Wait until the process exits
    pub async fn wait_exit(&self) -> TranscoderExit {
        let mut exit_rx = self.exit_rx.clone();
        loop {
            if let Some(exit) = exit_rx.borrow_and_update().clone() {
                return exit;
            }
            if exit_rx.changed().await.is_err() {
                return TranscoderExit {
                    code: None,
                    saw_output: self.has_output(),
                    disposition: classify_exit(None, self.has_output()),
                    stderr_tail: Vec::new(),
                };
            }
        }
    }

    /// Read the whole of stdout (snapshot mode) and wait for exit
    pub async fn capture_jpeg(&self) -> Result<Vec<u8>> {
        let task = self.stdout_task.lock().take();
        let Some(task) = task else {
            return Err(Error::TranscoderSpawn("stdout not captured".to_string()));
        };

        let bytes = task
            .await
            .map_err(|e| Error::TranscoderSpawn(format!("stdout reader failed: {}", e)))?;
        let exit = self.wait_exit().await;

        if bytes.is_empty() {
            return Err(Error::TranscoderSpawn(format!(
                "no image produced ({})",
                exit.describe()
            )));
        }
        Ok(bytes)
    }

    /// Close input, then SIGTERM, then SIGKILL after the grace period.
    ///
    /// Idempotent.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("Stopping transcoder for session {}", self.session_id);

        self.input_cancel.cancel();
        let input_task = self.input_task.lock().take();
        if let Some(mut task) = input_task {
            if tokio::time::timeout(self.config.input_close_grace(), &mut task)
                .await
                .is_err()
            {
                debug!("Session {} input writer did not drain, aborting", self.session_id);
                task.abort();
            }
        }

        let kill_tx = self.kill_tx.lock().take();
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
        }

        let supervisor = self.supervisor.lock().take();
        if let Some(mut task) = supervisor {
            let bound = self.config.stop_grace() + Duration::from_secs(2);
            if tokio::time::timeout(bound, &mut task).await.is_err() {
                warn!("Session {} transcoder supervisor hung, aborting", self.session_id);
                task.abort();
            }
        }

        let stdout_task = self.stdout_task.lock().take();
        if let Some(task) = stdout_task {
            task.abort();
        }

        let counters = &self.counters;
        info!(
            "Session {} transcoder stopped (forwarded={}, dropped={})",
            self.session_id,
            counters.forwarded.load(Ordering::Relaxed),
            counters.dropped.load(Ordering::Relaxed)
        );
    }
}

impl Drop for Transcoder {
    fn drop(&mut self) {
        self.input_cancel.cancel();
        if let Some(task) = self.input_task.get_mut().take() {
            task.abort();
        }
        // Supervisor terminates the child if stop() never ran
        if let Some(tx) = self.kill_tx.get_mut().take() {
            let _ = tx.send(());
        }
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Transcoder did not terminate gracefully, forcing kill");
            child.kill().await?;
            child.wait().await
        }
    }
}

async fn recv_optional(rx: &mut Option<mpsc::Receiver<MediaPacket>>) -> Option<MediaPacket> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

/// Bind-and-release an ephemeral loopback UDP port (plus the RTCP port above it)
async fn reserve_udp_port() -> Result<u16> {
    for _ in 0..16 {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = socket.local_addr()?.port();
        if port % 2 != 0 || port == u16::MAX {
            continue;
        }
        if UdpSocket::bind((Ipv4Addr::LOCALHOST, port + 1)).await.is_ok() {
            return Ok(port);
        }
    }
    Err(Error::TranscoderSpawn("No free loopback RTP port pair".to_string()))
}

/// Hide key material and credentials in logged command lines
fn redact(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            out.push("<redacted>".to_string());
            hide_next = false;
            continue;
        }
        hide_next = arg == "-srtp_out_params" || arg == "-headers";
        out.push(arg.clone());
    }
    out
}
