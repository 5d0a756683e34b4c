//! Network stream acquisition.
//!
//! A dedicated OS thread owns the decoder and feeds decoded frames into a
//! [`FrameBuffer`](crate::buffer::FrameBuffer). The thread runs a small
//! state machine: it connects, streams until the transport drops, backs
//! off, and reconnects, forever, until asked to stop.

use crate::buffer::FrameBuffer;
use crate::frame::Frame;
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("failed to launch decoder: {0}")]
    SpawnFailed(String),
    #[error("decoder not connected")]
    NotConnected,
    #[error("stream ended: {0}")]
    Disconnected(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle of one acquisition session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// Created but never connected.
    Disconnected = 0,
    /// Attempting the first connection.
    Connecting = 1,
    /// Frames are flowing.
    Streaming = 2,
    /// Lost an established stream; retrying.
    Reconnecting = 3,
    /// Shut down on request. Terminal.
    Stopped = 4,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Streaming,
            3 => Self::Reconnecting,
            4 => Self::Stopped,
            _ => Self::Disconnected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Source URL, usually `rtsp://` or `http://`.
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Delay before reconnecting after a failed frame read.
    pub reconnect_backoff: Duration,
    /// Longer delay between connection attempts that themselves fail.
    pub retry_backoff: Duration,
    /// How long `stop` waits for the acquisition thread before detaching.
    pub stop_grace: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            width: 1920,
            height: 1080,
            fps: 5,
            reconnect_backoff: Duration::from_secs(2),
            retry_backoff: Duration::from_secs(5),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Transport that turns a stream URL into raw RGB24 frames.
///
/// The acquisition thread owns the decoder exclusively; `interrupter`
/// hands out the one piece callable from other threads.
pub trait FrameDecoder: Send {
    /// Open or reopen the transport. Called again after every drop.
    fn connect(&mut self) -> Result<(), StreamError>;

    /// Block until the next frame fills `buf` (exactly one frame long).
    fn read_frame(&mut self, buf: &mut [u8]) -> Result<(), StreamError>;

    /// A handle that tears the transport down from another thread,
    /// unblocking any in-progress `read_frame`.
    fn interrupter(&self) -> Box<dyn Fn() + Send + Sync>;
}

/// FFmpeg subprocess decoder. One `ffmpeg` child per connection, emitting
/// rawvideo RGB24 at a fixed geometry and rate on stdout.
pub struct FfmpegDecoder {
    url: String,
    width: u32,
    height: u32,
    fps: u32,
    child: Arc<Mutex<Option<Child>>>,
    stdout: Option<ChildStdout>,
}

impl FfmpegDecoder {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            url: config.url.clone(),
            width: config.width,
            height: config.height,
            fps: config.fps,
            child: Arc::new(Mutex::new(None)),
            stdout: None,
        }
    }

    fn teardown(&mut self) {
        self.stdout = None;
        if let Ok(mut guard) = self.child.lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

impl FrameDecoder for FfmpegDecoder {
    fn connect(&mut self) -> Result<(), StreamError> {
        self.teardown();

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-nostdin").args(["-loglevel", "error"]);
        if self.url.starts_with("rtsp://") {
            // TCP avoids packet loss artifacts on congested school networks;
            // the read timeout bounds hangs on a dead camera.
            cmd.args(["-rtsp_transport", "tcp"]);
            cmd.args(["-rw_timeout", "10000000"]);
        }
        cmd.args(["-i", &self.url])
            .args(["-f", "image2pipe"])
            .args(["-pix_fmt", "rgb24"])
            .args(["-vcodec", "rawvideo"])
            .args(["-s", &format!("{}x{}", self.width, self.height)])
            .args(["-r", &self.fps.to_string()])
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| StreamError::SpawnFailed(format!("ffmpeg: {e}")))?;

        self.stdout = child.stdout.take();
        if self.stdout.is_none() {
            let _ = child.kill();
            return Err(StreamError::SpawnFailed("ffmpeg stdout not captured".into()));
        }

        if let Ok(mut guard) = self.child.lock() {
            *guard = Some(child);
        }

        tracing::info!(url = %self.url, "decoder launched");
        Ok(())
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        let stdout = self.stdout.as_mut().ok_or(StreamError::NotConnected)?;
        stdout.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                StreamError::Disconnected("decoder closed its output".into())
            } else {
                StreamError::Io(e)
            }
        })
    }

    fn interrupter(&self) -> Box<dyn Fn() + Send + Sync> {
        let child = Arc::clone(&self.child);
        Box::new(move || {
            if let Ok(mut guard) = child.lock() {
                if let Some(c) = guard.as_mut() {
                    let _ = c.kill();
                }
            }
        })
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Handle to a running acquisition session.
pub struct StreamSource {
    buffer: Arc<FrameBuffer>,
    state: Arc<AtomicU8>,
    stop_flag: Arc<AtomicBool>,
    interrupt: Box<dyn Fn() + Send + Sync>,
    worker: Option<JoinHandle<()>>,
    stop_grace: Duration,
}

impl StreamSource {
    /// Spawn the acquisition thread. The decoder moves into the thread;
    /// only its interrupter stays behind.
    pub fn start(
        config: StreamConfig,
        decoder: Box<dyn FrameDecoder>,
        buffer: Arc<FrameBuffer>,
    ) -> Self {
        let state = Arc::new(AtomicU8::new(StreamState::Disconnected as u8));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let interrupt = decoder.interrupter();
        let stop_grace = config.stop_grace;

        let worker = {
            let buffer = Arc::clone(&buffer);
            let state = Arc::clone(&state);
            let stop_flag = Arc::clone(&stop_flag);
            std::thread::Builder::new()
                .name("frame-acquisition".into())
                .spawn(move || acquisition_loop(config, decoder, buffer, state, stop_flag))
                .ok()
        };

        if worker.is_none() {
            tracing::error!("failed to spawn acquisition thread");
            state.store(StreamState::Stopped as u8, Ordering::SeqCst);
        }

        Self {
            buffer,
            state,
            stop_flag,
            interrupt,
            worker,
            stop_grace,
        }
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.buffer
    }

    /// Ask the acquisition thread to stop and wait up to the configured
    /// grace period. Returns whether the thread actually exited; on
    /// timeout it is detached and will die with its blocked read.
    pub fn stop(&mut self) -> bool {
        self.stop_flag.store(true, Ordering::SeqCst);
        (self.interrupt)();

        let Some(worker) = self.worker.take() else {
            return true;
        };

        let deadline = Instant::now() + self.stop_grace;
        while Instant::now() < deadline {
            if worker.is_finished() {
                let _ = worker.join();
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        tracing::warn!("acquisition thread did not exit within grace period, detaching");
        self.state.store(StreamState::Stopped as u8, Ordering::SeqCst);
        false
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

fn acquisition_loop(
    config: StreamConfig,
    mut decoder: Box<dyn FrameDecoder>,
    buffer: Arc<FrameBuffer>,
    state: Arc<AtomicU8>,
    stop_flag: Arc<AtomicBool>,
) {
    let frame_len = Frame::byte_len(config.width, config.height);
    let mut pixels = vec![0u8; frame_len];
    let mut had_stream = false;

    'connect: while !stop_flag.load(Ordering::SeqCst) {
        let attempt_state = if had_stream {
            StreamState::Reconnecting
        } else {
            StreamState::Connecting
        };
        state.store(attempt_state as u8, Ordering::SeqCst);

        if let Err(err) = decoder.connect() {
            tracing::warn!(error = %err, "connection attempt failed");
            sleep_interruptible(config.retry_backoff, &stop_flag);
            continue;
        }

        let mut sequence = 0u64;
        loop {
            if stop_flag.load(Ordering::SeqCst) {
                break 'connect;
            }

            match decoder.read_frame(&mut pixels) {
                Ok(()) => {
                    if sequence == 0 {
                        tracing::info!(
                            width = config.width,
                            height = config.height,
                            fps = config.fps,
                            "stream established"
                        );
                        // Anything buffered predates this session.
                        buffer.clear();
                        had_stream = true;
                        state.store(StreamState::Streaming as u8, Ordering::SeqCst);
                    }
                    sequence += 1;
                    let evicted = buffer.push(Frame {
                        data: pixels.clone(),
                        width: config.width,
                        height: config.height,
                        captured_at: Instant::now(),
                        sequence,
                    });
                    if evicted {
                        tracing::trace!(sequence, "buffer full, evicted oldest frame");
                    }
                }
                Err(err) => {
                    if stop_flag.load(Ordering::SeqCst) {
                        break 'connect;
                    }
                    tracing::warn!(error = %err, frames = sequence, "stream dropped");
                    state.store(StreamState::Reconnecting as u8, Ordering::SeqCst);
                    sleep_interruptible(config.reconnect_backoff, &stop_flag);
                    continue 'connect;
                }
            }
        }
    }

    state.store(StreamState::Stopped as u8, Ordering::SeqCst);
    tracing::info!("acquisition thread exiting");
}

/// Sleep in short slices so a stop request cuts the backoff short.
fn sleep_interruptible(total: Duration, stop_flag: &AtomicBool) {
    let slice = Duration::from_millis(50);
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && !stop_flag.load(Ordering::SeqCst) {
        std::thread::sleep(slice.min(deadline.saturating_duration_since(Instant::now())));
    }
}
