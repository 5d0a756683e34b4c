//! Daemon service layer.
//!
//! Inference sessions are not shared; a dedicated engine thread owns the
//! identification pipeline and handlers talk to it over a channel. The
//! roster lives behind a read-write lock so identification keeps running
//! while enrollments land.

use crate::config::Config;
use rollcall_core::matcher::{self, MatchError};
use rollcall_core::pipeline::{EnrollError, IdentificationPipeline, PipelineError};
use rollcall_core::roster::StoreError;
use rollcall_core::{
    build_detector, Descriptor, Identification, OnnxExtractor, RosterEntry, RosterStore,
};
use rollcall_stream::{FfmpegDecoder, FrameBuffer, StreamSource, StreamState};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{0} faces detected, need exactly one")]
    AmbiguousFace(usize),
    #[error("roster store: {0}")]
    Store(#[from] StoreError),
    #[error("invalid image: {0}")]
    BadImage(String),
    #[error("stream already running")]
    AlreadyStreaming,
    #[error("operation unavailable in simulation mode")]
    SimulationOnly,
    #[error("pipeline: {0}")]
    Pipeline(String),
    #[error("descriptor comparison: {0}")]
    Compare(#[from] MatchError),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl From<EnrollError> for ServiceError {
    fn from(err: EnrollError) -> Self {
        match err {
            EnrollError::NoFaceDetected => Self::NoFaceDetected,
            EnrollError::AmbiguousFace(n) => Self::AmbiguousFace(n),
            other => Self::Pipeline(other.to_string()),
        }
    }
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Identify {
        rgb: Vec<u8>,
        width: u32,
        height: u32,
        roster: Vec<RosterEntry>,
        reply: oneshot::Sender<Result<Vec<Identification>, PipelineError>>,
    },
    Describe {
        rgb: Vec<u8>,
        width: u32,
        height: u32,
        reply: oneshot::Sender<Result<Descriptor, EnrollError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Identify every face in a frame against a roster snapshot.
    pub async fn identify(
        &self,
        rgb: Vec<u8>,
        width: u32,
        height: u32,
        roster: Vec<RosterEntry>,
    ) -> Result<Result<Vec<Identification>, PipelineError>, ServiceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Identify {
                rgb,
                width,
                height,
                roster,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ServiceError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ServiceError::ChannelClosed)
    }

    /// Produce an enrollment-grade descriptor for the single face in an image.
    pub async fn describe(
        &self,
        rgb: Vec<u8>,
        width: u32,
        height: u32,
    ) -> Result<Result<Descriptor, EnrollError>, ServiceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Describe {
                rgb,
                width,
                height,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ServiceError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ServiceError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread. The pipeline moves in and
/// never comes back out; all access goes through the handle.
pub fn spawn_engine(mut pipeline: IdentificationPipeline) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Identify {
                        rgb,
                        width,
                        height,
                        roster,
                        reply,
                    } => {
                        let result = pipeline.identify(&rgb, width, height, &roster);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Describe {
                        rgb,
                        width,
                        height,
                        reply,
                    } => {
                        let result = pipeline.enroll_descriptor(&rgb, width, height);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportMode {
    /// Results come from a decoded stream frame.
    Live,
    /// Simulation mode; no camera was consulted.
    Simulation,
    /// No stream active or no frame arrived within the timeout.
    NoFrame,
}

/// One identification pass over the freshest available frame.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyReport {
    pub mode: ReportMode,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub results: Vec<Identification>,
}

impl IdentifyReport {
    fn empty(mode: ReportMode, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        Self { mode, timestamp, results: Vec::new() }
    }
}

/// Outcome of probing one photo against the roster.
#[derive(Debug, Clone, Serialize)]
pub struct RosterCheck {
    pub matched: bool,
    pub student_id: Option<String>,
    pub name: String,
    pub confidence: f32,
}

/// Which of a set of requested ids are already enrolled.
#[derive(Debug, Clone, Serialize)]
pub struct RosterPresence {
    pub present: Vec<String>,
    pub missing: Vec<String>,
}

pub struct Service {
    engine: Option<EngineHandle>,
    roster: Arc<RwLock<RosterStore>>,
    stream: Mutex<Option<StreamSource>>,
    config: Config,
}

impl Service {
    /// Bring the service up: load the roster, build the configured
    /// detector, load the descriptor model, and start the engine thread.
    /// Fails fast on anything unavailable, except in simulation mode,
    /// which runs without models or camera.
    pub fn new(config: Config) -> Result<Self, ServiceError> {
        let roster = RosterStore::load(&config.roster_path)?;

        let engine = if config.simulation {
            tracing::warn!("simulation mode: no models loaded, identify reports are empty");
            None
        } else {
            let detector = build_detector(config.backend, &config.deep_backend());
            let extractor = OnnxExtractor::load(&config.extractor_model_path(), config.ort_threads)
                .map_err(|e| ServiceError::Pipeline(e.to_string()))?;
            let pipeline =
                IdentificationPipeline::new(detector, Box::new(extractor), config.tuning());
            Some(spawn_engine(pipeline))
        };

        Ok(Self {
            engine,
            roster: Arc::new(RwLock::new(roster)),
            stream: Mutex::new(None),
            config,
        })
    }

    #[cfg(test)]
    fn from_parts(engine: Option<EngineHandle>, roster: RosterStore, config: Config) -> Self {
        Self {
            engine,
            roster: Arc::new(RwLock::new(roster)),
            stream: Mutex::new(None),
            config,
        }
    }

    fn engine(&self) -> Result<&EngineHandle, ServiceError> {
        self.engine.as_ref().ok_or(ServiceError::SimulationOnly)
    }

    /// Begin acquiring frames from the configured stream URL.
    pub async fn start_stream(&self) -> Result<(), ServiceError> {
        if self.config.simulation {
            tracing::info!("simulation mode: stream start is a no-op");
            return Ok(());
        }

        let mut guard = self.stream.lock().await;
        if let Some(source) = guard.as_ref() {
            if source.state() != StreamState::Stopped {
                return Err(ServiceError::AlreadyStreaming);
            }
        }

        let stream_config = self.config.stream_config();
        let decoder = Box::new(FfmpegDecoder::new(&stream_config));
        let buffer = Arc::new(FrameBuffer::new(self.config.buffer_capacity));
        tracing::info!(url = %stream_config.url, "starting stream");
        *guard = Some(StreamSource::start(stream_config, decoder, buffer));
        Ok(())
    }

    /// Stop frame acquisition. Idempotent; stopping with no stream active
    /// does nothing. The stop runs off the async runtime since it may wait
    /// out the grace period.
    pub async fn stop_stream(&self) -> Result<(), ServiceError> {
        let mut guard = self.stream.lock().await;
        let Some(mut source) = guard.take() else {
            return Ok(());
        };
        drop(guard);

        tokio::task::spawn_blocking(move || {
            let clean = source.stop();
            tracing::info!(clean, "stream stopped");
        })
        .await
        .map_err(|_| ServiceError::ChannelClosed)?;
        Ok(())
    }

    pub async fn stream_state(&self) -> StreamState {
        match self.stream.lock().await.as_ref() {
            Some(source) => source.state(),
            None => StreamState::Disconnected,
        }
    }

    /// Identify everyone visible in the freshest frame.
    ///
    /// A missing stream or an empty buffer is an empty report flagged
    /// `no-frame`, not an error; the caller's polling loop keeps going.
    pub async fn identify(&self) -> Result<IdentifyReport, ServiceError> {
        let timestamp = chrono::Utc::now();

        if self.config.simulation {
            return Ok(IdentifyReport::empty(ReportMode::Simulation, timestamp));
        }

        let buffer = {
            let guard = self.stream.lock().await;
            match guard.as_ref() {
                Some(source) => Arc::clone(source.buffer()),
                None => return Ok(IdentifyReport::empty(ReportMode::NoFrame, timestamp)),
            }
        };

        let timeout = self.config.frame_timeout;
        let frame = match tokio::task::spawn_blocking(move || buffer.recv_latest(timeout))
            .await
            .map_err(|_| ServiceError::ChannelClosed)?
        {
            Some(frame) => frame,
            None => return Ok(IdentifyReport::empty(ReportMode::NoFrame, timestamp)),
        };

        let roster = self.roster.read().await.entries().to_vec();
        let results = self
            .engine()?
            .identify(frame.data, frame.width, frame.height, roster)
            .await?
            .map_err(|e| ServiceError::Pipeline(e.to_string()))?;

        tracing::debug!(faces = results.len(), "identify pass complete");
        Ok(IdentifyReport {
            mode: ReportMode::Live,
            timestamp,
            results,
        })
    }

    /// Enroll a student from an encoded photo (PNG, JPEG, anything the
    /// image decoder accepts).
    pub async fn enroll(
        &self,
        student_id: &str,
        name: &str,
        image_bytes: &[u8],
    ) -> Result<(), ServiceError> {
        let (rgb, width, height) = decode_rgb(image_bytes)?;
        let descriptor = self.engine()?.describe(rgb, width, height).await??;
        self.roster
            .write()
            .await
            .upsert(student_id, name, descriptor)?;
        Ok(())
    }

    /// Remove a student's enrollment. Returns whether anything was removed.
    pub async fn remove_enrollment(&self, student_id: &str) -> Result<bool, ServiceError> {
        Ok(self.roster.write().await.remove(student_id)?)
    }

    /// Ordered (student_id, name) pairs of everyone enrolled.
    pub async fn roster_snapshot(&self) -> Vec<(String, String)> {
        self.roster.read().await.snapshot()
    }

    /// Which of the requested student ids already have enrollments.
    pub async fn check_roster(&self, ids: &[String]) -> RosterPresence {
        let roster = self.roster.read().await;
        let mut presence = RosterPresence {
            present: Vec::new(),
            missing: Vec::new(),
        };
        for id in ids {
            if roster.contains(id) {
                presence.present.push(id.clone());
            } else {
                presence.missing.push(id.clone());
            }
        }
        presence
    }

    /// Probe a photo against the roster without touching the stream.
    pub async fn probe_photo(&self, image_bytes: &[u8]) -> Result<RosterCheck, ServiceError> {
        let (rgb, width, height) = decode_rgb(image_bytes)?;
        let descriptor = self.engine()?.describe(rgb, width, height).await??;

        let roster = self.roster.read().await;
        let m = matcher::classify(&descriptor, roster.entries(), self.config.tolerance);
        Ok(RosterCheck {
            matched: m.student_id.is_some(),
            student_id: m.student_id,
            name: m.name,
            confidence: m.confidence,
        })
    }

    /// Compare the faces in two photos directly, roster not involved.
    pub async fn compare(
        &self,
        image_a: &[u8],
        image_b: &[u8],
    ) -> Result<matcher::CompareOutcome, ServiceError> {
        let (rgb_a, wa, ha) = decode_rgb(image_a)?;
        let (rgb_b, wb, hb) = decode_rgb(image_b)?;

        let engine = self.engine()?;
        let a = engine.describe(rgb_a, wa, ha).await??;
        let b = engine.describe(rgb_b, wb, hb).await??;

        Ok(matcher::compare(&a, &b, self.config.tolerance)?)
    }
}

/// Decode an encoded image into packed RGB24.
fn decode_rgb(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32), ServiceError> {
    let img = image::load_from_memory(bytes).map_err(|e| ServiceError::BadImage(e.to_string()))?;
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    Ok((rgb.into_raw(), width, height))
}
