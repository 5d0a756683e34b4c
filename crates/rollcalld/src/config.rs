use rollcall_core::pipeline::MultiFacePolicy;
use rollcall_core::{BackendKind, DeepBackendConfig, PipelineTuning};
use rollcall_stream::StreamConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Video stream URL (RTSP or HTTP).
    pub stream_url: String,
    pub frame_width: u32,
    pub frame_height: u32,
    pub frame_fps: u32,
    /// Which face localization backend to run.
    pub backend: BackendKind,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the roster JSON file.
    pub roster_path: PathBuf,
    /// Maximum descriptor distance accepted as a match.
    pub tolerance: f32,
    /// Smallest face edge (full-resolution pixels) worth identifying.
    pub min_face_px: u32,
    /// Downscale factor applied before detection.
    pub detect_scale: f32,
    /// Jitter samples averaged per enrollment.
    pub enroll_jitter: usize,
    pub multi_face: MultiFacePolicy,
    /// Frames held between the acquisition thread and consumers.
    pub buffer_capacity: usize,
    /// How long identify waits for a live frame.
    pub frame_timeout: Duration,
    /// Applied after a failed frame read before reconnecting.
    pub reconnect_backoff: Duration,
    /// Longer delay between connection attempts that themselves fail.
    pub retry_backoff: Duration,
    pub stop_grace: Duration,
    /// ONNX Runtime intra-op threads.
    pub ort_threads: usize,
    pub cuda_device_id: i32,
    /// When set, identify fabricates results instead of touching a camera.
    pub simulation: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let roster_path = std::env::var("ROLLCALL_ROSTER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("roster.json"));

        let backend = std::env::var("ROLLCALL_BACKEND")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(BackendKind::Classical);

        let multi_face = match std::env::var("ROLLCALL_MULTI_FACE_POLICY").as_deref() {
            Ok("reject") => MultiFacePolicy::Reject,
            _ => MultiFacePolicy::LargestFace,
        };

        Self {
            stream_url: std::env::var("ROLLCALL_STREAM_URL").unwrap_or_default(),
            frame_width: env_u32("ROLLCALL_FRAME_WIDTH", 1920),
            frame_height: env_u32("ROLLCALL_FRAME_HEIGHT", 1080),
            frame_fps: env_u32("ROLLCALL_FRAME_FPS", 5),
            backend,
            model_dir,
            roster_path,
            tolerance: env_f32("ROLLCALL_TOLERANCE", rollcall_core::DEFAULT_TOLERANCE),
            min_face_px: env_u32("ROLLCALL_MIN_FACE_PX", 80),
            detect_scale: env_f32("ROLLCALL_DETECT_SCALE", 0.5),
            enroll_jitter: env_usize("ROLLCALL_ENROLL_JITTER", 5),
            multi_face,
            buffer_capacity: env_usize("ROLLCALL_BUFFER_CAPACITY", 2),
            frame_timeout: Duration::from_millis(env_u64("ROLLCALL_FRAME_TIMEOUT_MS", 1000)),
            reconnect_backoff: Duration::from_secs(env_u64("ROLLCALL_RECONNECT_BACKOFF_SECS", 2)),
            retry_backoff: Duration::from_secs(env_u64("ROLLCALL_RETRY_BACKOFF_SECS", 5)),
            stop_grace: Duration::from_secs(env_u64("ROLLCALL_STOP_GRACE_SECS", 5)),
            ort_threads: env_usize("ROLLCALL_ORT_THREADS", 2),
            cuda_device_id: env_u32("ROLLCALL_CUDA_DEVICE", 0) as i32,
            simulation: std::env::var("ROLLCALL_SIMULATION")
                .map(|v| v == "1")
                .unwrap_or(false),
        }
    }

    /// Path to the face localization model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the descriptor model.
    pub fn extractor_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            url: self.stream_url.clone(),
            width: self.frame_width,
            height: self.frame_height,
            fps: self.frame_fps,
            reconnect_backoff: self.reconnect_backoff,
            retry_backoff: self.retry_backoff,
            stop_grace: self.stop_grace,
        }
    }

    pub fn tuning(&self) -> PipelineTuning {
        PipelineTuning {
            detect_scale: self.detect_scale,
            min_face_px: self.min_face_px,
            tolerance: self.tolerance,
            enroll_jitter: self.enroll_jitter,
            multi_face: self.multi_face,
        }
    }

    pub fn deep_backend(&self) -> DeepBackendConfig {
        DeepBackendConfig {
            model_path: self.detector_model_path(),
            intra_threads: self.ort_threads,
            cuda_device_id: self.cuda_device_id,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
