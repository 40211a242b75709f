//! Runtime configuration (TOML) and behavior rules (YAML) for vigil.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

mod behavior;

pub use behavior::{
    load_behavior_file, BehaviorRules, CrossDirection, RoiRule, TripwireRule,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVarError {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDeError {
        #[from]
        source: toml::de::Error,
    },
    #[error("YAML deserialization error: {source}")]
    YamlDeError {
        #[from]
        source: serde_yaml::Error,
    },
    #[error("config path {0} has no parent directory")]
    NoParentDirectory(PathBuf),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, Error>;

fn default_transport() -> Transport {
    Transport::Udp
}

fn default_pre_event_seconds() -> f64 {
    2.0
}

fn default_post_event_seconds() -> f64 {
    5.0
}

fn default_cooldown_period() -> f64 {
    5.0
}

fn default_max_event_duration() -> f64 {
    20.0
}

fn default_target_fps() -> f64 {
    30.0
}

fn default_target_bitrate_mbps() -> f64 {
    2.0
}

fn default_encode_width() -> u32 {
    2304
}

fn default_encode_height() -> u32 {
    1296
}

fn default_analysis_width() -> u32 {
    1280
}

fn default_analysis_height() -> u32 {
    736
}

fn default_intra_event_threshold() -> f32 {
    0.90
}

fn default_reid_interval() -> u64 {
    5
}

fn default_health_check_interval_secs() -> u64 {
    15
}

fn default_thread_join_timeout_secs() -> u64 {
    10
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data/captures")
}

fn default_database() -> PathBuf {
    PathBuf::from("data/security_events.db")
}

fn default_behavior_config() -> PathBuf {
    PathBuf::from("configs/behavior.yaml")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Rtsp,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FpsMode {
    /// Keep the observed frame rate of the recording.
    Source,
    /// Decimate down to `target_fps` when the observed rate exceeds it.
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingMode {
    /// Constant-quality rate control; file size varies with scene
    /// complexity.
    Quality,
    /// Constant bitrate at `target_bitrate_mbps`.
    Balanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Network URL (rtsp) or video file path (file). May contain shell
    /// variables such as `~`, `$A`, or `${B}`.
    pub uri: String,
    /// RTSP transport protocol. Ignored for file sources.
    #[serde(default = "default_transport")]
    pub transport: Transport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordingConfig {
    /// Seconds of context recorded before the trigger.
    #[serde(default = "default_pre_event_seconds")]
    pub pre_event_seconds: f64,
    /// Seconds the recording continues after the last person was seen.
    #[serde(default = "default_post_event_seconds")]
    pub post_event_seconds: f64,
    /// Idle seconds after an event before a new one may start.
    #[serde(default = "default_cooldown_period")]
    pub cooldown_period: f64,
    /// Hard cap on a single recording; longer activity is segmented.
    #[serde(default = "default_max_event_duration")]
    pub max_event_duration: f64,
    /// Nominal pipeline rate, used for buffer sizing and decimation.
    #[serde(default = "default_target_fps")]
    pub target_fps: f64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            pre_event_seconds: default_pre_event_seconds(),
            post_event_seconds: default_post_event_seconds(),
            cooldown_period: default_cooldown_period(),
            max_event_duration: default_max_event_duration(),
            target_fps: default_target_fps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VideoConfig {
    #[serde(default = "FpsMode::default")]
    pub fps_mode: FpsMode,
    #[serde(default = "EncodingMode::default")]
    pub encoding_mode: EncodingMode,
    /// Target average bitrate in Mbps, balanced mode only.
    #[serde(default = "default_target_bitrate_mbps")]
    pub target_bitrate_mbps: f64,
    #[serde(default = "default_encode_width")]
    pub encode_width: u32,
    #[serde(default = "default_encode_height")]
    pub encode_height: u32,
    /// Resolution frames are downscaled to for detection and tracking.
    #[serde(default = "default_analysis_width")]
    pub analysis_width: u32,
    #[serde(default = "default_analysis_height")]
    pub analysis_height: u32,
}

impl Default for FpsMode {
    fn default() -> Self {
        FpsMode::Source
    }
}

impl Default for EncodingMode {
    fn default() -> Self {
        EncodingMode::Balanced
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            fps_mode: FpsMode::default(),
            encoding_mode: EncodingMode::default(),
            target_bitrate_mbps: default_target_bitrate_mbps(),
            encode_width: default_encode_width(),
            encode_height: default_encode_height(),
            analysis_width: default_analysis_width(),
            analysis_height: default_analysis_height(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReidConfig {
    /// Gallery reconciliation threshold. Required; there is no default.
    pub person_match_threshold: f32,
    /// Intra-event clustering threshold, distinct from the gallery one.
    #[serde(default = "default_intra_event_threshold")]
    pub intra_event_threshold: f32,
    /// Apply mutual-kNN neighbor-feature centralization before clustering.
    #[serde(default)]
    pub feature_centralization: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Sidecar command that serves person detection requests.
    pub detector_command: Option<String>,
    /// Sidecar command that serves Re-ID embedding requests. Without it,
    /// events are persisted with no person identity.
    pub extractor_command: Option<String>,
    /// Extract Re-ID features every Nth frame.
    #[serde(default = "default_reid_interval")]
    pub reid_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_thread_join_timeout_secs")]
    pub thread_join_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval_secs(),
            thread_join_timeout_secs: default_thread_join_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Directory event clips are written to. Created if missing.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// SQLite database file.
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Behavior rules YAML file.
    #[serde(default = "default_behavior_config")]
    pub behavior_config: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            database: default_database(),
            behavior_config: default_behavior_config(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifierConfig {
    #[serde(default)]
    pub enabled: bool,
    /// External command invoked with the message and, when present, the
    /// clip path as its arguments.
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VigilConfig {
    pub source: SourceConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub video: VideoConfig,
    pub reid: ReidConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

impl VigilConfig {
    /// Capacity of the event stage's elastic frame queue.
    pub fn event_queue_capacity(&self) -> usize {
        let r = &self.recording;
        (r.target_fps * (r.pre_event_seconds + r.post_event_seconds) * 2.0).ceil() as usize
    }

    /// Capacity of the pre-event ring buffer.
    pub fn ring_buffer_capacity(&self) -> usize {
        let r = &self.recording;
        (r.pre_event_seconds * r.target_fps * 1.5).ceil() as usize
    }

    fn validate(&self) -> Result<()> {
        if self.recording.target_fps <= 0.0 {
            return Err(Error::Invalid("target_fps must be positive".into()));
        }
        if self.recording.max_event_duration <= 0.0 {
            return Err(Error::Invalid("max_event_duration must be positive".into()));
        }
        if self.video.analysis_width == 0 || self.video.analysis_height == 0 {
            return Err(Error::Invalid("analysis resolution must be nonzero".into()));
        }
        if self.video.encode_width == 0 || self.video.encode_height == 0 {
            return Err(Error::Invalid("encode resolution must be nonzero".into()));
        }
        if !(0.0..=1.0).contains(&self.reid.person_match_threshold) {
            return Err(Error::Invalid(
                "person_match_threshold must be within [0, 1]".into(),
            ));
        }
        if self.analysis.reid_interval == 0 {
            return Err(Error::Invalid("reid_interval must be at least 1".into()));
        }
        Ok(())
    }
}

/// Split `path` (which must be a file) into directory and filename
/// component.
fn split_path<P: AsRef<Path>>(path: P) -> Result<(PathBuf, PathBuf)> {
    let path = path.as_ref();
    let mut components = path.components();
    let filename = match components.next_back() {
        Some(c) => c.as_os_str().into(),
        None => return Err(Error::NoParentDirectory(path.into())),
    };
    let dirname = components.as_path().into();
    Ok((dirname, filename))
}

/// If `path` is relative, make it relative to `dirname`.
///
/// `path` must be utf-8 encoded and can start with a tilde, which is
/// expanded to the home directory.
fn fixup_relative_path(path: &mut PathBuf, dirname: &Path) -> Result<()> {
    let pathstr = path
        .to_str()
        .ok_or_else(|| Error::Invalid(format!("non-utf8 path {path:?}")))?;
    let expanded = shellexpand::full(pathstr)?;
    *path = PathBuf::from(expanded.to_string());

    if path.is_relative() {
        *path = dirname.join(&path);
    }
    Ok(())
}

/// Parse the runtime TOML configuration.
///
/// Relative paths inside the file are resolved against the file's own
/// directory, so a config directory can be moved as a unit.
pub fn parse_config_file<P: AsRef<Path>>(fname: P) -> Result<VigilConfig> {
    let buf = std::fs::read_to_string(fname.as_ref())?;
    let mut cfg: VigilConfig = toml::from_str(&buf)?;
    cfg.validate()?;

    let (dirname, _) = split_path(fname.as_ref())?;
    fixup_relative_path(&mut cfg.paths.output_dir, &dirname)?;
    fixup_relative_path(&mut cfg.paths.database, &dirname)?;
    fixup_relative_path(&mut cfg.paths.behavior_config, &dirname)?;
    if cfg.source.kind == SourceKind::File {
        let mut uri = PathBuf::from(&cfg.source.uri);
        fixup_relative_path(&mut uri, &dirname)?;
        cfg.source.uri = uri
            .to_str()
            .ok_or_else(|| Error::Invalid(format!("non-utf8 path {uri:?}")))?
            .to_string();
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[source]
kind = "file"
uri = "sample.mp4"

[reid]
person_match_threshold = 0.96
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: VigilConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(cfg.recording.pre_event_seconds, 2.0);
        assert_eq!(cfg.recording.post_event_seconds, 5.0);
        assert_eq!(cfg.recording.cooldown_period, 5.0);
        assert_eq!(cfg.recording.max_event_duration, 20.0);
        assert_eq!(cfg.video.fps_mode, FpsMode::Source);
        assert_eq!(cfg.video.encoding_mode, EncodingMode::Balanced);
        assert_eq!(cfg.reid.intra_event_threshold, 0.90);
        assert!(!cfg.reid.feature_centralization);
        assert_eq!(cfg.analysis.reid_interval, 5);
        assert_eq!(cfg.supervisor.health_check_interval_secs, 15);
        assert_eq!(cfg.supervisor.thread_join_timeout_secs, 10);
    }

    #[test]
    fn person_match_threshold_is_required() {
        let without = r#"
[source]
kind = "file"
uri = "sample.mp4"

[reid]
intra_event_threshold = 0.9
"#;
        assert!(toml::from_str::<VigilConfig>(without).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let cfg = format!("{MINIMAL}\n[recording]\npre_event_secnods = 2.0\n");
        assert!(toml::from_str::<VigilConfig>(&cfg).is_err());
    }

    #[test]
    fn queue_and_ring_sizing() {
        let cfg: VigilConfig = toml::from_str(MINIMAL).unwrap();
        // 30 fps * (2 + 5) s * 2 = 420; 2 s * 30 fps * 1.5 = 90.
        assert_eq!(cfg.event_queue_capacity(), 420);
        assert_eq!(cfg.ring_buffer_capacity(), 90);
    }

    #[test]
    fn relative_paths_follow_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("vigil.toml");
        let mut fd = std::fs::File::create(&cfg_path).unwrap();
        fd.write_all(MINIMAL.as_bytes()).unwrap();
        drop(fd);

        let cfg = parse_config_file(&cfg_path).unwrap();
        assert_eq!(cfg.paths.output_dir, dir.path().join("data/captures"));
        assert_eq!(
            cfg.paths.database,
            dir.path().join("data/security_events.db")
        );
        assert_eq!(cfg.source.uri, dir.path().join("sample.mp4").to_str().unwrap());
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let cfg = MINIMAL.replace("0.96", "1.5");
        let parsed: VigilConfig = toml::from_str(&cfg).unwrap();
        assert!(parsed.validate().is_err());
    }
}
