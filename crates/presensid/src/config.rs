use std::path::{Path, PathBuf};
use std::str::FromStr;

use presensi_core::detector::ChainConfig;
use presensi_core::geofence::DEFAULT_RADIUS_M;
use presensi_core::payload::DEFAULT_MAX_IMAGE_BYTES;
use presensi_core::types::{DEFAULT_DESCRIPTOR_DIM, MATCH_THRESHOLD};
use presensi_core::{ClientTrust, GeoPoint};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("{key} has invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(format!("unknown bus '{other}'")),
        }
    }
}

/// Optional TOML file named by `PRESENSI_CONFIG`. Environment variables take
/// precedence over any key set here.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub db_path: Option<PathBuf>,
    pub upload_dir: Option<PathBuf>,
    pub site_latitude: Option<f64>,
    pub site_longitude: Option<f64>,
    pub radius_m: Option<f64>,
    pub match_threshold: Option<f32>,
    pub descriptor_dim: Option<usize>,
    pub model_dir: Option<PathBuf>,
    pub cascade_path: Option<PathBuf>,
    pub client_trust: Option<ClientTrust>,
    pub max_image_bytes: Option<usize>,
    pub bus: Option<BusKind>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database holding attendance and enrollments.
    pub db_path: PathBuf,
    /// Directory that accepted submission images are written to.
    pub upload_dir: PathBuf,
    /// Authorized location at the center of the geofence.
    pub site: GeoPoint,
    pub radius_m: f64,
    /// Euclidean distance below which a descriptor matches.
    pub match_threshold: f32,
    pub descriptor_dim: usize,
    /// Directory containing the SCRFD and ArcFace ONNX files.
    pub model_dir: PathBuf,
    /// JSON cascade for the second detector tier.
    pub cascade_path: PathBuf,
    pub client_trust: ClientTrust,
    pub max_image_bytes: usize,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `PRESENSI_*` environment variables, on top of
    /// the file named by `PRESENSI_CONFIG` if there is one.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("PRESENSI_CONFIG") {
            Some(path) => ConfigFile::load(Path::new(&path))?,
            None => ConfigFile::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge `file` and the variables visible through `env` over defaults.
    pub fn resolve(
        file: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presensi");

        let model_dir = env("PRESENSI_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| data_dir.join("models"));

        let latitude = env_parse(&env, "PRESENSI_SITE_LATITUDE")?.or(file.site_latitude);
        let longitude = env_parse(&env, "PRESENSI_SITE_LONGITUDE")?.or(file.site_longitude);
        let site = match (latitude, longitude) {
            (Some(lat), Some(lon)) => GeoPoint::new(lat, lon),
            (None, _) => return Err(ConfigError::Missing("PRESENSI_SITE_LATITUDE")),
            (_, None) => return Err(ConfigError::Missing("PRESENSI_SITE_LONGITUDE")),
        };
        if !(site.latitude.abs() <= 90.0 && site.longitude.abs() <= 180.0) {
            return Err(ConfigError::Invalid {
                key: "site",
                value: format!("{}, {}", site.latitude, site.longitude),
            });
        }

        let radius_m = env_parse(&env, "PRESENSI_RADIUS_M")?
            .or(file.radius_m)
            .unwrap_or(DEFAULT_RADIUS_M);
        if !(radius_m.is_finite() && radius_m >= 0.0) {
            return Err(ConfigError::Invalid {
                key: "radius_m",
                value: radius_m.to_string(),
            });
        }
        let match_threshold = env_parse(&env, "PRESENSI_MATCH_THRESHOLD")?
            .or(file.match_threshold)
            .unwrap_or(MATCH_THRESHOLD);
        if !(match_threshold.is_finite() && match_threshold > 0.0) {
            return Err(ConfigError::Invalid {
                key: "match_threshold",
                value: match_threshold.to_string(),
            });
        }
        let descriptor_dim = env_parse(&env, "PRESENSI_DESCRIPTOR_DIM")?
            .or(file.descriptor_dim)
            .unwrap_or(DEFAULT_DESCRIPTOR_DIM);
        if descriptor_dim == 0 {
            return Err(ConfigError::Invalid {
                key: "descriptor_dim",
                value: "0".into(),
            });
        }
        let max_image_bytes = env_parse(&env, "PRESENSI_MAX_IMAGE_BYTES")?
            .or(file.max_image_bytes)
            .unwrap_or(DEFAULT_MAX_IMAGE_BYTES);
        if max_image_bytes == 0 {
            return Err(ConfigError::Invalid {
                key: "max_image_bytes",
                value: "0".into(),
            });
        }

        Ok(Self {
            db_path: env("PRESENSI_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("presensi.db")),
            upload_dir: env("PRESENSI_UPLOAD_DIR")
                .map(PathBuf::from)
                .or(file.upload_dir)
                .unwrap_or_else(|| PathBuf::from("static/uploads")),
            site,
            radius_m,
            match_threshold,
            descriptor_dim,
            cascade_path: env("PRESENSI_CASCADE_PATH")
                .map(PathBuf::from)
                .or(file.cascade_path)
                .unwrap_or_else(|| model_dir.join("face_cascade.json")),
            model_dir,
            client_trust: env_parse(&env, "PRESENSI_CLIENT_TRUST")?
                .or(file.client_trust)
                .unwrap_or_default(),
            max_image_bytes,
            bus: env_parse(&env, "PRESENSI_BUS")?
                .or(file.bus)
                .unwrap_or_default(),
        })
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }

    pub fn chain_config(&self) -> ChainConfig {
        ChainConfig {
            scrfd_model: Some(self.scrfd_model_path()),
            arcface_model: Some(self.arcface_model_path()),
            cascade: Some(self.cascade_path.clone()),
        }
    }
}

fn env_parse<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
