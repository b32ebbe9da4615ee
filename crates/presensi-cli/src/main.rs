use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[zbus::proxy(
    interface = "org.presensi.Attendance1",
    default_service = "org.presensi.Attendance1",
    default_path = "/org/presensi/Attendance1"
)]
trait Attendance {
    async fn admit(&self, user_id: i64, request_json: &str) -> zbus::Result<String>;
    async fn train(&self, user_id: i64, request_json: &str) -> zbus::Result<String>;
    async fn verify(&self, user_id: i64, request_json: &str) -> zbus::Result<String>;
    async fn training_status(&self, user_id: i64) -> zbus::Result<String>;
    async fn reset(&self, user_id: i64) -> zbus::Result<bool>;
    async fn history(&self, user_id: i64) -> zbus::Result<String>;
    async fn tally(&self, user_id: i64) -> zbus::Result<String>;
    async fn daily_counts(&self, days: u32) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "presensi", about = "Presensi attendance CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit today's attendance
    Admit {
        user_id: i64,
        /// Check-in time as shown on the form (e.g. "07:15")
        #[arg(long)]
        check_in: String,
        /// Present, Leave or Sick (Hadir, Izin, Sakit also accepted)
        #[arg(long, default_value = "Present")]
        status: String,
        #[arg(long)]
        check_out: Option<String>,
        #[arg(long)]
        note: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        lat: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        lon: Option<String>,
        /// Photo to attach
        #[arg(long)]
        image: Option<PathBuf>,
        /// Assert that a face was detected client-side
        #[arg(long)]
        face_detected: bool,
        #[arg(long)]
        face_confidence: Option<f32>,
    },
    /// Enroll face descriptors from a JSON file
    Train { user_id: i64, descriptors: PathBuf },
    /// Match a descriptor from a JSON file against the enrolled set
    Verify { user_id: i64, descriptor: PathBuf },
    /// Show whether a user has enrolled descriptors
    Status { user_id: i64 },
    /// Remove a user's enrolled descriptors
    Reset { user_id: i64 },
    /// List a user's attendance, newest first
    History { user_id: i64 },
    /// Count a user's attendance per status
    Tally { user_id: i64 },
    /// Records per day across all users
    Daily {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Show daemon status
    DaemonStatus,
}

/// Build the admission form JSON the daemon expects.
#[allow(clippy::too_many_arguments)]
fn admission_json(
    check_in: String,
    status: String,
    check_out: Option<String>,
    note: Option<String>,
    lat: Option<String>,
    lon: Option<String>,
    image: Option<&Path>,
    face_detected: bool,
    face_confidence: Option<f32>,
) -> Result<Value> {
    let image_data = match image {
        Some(path) => {
            let bytes =
                std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            Some(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        None => None,
    };

    Ok(json!({
        "check_in_time": check_in,
        "check_out_time": check_out,
        "status": status,
        "note": note,
        "latitude": lat,
        "longitude": lon,
        "image_data": image_data,
        "face_detected": face_detected.to_string(),
        "face_confidence": face_confidence.map(|c| c.to_string()),
    }))
}

/// Descriptor files hold either a bare list or `{"descriptors": [...]}`.
fn training_json(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).context("descriptor file is not JSON")?;
    Ok(match value {
        Value::Array(_) => json!({ "descriptors": value }),
        other => other,
    })
}

/// A single descriptor as a bare list or `{"descriptor": [...]}`.
fn verify_json(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).context("descriptor file is not JSON")?;
    Ok(match value {
        Value::Array(_) => json!({ "descriptor": value }),
        other => other,
    })
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: Value = serde_json::from_str(raw).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to the message bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("presensid is not reachable")?;

    match cli.command {
        Commands::Admit {
            user_id,
            check_in,
            status,
            check_out,
            note,
            lat,
            lon,
            image,
            face_detected,
            face_confidence,
        } => {
            let request = admission_json(
                check_in,
                status,
                check_out,
                note,
                lat,
                lon,
                image.as_deref(),
                face_detected,
                face_confidence,
            )?;
            tracing::debug!(user_id, "submitting attendance");
            print_json(&proxy.admit(user_id, &request.to_string()).await?)?;
        }
        Commands::Train {
            user_id,
            descriptors,
        } => {
            let request = training_json(&read_file(&descriptors)?)?;
            print_json(&proxy.train(user_id, &request.to_string()).await?)?;
        }
        Commands::Verify {
            user_id,
            descriptor,
        } => {
            let request = verify_json(&read_file(&descriptor)?)?;
            print_json(&proxy.verify(user_id, &request.to_string()).await?)?;
        }
        Commands::Status { user_id } => {
            print_json(&proxy.training_status(user_id).await?)?;
        }
        Commands::Reset { user_id } => {
            proxy.reset(user_id).await?;
            println!("Enrollment cleared for user {user_id}");
        }
        Commands::History { user_id } => {
            print_json(&proxy.history(user_id).await?)?;
        }
        Commands::Tally { user_id } => {
            print_json(&proxy.tally(user_id).await?)?;
        }
        Commands::Daily { days } => {
            print_json(&proxy.daily_counts(days).await?)?;
        }
        Commands::DaemonStatus => {
            print_json(&proxy.status().await?)?;
        }
    }

    Ok(())
}
