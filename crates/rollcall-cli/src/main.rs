use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod client;

use client::DaemonClient;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Base URL of the rollcalld HTTP API
    #[arg(long, env = "ROLLCALL_URL", default_value = "http://127.0.0.1:8750")]
    url: String,
    /// Print raw JSON responses
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon and recognition status
    Status,
    /// List enrolled identities
    List,
    /// Show one identity
    Show { id: i64 },
    /// Enroll a new identity
    Enroll {
        /// Display name
        name: String,
        /// Unique roll number
        #[arg(long)]
        roll_number: Option<String>,
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Replace an identity's reference encoding
    Reenroll {
        id: i64,
        #[command(flatten)]
        source: SourceArgs,
    },
    /// List attendance for a day (default: today)
    Attendance {
        /// Date as YYYY-MM-DD
        #[arg(short, long, conflicts_with = "all")]
        date: Option<String>,
        /// Every record ever taken, newest first
        #[arg(long)]
        all: bool,
        /// Print the day's attendance as CSV
        #[arg(long, conflicts_with = "all")]
        csv: bool,
    },
    /// Attendance statistics
    Stats {
        /// Number of most recent days with records
        #[arg(short, long, default_value_t = 7)]
        days: usize,
    },
    /// Start the recognition loop
    Start,
    /// Stop the recognition loop
    Stop,
    /// Run local camera diagnostics (bypasses the daemon)
    Test {
        #[arg(long, default_value = "/dev/video0")]
        device: String,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct SourceArgs {
    /// File holding the encoding as a JSON array or whitespace/comma separated numbers
    #[arg(long)]
    encoding_file: Option<PathBuf>,
    /// Capture this many frames from the daemon's camera and average them
    #[arg(long)]
    capture: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = DaemonClient::new(&cli.url, Duration::from_secs(60));

    match cli.command {
        Commands::Status => {
            let status = client.get("/api/status")?;
            if cli.json {
                return print_json(&status);
            }
            print_status(&status);
        }
        Commands::List => {
            let identities = client.get("/api/identities")?;
            if cli.json {
                return print_json(&identities);
            }
            let rows = identities.as_array().cloned().unwrap_or_default();
            if rows.is_empty() {
                println!("No identities enrolled");
            }
            for identity in rows {
                print_identity(&identity);
            }
        }
        Commands::Show { id } => {
            let identity = client.get(&format!("/api/identities/{id}"))?;
            if cli.json {
                return print_json(&identity);
            }
            print_identity(&identity);
        }
        Commands::Enroll {
            name,
            roll_number,
            source,
        } => {
            let body = json!({
                "name": name,
                "rollNumber": roll_number,
                "encodingSource": source.to_json()?,
            });
            if source.capture.is_some() {
                println!("Capturing from the daemon's camera; look at the camera...");
            }
            let created = client.post("/api/identities", Some(body))?;
            if cli.json {
                return print_json(&created);
            }
            println!("Enrolled:");
            print_identity(&created);
        }
        Commands::Reenroll { id, source } => {
            let body = json!({ "encodingSource": source.to_json()? });
            let updated = client.put(&format!("/api/identities/{id}/encoding"), body)?;
            if cli.json {
                return print_json(&updated);
            }
            println!("Re-enrolled:");
            print_identity(&updated);
        }
        Commands::Attendance { date, all, csv } => {
            let query: Vec<(&str, String)> = date.into_iter().map(|d| ("date", d)).collect();
            if csv {
                print!("{}", client.get_text("/api/attendance.csv", &query)?);
                return Ok(());
            }
            let entries = if all {
                client.get("/api/attendance/all")?
            } else {
                client.get_query("/api/attendance", &query)?
            };
            if cli.json {
                return print_json(&entries);
            }
            let rows = entries.as_array().cloned().unwrap_or_default();
            if rows.is_empty() {
                println!("No attendance recorded");
            }
            for entry in rows {
                print_attendance(&entry, all);
            }
        }
        Commands::Stats { days } => {
            let stats = client.get_query("/api/stats", &[("days", days.to_string())])?;
            if cli.json {
                return print_json(&stats);
            }
            println!("Enrolled:        {}", stats["totalStudents"]);
            println!("Present today:   {}", stats["presentToday"]);
            println!("Absent today:    {}", stats["absentToday"]);
            println!("Attendance rate: {}%", stats["attendanceRate"]);
            for day in stats["daily"].as_array().cloned().unwrap_or_default() {
                println!("  {}  {}", day["date"].as_str().unwrap_or("?"), day["count"]);
            }
        }
        Commands::Start => {
            let state = client.post("/api/control/start", None)?;
            print_loop_state(&state, cli.json)?;
        }
        Commands::Stop => {
            let state = client.post("/api/control/stop", None)?;
            print_loop_state(&state, cli.json)?;
        }
        Commands::Test { device } => run_camera_test(&device)?,
    }

    Ok(())
}

impl SourceArgs {
    fn to_json(&self) -> Result<Value> {
        match (&self.encoding_file, self.capture) {
            (Some(path), _) => Ok(json!({ "type": "vector", "encoding": read_encoding_file(path)? })),
            (None, Some(samples)) => Ok(json!({ "type": "capture", "samples": samples })),
            (None, None) => bail!("either --encoding-file or --capture is required"),
        }
    }
}

fn read_encoding_file(path: &Path) -> Result<Vec<f32>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_encoding(&text).with_context(|| format!("bad encoding in {}", path.display()))
}

/// Accept a JSON array, or plain numbers separated by whitespace or commas.
fn parse_encoding(text: &str) -> Result<Vec<f32>> {
    let trimmed = text.trim();
    let values: Vec<f32> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<f32>().with_context(|| format!("not a number: {s:?}")))
            .collect::<Result<_>>()?
    };
    if values.is_empty() {
        bail!("encoding is empty");
    }
    Ok(values)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_identity(identity: &Value) {
    println!(
        "{:>6}  {:<12}  {:<24}  enrolled {}",
        identity["id"],
        identity["rollNumber"].as_str().unwrap_or("-"),
        identity["name"].as_str().unwrap_or("?"),
        identity["enrolledAt"].as_str().unwrap_or("-"),
    );
}

fn print_attendance(entry: &Value, with_date: bool) {
    let date = if with_date {
        format!("{}  ", entry["date"].as_str().unwrap_or("?"))
    } else {
        String::new()
    };
    println!(
        "{date}{:>6}  {:<12}  {:<24}  {}",
        entry["identityId"],
        entry["rollNumber"].as_str().unwrap_or("-"),
        entry["name"].as_str().unwrap_or("(removed)"),
        entry["firstSeenAt"].as_str().unwrap_or("-"),
    );
}

fn print_status(status: &Value) {
    let yes_no = |v: &Value| if v.as_bool() == Some(true) { "yes" } else { "no" };
    println!("State:            {}", status["state"].as_str().unwrap_or("?"));
    println!("Recognition:      {}", yes_no(&status["recognitionRunning"]));
    println!("Camera connected: {}", yes_no(&status["cameraConnected"]));
    println!("Feedback board:   {}", yes_no(&status["feedbackConnected"]));
    println!("Date:             {}", status["date"].as_str().unwrap_or("?"));
    match status["presentToday"].as_u64() {
        Some(n) => println!("Present today:    {n} of {}", status["totalStudents"]),
        None => println!("Present today:    unavailable ({} enrolled)", status["totalStudents"]),
    }
    if let Some(at) = status["lastFrameAt"].as_str() {
        println!("Last frame:       {at}");
    }
    if let Some(err) = status["lastError"].as_str() {
        println!("Last error:       {err}");
    }
}

fn print_loop_state(state: &Value, raw: bool) -> Result<()> {
    if raw {
        return print_json(state);
    }
    println!("Recognition loop: {}", state["phase"].as_str().unwrap_or("?"));
    if let Some(err) = state["lastError"].as_str() {
        println!("Last error:       {err}");
    }
    Ok(())
}

fn run_camera_test(device: &str) -> Result<()> {
    println!("Running camera diagnostics...");
    let devices = rollcall_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("  {}  {} ({}, {})", d.path, d.card, d.driver, d.bus);
    }

    let camera = rollcall_hw::Camera::open(device, Duration::from_secs(2))
        .with_context(|| format!("failed to open {device}"))?;
    println!(
        "Opened {device}: {}x{} {:?}",
        camera.width, camera.height, camera.fourcc
    );
    let frame = camera.capture().context("frame capture failed")?;
    println!(
        "Captured frame #{}: {}x{}, brightness {:.1}{}",
        frame.sequence,
        frame.width,
        frame.height,
        frame.mean_luma(),
        if frame.is_dark { " (dark)" } else { "" },
    );
    Ok(())
}
