use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use roster_core::encoder::{ARCFACE_MODEL_FILE, SCRFD_MODEL_FILE};
use roster_core::{
    mark_many, AttendanceError, AttendanceRule, Clock, EuclideanMatcher, FaceEncoder, MatchPolicy,
    OnnxEncoder, SystemClock, UserId, DEFAULT_TOLERANCE,
};
use roster_store::{EmbeddingCipher, NewUser, Store};

#[derive(Parser)]
#[command(name = "roster", about = "Roster face attendance CLI", version)]
struct Cli {
    /// Registry database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Directory holding det_10g.onnx and w600k_r50.onnx
    #[arg(long, global = true)]
    models: Option<PathBuf>,

    /// Passphrase for encrypted embeddings (default: $ROSTER_EMBEDDING_KEY)
    #[arg(long, global = true)]
    key: Option<String>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new user from a face photo
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        gender: String,
        /// Date of birth, YYYY-MM-DD
        #[arg(long)]
        dob: NaiveDate,
        /// Photo containing exactly the user's face
        image: PathBuf,
    },
    /// Mark attendance from a photo, or for explicit user ids
    Mark {
        /// Photo to match against the registry
        #[arg(required_unless_present = "user", conflicts_with = "user")]
        image: Option<PathBuf>,
        /// Mark these user ids without a photo
        #[arg(long, num_args = 1..)]
        user: Vec<UserId>,
        /// Maximum Euclidean distance for a match
        #[arg(long, default_value_t = DEFAULT_TOLERANCE)]
        tolerance: f32,
        /// first | best
        #[arg(long, default_value_t = MatchPolicy::First)]
        policy: MatchPolicy,
    },
    /// List registered users
    List,
    /// Show users who have attended, optionally on one date
    Records {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Delete a user
    Remove { id: UserId },
    /// Encode a photo and print the embedding summary
    Encode { image: PathBuf },
    /// Show paths, model presence and registry size
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| roster_core::default_data_dir().join("roster.db"));
    let model_dir = cli.models.clone().unwrap_or_else(roster_core::default_model_dir);
    let key = embedding_key(cli.key.clone(), std::env::var("ROSTER_EMBEDDING_KEY").ok());

    match cli.command {
        Commands::Register { name, email, gender, dob, image } => {
            let store = open_store(&db_path, key.as_deref())?;
            if store.email_exists(&email)? {
                bail!("{email} is already registered");
            }
            let embedding = load_encoder(&model_dir)?
                .encode(&read_image(&image)?)
                .with_context(|| format!("could not encode {}", image.display()))?;
            let user = NewUser { name, email, gender, dob, embedding };
            let id = store.create_user(&user, SystemClock.now())?;
            if cli.json {
                println!("{}", serde_json::json!({ "id": id }));
            } else {
                println!("Registered {} as user {id}", user.name);
            }
        }
        Commands::Mark { image: Some(image), tolerance, policy, .. } => {
            let store = open_store(&db_path, key.as_deref())?;
            let query = load_encoder(&model_dir)?
                .encode(&read_image(&image)?)
                .with_context(|| format!("could not encode {}", image.display()))?;
            let rule = AttendanceRule::new(EuclideanMatcher::new(policy), tolerance);
            match rule.check_in(&store, &query, SystemClock.now()) {
                Ok(a) if cli.json => println!("{}", serde_json::to_string(&a)?),
                Ok(a) => println!("Attendance marked for {} at {}", a.name, a.at.format("%Y-%m-%d %H:%M:%S")),
                Err(AttendanceError::AlreadyMarkedToday { name, at, .. }) => {
                    bail!("attendance already marked today for {name} at {}", at.format("%H:%M:%S"))
                }
                Err(AttendanceError::NoMatch { closest }) => match closest {
                    Some(d) => bail!("no matching face (closest distance {d:.3}, tolerance {tolerance})"),
                    None => bail!("no matching face (registry empty)"),
                },
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Mark { user, .. } => {
            let store = open_store(&db_path, key.as_deref())?;
            let report = mark_many(&store, &user, SystemClock.now())?;
            if cli.json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!("marked:         {:?}", report.marked);
                println!("already marked: {:?}", report.already_marked);
                println!("not found:      {:?}", report.not_found);
            }
        }
        Commands::List => {
            let store = open_store(&db_path, key.as_deref())?;
            let users = store.list_users()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&users)?);
            } else if users.is_empty() {
                println!("No users registered");
            } else {
                for u in users {
                    let last = u
                        .last_attendance
                        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".into());
                    println!("{:>4}  {:<24} {:<32} last: {last}", u.id, u.name, u.email);
                }
            }
        }
        Commands::Records { date } => {
            let store = open_store(&db_path, key.as_deref())?;
            let records = store.attendance_records(date)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for r in &records {
                    println!("{:>4}  {:<24} {}", r.id, r.name, r.last_attendance.format("%Y-%m-%d %H:%M:%S"));
                }
                println!("{} record(s)", records.len());
            }
        }
        Commands::Remove { id } => {
            let store = open_store(&db_path, key.as_deref())?;
            store.delete_user(id)?;
            println!("Removed user {id}");
        }
        Commands::Encode { image } => {
            let embedding = load_encoder(&model_dir)?
                .encode(&read_image(&image)?)
                .with_context(|| format!("could not encode {}", image.display()))?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "dimension": embedding.dim(),
                        "norm": embedding.norm(),
                        "model_version": embedding.model_version,
                    })
                );
            } else {
                println!("dimension: {}", embedding.dim());
                println!("norm:      {:.4}", embedding.norm());
                println!("model:     {}", embedding.model_version.as_deref().unwrap_or("unknown"));
            }
        }
        Commands::Status => {
            let scrfd = model_dir.join(SCRFD_MODEL_FILE);
            let arcface = model_dir.join(ARCFACE_MODEL_FILE);
            println!("database: {}", db_path.display());
            println!("models:   {}", model_dir.display());
            println!("  {SCRFD_MODEL_FILE}: {}", presence(&scrfd));
            println!("  {ARCFACE_MODEL_FILE}: {}", presence(&arcface));
            if db_path.exists() {
                let store = open_store(&db_path, key.as_deref())?;
                println!("users:    {}", store.count_users()?);
                println!("encrypted: {}", store.is_encrypted());
            } else {
                println!("users:    (no database yet)");
            }
        }
    }

    Ok(())
}

/// `--key` wins over the environment; an empty value from either means no key.
fn embedding_key(flag: Option<String>, env: Option<String>) -> Option<String> {
    flag.filter(|k| !k.is_empty())
        .or_else(|| env.filter(|k| !k.is_empty()))
}

fn open_store(path: &Path, key: Option<&str>) -> Result<Store> {
    let cipher = key.map(EmbeddingCipher::from_passphrase).transpose()?;
    let store = Store::open(path, cipher)
        .with_context(|| format!("failed to open registry at {}", path.display()))?;
    tracing::debug!(path = %path.display(), encrypted = store.is_encrypted(), "registry opened");
    Ok(store)
}

fn load_encoder(model_dir: &Path) -> Result<OnnxEncoder> {
    let started = std::time::Instant::now();
    let encoder = OnnxEncoder::from_model_dir(model_dir)
        .with_context(|| format!("failed to load models from {}", model_dir.display()))?;
    tracing::debug!(dir = %model_dir.display(), elapsed = ?started.elapsed(), "models loaded");
    Ok(encoder)
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn presence(path: &Path) -> &'static str {
    if path.exists() {
        "present"
    } else {
        "missing"
    }
}
