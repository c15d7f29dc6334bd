use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::sync::Arc;

use studyflow_core::{
    AdaptationOutcome, AdaptationTrigger, Clock, CompletionReport, Difficulty, InMemoryStore,
    FixedClock, JobKind, JobRun, Orchestrator, SessionAction, SubjectContext, SubjectForUser,
    SystemClock, TransitionOutcome, User, score,
    time::{local_today, parse_local_datetime_to_utc},
};

mod config;
mod daemon;
mod locks;
mod logging;
mod notifier;
mod state;

use locks::FileJobLock;
use notifier::OutboxDispatcher;
use state::StateFile;

pub(crate) type Engine = Orchestrator<InMemoryStore, OutboxDispatcher, FileJobLock, Arc<dyn Clock>>;

#[derive(Parser, Debug)]
#[command(name = "studyflow", version, about = "Study priority and adaptive scheduling engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default ~/.studyflow/config.toml
    Init,

    /// Run one batch job now
    RunJob {
        /// recalculate-priorities, check-missed-sessions, adapt-schedules or send-reminders
        job: JobKind,

        /// Evaluate as of this local time, "YYYY-MM-DD HH:MM" (default: now)
        #[arg(long)]
        at: Option<String>,
    },

    /// Run every job on its cadence until Ctrl-C
    Daemon,

    /// Score a single subject from raw inputs (nothing is stored)
    Score {
        /// Days until the exam; negative if it has passed
        #[arg(long, allow_hyphen_values = true)]
        days_until_exam: Option<i64>,

        #[arg(long, default_value_t = 1)]
        coefficient: u32,

        /// Largest coefficient among the user's subjects (default: --coefficient)
        #[arg(long)]
        max_coefficient: Option<u32>,

        #[arg(long, value_enum, default_value_t = DifficultyArg::Medium)]
        difficulty: DifficultyArg,

        /// Days since last studied; omit if never
        #[arg(long)]
        days_since_studied: Option<i64>,

        /// Recent performance in [0, 1]
        #[arg(long)]
        recent_score: Option<f64>,
    },

    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommand,
    },

    /// Manage a user's subjects
    Subject {
        #[command(subcommand)]
        command: SubjectCommand,
    },

    /// Generate and activate a week of sessions for a user
    Generate {
        #[arg(long)]
        user: u64,

        /// First day of the week, YYYY-MM-DD (default: today)
        #[arg(long)]
        start: Option<NaiveDate>,
    },

    /// Start, pause, resume, complete or skip a session
    Session {
        #[arg(value_enum)]
        action: ActionArg,

        #[arg(long)]
        id: u64,

        /// Completion percentage when completing (default: 100)
        #[arg(long)]
        completion: Option<u8>,

        /// Self-reported focus 0-10 when completing
        #[arg(long)]
        focus: Option<u8>,
    },

    /// Run the adaptation engine for one user now
    Adapt {
        #[arg(long)]
        user: u64,

        /// Days of history to analyse
        #[arg(long, default_value_t = 7)]
        days: i64,
    },

    /// Show behaviour patterns for a user
    Patterns {
        #[arg(long)]
        user: u64,
    },

    /// Summarise stored state and the next run of every job
    Status,
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Add an active user
    Add {
        #[arg(long)]
        name: String,
    },
    /// List users
    List,
}

#[derive(Subcommand, Debug)]
enum SubjectCommand {
    /// Add a subject for a user
    Add {
        #[arg(long)]
        user: u64,

        #[arg(long)]
        name: String,

        #[arg(long, default_value_t = 1)]
        coefficient: u32,

        #[arg(long, value_enum, default_value_t = DifficultyArg::Medium)]
        difficulty: DifficultyArg,

        /// Exam date, YYYY-MM-DD
        #[arg(long)]
        exam: Option<NaiveDate>,

        /// Weekly study budget in minutes
        #[arg(long, default_value_t = 120)]
        weekly_minutes: u32,
    },
    /// List a user's subjects with their last computed priority
    List {
        #[arg(long)]
        user: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DifficultyArg {
    Easy,
    Medium,
    Hard,
}

impl From<DifficultyArg> for Difficulty {
    fn from(d: DifficultyArg) -> Self {
        match d {
            DifficultyArg::Easy => Difficulty::Easy,
            DifficultyArg::Medium => Difficulty::Medium,
            DifficultyArg::Hard => Difficulty::Hard,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ActionArg {
    Start,
    Pause,
    Resume,
    Complete,
    Skip,
}

impl From<ActionArg> for SessionAction {
    fn from(a: ActionArg) -> Self {
        match a {
            ActionArg::Start => SessionAction::Start,
            ActionArg::Pause => SessionAction::Pause,
            ActionArg::Resume => SessionAction::Resume,
            ActionArg::Complete => SessionAction::Complete,
            ActionArg::Skip => SessionAction::Skip,
        }
    }
}

fn engine(cfg: &config::Config, state: &StateFile) -> Result<Engine> {
    engine_with_clock(cfg, state, Arc::new(SystemClock))
}

/// An engine over the current state file. Mutations must still run inside
/// [`StateFile::transaction`], which reloads the store under the state lock.
fn engine_with_clock(cfg: &config::Config, state: &StateFile, clock: Arc<dyn Clock>) -> Result<Engine> {
    let store = InMemoryStore::from_snapshot(state.read()?);
    let notifier = OutboxDispatcher::new(state::outbox_path()?);
    let locks = FileJobLock::new(state::locks_dir()?);
    Orchestrator::new(store, notifier, locks, clock, cfg.planner.clone())
        .context("build orchestrator")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config()?;
    logging::init(&cfg.logging)?;
    let state = StateFile::open()?;

    match cli.command {
        Command::Init => config::init_config()?,

        Command::RunJob { job, at } => {
            let engine = match at {
                Some(local) => {
                    let tz = cfg.planner.tz()?;
                    let instant = parse_local_datetime_to_utc(&local, tz)?;
                    engine_with_clock(&cfg, &state, Arc::new(FixedClock::new(instant)))?
                }
                None => engine(&cfg, &state)?,
            };
            let result = tokio::task::spawn_blocking(move || {
                state.transaction(engine.store(), || Ok(engine.run(job)))
            })
            .await
            .context("join job task")??;
            match result.with_context(|| format!("run {job}"))? {
                JobRun::Completed(report) => {
                    println!(
                        "{job}: users={} succeeded={} failed={} skipped={} affected={}",
                        report.total_users,
                        report.succeeded,
                        report.failed,
                        report.skipped,
                        report.affected
                    );
                    if report.dispatch_failures > 0 {
                        println!("  dispatch failures: {}", report.dispatch_failures);
                    }
                    if report.timed_out {
                        println!("  timed out; {} users not visited", report.not_started());
                    }
                }
                JobRun::AlreadyRunning => println!("{job} is already running"),
            }
        }

        Command::Daemon => {
            let engine = Arc::new(engine(&cfg, &state)?);
            daemon::run(engine, state, cfg.daemon.tick_seconds).await?;
        }

        Command::Score {
            days_until_exam,
            coefficient,
            max_coefficient,
            difficulty,
            days_since_studied,
            recent_score,
        } => {
            if let Some(r) = recent_score {
                if !(0.0..=1.0).contains(&r) {
                    bail!("--recent-score must be within [0, 1] (got {r})");
                }
            }
            let ctx = SubjectContext {
                days_until_exam,
                coefficient,
                max_coefficient: max_coefficient.unwrap_or(coefficient),
                difficulty: difficulty.into(),
                days_since_studied,
                recent_score,
            };
            let b = score(&ctx, &cfg.planner.priority);
            println!("priority    {:.4}", b.total);
            println!("  proximity   {:.4}", b.proximity);
            println!("  coefficient {:.4}", b.coefficient);
            println!("  difficulty  {:.4}", b.difficulty);
            println!("  recency     {:.4}", b.recency);
            println!("  performance {:.4}", b.performance);
        }

        Command::User { command } => {
            match command {
                UserCommand::Add { name } => {
                    let store = InMemoryStore::new();
                    let id = state.transaction(&store, || {
                        let id = store.snapshot()?.users.keys().max().map_or(1, |max| max + 1);
                        store.add_user(User::new(id, name.clone()))?;
                        Ok(id)
                    })?;
                    println!("Added user {id} ({name})");
                }
                UserCommand::List => {
                    for user in state.read()?.users.values() {
                        let flag = if user.is_active { "" } else { " (inactive)" };
                        println!("{:>4}  {}{flag}", user.id, user.name);
                    }
                }
            }
        }

        Command::Subject { command } => {
            match command {
                SubjectCommand::Add {
                    user,
                    name,
                    coefficient,
                    difficulty,
                    exam,
                    weekly_minutes,
                } => {
                    let store = InMemoryStore::new();
                    let id = state.transaction(&store, || {
                        let snapshot = store.snapshot()?;
                        if !snapshot.users.contains_key(&user) {
                            bail!("no user {user} (add one with `studyflow user add`)");
                        }
                        let id = snapshot
                            .subjects
                            .iter()
                            .map(|s| s.subject_id)
                            .max()
                            .map_or(1, |max| max + 1);
                        let mut subject = SubjectForUser::new(id, user, name.clone())
                            .with_coefficient(coefficient)
                            .with_difficulty(difficulty.into())
                            .with_weekly_minutes(weekly_minutes);
                        if let Some(exam) = exam {
                            subject = subject.with_exam(exam);
                        }
                        store.upsert_subject(subject)?;
                        Ok(id)
                    })?;
                    println!("Added subject {id} ({name}) for user {user}");
                }
                SubjectCommand::List { user } => {
                    let snapshot = state.read()?;
                    let mut subjects: Vec<&SubjectForUser> =
                        snapshot.subjects.iter().filter(|s| s.user_id == user).collect();
                    subjects.sort_by(|a, b| b.computed_priority.total_cmp(&a.computed_priority));
                    for s in subjects {
                        let exam = s
                            .exam_date
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:>4}  {:<24} prio={:.3} coef={} exam={} weekly={}min",
                            s.subject_id, s.name, s.computed_priority, s.coefficient, exam, s.weekly_minutes
                        );
                    }
                }
            }
        }

        Command::Generate { user, start } => {
            let engine = engine(&cfg, &state)?;
            let tz = cfg.planner.tz()?;
            let start = start.unwrap_or_else(|| local_today(engine.clock().now(), tz));
            let (schedule_id, week) =
                state.transaction(engine.store(), || Ok(engine.generate_week(user, start)?))?;

            println!(
                "Schedule {schedule_id}: {} sessions, {} min planned ({} to {})",
                week.sessions.len(),
                week.planned_minutes(),
                week.schedule.start_date,
                week.schedule.end_date
            );
            let names: BTreeMap<u64, String> = engine
                .store()
                .snapshot()?
                .subjects
                .into_iter()
                .filter(|s| s.user_id == user)
                .map(|s| (s.subject_id, s.name))
                .collect();
            for s in &week.sessions {
                let name = names.get(&s.subject_id).map(String::as_str).unwrap_or("?");
                println!(
                    "  {} {}  {:<10} {} ({} min)",
                    s.scheduled_date,
                    s.scheduled_start_time.format("%H:%M"),
                    s.session_type.label(),
                    name,
                    s.planned_duration_minutes
                );
            }
            if week.total_unplaced() > 0 {
                println!("  {} min did not fit in the study window", week.total_unplaced());
            }
        }

        Command::Session {
            action,
            id,
            completion,
            focus,
        } => {
            let engine = engine(&cfg, &state)?;
            let action = SessionAction::from(action);
            let report = match action {
                SessionAction::Complete => Some(CompletionReport {
                    completion_percentage: completion.unwrap_or(100).min(100),
                    focus_score: focus.map(|f| f.min(10)),
                }),
                _ => None,
            };
            let outcome = state.transaction(engine.store(), || {
                Ok(engine.transition_session(id, action, report)?)
            })?;
            match outcome {
                TransitionOutcome::Applied { from, to } => println!("Session {id}: {from} -> {to}"),
                TransitionOutcome::AlreadyTerminal(status) => {
                    println!("Session {id} is already {status}; nothing to do")
                }
                TransitionOutcome::NotDue => println!("Session {id}: nothing to do yet"),
            }
        }

        Command::Adapt { user, days } => {
            let engine = engine(&cfg, &state)?;
            let outcome = state.transaction(engine.store(), || {
                Ok(engine.adapt(user, AdaptationTrigger::Manual { analysis_days: days })?)
            })?;
            match outcome {
                AdaptationOutcome::Adapted(result) => {
                    println!("{} change(s)", result.changes_count);
                    for line in &result.improvements {
                        println!("  {line}");
                    }
                }
                AdaptationOutcome::Skipped(reason) => println!("Skipped: {reason}"),
            }
        }

        Command::Patterns { user } => {
            let engine = engine(&cfg, &state)?;
            match engine.patterns(user)? {
                None => println!("No sessions in the last {} days", cfg.planner.adaptation.pattern_window_days),
                Some(p) => {
                    println!("sessions            {}", p.total_sessions);
                    println!("consistency         {:.2}%", p.consistency_score);
                    match p.most_productive_period {
                        Some(period) => println!("most productive      {period:?}"),
                        None => println!("most productive      -"),
                    }
                    println!("preferred duration  {} min", p.preferred_duration_minutes);
                    for (subject_id, rate) in &p.subject_completion_rates {
                        println!("  subject {subject_id:>4}  {rate:.2}%");
                    }
                }
            }
        }

        Command::Status => {
            let snapshot = state.read()?;
            let tz = cfg.planner.tz()?;
            let now = SystemClock.now();

            let active = snapshot.users.values().filter(|u| u.is_active).count();
            println!("home       {}", state::studyflow_home()?.display());
            println!("timezone   {}", cfg.planner.timezone);
            println!("users      {} ({active} active)", snapshot.users.len());
            println!("subjects   {}", snapshot.subjects.len());
            println!(
                "schedules  {} ({} active)",
                snapshot.schedules.len(),
                snapshot.schedules.iter().filter(|s| s.is_active).count()
            );

            let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
            for s in snapshot.sessions.values() {
                *by_status.entry(s.status.to_string()).or_default() += 1;
            }
            println!("sessions   {}", snapshot.sessions.len());
            for (status, n) in &by_status {
                println!("  {status:<12} {n}");
            }

            println!("next runs");
            for job in JobKind::ALL {
                match job.spec().cadence.next_after(now, tz) {
                    Some(at) => println!("  {:<24} {}", job.name(), at.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z")),
                    None => println!("  {:<24} -", job.name()),
                }
            }
        }
    }

    Ok(())
}
