mod availability;
mod clock;
mod config;
mod db;
mod engine;
mod error;
mod gate;
mod identity;
mod ledger;
mod lifecycle;
mod models;
mod planner;
mod rerating;

use std::collections::HashMap;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use clap::{Parser, Subcommand};

use clock::SystemClock;
use config::Config;
use db::Database;
use engine::Scheduler;
use error::SchedulerError;
use identity::{EnvIdentity, IdentityResolver, StaticIdentity};
use models::{
    monday_of, AvailabilityProfile, Block, JsonOutput, RecurringEvent, UnavailableInterval,
    UserId,
};

const USER_ENV: &str = "CADENCE_USER";

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Plans revision sessions around your availability and confidence")]
#[command(version)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Acting user (defaults to $CADENCE_USER)
    #[arg(long, short, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage subjects
    #[command(subcommand)]
    Subject(SubjectCommands),

    /// Manage syllabus topics
    #[command(subcommand)]
    Topic(TopicCommands),

    /// Rate your confidence in a topic (-2 to 5)
    Rate {
        /// Topic ID
        topic_id: i64,

        /// Confidence rating; 0 or below means "do not schedule"
        #[arg(allow_negative_numbers = true)]
        rating: Option<i32>,

        /// Remove the rating instead
        #[arg(long, conflicts_with = "rating")]
        clear: bool,
    },

    /// Manage study hours and blocked time
    #[command(subcommand)]
    Availability(AvailabilityCommands),

    /// Generate sessions for a week
    Plan {
        /// Week to plan: a Monday (YYYY-MM-DD), "this" or "next"
        #[arg(long, short)]
        week: Option<String>,

        /// Only plan topics of these subject IDs
        #[arg(long, short)]
        subject: Vec<i64>,
    },

    /// Show the sessions of a week
    Week {
        /// A Monday (YYYY-MM-DD), "this" or "next"
        #[arg(long, short)]
        week: Option<String>,
    },

    /// Mark a session as done
    Done {
        /// Block ID
        id: i64,
    },

    /// Skip a session
    Skip {
        /// Block ID
        id: i64,
    },

    /// Put a session back to scheduled
    Revert {
        /// Block ID
        id: i64,
    },

    /// Re-rate a topic after the final session of its cycle (1 to 5)
    Rerate {
        /// Block ID of the final session
        id: i64,

        /// New confidence rating
        rating: i32,
    },

    /// Mark elapsed sessions as missed
    Sweep {
        /// Sweep every user, not just the current one
        #[arg(long)]
        all: bool,
    },

    /// Show recent scheduling events
    Events {
        /// Number of events to show
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },

    /// Show study statistics
    Stats,
}

#[derive(Subcommand)]
enum SubjectCommands {
    /// Add a subject
    Add {
        /// Subject name
        name: String,

        /// Exam date (YYYY-MM-DD)
        #[arg(long, short)]
        exam: Option<String>,
    },

    /// List subjects
    List,
}

#[derive(Subcommand)]
enum TopicCommands {
    /// Add a topic to a subject
    Add {
        /// Subject ID
        subject_id: i64,

        /// Topic name
        name: String,

        /// Syllabus level (1-3); only level 3 topics are scheduled
        #[arg(long, short, default_value_t = 3)]
        level: i32,

        /// Parent topic ID
        #[arg(long, short)]
        parent: Option<i64>,

        /// Position within the syllabus
        #[arg(long, short, default_value_t = 0)]
        order: i32,
    },

    /// List topics with your ratings
    List {
        /// Filter by subject ID
        #[arg(long, short)]
        subject: Option<i64>,
    },
}

#[derive(Subcommand)]
enum AvailabilityCommands {
    /// Set study hours, replacing manually blocked intervals
    Set {
        /// Weekday window, e.g. 09:00-17:00
        #[arg(long)]
        weekday: String,

        /// Weekend window; omit to use the weekday window
        #[arg(long)]
        weekend: Option<String>,

        /// Blocked interval "YYYY-MM-DD HH:MM/YYYY-MM-DD HH:MM" (repeatable)
        #[arg(long)]
        block: Vec<String>,
    },

    /// Show study hours and open slots for a week
    Show {
        #[arg(long, short)]
        week: Option<String>,
    },

    /// Block out a one-off interval
    Block {
        /// Start (YYYY-MM-DD HH:MM)
        start: String,

        /// End (YYYY-MM-DD HH:MM)
        end: String,

        #[arg(long, short)]
        reason: Option<String>,
    },

    /// Manage recurring commitments
    #[command(subcommand)]
    Recurring(RecurringCommands),

    /// Confirm a week has nothing to block
    Confirm {
        #[arg(long, short)]
        week: Option<String>,
    },

    /// Show whether a week has been reviewed
    Status {
        #[arg(long, short)]
        week: Option<String>,
    },
}

#[derive(Subcommand)]
enum RecurringCommands {
    /// Add a weekly commitment
    Add {
        /// Label, e.g. "Football practice"
        label: String,

        /// Days, e.g. Mon,Wed
        #[arg(long, short)]
        days: String,

        /// Time window, e.g. 18:00-20:00 (may cross midnight)
        #[arg(long, short)]
        time: String,

        /// First date it applies (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,

        /// Last date it applies (YYYY-MM-DD)
        #[arg(long)]
        until: Option<String>,
    },

    /// List recurring commitments
    List,

    /// Remove a recurring commitment
    Remove {
        /// Recurring event ID
        id: i64,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let json = cli.json;

    if let Err(e) = run(cli) {
        if let Some(err) = e.downcast_ref::<SchedulerError>() {
            if !err.is_user_facing() {
                log::error!("{:?}", err);
            }
        }
        if json {
            if let Ok(out) = serde_json::to_string(&JsonOutput::<()>::err(e.to_string())) {
                println!("{}", out);
            }
        } else {
            eprintln!("Error: {}", e);
        }
        std::process::exit(1);
    }
}

fn print_json<T: serde::Serialize>(data: T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string(&JsonOutput::ok(data))?);
    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();
    let db_path = config.db_path.clone();
    let db = Database::open(&db_path)?;
    db.init()?;

    let scheduler = Scheduler::new(db, Box::new(SystemClock), config);
    let today = scheduler.now().date();

    let identity: Box<dyn IdentityResolver> = match &cli.user {
        Some(user) => Box::new(StaticIdentity(user.clone())),
        None => Box::new(EnvIdentity { var: USER_ENV }),
    };
    let user = || -> Result<UserId, Box<dyn std::error::Error>> { Ok(identity.resolve()?) };

    match cli.command {
        Commands::Init => {
            if cli.json {
                print_json(())?;
            } else {
                println!("Database initialized at: {}", db_path.display());
            }
        }

        Commands::Subject(cmd) => match cmd {
            SubjectCommands::Add { name, exam } => {
                let exam_date = exam.as_deref().map(parse_date).transpose()?;
                let id = scheduler.add_subject(&name, exam_date)?;
                if cli.json {
                    print_json(serde_json::json!({ "id": id, "name": name }))?;
                } else {
                    println!("Added subject '{}' with ID: {}", name, id);
                }
            }

            SubjectCommands::List => {
                let subjects = scheduler.list_subjects()?;
                if cli.json {
                    print_json(&subjects)?;
                } else if subjects.is_empty() {
                    println!("No subjects found.");
                } else {
                    println!("{:<5} {:<40} EXAM", "ID", "NAME");
                    println!("{}", "-".repeat(60));
                    for subject in subjects {
                        let exam = subject
                            .exam_date
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        println!("{:<5} {:<40} {}", subject.id, truncate(&subject.name, 38), exam);
                    }
                }
            }
        },

        Commands::Topic(cmd) => match cmd {
            TopicCommands::Add {
                subject_id,
                name,
                level,
                parent,
                order,
            } => {
                let id = scheduler.add_topic(subject_id, &name, level, parent, order)?;
                if cli.json {
                    print_json(serde_json::json!({ "id": id, "name": name }))?;
                } else {
                    println!("Added topic '{}' with ID: {}", name, id);
                }
            }

            TopicCommands::List { subject } => {
                let topics = scheduler.list_topics(subject)?;
                // Ratings are shown when a user is known
                let ratings: HashMap<i64, i32> = match identity.resolve() {
                    Ok(user) => scheduler
                        .list_ratings(&user)?
                        .into_iter()
                        .map(|r| (r.topic_id, r.rating))
                        .collect(),
                    Err(_) => HashMap::new(),
                };

                if cli.json {
                    print_json(serde_json::json!({ "topics": topics, "ratings": ratings }))?;
                } else if topics.is_empty() {
                    println!("No topics found.");
                } else {
                    println!("{:<5} {:<8} {:<6} {:<40} RATING", "ID", "SUBJECT", "LEVEL", "NAME");
                    println!("{}", "-".repeat(70));
                    for topic in topics {
                        let indent = "  ".repeat((topic.level - 1).max(0) as usize);
                        let rating = ratings
                            .get(&topic.id)
                            .map(|r| r.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:<5} {:<8} {:<6} {:<40} {}",
                            topic.id,
                            topic.subject_id,
                            topic.level,
                            truncate(&format!("{}{}", indent, topic.name), 38),
                            rating
                        );
                    }
                }
            }
        },

        Commands::Rate {
            topic_id,
            rating,
            clear,
        } => {
            let user = user()?;
            if rating.is_none() && !clear {
                return Err("Give a rating between -2 and 5, or --clear".into());
            }
            let saved = scheduler.save_rating(&user, topic_id, rating)?;
            if cli.json {
                print_json(&saved)?;
            } else {
                match saved {
                    Some(r) => println!("Topic {} rated {}.", topic_id, r.rating),
                    None => println!("Rating cleared for topic {}.", topic_id),
                }
            }
        }

        Commands::Availability(cmd) => {
            let user = user()?;
            run_availability(&scheduler, &user, cmd, today, cli.json)?;
        }

        Commands::Plan { week, subject } => {
            let user = user()?;
            let week_start = parse_week(week.as_deref(), today)?;
            let outcome = scheduler.generate_plan(&user, week_start, &subject, None)?;

            if cli.json {
                print_json(&outcome)?;
            } else {
                let names = topic_names(&scheduler)?;
                if outcome.blocks.is_empty() {
                    println!("No new sessions for the week of {}.", week_start);
                } else {
                    println!("Planned {} new session(s):", outcome.blocks.len());
                    print_blocks(&outcome.blocks, &names);
                }
                for unmet in &outcome.unmet {
                    println!(
                        "  {} session(s) of '{}' not planned: {}",
                        unmet.sessions,
                        topic_label(&names, unmet.topic_id),
                        unmet.reason.label()
                    );
                }
            }
        }

        Commands::Week { week } => {
            let user = user()?;
            let week_start = parse_week(week.as_deref(), today)?;
            let blocks = scheduler.week_view(&user, week_start)?;
            if cli.json {
                print_json(&blocks)?;
            } else if blocks.is_empty() {
                println!("Nothing planned for the week of {}.", week_start);
            } else {
                println!("Week of {}", week_start);
                print_blocks(&blocks, &topic_names(&scheduler)?);
            }
        }

        Commands::Done { id } => {
            let user = user()?;
            let block = scheduler.mark_done(&user, id)?;
            if cli.json {
                print_json(&block)?;
            } else {
                if scheduler.first_attempt_completion(&user, id)? {
                    println!("Session {} marked done.", id);
                } else {
                    println!("Session {} marked done (after being missed).", id);
                }
                if block.is_final_session() {
                    println!("That was the last session of the cycle; re-rate it with `cadence rerate {} <1-5>`.", id);
                }
            }
        }

        Commands::Skip { id } => {
            let user = user()?;
            let block = scheduler.mark_skipped(&user, id)?;
            if cli.json {
                print_json(&block)?;
            } else {
                println!("Session {} skipped.", id);
            }
        }

        Commands::Revert { id } => {
            let user = user()?;
            let block = scheduler.mark_scheduled(&user, id)?;
            if cli.json {
                print_json(&block)?;
            } else {
                println!("Session {} is scheduled again.", id);
            }
        }

        Commands::Rerate { id, rating } => {
            let user = user()?;
            let action = scheduler.submit_rerating(&user, id, rating)?;
            if cli.json {
                print_json(&action)?;
            } else {
                println!("Re-rated {}: {}.", rating, action.describe());
            }
        }

        Commands::Sweep { all } => {
            let missed = if all {
                scheduler.sweep_missed(None)?
            } else {
                scheduler.sweep_missed(Some(&user()?))?
            };
            if cli.json {
                print_json(&missed)?;
            } else if missed.is_empty() {
                println!("No missed sessions.");
            } else {
                println!("Marked {} session(s) as missed:", missed.len());
                print_blocks(&missed, &topic_names(&scheduler)?);
            }
        }

        Commands::Events { limit } => {
            let user = user()?;
            let events = scheduler.events(&user, limit)?;
            if cli.json {
                print_json(&events)?;
            } else if events.is_empty() {
                println!("No events recorded.");
            } else {
                for record in events {
                    println!(
                        "{}  {:<18} {}",
                        record.occurred_at.format("%Y-%m-%d %H:%M"),
                        record.event.kind(),
                        serde_json::to_string(&record.event)?
                    );
                }
            }
        }

        Commands::Stats => {
            let user = user()?;
            let stats = scheduler.stats(&user)?;
            if cli.json {
                print_json(&stats)?;
            } else {
                println!("=== Revision Statistics ===");
                println!();
                println!("Rated topics:      {}", stats.rated_topics);
                println!("Average rating:    {:.1}", stats.avg_rating);
                println!();
                println!("Sessions scheduled: {}", stats.scheduled);
                println!("Sessions done:      {}", stats.done);
                println!("Sessions skipped:   {}", stats.skipped);
                println!("Sessions missed:    {} ({} missed events)", stats.missed, stats.missed_events);
                println!("Done first time:    {} of {}", stats.first_attempt_done, stats.done);
            }
        }
    }

    Ok(())
}

fn run_availability(
    scheduler: &Scheduler,
    user: &str,
    cmd: AvailabilityCommands,
    today: NaiveDate,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        AvailabilityCommands::Set {
            weekday,
            weekend,
            block,
        } => {
            let (weekday_earliest, weekday_latest) = parse_window(&weekday)?;
            let (weekend_earliest, weekend_latest) = match weekend.as_deref() {
                Some(window) => parse_window(window)?,
                None => (weekday_earliest, weekday_latest),
            };
            let profile = AvailabilityProfile {
                user_id: user.to_string(),
                weekday_earliest,
                weekday_latest,
                weekend_earliest,
                weekend_latest,
                use_same_weekend: weekend.is_none(),
            };
            let intervals = block
                .iter()
                .map(|raw| {
                    let (start, end) = parse_interval(raw)?;
                    Ok(UnavailableInterval::manual(user, start, end))
                })
                .collect::<Result<Vec<_>, String>>()?;

            scheduler.save_availability(user, &profile, &intervals)?;
            if json {
                print_json(&profile)?;
            } else {
                println!(
                    "Study hours saved ({} blocked interval(s)).",
                    intervals.len()
                );
            }
        }

        AvailabilityCommands::Show { week } => {
            let week_start = parse_week(week.as_deref(), today)?;
            let profile = scheduler
                .get_profile(user)?
                .ok_or("No study hours saved yet; run `cadence availability set`")?;
            let availability = scheduler.week_availability(user, week_start)?;

            if json {
                print_json(serde_json::json!({
                    "profile": profile,
                    "availability": availability,
                }))?;
            } else {
                println!(
                    "Weekdays: {}-{}",
                    profile.weekday_earliest.format("%H:%M"),
                    profile.weekday_latest.format("%H:%M")
                );
                if profile.use_same_weekend {
                    println!("Weekends: same as weekdays");
                } else {
                    println!(
                        "Weekends: {}-{}",
                        profile.weekend_earliest.format("%H:%M"),
                        profile.weekend_latest.format("%H:%M")
                    );
                }
                println!();
                println!(
                    "Open slots for the week of {} ({} total):",
                    week_start,
                    availability.slot_count()
                );
                for day in &availability.days {
                    let starts: Vec<String> = day
                        .slots
                        .iter()
                        .map(|s| s.start.format("%H:%M").to_string())
                        .collect();
                    let listed = if starts.is_empty() {
                        "-".to_string()
                    } else {
                        truncate(&starts.join(" "), 60)
                    };
                    println!("  {} {}  {}", day.date.format("%a"), day.date, listed);
                }
                if availability.has_same_day_capacity(scheduler.now()) {
                    println!();
                    println!("There is still time to study today.");
                }
            }
        }

        AvailabilityCommands::Block { start, end, reason } => {
            let start = parse_datetime(&start)?;
            let end = parse_datetime(&end)?;
            let id = scheduler.block_time(user, start, end, reason)?;
            if json {
                print_json(serde_json::json!({ "id": id }))?;
            } else {
                println!("Blocked {} to {} (ID: {}).", start, end, id);
            }
        }

        AvailabilityCommands::Recurring(cmd) => match cmd {
            RecurringCommands::Add {
                label,
                days,
                time,
                from,
                until,
            } => {
                let (start_time, end_time) = parse_window(&time)?;
                let event = RecurringEvent {
                    id: 0,
                    user_id: user.to_string(),
                    label: label.clone(),
                    start_time,
                    end_time,
                    days_of_week: parse_weekdays(&days)?,
                    start_date: from.as_deref().map(parse_date).transpose()?,
                    end_date: until.as_deref().map(parse_date).transpose()?,
                };
                let id = scheduler.add_recurring_event(user, &event)?;
                if json {
                    print_json(serde_json::json!({ "id": id, "label": label }))?;
                } else {
                    println!("Added recurring '{}' with ID: {}", label, id);
                }
            }

            RecurringCommands::List => {
                let events = scheduler.list_recurring_events(user)?;
                if json {
                    print_json(&events)?;
                } else if events.is_empty() {
                    println!("No recurring commitments.");
                } else {
                    println!("{:<5} {:<30} {:<12} DAYS", "ID", "LABEL", "TIME");
                    println!("{}", "-".repeat(70));
                    for event in events {
                        let days: Vec<String> =
                            event.days_of_week.iter().map(|d| d.to_string()).collect();
                        let window = format!(
                            "{}-{}",
                            event.start_time.format("%H:%M"),
                            event.end_time.format("%H:%M")
                        );
                        println!(
                            "{:<5} {:<30} {:<12} {}",
                            event.id,
                            truncate(&event.label, 28),
                            window,
                            days.join(",")
                        );
                    }
                }
            }

            RecurringCommands::Remove { id } => {
                scheduler.remove_recurring_event(user, id)?;
                if json {
                    print_json(())?;
                } else {
                    println!("Removed recurring commitment {}.", id);
                }
            }
        },

        AvailabilityCommands::Confirm { week } => {
            let week_start = parse_week(week.as_deref(), today)?;
            scheduler.confirm_week(user, week_start)?;
            if json {
                print_json(serde_json::json!({ "week_start": week_start, "confirmed": true }))?;
            } else {
                println!("Week of {} confirmed.", week_start);
            }
        }

        AvailabilityCommands::Status { week } => {
            let week_start = parse_week(week.as_deref(), today)?;
            let confirmed = scheduler.is_week_confirmed(user, week_start)?;
            if json {
                print_json(serde_json::json!({ "week_start": week_start, "confirmed": confirmed }))?;
            } else if confirmed {
                println!("Week of {} has been reviewed.", week_start);
            } else {
                println!(
                    "Week of {} has not been reviewed; block time or run `cadence availability confirm`.",
                    week_start
                );
            }
        }
    }

    Ok(())
}

fn topic_names(scheduler: &Scheduler) -> Result<HashMap<i64, String>, Box<dyn std::error::Error>> {
    Ok(scheduler
        .list_topics(None)?
        .into_iter()
        .map(|t| (t.id, t.name))
        .collect())
}

fn topic_label(names: &HashMap<i64, String>, topic_id: i64) -> String {
    names
        .get(&topic_id)
        .cloned()
        .unwrap_or_else(|| format!("topic {}", topic_id))
}

fn print_blocks(blocks: &[Block], names: &HashMap<i64, String>) {
    println!(
        "{:<5} {:<16} {:<30} {:<8} {:<14} STATUS",
        "ID", "WHEN", "TOPIC", "SESSION", "KIND"
    );
    println!("{}", "-".repeat(85));
    for block in blocks {
        println!(
            "{:<5} {:<16} {:<30} {:<8} {:<14} {}",
            block.id,
            block.scheduled_at.format("%a %d %b %H:%M"),
            truncate(&topic_label(names, block.topic_id), 28),
            format!("{}/{}", block.session_number, block.session_total),
            block.kind.as_str(),
            block.status.label()
        );
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| format!("Invalid date '{}'. Use YYYY-MM-DD", raw))
}

fn parse_time(raw: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| format!("Invalid time '{}'. Use HH:MM", raw))
}

fn parse_datetime(raw: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M")
        .map_err(|_| format!("Invalid date-time '{}'. Use \"YYYY-MM-DD HH:MM\"", raw))
}

/// "09:00-17:00" into its two ends.
fn parse_window(raw: &str) -> Result<(NaiveTime, NaiveTime), String> {
    let (start, end) = raw
        .split_once('-')
        .ok_or_else(|| format!("Invalid window '{}'. Use HH:MM-HH:MM", raw))?;
    Ok((parse_time(start)?, parse_time(end)?))
}

fn parse_interval(raw: &str) -> Result<(NaiveDateTime, NaiveDateTime), String> {
    let (start, end) = raw.split_once('/').ok_or_else(|| {
        format!(
            "Invalid interval '{}'. Use \"YYYY-MM-DD HH:MM/YYYY-MM-DD HH:MM\"",
            raw
        )
    })?;
    Ok((parse_datetime(start)?, parse_datetime(end)?))
}

fn parse_weekdays(raw: &str) -> Result<Vec<Weekday>, String> {
    raw.split(',')
        .map(|d| {
            d.trim()
                .parse::<Weekday>()
                .map_err(|_| format!("Invalid weekday '{}'. Use Mon, Tue, ...", d.trim()))
        })
        .collect()
}

fn parse_week(raw: Option<&str>, today: NaiveDate) -> Result<NaiveDate, String> {
    let this_week = monday_of(today);
    match raw.map(|r| r.trim().to_lowercase()).as_deref() {
        None | Some("this") => Ok(this_week),
        Some("next") => Ok(this_week + Duration::days(7)),
        Some(date) => parse_date(date),
    }
}
