//! Daily reminder batch entry point, for cron or a scheduler service.
//!
//! Exit codes: 0 = clean run, 1 = completed with errors, 2 = fatal setup
//! failure.

use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "reminder-job", about = "Send day-of appointment reminders for all active accounts")]
struct Args {
    /// Timezone the appointment window is computed in.
    #[arg(long, default_value = "America/Mexico_City")]
    timezone: String,

    /// Log what would be sent without sending anything.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reminder_job=info,citabot_reminders=info".into()),
        )
        .init();

    let args = Args::parse();
    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let timezone: chrono_tz::Tz = match args.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            eprintln!("FATAL ERROR: unknown timezone {}", args.timezone);
            return 2;
        }
    };

    let config_path = std::env::var("CITABOT_CONFIG").ok();
    let config = match citabot_core::config::CitabotConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "config load failed");
            eprintln!("FATAL ERROR: {e}");
            return 2;
        }
    };

    let stores = match citabot_store::Stores::open(&config.database.path) {
        Ok(stores) => stores,
        Err(e) => {
            error!(error = %e, "store open failed");
            eprintln!("FATAL ERROR: {e}");
            return 2;
        }
    };

    let config = std::sync::Arc::new(config);
    let engine = citabot_gateway::app::build_engine(config, stores.clone());
    let dispatcher = citabot_reminders::ReminderDispatcher::new(
        stores,
        engine.crm.clone(),
        engine.whatsapp.clone(),
    );

    info!(timezone = %args.timezone, dry_run = args.dry_run, "starting reminder job");
    if args.dry_run {
        info!("dry-run mode: no messages will be sent");
    }

    let stats = dispatcher.run_daily(timezone, args.dry_run).await;

    println!("Reminder Job Summary:");
    println!("  Total Accounts: {}", stats.total_accounts);
    println!("  Total Appointments: {}", stats.total_appointments);
    println!("  Reminders Sent: {}", stats.reminders_sent);
    println!("  Errors: {}", stats.errors.len());
    if !stats.errors.is_empty() {
        println!("\nErrors encountered:");
        for error in &stats.errors {
            println!("  - {error}");
        }
    }

    if stats.errors.is_empty() {
        0
    } else {
        1
    }
}
