//! Batch-delete conversations for one patient phone under one tenant.
//!
//! Defaults to a dry listing; `--preview` prints details and `--force`
//! actually deletes.

use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "delete-conversations",
    about = "Delete conversations matching a phone number under one account"
)]
struct Args {
    /// Patient phone in any format; canonicalized before matching.
    #[arg(long)]
    phone: String,

    /// Tenant id owning the conversations.
    #[arg(long, conflicts_with = "account_name")]
    account_id: Option<String>,

    /// Tenant display name, resolved to an id.
    #[arg(long)]
    account_name: Option<String>,

    /// Show the matching conversations without deleting.
    #[arg(long)]
    preview: bool,

    /// Actually delete. Without this flag nothing is removed.
    #[arg(long)]
    force: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "delete_conversations=info".into()),
        )
        .init();

    let args = Args::parse();
    std::process::exit(run(args));
}

fn run(args: Args) -> i32 {
    let Some(phone) = citabot_core::phone::normalize_phone(&args.phone) else {
        eprintln!("error: '{}' contains no usable digits", args.phone);
        return 2;
    };

    let config_path = std::env::var("CITABOT_CONFIG").ok();
    let config = match citabot_core::config::CitabotConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return 2;
        }
    };
    let stores = match citabot_store::Stores::open(&config.database.path) {
        Ok(stores) => stores,
        Err(e) => {
            eprintln!("error: {e}");
            return 2;
        }
    };

    let account = match resolve_account(&stores, &args) {
        Ok(account) => account,
        Err(message) => {
            eprintln!("error: {message}");
            return 2;
        }
    };

    let conversations = match stores.conversations.list_for_phone(&account.id, &phone) {
        Ok(conversations) => conversations,
        Err(e) => {
            eprintln!("error: {e}");
            return 2;
        }
    };

    if conversations.is_empty() {
        println!("No conversations found for {phone} under account {}", account.id);
        return 0;
    }

    println!(
        "Found {} conversation(s) for {phone} under account '{}' ({}):",
        conversations.len(),
        account.name,
        account.id
    );
    for conversation in &conversations {
        println!(
            "  {} — status={}, messages={}, updated={}",
            conversation.id,
            conversation.status,
            conversation.messages.len(),
            conversation.updated_at.format("%Y-%m-%d %H:%M UTC"),
        );
        if args.preview {
            for message in conversation.messages.iter().rev().take(3).rev() {
                let content: String = message.content.chars().take(60).collect();
                println!("      [{:?}] {content}", message.role);
            }
        }
    }

    if !args.force {
        println!(
            "\nDry run. To actually delete these {} conversation(s), run again with --force",
            conversations.len()
        );
        return 0;
    }

    let mut deleted = 0;
    for conversation in &conversations {
        match stores.conversations.delete(&conversation.id) {
            Ok(()) => {
                info!(conversation_id = %conversation.id, "deleted");
                deleted += 1;
            }
            Err(e) => eprintln!("failed to delete {}: {e}", conversation.id),
        }
    }
    println!("Deleted {deleted} of {} conversation(s)", conversations.len());

    if deleted == conversations.len() {
        0
    } else {
        1
    }
}

fn resolve_account(
    stores: &citabot_store::Stores,
    args: &Args,
) -> Result<citabot_store::types::Account, String> {
    if let Some(id) = &args.account_id {
        return stores
            .accounts
            .get(id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("no account with id {id}"));
    }
    if let Some(name) = &args.account_name {
        return stores
            .accounts
            .get_by_name(name)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("no account named '{name}'"));
    }
    Err("one of --account-id or --account-name is required".into())
}
