//! Offline chain-integrity digest (spec §4.12, §2.2). Connects to the same
//! Postgres the gateway writes to, replays the audit chain with
//! `verify_chain`, and prints a pass/fail summary for ops to run out of band
//! without standing up the whole server.

use casf_gateway::audit::{AuditStore, PgAuditStore};
use casf_gateway::hash_chain::{verify_chain, ChainVerdict};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "casf-digest", about = "Verify the CASF audit hash chain")]
struct Args {
    /// Postgres DSN. Defaults to $DATABASE_URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&args.database_url)
        .await?;
    let store = PgAuditStore::new(pool, std::time::Duration::from_secs(30));
    let events = store.all_events().await?;

    match verify_chain(&events) {
        ChainVerdict::Intact => {
            println!("OK: {} events, chain intact", events.len());
            Ok(())
        }
        ChainVerdict::BrokenAt(i) => {
            let broken = &events[i];
            eprintln!(
                "FAIL: chain broken at index {i} (event_id={}, stored_hash={}, prev_hash={})",
                broken.event_id, broken.hash, broken.prev_hash
            );
            std::process::exit(1);
        }
    }
}
