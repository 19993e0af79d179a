//! Development helper: mint a session token for a user and record their
//! group memberships in Redis.
//!
//! Usage: `issue-token <user_id> [group_id[=Display Name]]...`
//!        `issue-token --revoke <token>`

use std::path::Path;

use chat_gateway::auth::tokens::{self, SessionData, SESSION_TTL_SECS};
use chat_gateway::db::kv::{KeyValueStore, RedisStore};
use chat_gateway::membership::KvMembership;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    let mut args = std::env::args().skip(1).peekable();
    let revoke = args.peek().is_some_and(|a| a == "--revoke");
    if revoke {
        args.next();
    }
    let Some(subject) = args.next().filter(|u| !u.trim().is_empty()) else {
        eprintln!("usage: issue-token <user_id> [group_id[=Display Name]]...");
        eprintln!("       issue-token --revoke <token>");
        std::process::exit(2);
    };

    let redis_url = std::env::var("REDIS_URL")
        .map_err(|_| "REDIS_URL must be set; in-memory sessions are not shared with the server")?;
    let client = redis::Client::open(redis_url)?;
    let kv = RedisStore::new(redis::aio::ConnectionManager::new(client).await?);

    if revoke {
        tokens::revoke_session(&kv, subject.trim()).await?;
        println!("revoked");
        return Ok(());
    }
    let user_id = subject;

    let token = tokens::generate_session_token();
    tokens::store_session(
        &kv,
        &token,
        &SessionData {
            user_id: user_id.clone(),
        },
        SESSION_TTL_SECS,
    )
    .await?;

    for arg in args {
        let (group_id, name) = match arg.split_once('=') {
            Some((group, name)) => (group.trim().to_string(), name.trim().to_string()),
            None => (arg.trim().to_string(), user_id.clone()),
        };
        if group_id.is_empty() {
            continue;
        }
        kv.set_ex(
            &KvMembership::member_key(&group_id, &user_id),
            &name,
            SESSION_TTL_SECS,
        )
        .await?;
        println!("member of {group_id} as {name:?}");
    }

    println!("{token}");
    Ok(())
}
