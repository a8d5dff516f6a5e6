//! CLI smoke entry point.
//!
//! # Responsibility
//! - Run one transactional and one non-transactional unit of work against
//!   the configured `default` engine.
//! - Keep output deterministic for quick local sanity checks.
//!
//! Usage: `dbrepo_cli [config.json]`. Without a config an in-memory engine
//! is used.

use dbrepo_core::{
    compose_tx_context, default_log_level, fields, init_logging, init_logging_from_config,
    BoxError, DbTxCommitter, EngineConfig, EngineRegistry, Hooks, InsertItem, MemoryEngine,
    Repository, SqliteEngine, StoreConfig, TransactionCommitter, TxContext, TxResult, Values,
};
use log::{error, info};
use std::process::ExitCode;
use std::sync::Arc;

const USERS_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS users (user_name TEXT NOT NULL);";

#[derive(Default)]
struct UserRepo {
    ctx: TxContext,
}

compose_tx_context!(UserRepo => ctx);
impl Repository for UserRepo {}

impl UserRepo {
    fn new(engines: Arc<EngineRegistry>) -> Self {
        Self {
            ctx: TxContext::new(engines),
        }
    }

    fn add_user(&self, name: &str) -> TxResult<u64> {
        self.ctx.with_session(|session| {
            session.insert_multi(&[InsertItem::new("users").field("user_name", name)])
        })
    }

    fn count_users(&self, name: &str) -> TxResult<usize> {
        self.ctx
            .with_session(|session| session.find("users", &fields([("user_name", name)])))
            .map(|rows| rows.len())
    }
}

fn main() -> ExitCode {
    match run(std::env::args().nth(1)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("event=cli_run module=cli status=error error={}", err);
            eprintln!("dbrepo_cli error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(config_path: Option<String>) -> Result<(), BoxError> {
    let registry = match config_path {
        Some(path) => {
            let config = StoreConfig::from_path(&path)?;
            match &config.logging {
                Some(logging) => init_logging_from_config(logging)?,
                None => init_logging(default_log_level(), None)?,
            }
            for engine in config.engines.values() {
                if let EngineConfig::Sqlite { path, .. } = engine {
                    SqliteEngine::new(path).execute_batch(USERS_SCHEMA)?;
                }
            }
            EngineRegistry::from_config(&config)?
        }
        None => {
            init_logging(default_log_level(), None)?;
            EngineRegistry::builder()
                .engine("default", MemoryEngine::new())
                .build()?
        }
    };
    info!(
        "event=cli_start module=cli status=ok engines={:?}",
        registry.names()
    );

    let repos = (UserRepo::new(Arc::new(registry)),);
    let committer = DbTxCommitter::new();

    let hooks = Hooks::from_logic(|(repo,): &mut (UserRepo,)| {
        repo.add_user("ada")?;
        let mut values = Values::new();
        values.push(repo.count_users("ada")? as i64);
        Ok(values)
    })
    .after_commit(|count: i64| {
        println!("after_commit users={count}");
    });
    committer.transaction(hooks, &repos)?;

    let hooks = Hooks::from_logic(|(repo,): &mut (UserRepo,)| {
        println!("no_transaction users={}", repo.count_users("ada")?);
        Ok(())
    });
    committer.no_transaction(hooks, &repos)?;

    println!("dbrepo_core version={}", dbrepo_core::core_version());
    Ok(())
}
