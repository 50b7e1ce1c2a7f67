//! bedrock - a transactional, cached, log-structured key-value table engine
//!
//! This binary is a local smoke-test harness, not a network server: it
//! opens an `Engine`, defines a couple of example record types, and drives
//! a handful of procedures against them so the table cache, checkpoint
//! pipeline, and safe-context rollback can be exercised end to end.

use std::path::PathBuf;
use std::sync::Arc;

use bedrock::codec::octets::Octets;
use bedrock::codec::record::{read_fields, read_int_value, read_string_value, write_int_field, write_string_field, write_terminator, Bean};
use bedrock::config::Config;
use bedrock::error::Result;
use bedrock::procedure::Procedure;
use bedrock::sctx::SContext;
use bedrock::table::Table;
use bedrock::Engine;

#[derive(Debug, Clone, PartialEq)]
struct Account {
    owner: String,
    balance: i64,
}

impl Bean for Account {
    fn marshal(&self, out: &mut Octets) {
        write_string_field(out, 1, &self.owner);
        write_int_field(out, 2, self.balance);
        write_terminator(out);
    }

    fn unmarshal(inp: &mut Octets) -> Result<Self> {
        let mut owner = String::new();
        let mut balance = 0;
        read_fields(inp, |inp, tag, _kind| match tag {
            1 => {
                owner = read_string_value(inp)?;
                Ok(true)
            }
            2 => {
                balance = read_int_value(inp)?;
                Ok(true)
            }
            _ => Ok(false),
        })?;
        Ok(Account { owner, balance })
    }
}

/// Moves `amount` from one account key to another, rolling back cleanly if
/// the source account would go negative.
struct Transfer {
    table: Arc<Table<Account>>,
    from: Vec<u8>,
    to: Vec<u8>,
    amount: i64,
}

impl Procedure for Transfer {
    fn lock_ids(&self) -> Vec<u64> {
        vec![self.table.lock_id(&self.from), self.table.lock_id(&self.to)]
    }

    fn run(&mut self, sctx: &mut SContext) -> Result<()> {
        let mut source = self.table.get(&self.from)?.ok_or_else(|| bedrock::error::Error::Internal("no such account".into()))?;
        if source.balance < self.amount {
            return bedrock::procedure::undo();
        }
        let mut dest = self.table.get(&self.to)?.unwrap_or(Account { owner: String::new(), balance: 0 });

        source.balance -= self.amount;
        dest.balance += self.amount;

        sctx.put(&self.table, &self.from, source)?;
        sctx.put(&self.table, &self.to, dest)
    }
}

fn parse_args() -> (PathBuf, usize) {
    let args: Vec<String> = std::env::args().collect();
    let mut data_dir = PathBuf::from("./bedrock-data");
    let mut db_thread_count = 4usize;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--data-dir" | "-d" => {
                if i + 1 < args.len() {
                    data_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--threads" | "-t" => {
                if i + 1 < args.len() {
                    if let Ok(n) = args[i + 1].parse() {
                        db_thread_count = n;
                    }
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("bedrock - a transactional, cached, log-structured key-value table engine");
                println!();
                println!("Usage: bedrock [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -d, --data-dir DIR    Data directory (default: ./bedrock-data)");
                println!("  -t, --threads N       Procedure worker pool size (default: 4)");
                println!("  -h, --help            Show this help");
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    (data_dir, db_thread_count)
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (data_dir, db_thread_count) = parse_args();

    let mut config = Config::default();
    config.db_thread_count = db_thread_count;

    log::info!("starting bedrock engine at {:?}", data_dir);
    let engine = Engine::startup(config, &data_dir)?;

    let accounts: Arc<Table<Account>> = engine.open_table(1, "accounts", 1024);
    engine.start_commit_thread()?;

    let alice = b"alice".to_vec();
    let bob = b"bob".to_vec();
    {
        let _guard = accounts.locks().lock(accounts.lock_id(&alice));
        accounts.put(&alice, Account { owner: "alice".into(), balance: 100 })?;
    }
    {
        let _guard = accounts.locks().lock(accounts.lock_id(&bob));
        accounts.put(&bob, Account { owner: "bob".into(), balance: 0 })?;
    }

    engine.submit_sync(
        1,
        Box::new(Transfer { table: Arc::clone(&accounts), from: alice.clone(), to: bob.clone(), amount: 30 }),
    )?;

    let report = engine.checkpoint()?;
    log::info!("checkpoint complete, {} records still dirty, backup={:?}", report.residual_after_best_effort, report.backup);

    {
        let _guard = accounts.locks().lock(accounts.lock_id(&alice));
        println!("alice: {:?}", accounts.get(&alice)?);
    }
    {
        let _guard = accounts.locks().lock(accounts.lock_id(&bob));
        println!("bob:   {:?}", accounts.get(&bob)?);
    }

    engine.stop_queue()?;
    engine.shutdown();
    Ok(())
}
