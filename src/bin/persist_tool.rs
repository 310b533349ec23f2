use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use persistkit::{
    CacheMode, Entity, EntityHandle, EntityId, FlushMode, IdStrategy, LockMode, LockOptions,
    PersistError, SessionFactory, SessionFactoryConfig,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "persist-tool")]
#[command(about = "Developer tooling for persistkit sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Saves invoices, queries them back and prints factory statistics
    Demo {
        #[arg(long, default_value_t = 10)]
        count: i64,
        #[arg(long, default_value = "NORMAL")]
        cache_mode: String,
        #[arg(long, default_value = "AUTO")]
        flush_mode: String,
        #[arg(long, default_value = "where this.amount >= 50 order by this.amount desc")]
        filter: String,
    },
    /// Has a second session wait for a row lock held by the first
    Contention {
        /// -1 waits forever, 0 fails immediately, n > 0 waits n ms
        #[arg(long, default_value_t = 50)]
        timeout_ms: i64,
    },
    /// Prints the lock and flush mode rank tables and cache mode flags
    Modes,
}

#[derive(Debug, Serialize, Deserialize)]
struct Invoice {
    id: Option<EntityId>,
    version: i64,
    number: String,
    amount: i64,
}

impl Entity for Invoice {
    const ENTITY_NAME: &'static str = "Invoice";
    const ID_STRATEGY: IdStrategy = IdStrategy::Sequence;

    fn id(&self) -> Option<EntityId> {
        self.id.clone()
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn version(&self) -> Option<i64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn natural_id(&self) -> Option<String> {
        Some(self.number.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Demo {
            count,
            cache_mode,
            flush_mode,
            filter,
        } => {
            let cache_mode: CacheMode = cache_mode.parse().context("Invalid --cache-mode")?;
            let flush_mode: FlushMode = flush_mode.parse().context("Invalid --flush-mode")?;
            demo(count, cache_mode, flush_mode, &filter).await
        }
        Command::Contention { timeout_ms } => contention(timeout_ms).await,
        Command::Modes => {
            print_modes();
            Ok(())
        }
    }
}

async fn demo(count: i64, cache_mode: CacheMode, flush_mode: FlushMode, filter: &str) -> Result<()> {
    if count <= 0 {
        return Err(anyhow!("--count must be positive"));
    }
    let config = SessionFactoryConfig::new()
        .cache_mode(cache_mode)
        .flush_mode(flush_mode);
    let factory = SessionFactory::new(config)
        .await
        .context("Failed to build session factory")?;

    let started = Instant::now();
    let mut session = factory.open_session()?;
    session.begin_transaction().await?;
    let mut invoices = Vec::with_capacity(count as usize);
    for n in 1..=count {
        let invoice = EntityHandle::new(Invoice {
            id: None,
            version: 0,
            number: format!("INV-{:04}", n),
            amount: n * 10,
        });
        session.save(&invoice).await?;
        invoices.push(invoice);
    }
    session.commit().await.context("Commit failed")?;
    session.close().await?;
    println!("Saved {} invoices in {:?}", count, started.elapsed());

    let mut session = factory.open_session()?;
    let mut ids = Vec::with_capacity(invoices.len());
    for invoice in &invoices {
        ids.push(invoice.id().context("saved invoice has no id")?);
    }
    let mut loaded = Vec::with_capacity(ids.len());
    for id in ids {
        let invoice = session.load::<Invoice>(id, LockOptions::NONE).await?;
        loaded.push(invoice);
    }

    let mut query = session.create_filter(&loaded, filter)?;
    query.set_cacheable(true);
    let first = query.list(&mut session).await?;
    let second = query.list(&mut session).await?;
    println!("Filter '{}' matched {} invoices ({} on re-run)", filter, first.len(), second.len());
    for invoice in &first {
        let invoice = invoice.read();
        println!("  {} amount={} version={}", invoice.number, invoice.amount, invoice.version);
    }

    if let Some(top) = first.first() {
        session
            .build_lock_request(LockMode::OptimisticForceIncrement)
            .lock(top)
            .await?;
        session.flush().await?;
        println!("Forced a version increment on {}", top.read().number);
    }

    let statistics = session.statistics();
    println!("Session: {} tracked entities", statistics.entity_count);
    session.close().await?;

    println!("\n{}", factory.statistics());
    for (tenant, stats) in factory.pool_stats().await {
        println!("pool {}: {}", tenant.as_deref().unwrap_or("<default>"), stats);
    }
    factory.close().await?;
    Ok(())
}

async fn contention(timeout_ms: i64) -> Result<()> {
    let factory = SessionFactory::new(SessionFactoryConfig::default()).await?;

    let mut setup = factory.open_session()?;
    let invoice = EntityHandle::new(Invoice {
        id: None,
        version: 0,
        number: "INV-LOCK".into(),
        amount: 100,
    });
    let id = setup.save(&invoice).await?;
    setup.flush().await?;
    setup.close().await?;

    let mut holder = factory.open_session()?;
    holder.load::<Invoice>(id.clone(), LockOptions::UPGRADE).await?;
    println!("Session {} holds an exclusive lock on Invoice#{}", holder.id(), id);

    let mut waiter = factory.open_session()?;
    let started = Instant::now();
    let options = LockOptions::UPGRADE.timeout_millis(timeout_ms);
    match waiter.load::<Invoice>(id.clone(), options).await {
        Ok(_) => println!("Session {} acquired the lock", waiter.id()),
        Err(err @ (PersistError::LockTimeout { .. } | PersistError::LockUnavailable(_))) => {
            println!(
                "Session {} gave up after {:?}: {}",
                waiter.id(),
                started.elapsed(),
                err
            );
        }
        Err(err) => return Err(err).context("Unexpected lock failure"),
    }

    holder.close().await?;
    waiter.close().await?;
    factory.close().await?;
    Ok(())
}

fn print_modes() {
    println!("Lock modes (rank):");
    for mode in [
        LockMode::None,
        LockMode::Read,
        LockMode::Optimistic,
        LockMode::OptimisticForceIncrement,
        LockMode::UpgradeNowait,
        LockMode::Write,
        LockMode::PessimisticRead,
        LockMode::PessimisticWrite,
        LockMode::PessimisticForceIncrement,
    ] {
        println!("  {:<28} {:>2}", mode, mode.level());
    }

    println!("\nFlush modes (rank):");
    for mode in [
        FlushMode::Never,
        FlushMode::Manual,
        FlushMode::Commit,
        FlushMode::Auto,
        FlushMode::Always,
    ] {
        println!("  {:<28} {:>2}", mode, mode.level());
    }

    println!("\nCache modes (read, write):");
    for mode in [
        CacheMode::Normal,
        CacheMode::Ignore,
        CacheMode::Get,
        CacheMode::Put,
        CacheMode::Refresh,
    ] {
        println!(
            "  {:<28} ({}, {})",
            mode,
            mode.is_read_enabled(),
            mode.is_write_enabled()
        );
    }
}
