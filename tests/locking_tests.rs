mod common;

use common::{Invoice, customer, factory, factory_with, seed_invoices};
use persistkit::{
    CacheMode, ConnectionConfig, EntityHandle, LockMode, LockOptions, LockTimeout, PersistError,
    SessionFactoryConfig,
};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_lock_mode_never_downgrades() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut session = factory.open_session().unwrap();
    let handle = session
        .load::<Invoice>(ids[0].clone(), LockMode::Optimistic)
        .await
        .unwrap();
    assert_eq!(session.get_current_lock_mode(&handle).unwrap(), LockMode::Optimistic);

    session
        .build_lock_request(LockMode::Read)
        .lock(&handle)
        .await
        .unwrap();
    assert_eq!(session.get_current_lock_mode(&handle).unwrap(), LockMode::Optimistic);

    session
        .build_lock_request(LockMode::PessimisticWrite)
        .lock(&handle)
        .await
        .unwrap();
    assert_eq!(
        session.get_current_lock_mode(&handle).unwrap(),
        LockMode::PessimisticWrite
    );
}

#[tokio::test]
async fn test_write_lock_cannot_be_requested() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut session = factory.open_session().unwrap();
    assert!(matches!(
        session.load::<Invoice>(ids[0].clone(), LockMode::Write).await,
        Err(PersistError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_lock_request_settings() {
    let factory = factory().await;
    let mut session = factory.open_session().unwrap();

    let request = session
        .build_lock_request(LockOptions::UPGRADE)
        .set_timeout(LockTimeout::PESSIMISTIC_NO_WAIT)
        .set_scope(true);
    assert_eq!(request.lock_mode(), LockMode::PessimisticWrite);
    assert_eq!(request.timeout(), 0);
    assert!(request.scope());

    let request = request
        .set_lock_mode(LockMode::PessimisticRead)
        .set_timeout(-5);
    assert_eq!(request.lock_mode(), LockMode::PessimisticRead);
    assert_eq!(request.timeout(), LockTimeout::PESSIMISTIC_WAIT_FOREVER);
}

#[tokio::test]
async fn test_pessimistic_lock_blocks_other_sessions() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut holder = factory.open_session().unwrap();
    holder
        .load::<Invoice>(ids[0].clone(), LockOptions::UPGRADE)
        .await
        .unwrap();

    let mut waiter = factory.open_session().unwrap();
    let nowait = waiter
        .load::<Invoice>(ids[0].clone(), LockMode::UpgradeNowait)
        .await;
    assert!(matches!(nowait, Err(PersistError::LockUnavailable(_))));

    let started = Instant::now();
    let bounded = waiter
        .load::<Invoice>(ids[0].clone(), LockOptions::UPGRADE.timeout_millis(30))
        .await;
    assert!(matches!(bounded, Err(PersistError::LockTimeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(waiter.statistics().entity_count, 0);

    holder.close().await.unwrap();
    let handle = waiter
        .load::<Invoice>(ids[0].clone(), LockOptions::UPGRADE.timeout_millis(0))
        .await
        .unwrap();
    assert_eq!(
        waiter.get_current_lock_mode(&handle).unwrap(),
        LockMode::PessimisticWrite
    );
}

#[tokio::test]
async fn test_waiting_lock_is_granted_on_release() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut holder = factory.open_session().unwrap();
    holder
        .load::<Invoice>(ids[0].clone(), LockOptions::UPGRADE)
        .await
        .unwrap();

    let contender = factory.clone();
    let id = ids[0].clone();
    let waiting = tokio::spawn(async move {
        let mut waiter = contender.open_session().unwrap();
        let result = waiter
            .load::<Invoice>(id, LockOptions::UPGRADE.timeout_millis(5_000))
            .await
            .map(|_| ());
        waiter.close().await.unwrap();
        result
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    holder.close().await.unwrap();
    assert!(waiting.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_locked_row_rejects_writes_from_other_sessions() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut holder = factory.open_session().unwrap();
    holder
        .load::<Invoice>(ids[0].clone(), LockOptions::UPGRADE)
        .await
        .unwrap();

    let mut writer = factory.open_session().unwrap();
    let handle = writer.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    handle.write().amount = 999;
    assert!(matches!(writer.flush().await, Err(PersistError::LockUnavailable(_))));
    assert!(writer.is_dirty().unwrap());

    let mut reader = factory.with_options().cache_mode(CacheMode::Ignore).open().unwrap();
    let stored = reader.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    assert_eq!(stored.read().amount, 10);

    holder.close().await.unwrap();
    writer.flush().await.unwrap();
    assert_eq!(handle.read().version, 1);
}

#[tokio::test]
async fn test_lock_waiters_do_not_hold_connections() {
    let config = SessionFactoryConfig::new().connection(
        ConnectionConfig::new("narrow")
            .max_connections(2)
            .connect_timeout(Duration::from_millis(200)),
    );
    let factory = factory_with(config).await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut holder = factory.open_session().unwrap();
    let handle = holder
        .load::<Invoice>(ids[0].clone(), LockOptions::UPGRADE)
        .await
        .unwrap();

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let contender = factory.clone();
            let id = ids[0].clone();
            tokio::spawn(async move {
                let mut waiter = contender.open_session().unwrap();
                let result = waiter
                    .load::<Invoice>(id, LockOptions::UPGRADE.timeout_millis(5_000))
                    .await
                    .map(|_| ());
                waiter.close().await.unwrap();
                result
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let pools = factory.pool_stats().await;
    assert_eq!(pools[0].1.active_connections, 0);

    handle.write().amount = 11;
    holder.flush().await.unwrap();
    holder.close().await.unwrap();

    for waiter in waiters {
        assert!(waiter.await.unwrap().is_ok());
    }
}

#[tokio::test]
async fn test_shared_locks_coexist() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut first = factory.open_session().unwrap();
    let mut second = factory.open_session().unwrap();
    let read = LockOptions::of(LockMode::PessimisticRead).timeout_millis(0);
    first.load::<Invoice>(ids[0].clone(), read).await.unwrap();
    second.load::<Invoice>(ids[0].clone(), read).await.unwrap();

    let mut writer = factory.open_session().unwrap();
    assert!(matches!(
        writer.load::<Invoice>(ids[0].clone(), LockMode::UpgradeNowait).await,
        Err(PersistError::LockUnavailable(_))
    ));
}

#[tokio::test]
async fn test_commit_releases_row_locks() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut holder = factory.open_session().unwrap();
    holder.begin_transaction().await.unwrap();
    let handle = holder
        .load::<Invoice>(ids[0].clone(), LockOptions::UPGRADE)
        .await
        .unwrap();
    holder.commit().await.unwrap();
    assert_eq!(holder.get_current_lock_mode(&handle).unwrap(), LockMode::None);

    let mut other = factory.open_session().unwrap();
    other
        .load::<Invoice>(ids[0].clone(), LockMode::UpgradeNowait)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_scoped_lock_reaches_tracked_associations() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10), ("INV-2", 20)]).await;

    let mut holder = factory.open_session().unwrap();
    let first = holder.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    let owner = customer("Acme", vec![ids[0].clone()]);
    holder.save(&owner).await.unwrap();
    holder.flush().await.unwrap();

    holder
        .build_lock_request(LockOptions::UPGRADE)
        .set_scope(true)
        .lock(&owner)
        .await
        .unwrap();
    assert_eq!(
        holder.get_current_lock_mode(&first).unwrap(),
        LockMode::PessimisticWrite
    );

    let mut other = factory.open_session().unwrap();
    assert!(matches!(
        other.load::<Invoice>(ids[0].clone(), LockMode::UpgradeNowait).await,
        Err(PersistError::LockUnavailable(_))
    ));
    other
        .load::<Invoice>(ids[1].clone(), LockMode::UpgradeNowait)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_optimistic_force_increment_bumps_version_on_flush() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut session = factory.open_session().unwrap();
    let handle = session
        .load::<Invoice>(ids[0].clone(), LockMode::OptimisticForceIncrement)
        .await
        .unwrap();
    assert!(!session.is_dirty().unwrap());
    session.flush().await.unwrap();
    assert_eq!(handle.read().version, 1);
    assert!(!session.is_dirty().unwrap());
    session.close().await.unwrap();

    let mut session = factory.open_session().unwrap();
    let reloaded = session.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    assert_eq!(reloaded.read().version, 1);
    assert_eq!(reloaded.read().amount, 10);
}

#[tokio::test]
async fn test_pessimistic_force_increment_is_immediate() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut session = factory.open_session().unwrap();
    let handle = session.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    session
        .build_lock_request(LockMode::PessimisticForceIncrement)
        .lock(&handle)
        .await
        .unwrap();
    assert_eq!(handle.read().version, 1);

    let mut other = factory.with_options().cache_mode(persistkit::CacheMode::Ignore).open().unwrap();
    let seen = other.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    assert_eq!(seen.read().version, 1);
}

#[tokio::test]
async fn test_concurrent_modification_is_stale() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut first = factory.open_session().unwrap();
    let mut second = factory.open_session().unwrap();
    let mine = first.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    let theirs = second.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();

    theirs.write().amount = 20;
    second.flush().await.unwrap();

    mine.write().amount = 30;
    assert!(matches!(first.flush().await, Err(PersistError::StaleState(_))));
    assert!(first.is_dirty().unwrap());
    assert_eq!(mine.read().version, 0);
    assert_eq!(factory.statistics().optimistic_failures, 1);
}

#[tokio::test]
async fn test_optimistic_lock_verifies_unchanged_instance() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut first = factory.open_session().unwrap();
    first
        .load::<Invoice>(ids[0].clone(), LockMode::Optimistic)
        .await
        .unwrap();

    let mut second = factory.open_session().unwrap();
    let theirs = second.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    theirs.write().amount = 20;
    second.flush().await.unwrap();

    assert!(matches!(first.flush().await, Err(PersistError::StaleState(_))));
}

#[tokio::test]
async fn test_read_lock_checks_version_now() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut first = factory.open_session().unwrap();
    let mine = first.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();

    let mut second = factory.open_session().unwrap();
    let theirs = second.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    theirs.write().amount = 20;
    second.flush().await.unwrap();

    let result = first.build_lock_request(LockMode::Read).lock(&mine).await;
    assert!(matches!(result, Err(PersistError::StaleState(_))));
    assert_eq!(first.get_current_lock_mode(&mine).unwrap(), LockMode::None);
}

#[tokio::test]
async fn test_lock_reattaches_detached_instance() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut session = factory.open_session().unwrap();
    let detached = session.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    session.close().await.unwrap();

    let mut session = factory.open_session().unwrap();
    session
        .build_lock_request(LockMode::Read)
        .lock(&detached)
        .await
        .unwrap();
    assert!(session.contains(&detached));
    assert_eq!(session.get_current_lock_mode(&detached).unwrap(), LockMode::Read);

    let copy = EntityHandle::new(detached.read().clone());
    let result = session.build_lock_request(LockMode::Read).lock(&copy).await;
    assert!(matches!(result, Err(PersistError::Conflict(_))));
}
