mod common;

use common::{Customer, Invoice, Sku, customer, factory, invoice, seed_invoices, sku};
use persistkit::{EntityHandle, EntityId, LockOptions, PersistError};

#[tokio::test]
async fn test_save_get_flush_refresh() {
    let factory = factory().await;
    let mut session = factory.open_session().unwrap();

    let handle = invoice("INV-1", 40);
    let id = session.save(&handle).await.unwrap();
    assert_eq!(id, EntityId::Int(1));
    assert_eq!(handle.id(), Some(id.clone()));

    let found = session.get::<Invoice>(id.clone()).await.unwrap().unwrap();
    assert!(found.same_instance(&handle));
    assert!(session.is_dirty().unwrap());

    session.flush().await.unwrap();
    assert!(!session.is_dirty().unwrap());

    session.refresh(&handle).await.unwrap();
    assert_eq!(handle.read().amount, 40);
    assert_eq!(handle.read().version, 0);
    assert!(session.contains(&handle));
    assert_eq!(factory.statistics().entity_inserts, 1);
}

#[tokio::test]
async fn test_update_with_other_tracked_instance_conflicts() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut session = factory.open_session().unwrap();
    let tracked = session.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    let copy = EntityHandle::new(tracked.read().clone());

    assert!(matches!(session.update(&copy).await, Err(PersistError::Conflict(_))));
    assert!(session.update(&tracked).await.is_ok());
}

#[tokio::test]
async fn test_identity_map_returns_same_instance() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut session = factory.open_session().unwrap();
    let first = session.load::<Invoice>(ids[0].clone(), LockOptions::NONE).await.unwrap();
    let second = session.load::<Invoice>(ids[0].clone(), LockOptions::NONE).await.unwrap();
    assert!(first.same_instance(&second));
    assert_eq!(session.statistics().entity_count, 1);
    assert_eq!(session.get_entity_name(&first).unwrap(), "Invoice");
    assert_eq!(session.get_identifier(&first).unwrap(), ids[0]);
}

#[tokio::test]
async fn test_load_missing_row() {
    let factory = factory().await;
    let mut session = factory.open_session().unwrap();

    assert!(session.get::<Invoice>(99).await.unwrap().is_none());
    assert!(matches!(
        session.load::<Invoice>(99, LockOptions::NONE).await,
        Err(PersistError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_dirty_instance_is_written_on_flush() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut session = factory.open_session().unwrap();
    let handle = session.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    handle.write().amount = 25;
    assert!(session.is_dirty().unwrap());
    session.flush().await.unwrap();
    assert_eq!(handle.read().version, 1);
    session.close().await.unwrap();

    let mut session = factory.open_session().unwrap();
    let reloaded = session.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    assert_eq!(reloaded.read().amount, 25);
    assert_eq!(reloaded.read().version, 1);
}

#[tokio::test]
async fn test_read_only_instances_are_never_dirty() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut session = factory.open_session().unwrap();
    let handle = session.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    session.set_read_only(&handle, true).unwrap();
    assert!(session.is_read_only(&handle).unwrap());

    handle.write().amount = 999;
    assert!(!session.is_dirty().unwrap());
    session.flush().await.unwrap();

    // Becoming modifiable again takes the current state as the baseline.
    session.set_read_only(&handle, false).unwrap();
    assert!(!session.is_dirty().unwrap());
    session.close().await.unwrap();

    let mut session = factory.open_session().unwrap();
    let reloaded = session.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    assert_eq!(reloaded.read().amount, 10);
}

#[tokio::test]
async fn test_default_read_only_session() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut session = factory.with_options().default_read_only(true).open().unwrap();
    let handle = session.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    assert!(session.is_read_only(&handle).unwrap());
    handle.write().amount = 11;
    assert!(!session.is_dirty().unwrap());
}

#[tokio::test]
async fn test_evict_is_idempotent_and_cascades() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10), ("INV-2", 20)]).await;

    let mut session = factory.open_session().unwrap();
    let first = session.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    let second = session.get::<Invoice>(ids[1].clone()).await.unwrap().unwrap();
    let owner = customer("Acme", ids.clone());
    session.save(&owner).await.unwrap();

    session.evict(&owner).unwrap();
    assert!(!session.contains(&owner));
    assert!(!session.contains(&first));
    assert!(!session.contains(&second));
    assert_eq!(session.statistics().entity_count, 0);

    session.evict(&owner).unwrap();
    session.evict(&invoice("INV-9", 1)).unwrap();
}

#[tokio::test]
async fn test_delete_cascades_to_tracked_targets() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10), ("INV-2", 20), ("INV-3", 30)]).await;

    let mut session = factory.open_session().unwrap();
    session.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    session.get::<Invoice>(ids[1].clone()).await.unwrap().unwrap();
    let owner = customer("Acme", vec![ids[0].clone(), ids[1].clone()]);
    session.save(&owner).await.unwrap();
    session.flush().await.unwrap();

    session.delete(&owner).await.unwrap();
    assert!(!session.contains(&owner));
    assert!(session.get::<Invoice>(ids[0].clone()).await.unwrap().is_none());
    session.flush().await.unwrap();
    session.close().await.unwrap();

    let mut session = factory.open_session().unwrap();
    let owner_id = owner.id().unwrap();
    assert!(session.get::<Customer>(owner_id).await.unwrap().is_none());
    assert!(session.get::<Invoice>(ids[0].clone()).await.unwrap().is_none());
    assert!(session.get::<Invoice>(ids[1].clone()).await.unwrap().is_none());
    assert!(session.get::<Invoice>(ids[2].clone()).await.unwrap().is_some());
    assert_eq!(factory.statistics().entity_deletes, 3);
}

#[tokio::test]
async fn test_delete_of_unflushed_instance_just_untracks() {
    let factory = factory().await;
    let mut session = factory.open_session().unwrap();

    let handle = invoice("INV-1", 10);
    let id = session.save(&handle).await.unwrap();
    session.delete(&handle).await.unwrap();
    assert!(!session.is_dirty().unwrap());
    session.flush().await.unwrap();

    assert!(session.get::<Invoice>(id).await.unwrap().is_none());
    assert_eq!(factory.statistics().entity_inserts, 0);
}

#[tokio::test]
async fn test_save_rejects_detached_instance() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut session = factory.open_session().unwrap();
    let detached = EntityHandle::new(Invoice {
        id: Some(ids[0].clone()),
        version: 0,
        number: "INV-1".into(),
        amount: 10,
        status: None,
    });
    assert!(matches!(
        session.save(&detached).await,
        Err(PersistError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_detached_update_is_written_unconditionally() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut session = factory.open_session().unwrap();
    let detached = session.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    session.close().await.unwrap();

    // Another unit of work moves the row ahead.
    let mut other = factory.open_session().unwrap();
    let current = other.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    current.write().amount = 15;
    other.flush().await.unwrap();
    other.close().await.unwrap();

    detached.write().amount = 50;
    let mut session = factory.open_session().unwrap();
    session.update(&detached).await.unwrap();
    assert!(session.is_dirty().unwrap());
    session.flush().await.unwrap();
    assert_eq!(detached.read().version, 2);
    session.close().await.unwrap();

    let mut session = factory.open_session().unwrap();
    let reloaded = session.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    assert_eq!(reloaded.read().amount, 50);
}

#[tokio::test]
async fn test_merge_copies_onto_tracked_instance() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut session = factory.open_session().unwrap();
    let tracked = session.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();

    let mut edited = tracked.read().clone();
    edited.amount = 70;
    let detached = EntityHandle::new(edited);
    let merged = session.merge(&detached).await.unwrap();

    assert!(merged.same_instance(&tracked));
    assert!(!session.contains(&detached));
    assert_eq!(tracked.read().amount, 70);

    let mut stale = tracked.read().clone();
    stale.version = 5;
    let result = session.merge(&EntityHandle::new(stale)).await;
    assert!(matches!(result, Err(PersistError::StaleState(_))));
}

#[tokio::test]
async fn test_merge_of_transient_saves_a_copy() {
    let factory = factory().await;
    let mut session = factory.open_session().unwrap();

    let transient = invoice("INV-1", 10);
    let merged = session.merge(&transient).await.unwrap();
    assert!(!merged.same_instance(&transient));
    assert!(transient.id().is_none());
    assert!(merged.id().is_some());
    assert!(session.contains(&merged));
}

#[tokio::test]
async fn test_natural_id_lookup() {
    let factory = factory().await;
    seed_invoices(&factory, &[("INV-1", 10), ("INV-2", 20)]).await;

    let mut session = factory.open_session().unwrap();
    let found = session
        .get_by_natural_id::<Invoice>("INV-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.read().amount, 20);

    let again = session
        .get_by_natural_id::<Invoice>("INV-2")
        .await
        .unwrap()
        .unwrap();
    assert!(again.same_instance(&found));
    assert!(
        session
            .get_by_natural_id::<Invoice>("INV-404")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_save_or_update_with_assigned_ids() {
    let factory = factory().await;

    let mut session = factory.open_session().unwrap();
    let item = sku("SKU-1", "Widget");
    session.save_or_update(&item).await.unwrap();
    session.flush().await.unwrap();
    session.close().await.unwrap();

    let mut edited = item.read().clone();
    edited.title = "Gadget".into();
    let detached = EntityHandle::new(edited);

    let mut session = factory.open_session().unwrap();
    session.save_or_update(&detached).await.unwrap();
    session.flush().await.unwrap();
    session.close().await.unwrap();

    let mut session = factory.open_session().unwrap();
    let reloaded = session.get::<Sku>("SKU-1").await.unwrap().unwrap();
    assert_eq!(reloaded.read().title, "Gadget");
    assert_eq!(reloaded.read().version, 1);
}

#[tokio::test]
async fn test_save_rejects_existing_assigned_id() {
    let factory = factory().await;

    let mut session = factory.open_session().unwrap();
    session.save(&sku("SKU-1", "Widget")).await.unwrap();
    session.flush().await.unwrap();
    session.close().await.unwrap();

    let mut session = factory.open_session().unwrap();
    let duplicate = sku("SKU-1", "Imposter");
    assert!(matches!(
        session.save(&duplicate).await,
        Err(PersistError::InvalidState(_))
    ));
    assert!(!session.contains(&duplicate));
    assert!(!session.is_dirty().unwrap());
}

#[tokio::test]
async fn test_assigned_id_is_required() {
    let factory = factory().await;
    let mut session = factory.open_session().unwrap();

    let item = EntityHandle::new(Sku {
        id: None,
        version: 0,
        title: "Nameless".into(),
    });
    assert!(matches!(
        session.save(&item).await,
        Err(PersistError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_closed_session_rejects_operations() {
    let factory = factory().await;
    let mut session = factory.open_session().unwrap();
    session.close().await.unwrap();

    assert!(!session.is_open());
    assert!(matches!(
        session.get::<Invoice>(1).await,
        Err(PersistError::IllegalState(_))
    ));
    assert!(matches!(session.flush().await, Err(PersistError::IllegalState(_))));
    assert!(matches!(session.close().await, Err(PersistError::IllegalState(_))));
    assert_eq!(factory.statistics().sessions_closed, 1);
}

#[tokio::test]
async fn test_auto_flush_before_query_only_for_touched_type() {
    let factory = factory().await;
    let ids = seed_invoices(&factory, &[("INV-1", 10)]).await;

    let mut session = factory.open_session().unwrap();
    let tracked = session.get::<Invoice>(ids[0].clone()).await.unwrap().unwrap();
    tracked.write().amount = 90;

    let query = session
        .create_filter(std::slice::from_ref(&tracked), "where this.amount > 50")
        .unwrap();
    let results = query.list(&mut session).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].same_instance(&tracked));
    assert!(!session.is_dirty().unwrap());
}
