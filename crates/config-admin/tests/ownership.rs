mod common;

use std::sync::Arc;

use common::{identity, props, AllowList, Harness, RecordingHandle};
use maple_config_admin::{
    InMemoryPersistenceManager, InMemoryTargetRegistry, PersistenceManager,
};

#[tokio::test]
async fn first_target_binds_and_explicit_location_moves_config() {
    let h = Harness::start().await;
    let at_a = RecordingHandle::new();
    let at_b = RecordingHandle::new();
    h.plain("svc.Bar", identity("loc:a"), at_a.clone());
    h.plain("svc.Bar", identity("loc:b"), at_b.clone());

    let config = h.manager.create_configuration("svc.Bar", None).await.unwrap();
    h.manager.update(&config, props(1), true, None).await.unwrap();
    h.manager.sync().await;

    assert_eq!(config.bundle_location().as_deref(), Some("loc:a"));
    assert_eq!(at_a.updates().last(), Some(&("svc.Bar".to_string(), Some(1), 1)));
    assert_eq!(at_b.updates(), vec![("svc.Bar".to_string(), None, 0)]);

    h.manager
        .set_bundle_location(&config, Some("loc:b"), None)
        .await
        .unwrap();
    h.manager.sync().await;

    assert_eq!(config.revision(), 2);
    assert_eq!(config.static_location().as_deref(), Some("loc:b"));
    assert_eq!(config.dynamic_location(), None);
    assert_eq!(at_a.removals(), vec!["svc.Bar".to_string()]);
    assert_eq!(at_b.updates().last(), Some(&("svc.Bar".to_string(), Some(1), 2)));
}

#[tokio::test]
async fn multi_location_defers_to_permission_check() {
    let h = Harness::start_with(
        Arc::new(InMemoryPersistenceManager::new()),
        Some(Arc::new(AllowList(vec!["loc:a".into()]))),
    )
    .await;
    let allowed = RecordingHandle::new();
    let denied = RecordingHandle::new();
    h.plain("svc.Multi", identity("loc:a"), allowed.clone());
    h.plain("svc.Multi", identity("loc:b"), denied.clone());

    let config = h
        .manager
        .create_configuration("svc.Multi", Some("?group"))
        .await
        .unwrap();
    h.manager.update(&config, props(5), true, None).await.unwrap();
    h.manager.sync().await;

    assert_eq!(config.bundle_location().as_deref(), Some("?group"));
    assert_eq!(allowed.updates().last(), Some(&("svc.Multi".to_string(), Some(5), 1)));
    assert_eq!(denied.updates(), vec![("svc.Multi".to_string(), None, 0)]);
}

#[tokio::test]
async fn owner_removal_releases_dynamic_bindings() {
    let h = Harness::start().await;
    let handle = RecordingHandle::new();
    let target = h.plain("svc.Own", identity("loc:a"), handle.clone());

    let config = h.manager.create_configuration("svc.Own", None).await.unwrap();
    h.manager.update(&config, props(1), true, None).await.unwrap();
    h.manager.sync().await;

    let store_pid = h.manager.config().bindings.store_pid.clone();
    let bindings = h.persistence.load(&store_pid).await.unwrap().unwrap();
    assert_eq!(bindings.get_str("svc.Own"), Some("loc:a"));

    h.registry.unregister(target.id());
    h.registry.uninstall_owner("loc:a");
    h.manager.owner_removed("loc:a").await;
    h.manager.sync().await;

    assert_eq!(config.bundle_location(), None);
    let bindings = h.persistence.load(&store_pid).await.unwrap().unwrap();
    assert!(!bindings.contains_key("svc.Own"));
}

#[tokio::test]
async fn explicit_binding_survives_owner_removal() {
    let h = Harness::start().await;
    let config = h
        .manager
        .create_configuration("svc.Pinned", Some("loc:a"))
        .await
        .unwrap();
    h.manager.update(&config, props(1), true, None).await.unwrap();
    h.manager.owner_removed("loc:a").await;
    assert_eq!(config.bundle_location().as_deref(), Some("loc:a"));
}

#[tokio::test]
async fn dynamic_bindings_persist_across_restarts() {
    let persistence: Arc<dyn PersistenceManager> = Arc::new(InMemoryPersistenceManager::new());
    {
        let h = Harness::start_with(persistence.clone(), None).await;
        h.plain("svc.Kept", identity("loc:a"), RecordingHandle::new());
        let config = h.manager.create_configuration("svc.Kept", None).await.unwrap();
        h.manager.update(&config, props(1), true, None).await.unwrap();
        h.manager.sync().await;
        assert_eq!(config.bundle_location().as_deref(), Some("loc:a"));
        h.manager.shutdown().await;
    }

    let live = Arc::new(InMemoryTargetRegistry::new());
    live.install_owner("loc:a");
    let h = Harness::start_on(persistence.clone(), live, None).await;
    let config = h.manager.get_configuration("svc.Kept").await.unwrap().unwrap();
    assert_eq!(config.revision(), 1);
    assert_eq!(config.bundle_location().as_deref(), Some("loc:a"));
    h.manager.shutdown().await;

    // owner gone: pruned on start
    let h = Harness::start_with(persistence, None).await;
    let config = h.manager.get_configuration("svc.Kept").await.unwrap().unwrap();
    assert_eq!(config.bundle_location(), None);
}
