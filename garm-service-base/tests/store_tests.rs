use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use garm_common::config::DbSqliteConfig;
use garm_common::model::{
    CredentialsId, Entity, EntityId, EntityKind, EventLevel, ForgeAuth, ForgeCredentials,
    ForgeEndpoint, Instance, InstanceId, InstanceStatus, Job, JobId, JobStatus, OsArch, OsType,
    PatAuth, Pool, PoolBalancerType, PoolId, PoolManagerStatus, RunnerStatus, ScaleSet,
    ScaleSetId,
};
use garm_service_base::db;
use garm_service_base::repo::instance::UpdateInstanceParams;
use garm_service_base::store::Store;
use garm_service_base::watcher::{ChangeOperation, ChangePayload};

use test_r::test;

test_r::enable!();

struct TestStore {
    _dir: tempfile::TempDir,
    store: Store,
}

async fn test_store() -> TestStore {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_config = DbSqliteConfig {
        database: dir.path().join("garm.db").to_string_lossy().into_owned(),
        max_connections: 5,
        foreign_keys: true,
    };
    db::sqlite_migrate(&db_config).await.expect("migrations");
    let pool = db::create_sqlite_pool(&db_config).await.expect("db pool");
    TestStore {
        _dir: dir,
        store: Store::sqlite(Arc::new(pool)).with_event_ring_size(5),
    }
}

async fn seed_entity(store: &Store) -> Entity {
    let endpoint = ForgeEndpoint::github();
    store.upsert_endpoint(&endpoint).await.unwrap();

    let credentials = ForgeCredentials {
        id: CredentialsId::new_v4(),
        name: "pat".to_string(),
        endpoint: endpoint.clone(),
        auth: ForgeAuth::Pat(PatAuth {
            token: "token".to_string(),
        }),
    };
    store.upsert_credentials(&credentials).await.unwrap();

    let entity = Entity {
        id: EntityId::new_v4(),
        kind: EntityKind::Repository,
        name: "acme/widgets".to_string(),
        endpoint_name: endpoint.name,
        credentials_id: credentials.id,
        webhook_secret: "secret".to_string(),
        pool_balancer_type: PoolBalancerType::Pack,
        status: PoolManagerStatus::default(),
        created_at: Utc::now(),
    };
    store.create_entity(&entity).await.unwrap();
    entity
}

fn make_pool(entity_id: EntityId) -> Pool {
    let now = Utc::now();
    Pool {
        id: PoolId::new_v4(),
        entity_id,
        provider_name: "lxd".to_string(),
        image: "ubuntu:22.04".to_string(),
        flavor: "default".to_string(),
        os_type: OsType::Linux,
        os_arch: OsArch::Amd64,
        tags: vec!["gpu".to_string()],
        min_idle_runners: 1,
        max_runners: 3,
        runner_bootstrap_timeout: 20,
        runner_prefix: "garm".to_string(),
        enabled: true,
        github_runner_group: None,
        extra_specs: Some(serde_json::json!({"disk": 20})),
        priority: 10,
        disable_jit_config: false,
        created_at: now,
        updated_at: now,
    }
}

fn make_instance(pool_id: PoolId, name: &str) -> Instance {
    let now = Utc::now();
    Instance {
        id: InstanceId::new_v4(),
        name: name.to_string(),
        provider_id: None,
        pool_id: Some(pool_id),
        scale_set_id: None,
        os_type: OsType::Linux,
        os_arch: OsArch::Amd64,
        status: InstanceStatus::PendingCreate,
        runner_status: RunnerStatus::Pending,
        create_attempt: 1,
        agent_id: None,
        token_fetched: false,
        jit_configuration: None,
        addresses: vec![],
        heartbeat: None,
        status_events: vec![],
        created_at: now,
        updated_at: now,
    }
}

fn make_scale_set(entity_id: EntityId) -> ScaleSet {
    let now = Utc::now();
    ScaleSet {
        id: ScaleSetId::new_v4(),
        scale_set_id: 3,
        name: "ci".to_string(),
        entity_id,
        provider_name: "lxd".to_string(),
        image: "ubuntu:22.04".to_string(),
        flavor: "default".to_string(),
        os_type: OsType::Linux,
        os_arch: OsArch::Amd64,
        min_runners: 0,
        max_runners: 5,
        runner_bootstrap_timeout: 20,
        runner_prefix: "garm-ss".to_string(),
        enabled: true,
        github_runner_group: None,
        extra_specs: None,
        desired_runner_count: 0,
        last_message_id: 0,
        created_at: now,
        updated_at: now,
    }
}

#[test]
async fn pool_round_trips_through_the_store() {
    let t = test_store().await;
    let entity = seed_entity(&t.store).await;
    let pool = make_pool(entity.id);
    t.store.create_pool(&pool).await.unwrap();

    let loaded = t.store.get_pool(pool.id).await.unwrap();
    assert_eq!(loaded.tags, pool.tags);
    assert_eq!(loaded.extra_specs, pool.extra_specs);
    assert_eq!(loaded.priority, 10);
    assert_eq!(loaded.os_type, OsType::Linux);
}

#[test]
async fn instance_updates_are_validated_and_return_the_post_image() {
    let t = test_store().await;
    let entity = seed_entity(&t.store).await;
    let pool = make_pool(entity.id);
    t.store.create_pool(&pool).await.unwrap();

    let instance = make_instance(pool.id, "garm-a1b2c3");
    t.store.create_instance(&instance).await.unwrap();

    let updated = t
        .store
        .update_instance(
            instance.id,
            UpdateInstanceParams {
                status: Some(InstanceStatus::Creating),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.status, InstanceStatus::Creating);

    // deleted straight from creating is rejected
    let illegal = t
        .store
        .update_instance(
            instance.id,
            UpdateInstanceParams {
                status: Some(InstanceStatus::Deleted),
                ..Default::default()
            },
        )
        .await;
    assert!(illegal.is_err());

    let still = t.store.get_instance(instance.id).await.unwrap();
    assert_eq!(still.status, InstanceStatus::Creating);
}

#[test]
async fn duplicate_instance_names_are_rejected() {
    let t = test_store().await;
    let entity = seed_entity(&t.store).await;
    let pool = make_pool(entity.id);
    t.store.create_pool(&pool).await.unwrap();

    t.store
        .create_instance(&make_instance(pool.id, "garm-same"))
        .await
        .unwrap();
    let duplicate = t
        .store
        .create_instance(&make_instance(pool.id, "garm-same"))
        .await;
    assert!(duplicate.err().map(|e| e.is_duplicate()).unwrap_or(false));
}

#[test]
async fn event_ring_is_trimmed() {
    let t = test_store().await;
    let entity = seed_entity(&t.store).await;
    let pool = make_pool(entity.id);
    t.store.create_pool(&pool).await.unwrap();
    let instance = make_instance(pool.id, "garm-ring");
    t.store.create_instance(&instance).await.unwrap();

    for n in 0..12 {
        t.store
            .add_instance_event(instance.id, EventLevel::Info, &format!("event {n}"))
            .await
            .unwrap();
    }

    let loaded = t.store.get_instance(instance.id).await.unwrap();
    assert_eq!(loaded.status_events.len(), 5);
    assert_eq!(loaded.status_events[0].message, "event 7");
    assert_eq!(loaded.status_events[4].message, "event 11");
}

#[test]
async fn job_lock_is_atomic_and_conditional() {
    let t = test_store().await;
    let entity = seed_entity(&t.store).await;
    let other = EntityId::new_v4();

    let now = Utc::now();
    t.store
        .upsert_job(&Job {
            id: JobId(5),
            entity_id: entity.id,
            status: JobStatus::Queued,
            name: "build".to_string(),
            labels: vec!["self-hosted".to_string()],
            runner_name: None,
            runner_id: None,
            locked_by: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

    assert!(t.store.lock_job(JobId(5), entity.id).await.unwrap());
    // re-locking by the same entity is fine, another entity is refused
    assert!(t.store.lock_job(JobId(5), entity.id).await.unwrap());
    assert!(!t.store.lock_job(JobId(5), other).await.unwrap());

    // break-lock only applies while the job is queued
    t.store.break_lock_if_queued(JobId(5)).await.unwrap();
    assert!(t.store.lock_job(JobId(5), other).await.unwrap());
}

#[test]
async fn completed_jobs_are_garbage_collected() {
    let t = test_store().await;
    let entity = seed_entity(&t.store).await;

    let old = Utc::now() - chrono::Duration::hours(2);
    t.store
        .upsert_job(&Job {
            id: JobId(9),
            entity_id: entity.id,
            status: JobStatus::Completed,
            name: "build".to_string(),
            labels: vec![],
            runner_name: None,
            runner_id: None,
            locked_by: None,
            created_at: old,
            updated_at: old,
        })
        .await
        .unwrap();

    let removed = t
        .store
        .delete_completed_jobs_before(Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(t.store.get_job(JobId(9)).await.unwrap().is_none());
}

#[test]
async fn scale_set_cursor_only_moves_forward() {
    let t = test_store().await;
    let entity = seed_entity(&t.store).await;
    let scale_set = make_scale_set(entity.id);
    t.store.create_scale_set(&scale_set).await.unwrap();

    assert!(t
        .store
        .set_scale_set_last_message_id(scale_set.id, 7)
        .await
        .unwrap());
    assert!(t
        .store
        .set_scale_set_last_message_id(scale_set.id, 10)
        .await
        .unwrap());
    // equal or smaller values are refused
    assert!(!t
        .store
        .set_scale_set_last_message_id(scale_set.id, 10)
        .await
        .unwrap());
    assert!(!t
        .store
        .set_scale_set_last_message_id(scale_set.id, 9)
        .await
        .unwrap());

    let loaded = t.store.get_scale_set(scale_set.id).await.unwrap();
    assert_eq!(loaded.last_message_id, 10);
}

#[test]
async fn entity_deletion_is_guarded_by_ownership() {
    let t = test_store().await;
    let entity = seed_entity(&t.store).await;
    let pool = make_pool(entity.id);
    t.store.create_pool(&pool).await.unwrap();

    assert!(t.store.delete_entity(entity.id).await.is_err());

    t.store.delete_pool(pool.id).await.unwrap();
    t.store.delete_entity(entity.id).await.unwrap();
}

#[test]
async fn pool_deletion_is_guarded_by_live_instances() {
    let t = test_store().await;
    let entity = seed_entity(&t.store).await;
    let pool = make_pool(entity.id);
    t.store.create_pool(&pool).await.unwrap();
    let instance = make_instance(pool.id, "garm-live");
    t.store.create_instance(&instance).await.unwrap();

    assert!(t.store.delete_pool(pool.id).await.is_err());

    t.store.delete_instance_by_name("garm-live").await.unwrap();
    t.store.delete_pool(pool.id).await.unwrap();
}

#[test]
async fn jit_configuration_round_trips() {
    let t = test_store().await;
    let entity = seed_entity(&t.store).await;
    let pool = make_pool(entity.id);
    t.store.create_pool(&pool).await.unwrap();
    let instance = make_instance(pool.id, "garm-jit");
    t.store.create_instance(&instance).await.unwrap();

    let jit = HashMap::from([(".runner".to_string(), "eyJ0ZXN0IjoxfQ==".to_string())]);
    let updated = t
        .store
        .update_instance(
            instance.id,
            UpdateInstanceParams {
                jit_configuration: Some(jit.clone()),
                agent_id: Some(1234),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.jit_configuration, Some(jit));
    assert_eq!(updated.agent_id, Some(1234));

    let by_agent = t
        .store
        .get_instance_by_agent_id(1234)
        .await
        .unwrap()
        .expect("instance by agent id");
    assert_eq!(by_agent.id, instance.id);
}

#[test]
async fn store_mutations_are_published_to_watchers() {
    let t = test_store().await;
    let mut changes = t.store.subscribe();

    let entity = seed_entity(&t.store).await;

    // credentials create, then entity create
    let first = changes.recv().await.unwrap();
    assert!(matches!(first.payload, ChangePayload::Credentials(_)));
    assert_eq!(first.operation, ChangeOperation::Create);

    let second = changes.recv().await.unwrap();
    match second.payload {
        ChangePayload::Entity(ref seen) => assert_eq!(seen.id, entity.id),
        other => panic!("unexpected change payload: {other:?}"),
    }
}
