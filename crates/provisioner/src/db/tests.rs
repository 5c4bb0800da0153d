use chrono::{Duration, TimeZone, Utc};

use super::*;
use crate::configuration::ConfigurationFileOverride;
use crate::testing::temp_db;

fn new_instance(id: &str, cluster_id: &str, name: &str) -> NewInstance {
    NewInstance {
        id: id.to_string(),
        cluster_id: cluster_id.to_string(),
        name: name.to_string(),
        plan_id: "nano_2_0".to_string(),
        instance_type: InstanceType::DockerCompose,
        is_provisioned: false,
        expires_at: None,
        pull_dog_pull_request_id: None,
    }
}

fn new_cluster(id: &str, user_id: Option<&str>) -> NewCluster {
    NewCluster {
        id: id.to_string(),
        user_id: user_id.map(ToString::to_string),
        name: format!("cluster-{id}"),
    }
}

#[tokio::test]
async fn initialize_runs_migrations_and_enables_wal() {
    let db = temp_db().await;
    db.ensure_wal_mode().await.expect("wal mode");
}

#[tokio::test]
async fn duplicate_cluster_insert_reports_existing_row() {
    let db = temp_db().await;
    let mut connection = db.pool().acquire().await.expect("acquire");
    let mut store = Store::new(&mut connection);

    assert!(store
        .insert_cluster(&new_cluster(DEMO_CLUSTER_ID, None))
        .await
        .expect("first insert"));
    assert!(!store
        .insert_cluster(&new_cluster(DEMO_CLUSTER_ID, None))
        .await
        .expect("second insert"));

    let cluster = store
        .get_cluster_by_id(DEMO_CLUSTER_ID)
        .await
        .expect("get cluster")
        .expect("cluster exists");
    assert_eq!(cluster.user_id, None);
}

#[tokio::test]
async fn instance_lifecycle_updates_flags_and_expiry() {
    let db = temp_db().await;
    let mut connection = db.pool().acquire().await.expect("acquire");
    let mut store = Store::new(&mut connection);

    store.ensure_user("user-1").await.expect("ensure user");
    store.ensure_user("user-1").await.expect("ensure user twice");
    assert!(store.user_exists("user-1").await.expect("exists"));

    store
        .insert_cluster(&new_cluster("cluster-1", Some("user-1")))
        .await
        .expect("insert cluster");
    store
        .insert_instance(&new_instance("instance-1", "cluster-1", "web-1"))
        .await
        .expect("insert instance");

    assert!(store
        .insert_instance(&new_instance("instance-2", "cluster-1", "web-1"))
        .await
        .is_err());

    assert!(store
        .set_instance_provisioned("web-1")
        .await
        .expect("set provisioned"));
    assert!(!store
        .set_instance_provisioned("missing")
        .await
        .expect("set provisioned on missing"));

    let expiry = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).single().expect("date");
    assert!(store
        .set_instance_expiry("web-1", Some(expiry))
        .await
        .expect("set expiry"));

    let instance = store
        .get_instance_by_name("web-1")
        .await
        .expect("get instance")
        .expect("instance exists");
    assert!(instance.is_provisioned);
    assert_eq!(instance.expires_at, Some(expiry));
    assert_eq!(instance.instance_type, InstanceType::DockerCompose);

    let expired = store
        .list_expired_instances(expiry + Duration::seconds(1))
        .await
        .expect("list expired");
    assert_eq!(expired.len(), 1);
    let expired = store
        .list_expired_instances(expiry - Duration::seconds(1))
        .await
        .expect("list expired");
    assert!(expired.is_empty());

    assert!(store
        .delete_instance_by_name("web-1")
        .await
        .expect("delete"));
    assert!(store
        .get_instance_by_name("web-1")
        .await
        .expect("get instance")
        .is_none());
}

#[tokio::test]
async fn provisioned_listing_skips_unprovisioned_instances_and_empty_clusters() {
    let db = temp_db().await;
    let mut connection = db.pool().acquire().await.expect("acquire");
    let mut store = Store::new(&mut connection);

    store.ensure_user("user-1").await.expect("ensure user");
    store
        .insert_cluster(&new_cluster("cluster-a", Some("user-1")))
        .await
        .expect("insert cluster a");
    store
        .insert_cluster(&new_cluster("cluster-b", Some("user-1")))
        .await
        .expect("insert cluster b");

    let mut provisioned = new_instance("i-1", "cluster-a", "provisioned");
    provisioned.is_provisioned = true;
    store.insert_instance(&provisioned).await.expect("insert");
    store
        .insert_instance(&new_instance("i-2", "cluster-a", "pending"))
        .await
        .expect("insert");
    store
        .insert_instance(&new_instance("i-3", "cluster-b", "pending-b"))
        .await
        .expect("insert");

    let clusters = store
        .list_provisioned_clusters_with_instances_for_user("user-1")
        .await
        .expect("list");
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].cluster.id, "cluster-a");
    assert_eq!(clusters[0].instances.len(), 1);
    assert_eq!(clusters[0].instances[0].name, "provisioned");
}

#[tokio::test]
async fn pull_dog_rows_are_unique_per_parent_and_handle() {
    let db = temp_db().await;
    let mut connection = db.pool().acquire().await.expect("acquire");
    let mut store = Store::new(&mut connection);

    store.ensure_user("user-1").await.expect("ensure user");
    store
        .insert_pull_dog_settings(&NewPullDogSettings {
            id: "settings-1".to_string(),
            user_id: "user-1".to_string(),
            plan_id: "plan".to_string(),
            pool_size: 2,
            encrypted_api_key: "secret".to_string(),
        })
        .await
        .expect("insert settings");

    let repository = NewPullDogRepository {
        id: "repo-1".to_string(),
        settings_id: "settings-1".to_string(),
        handle: "octo/app".to_string(),
        installation_id: Some(7),
    };
    assert!(store
        .insert_pull_dog_repository(&repository)
        .await
        .expect("insert repository"));
    assert!(!store
        .insert_pull_dog_repository(&NewPullDogRepository {
            id: "repo-2".to_string(),
            ..repository.clone()
        })
        .await
        .expect("insert duplicate repository"));

    let pull_request = NewPullDogPullRequest {
        id: "pr-1".to_string(),
        repository_id: "repo-1".to_string(),
        handle: "42".to_string(),
    };
    assert!(store
        .insert_pull_dog_pull_request(&pull_request)
        .await
        .expect("insert pull request"));
    assert!(!store
        .insert_pull_dog_pull_request(&NewPullDogPullRequest {
            id: "pr-2".to_string(),
            ..pull_request.clone()
        })
        .await
        .expect("insert duplicate pull request"));

    let fetched = store
        .get_pull_dog_pull_request("repo-1", "42")
        .await
        .expect("get pull request")
        .expect("pull request exists");
    assert_eq!(fetched.id, "pr-1");
    assert!(fetched.configuration_override.is_none());

    let configuration_override = ConfigurationFileOverride {
        expiry: Some(std::time::Duration::from_secs(300)),
        ..ConfigurationFileOverride::default()
    };
    assert!(store
        .set_pull_dog_configuration_override("pr-1", &configuration_override)
        .await
        .expect("set override"));

    let fetched = store
        .get_pull_dog_pull_request_by_id("pr-1")
        .await
        .expect("get pull request")
        .expect("pull request exists");
    assert_eq!(fetched.configuration_override, Some(configuration_override));

    let settings = store
        .get_pull_dog_settings_for_pull_request("pr-1")
        .await
        .expect("settings lookup")
        .expect("settings exist");
    assert_eq!(settings.id, "settings-1");
    assert_eq!(
        store
            .count_pull_dog_instances_for_settings("settings-1")
            .await
            .expect("count"),
        0
    );
}
