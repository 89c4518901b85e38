//! Public-surface tests: the reader trait over the in-memory store and the
//! owner-lookup retry wrapper.

use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use podtap_model::Instrumentation;
use podtap_store::{lookup_with_retry, Backoff, ClusterReader, MemReader};

fn profile(namespace: &str, name: &str) -> Instrumentation {
    Instrumentation {
        metadata: ObjectMeta {
            namespace: Some(namespace.into()),
            name: Some(name.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn listing_is_scoped_to_the_namespace_and_sorted() {
    let reader = MemReader::new()
        .with_instrumentation(profile("apps", "zeta"))
        .with_instrumentation(profile("apps", "alpha"))
        .with_instrumentation(profile("other", "beta"));

    let found = reader.instrumentations("apps").await.expect("list");
    let names: Vec<&str> = found.iter().map(|i| i.name()).collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
}

#[tokio::test]
async fn get_distinguishes_absent_from_present() {
    let reader = MemReader::new().with_instrumentation(profile("apps", "prof"));
    assert!(reader
        .instrumentation("apps", "prof")
        .await
        .expect("read")
        .is_some());
    assert!(reader
        .instrumentation("apps", "missing")
        .await
        .expect("read")
        .is_none());
}

#[tokio::test]
async fn retry_wrapper_finds_objects_through_the_trait() {
    let reader = MemReader::new().with_replica_set(ReplicaSet {
        metadata: ObjectMeta {
            namespace: Some("apps".into()),
            name: Some("web-6b7f".into()),
            ..Default::default()
        },
        ..Default::default()
    });
    let policy = Backoff {
        attempts: 1,
        ..Backoff::default()
    };

    let found = lookup_with_retry(&policy, "ReplicaSet", "apps", "web-6b7f", || {
        reader.replica_set("apps", "web-6b7f")
    })
    .await;
    assert!(found.is_some());

    let absent = lookup_with_retry(&policy, "ReplicaSet", "apps", "gone", || {
        reader.replica_set("apps", "gone")
    })
    .await;
    assert!(absent.is_none());
}
