mod common;

use common::{emis_env, put_emis_file, TestEnv};
use feed_reader::db;
use feed_reader::model::BatchSplit;
use feed_reader::notifier::NOT_SENT;
use feed_reader::storage::ObjectStore;

const TS1: &str = "20240101120000";
const TS2: &str = "20240102120000";
const GUID_A: &str = "A1B2C3D4-0000-4000-8000-00000000000A";
const GUID_B: &str = "A1B2C3D4-0000-4000-8000-00000000000B";
const ODS_A: &str = "A12345";
const ODS_B: &str = "B67890";

async fn put_organisations(env: &TestEnv, ts: &str) {
    put_emis_file(
        &env.remote,
        1,
        "Admin_Organisation",
        ts,
        &format!(
            "OrganisationGuid,OrganisationName,ODSCode\n\
             {GUID_A},Practice A,{ODS_A}\n\
             {GUID_B},Practice B,{ODS_B}\n"
        ),
    )
    .await;
}

/// First delivery: both practices, each with a deleted patient so neither
/// looks like a full extract.
async fn put_delta_batch(env: &TestEnv) {
    put_organisations(env, TS1).await;
    put_emis_file(
        &env.remote,
        2,
        "Admin_Patient",
        TS1,
        &format!(
            "PatientGuid,OrganisationGuid,ProcessingId,Deleted\n\
             p1,{GUID_A},1,false\n\
             p2,{GUID_B},1,true\n\
             p3,{GUID_A},2,true\n"
        ),
    )
    .await;
    put_emis_file(
        &env.remote,
        3,
        "Agreements_SharingOrganisation",
        TS1,
        &format!("OrganisationGuid,IsActivated\n{GUID_A},true\n{GUID_B},true\n"),
    )
    .await;
    put_emis_file(
        &env.remote,
        4,
        "CareRecord_Observation",
        TS1,
        &format!(
            "ObservationGuid,OrganisationGuid,ProcessingId\n\
             obs-c,{GUID_A},3\n\
             obs-x,{GUID_B},1\n\
             obs-a,{GUID_A},1\n\
             obs-b,{GUID_A},2\n"
        ),
    )
    .await;
}

/// Second delivery: a clean re-extract of practice A only.
async fn put_bulk_batch(env: &TestEnv) {
    put_organisations(env, TS2).await;
    put_emis_file(
        &env.remote,
        5,
        "Admin_Patient",
        TS2,
        &format!(
            "PatientGuid,OrganisationGuid,ProcessingId,Deleted\n\
             p1,{GUID_A},4,false\n\
             p4,{GUID_A},4,false\n"
        ),
    )
    .await;
    put_emis_file(
        &env.remote,
        6,
        "Agreements_SharingOrganisation",
        TS2,
        &format!("OrganisationGuid,IsActivated\n{GUID_A},true\n"),
    )
    .await;
}

async fn splits_of(env: &TestEnv, identifier: &str) -> Vec<BatchSplit> {
    let batch = db::get_all_batches(&env.runner.pool, "EMIS001")
        .await
        .unwrap()
        .into_iter()
        .find(|b| b.batch_identifier == identifier)
        .unwrap();
    db::get_splits_for_batch(&env.runner.pool, batch.id).await.unwrap()
}

fn split_for<'a>(splits: &'a [BatchSplit], ods: &str) -> &'a BatchSplit {
    splits.iter().find(|s| s.organisation_id == ods).unwrap()
}

#[tokio::test]
async fn emis_batches_split_by_practice_and_supersede_deltas() {
    let mut env = emis_env().await;
    env.source.bulk_min_rows = 2;
    put_delta_batch(&env).await;
    put_bulk_batch(&env).await;

    let attempt = env.run().await;
    assert_eq!(attempt.error_text, None);
    assert_eq!(attempt.batches_completed, 2);

    // GUIDs resolve to ODS codes through Admin_Organisation
    let first = splits_of(&env, "2024-01-01T12.00.00").await;
    let second = splits_of(&env, "2024-01-02T12.00.00").await;
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    let a1 = split_for(&first, ODS_A);
    let b1 = split_for(&first, ODS_B);
    let a2 = split_for(&second, ODS_A);
    let b2 = split_for(&second, ODS_B);
    assert!(a1.storage_path.ends_with(GUID_A));
    assert!(!a1.is_bulk && !b1.is_bulk);
    assert!(a2.is_bulk);
    assert!(!b2.is_bulk);

    // fragments are rejoined in ProcessingId order
    let observations = env
        .runner
        .store
        .get_bytes(&format!(
            "{}/4_CareRecord_Observation_{}_{}.csv",
            a1.storage_path,
            TS1,
            common::EMIS_AGREEMENT
        ))
        .await
        .unwrap();
    let observations = String::from_utf8(observations).unwrap();
    let ids: Vec<&str> = observations
        .lines()
        .skip(1)
        .map(|l| l.split(',').next().unwrap())
        .collect();
    assert_eq!(ids, vec!["obs-a", "obs-b", "obs-c"]);

    // the reference file is copied whole into every practice
    let organisations = env
        .runner
        .store
        .get_bytes(&format!(
            "{}/1_Admin_Organisation_{}_{}.csv",
            b1.storage_path,
            TS1,
            common::EMIS_AGREEMENT
        ))
        .await
        .unwrap();
    assert_eq!(String::from_utf8(organisations).unwrap().lines().count(), 3);

    // A's delta is superseded by the pending bulk and acknowledged unsent
    let calls = env.messaging.calls().await;
    let a_calls: Vec<_> = calls.iter().filter(|c| c.organisation_id == ODS_A).collect();
    assert_eq!(a_calls.len(), 1);
    assert!(a_calls[0].is_bulk);
    assert_eq!(calls.iter().filter(|c| c.organisation_id == ODS_B).count(), 2);
    assert_eq!(attempt.splits_notified_ok, 4);

    let skipped = db::get_notifications_for_split(&env.runner.pool, a1.id).await.unwrap();
    assert_eq!(skipped.len(), 1);
    assert!(skipped[0].success);
    assert_eq!(skipped[0].inbound.as_deref(), Some(NOT_SENT));
    assert_eq!(skipped[0].outbound, None);

    let sent = db::get_notifications_for_split(&env.runner.pool, a2.id).await.unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_id, a_calls[0].message_id);
    assert!(sent[0].inbound.as_deref().unwrap().starts_with("HTTP/1.1 200"));

    for split in [a1, b1, a2, b2] {
        let refreshed = db::get_splits_for_batch(&env.runner.pool, split.batch_id)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.id == split.id)
            .unwrap();
        assert!(refreshed.have_notified, "split {}", split.id);
    }
}
