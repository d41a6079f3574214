//! Guards the local-development seed dataset: the SQL fixture, the scenario
//! contract embedded in `winback_db::fixtures`, and the loaded rows must
//! stay in sync or `winback seed` starts lying to whoever runs it.

use winback_db::{connect_with_settings, migrations, DbPool, SeedDataset};

const SEED_CONVERSATIONS: &[&str] = &["conv-seed-001", "conv-seed-002", "conv-seed-003"];
const SEED_EXTERNAL_IDS: &[&str] = &["EXT-SEED-1001", "EXT-SEED-1002", "EXT-SEED-1003"];
const SEED_ADDRESSES: &[&str] = &["+5511999110001", "+5511999110002", "+5511999110003"];

async fn setup_pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30)
        .await
        .expect("in-memory pool");
    migrations::run_pending(&pool).await.expect("migrations apply");
    pool
}

async fn count_rows(pool: &DbPool, table: &str) -> i64 {
    let query = format!("SELECT COUNT(*) AS total FROM {table}");
    sqlx::query_scalar(&query).fetch_one(pool).await.expect("count query")
}

#[test]
fn seed_sql_fixture_covers_every_contract_scenario() {
    for conversation_id in SEED_CONVERSATIONS {
        assert!(
            SeedDataset::SQL.contains(&format!("'{conversation_id}'")),
            "seed SQL should insert {conversation_id}"
        );
    }
    for external_id in SEED_EXTERNAL_IDS {
        assert!(
            SeedDataset::SQL.contains(&format!("'{external_id}'")),
            "seed SQL should insert abandonment {external_id}"
        );
    }
    for address in SEED_ADDRESSES {
        assert!(
            SeedDataset::SQL.contains(&format!("'{address}'")),
            "seed SQL should insert a user at {address}"
        );
    }
    assert!(
        SeedDataset::SQL.contains("'job-seed-001'"),
        "seed SQL should insert the settled delivery job"
    );
}

#[tokio::test]
async fn seed_load_reports_every_scenario_and_verifies_clean() {
    let pool = setup_pool().await;

    let result = SeedDataset::load(&pool).await.expect("seed load");
    let seeded: Vec<&str> =
        result.scenarios_seeded.iter().map(|info| info.conversation_id).collect();
    assert_eq!(seeded, SEED_CONVERSATIONS);

    let verification = SeedDataset::verify(&pool).await.expect("seed verify");
    for (check, passed) in &verification.checks {
        assert!(*passed, "seed verification check failed: {check}");
    }
    assert!(verification.all_present);

    pool.close().await;
}

#[tokio::test]
async fn seed_load_is_idempotent() {
    let pool = setup_pool().await;

    SeedDataset::load(&pool).await.expect("first load");
    let users = count_rows(&pool, "users").await;
    let abandonments = count_rows(&pool, "abandonments").await;
    let conversations = count_rows(&pool, "conversations").await;
    let messages = count_rows(&pool, "messages").await;
    let jobs = count_rows(&pool, "queue_jobs").await;

    SeedDataset::load(&pool).await.expect("second load");
    assert_eq!(count_rows(&pool, "users").await, users);
    assert_eq!(count_rows(&pool, "abandonments").await, abandonments);
    assert_eq!(count_rows(&pool, "conversations").await, conversations);
    assert_eq!(count_rows(&pool, "messages").await, messages);
    assert_eq!(count_rows(&pool, "queue_jobs").await, jobs);

    assert!(SeedDataset::verify(&pool).await.expect("verify").all_present);

    pool.close().await;
}

#[tokio::test]
async fn seeded_active_conversation_carries_its_dialogue() {
    let pool = setup_pool().await;
    SeedDataset::load(&pool).await.expect("seed load");

    let (status, message_count): (String, i64) = sqlx::query_as(
        "SELECT status, message_count FROM conversations WHERE id = 'conv-seed-002'",
    )
    .fetch_one(&pool)
    .await
    .expect("seeded conversation");
    assert_eq!(status, "active");
    assert_eq!(message_count, 3);

    let rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM messages WHERE conversation_id = 'conv-seed-002'",
    )
    .fetch_one(&pool)
    .await
    .expect("seeded messages");
    assert_eq!(rows, 3);

    pool.close().await;
}
