use sqlx::Executor;

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

/// Canonical seed contract: one conversation per lifecycle phase the agent
/// has to handle in local development.
const SEED_SCENARIOS: &[SeedScenarioContract] = &[
    SeedScenarioContract {
        scenario: "awaiting_response",
        conversation_id: "conv-seed-001",
        conversation_status: "awaiting_response",
        abandonment_external_id: "EXT-SEED-1001",
        abandonment_status: "pending",
        user_address: "+5511999110001",
        expected_message_count: 1,
        description: "Opening sent, customer has not replied yet",
    },
    SeedScenarioContract {
        scenario: "active",
        conversation_id: "conv-seed-002",
        conversation_status: "active",
        abandonment_external_id: "EXT-SEED-1002",
        abandonment_status: "pending",
        user_address: "+5511999110002",
        expected_message_count: 3,
        description: "Customer replied, dialogue in progress",
    },
    SeedScenarioContract {
        scenario: "closed_converted",
        conversation_id: "conv-seed-003",
        conversation_status: "closed",
        abandonment_external_id: "EXT-SEED-1003",
        abandonment_status: "converted",
        user_address: "+5511999110003",
        expected_message_count: 2,
        description: "Payment reconciled, conversation closed as converted",
    },
];

const SEED_COMPLETED_JOB_ID: &str = "job-seed-001";

/// Deterministic local-development dataset covering the three conversation
/// phases plus one settled delivery job for the ops view.
pub struct SeedDataset;

impl SeedDataset {
    /// SQL fixture content for the seed dataset.
    pub const SQL: &str = include_str!("../../../config/fixtures/seed_data.sql");

    /// Load the seed dataset into the database. Safe to run repeatedly.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;

        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        let scenarios_seeded = SEED_SCENARIOS
            .iter()
            .map(|scenario| ScenarioSeedInfo {
                scenario: scenario.scenario,
                conversation_id: scenario.conversation_id,
                description: scenario.description,
            })
            .collect::<Vec<_>>();

        Ok(SeedResult { scenarios_seeded })
    }

    /// Verify that the seed data exists and matches the contract.
    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        for scenario in SEED_SCENARIOS {
            let user_exists: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM users WHERE address = ?1 AND opted_out = 0)",
            )
            .bind(scenario.user_address)
            .fetch_one(pool)
            .await?;
            checks.push((scenario.user_label(), user_exists == 1));

            let abandonment_ok: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM abandonments WHERE external_id = ?1 AND status = ?2)",
            )
            .bind(scenario.abandonment_external_id)
            .bind(scenario.abandonment_status)
            .fetch_one(pool)
            .await?;
            checks.push((scenario.abandonment_label(), abandonment_ok == 1));

            let conversation_ok: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1 AND status = ?2)",
            )
            .bind(scenario.conversation_id)
            .bind(scenario.conversation_status)
            .fetch_one(pool)
            .await?;
            checks.push((scenario.conversation_label(), conversation_ok == 1));

            let message_count: i64 =
                sqlx::query_scalar("SELECT COUNT(1) FROM messages WHERE conversation_id = ?1")
                    .bind(scenario.conversation_id)
                    .fetch_one(pool)
                    .await?;
            checks.push((
                scenario.message_count_label(),
                message_count == scenario.expected_message_count,
            ));

            let counter_matches: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1 AND message_count = ?2)",
            )
            .bind(scenario.conversation_id)
            .bind(scenario.expected_message_count)
            .fetch_one(pool)
            .await?;
            checks.push((scenario.counter_label(), counter_matches == 1));
        }

        let settled_job: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM queue_jobs WHERE id = ?1 AND state = 'completed')",
        )
        .bind(SEED_COMPLETED_JOB_ID)
        .fetch_one(pool)
        .await?;
        checks.push(("completed delivery job", settled_job == 1));

        let all_present = checks.iter().all(|(_, exists)| *exists);
        Ok(VerificationResult { all_present, checks })
    }
}

struct SeedScenarioContract {
    scenario: &'static str,
    conversation_id: &'static str,
    conversation_status: &'static str,
    abandonment_external_id: &'static str,
    abandonment_status: &'static str,
    user_address: &'static str,
    expected_message_count: i64,
    description: &'static str,
}

impl SeedScenarioContract {
    fn user_label(&self) -> &'static str {
        match self.scenario {
            "awaiting_response" => "awaiting_response user",
            "active" => "active user",
            _ => "closed_converted user",
        }
    }

    fn abandonment_label(&self) -> &'static str {
        match self.scenario {
            "awaiting_response" => "awaiting_response abandonment",
            "active" => "active abandonment",
            _ => "closed_converted abandonment",
        }
    }

    fn conversation_label(&self) -> &'static str {
        match self.scenario {
            "awaiting_response" => "awaiting_response conversation",
            "active" => "active conversation",
            _ => "closed_converted conversation",
        }
    }

    fn message_count_label(&self) -> &'static str {
        match self.scenario {
            "awaiting_response" => "awaiting_response message rows",
            "active" => "active message rows",
            _ => "closed_converted message rows",
        }
    }

    fn counter_label(&self) -> &'static str {
        match self.scenario {
            "awaiting_response" => "awaiting_response message counter",
            "active" => "active message counter",
            _ => "closed_converted message counter",
        }
    }
}

#[derive(Debug)]
pub struct SeedResult {
    pub scenarios_seeded: Vec<ScenarioSeedInfo>,
}

#[derive(Debug)]
pub struct ScenarioSeedInfo {
    pub scenario: &'static str,
    pub conversation_id: &'static str,
    pub description: &'static str,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
