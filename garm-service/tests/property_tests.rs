use chrono::Utc;
use garm_common::config::RetryConfig;
use garm_common::model::{
    Instance, InstanceId, InstanceStatus, OsArch, OsType, Pool, PoolId, RunnerStatus,
};
use garm_service::auth::{check_instance_freshness, InstanceClaims, TokenScope};
use proptest::prelude::*;
use std::time::Duration;

fn any_instance_status() -> impl Strategy<Value = InstanceStatus> {
    prop_oneof![
        Just(InstanceStatus::PendingCreate),
        Just(InstanceStatus::Creating),
        Just(InstanceStatus::Running),
        Just(InstanceStatus::PendingDelete),
        Just(InstanceStatus::Deleting),
        Just(InstanceStatus::Deleted),
        Just(InstanceStatus::Failed),
    ]
}

fn any_runner_status() -> impl Strategy<Value = RunnerStatus> {
    prop_oneof![
        Just(RunnerStatus::Pending),
        Just(RunnerStatus::Installing),
        Just(RunnerStatus::Idle),
        Just(RunnerStatus::Active),
        Just(RunnerStatus::Terminated),
        Just(RunnerStatus::Failed),
    ]
}

fn test_instance(status: InstanceStatus, runner_status: RunnerStatus, attempt: u32) -> Instance {
    let now = Utc::now();
    Instance {
        id: InstanceId::new_v4(),
        name: "garm-proptest".to_string(),
        provider_id: None,
        pool_id: Some(PoolId::new_v4()),
        scale_set_id: None,
        os_type: OsType::Linux,
        os_arch: OsArch::Amd64,
        status,
        runner_status,
        create_attempt: attempt,
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

fn claims(attempt: u32) -> InstanceClaims {
    InstanceClaims {
        instance_id: InstanceId::new_v4().to_string(),
        instance_name: "garm-proptest".to_string(),
        pool_id: Some(PoolId::new_v4().to_string()),
        scope: TokenScope::Pool,
        entity_id: uuid::Uuid::new_v4().to_string(),
        forge_type: garm_common::model::ForgeType::Github,
        is_agent: true,
        create_attempt: attempt,
        exp: (Utc::now().timestamp() as u64) + 3600,
        iss: "garm".to_string(),
    }
}

proptest! {
    /// Any sequence of accepted transitions is a path in the state graph:
    /// `deleted` is only ever entered from `deleting`, and nothing leaves a
    /// deleted instance.
    #[test]
    fn instance_status_walks_are_valid(targets in proptest::collection::vec(any_instance_status(), 1..32)) {
        let mut current = InstanceStatus::PendingCreate;
        for target in targets {
            match current.transition(target) {
                Ok(next) => {
                    if next == InstanceStatus::Deleted && current != InstanceStatus::Deleted {
                        prop_assert_eq!(current, InstanceStatus::Deleting);
                    }
                    current = next;
                }
                Err(_) => {
                    // rejected moves leave the state untouched
                }
            }
            if current == InstanceStatus::Deleted {
                for probe in [
                    InstanceStatus::PendingCreate,
                    InstanceStatus::Creating,
                    InstanceStatus::Running,
                    InstanceStatus::PendingDelete,
                    InstanceStatus::Deleting,
                    InstanceStatus::Failed,
                ] {
                    prop_assert!(!current.can_transition_to(probe));
                }
            }
        }
    }

    /// Runner status only moves forward; the only exception is the failure
    /// edge out of non-terminal states.
    #[test]
    fn runner_status_progress_is_monotonic(a in any_runner_status(), b in any_runner_status()) {
        fn rank(status: RunnerStatus) -> u8 {
            match status {
                RunnerStatus::Pending => 0,
                RunnerStatus::Installing => 1,
                RunnerStatus::Idle => 2,
                RunnerStatus::Active => 3,
                RunnerStatus::Terminated => 4,
                RunnerStatus::Failed => 5,
            }
        }
        if a.can_transition_to(b) {
            prop_assert!(!a.is_terminal());
            prop_assert!(b == RunnerStatus::Failed || rank(b) > rank(a));
        }
    }

    /// A credential verifies only while the attempt matches, the instance is
    /// running and the runner has not been used.
    #[test]
    fn token_freshness_matches_the_rules(
        status in any_instance_status(),
        runner_status in any_runner_status(),
        instance_attempt in 1u32..5,
        token_attempt in 1u32..5,
    ) {
        let instance = test_instance(status, runner_status, instance_attempt);
        let result = check_instance_freshness(&claims(token_attempt), &instance);
        let should_pass = token_attempt == instance_attempt
            && status == InstanceStatus::Running
            && !runner_status.refuses_credentials();
        prop_assert_eq!(result.is_ok(), should_pass);
    }

    /// Back-off delays never decrease with the attempt number and never
    /// exceed the configured maximum.
    #[test]
    fn retry_delays_are_monotonic_and_capped(
        max_attempts in 1u32..20,
        min_delay_ms in 1u64..5_000,
        max_delay_ms in 5_000u64..60_000,
        multiplier in 1.0f64..4.0,
        attempt in 1u32..25,
    ) {
        let config = RetryConfig {
            max_attempts,
            min_delay: Duration::from_millis(min_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            multiplier,
            max_jitter_factor: None,
        };
        let delay = config.delay_for_attempt(attempt);
        let next = config.delay_for_attempt(attempt + 1);
        prop_assert!(delay <= config.max_delay);
        prop_assert!(next >= delay);
    }

    /// Pool label matching: the pool's own tags together with the system
    /// labels cover every matching job, and any label outside that set
    /// breaks the match.
    #[test]
    fn label_matching_is_exactly_coverage(
        tags in proptest::collection::vec("[a-z]{3,8}", 1..5),
        extra in "[a-z]{9,12}",
    ) {
        // a tag that happens to spell the os would satisfy the os check
        prop_assume!(!tags.iter().any(|t| t == "linux"));

        let now = Utc::now();
        let pool = Pool {
            id: PoolId::new_v4(),
            entity_id: garm_common::model::EntityId::new_v4(),
            provider_name: "mock".to_string(),
            image: "ubuntu".to_string(),
            flavor: "default".to_string(),
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
            tags: tags.clone(),
            min_idle_runners: 0,
            max_runners: 1,
            runner_bootstrap_timeout: 20,
            runner_prefix: "garm".to_string(),
            enabled: true,
            github_runner_group: None,
            extra_specs: None,
            priority: 0,
            disable_jit_config: false,
            created_at: now,
            updated_at: now,
        };

        // system labels present and all tags covered
        let mut job: Vec<String> = tags.clone();
        job.push("self-hosted".to_string());
        job.push("linux".to_string());
        job.push("x64".to_string());
        prop_assert!(pool.matches_labels(&job));

        // omitting the os or arch label breaks the match even though the
        // coverage check would be satisfied
        let mut no_arch: Vec<String> = tags.clone();
        no_arch.push("self-hosted".to_string());
        no_arch.push("linux".to_string());
        prop_assert!(!pool.matches_labels(&no_arch));

        let mut no_os: Vec<String> = tags.clone();
        no_os.push("self-hosted".to_string());
        no_os.push("x64".to_string());
        prop_assert!(!pool.matches_labels(&no_os));

        let mut bare: Vec<String> = tags.clone();
        bare.push("self-hosted".to_string());
        prop_assert!(!pool.matches_labels(&bare));

        // the extra label is longer than any tag, so it cannot collide
        job.push(extra);
        prop_assert!(!pool.matches_labels(&job));
    }
}
