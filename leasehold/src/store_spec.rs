//! Shared test specifications for LeaseStore implementations.
//!
//! Every backend runs the same elections against a real database so that the
//! engine-specific SQL and error mapping are checked the same way everywhere.

use std::sync::Arc;
use std::time::Duration;

use crate::core::config::ElectorOptions;
use crate::core::election::{ElectionEngine, PreFlightError};
use crate::core::event::{EventSubscription, EventType};
use crate::core::lease_row::NO_LEADER_CANDIDATE_ID;
use crate::core::schema::verify_columns;
use crate::core::store::LeaseStore;

/// Generate all store spec test wrappers for a backend.
///
/// # Usage
///
/// ```ignore
/// // PostgreSQL example with sqlx::test
/// leasehold::generate_store_spec_tests! {
///     backend = "pg",
///     test_attr = sqlx::test,
///     setup = |pool: PgPool| PostgresLeaseStore::with_pool(pool)
/// }
///
/// // Tests that need a server nobody starts by default
/// leasehold::generate_store_spec_tests! {
///     backend = "mysql",
///     test_attr = sqlx::test,
///     extra_attr = ignore,
///     setup = |pool: MySqlPool| MySqlLeaseStore::with_pool(pool)
/// }
/// ```
#[macro_export]
macro_rules! generate_store_spec_tests {
    (
        backend = $backend:literal,
        test_attr = $test_attr:meta,
        $(extra_attr = $extra_attr:meta,)?
        setup = |$pool:ident: $pool_type:ty| $setup_expr:expr
    ) => {
        paste::paste! {
            #[$test_attr]
            $(#[$extra_attr])?
            async fn [<prepare_creates_table_and_row_ $backend>]($pool: $pool_type) {
                let store = $setup_expr;
                $crate::store_spec::test_prepare_creates_table_and_row(store).await;
            }

            #[$test_attr]
            $(#[$extra_attr])?
            async fn [<prepare_is_repeatable_ $backend>]($pool: $pool_type) {
                let store = $setup_expr;
                $crate::store_spec::test_prepare_is_repeatable(store).await;
            }

            #[$test_attr]
            $(#[$extra_attr])?
            async fn [<prepare_requires_table_ $backend>]($pool: $pool_type) {
                let store = $setup_expr;
                $crate::store_spec::test_prepare_requires_table(store).await;
            }

            #[$test_attr]
            $(#[$extra_attr])?
            async fn [<server_info_detects_engine_ $backend>]($pool: $pool_type) {
                let store = $setup_expr;
                $crate::store_spec::test_server_info_detects_engine(store).await;
            }

            #[$test_attr]
            $(#[$extra_attr])?
            async fn [<single_candidate_assumes_and_confirms_ $backend>]($pool: $pool_type) {
                let store = $setup_expr;
                $crate::store_spec::test_single_candidate_assumes_and_confirms(store).await;
            }

            #[$test_attr]
            $(#[$extra_attr])?
            async fn [<other_candidate_sees_noop_ $backend>]($pool: $pool_type) {
                let store = $setup_expr;
                $crate::store_spec::test_other_candidate_sees_noop(store).await;
            }

            #[$test_attr]
            $(#[$extra_attr])?
            async fn [<relinquish_lets_other_candidate_take_over_ $backend>]($pool: $pool_type) {
                let store = $setup_expr;
                $crate::store_spec::test_relinquish_lets_other_candidate_take_over(store).await;
            }

            #[$test_attr]
            $(#[$extra_attr])?
            async fn [<expired_lease_is_taken_over_ $backend>]($pool: $pool_type) {
                let store = $setup_expr;
                $crate::store_spec::test_expired_lease_is_taken_over(store).await;
            }

            #[$test_attr]
            $(#[$extra_attr])?
            async fn [<roles_are_independent_ $backend>]($pool: $pool_type) {
                let store = $setup_expr;
                $crate::store_spec::test_roles_are_independent(store).await;
            }

            #[$test_attr]
            $(#[$extra_attr])?
            async fn [<concurrent_candidates_elect_one_leader_ $backend>]($pool: $pool_type) {
                let store = $setup_expr;
                $crate::store_spec::test_concurrent_candidates_elect_one_leader(store).await;
            }
        }
    };
}

const ROLE: &str = "spec-role";

fn options(candidate_id: &str) -> ElectorOptions {
    ElectorOptions::new()
        .with_role_id(ROLE)
        .with_candidate_id(candidate_id)
        .with_interval(Duration::from_millis(200))
        .with_assume_dead(Duration::from_millis(600))
        .with_query_timeout(Duration::from_secs(5))
        .with_create_table(true)
        .with_subscription(EventSubscription::all())
}

async fn candidate<S: LeaseStore>(store: &Arc<S>, candidate_id: &str) -> ElectionEngine<S> {
    ElectionEngine::prepare(store.clone(), &options(candidate_id))
        .await
        .expect("pre-flight failed")
}

pub async fn test_prepare_creates_table_and_row<S: LeaseStore>(store: S) {
    let store = Arc::new(store);
    let table = options("a").table();
    assert!(store.table_columns(&table).await.unwrap().is_empty());

    let engine = candidate(&store, "a").await;

    let columns = store.table_columns(&table).await.unwrap();
    assert_eq!(columns.len(), 4);
    verify_columns(&columns).unwrap();
    assert_eq!(engine.role_id(), ROLE);
    assert!(!engine.is_leader());
}

pub async fn test_prepare_is_repeatable<S: LeaseStore>(store: S) {
    let store = Arc::new(store);
    let mut first = candidate(&store, "a").await;
    assert_eq!(
        first.elect(false).await.event_type(),
        EventType::LeadershipAssumed
    );

    // A second start must neither fail on the existing table nor reset the row.
    let mut second = candidate(&store, "b").await;
    let event = second.elect(false).await;
    assert_eq!(event.event_type(), EventType::LeadershipNoop);
    assert_eq!(event.candidate_id(), Some("a"));
}

pub async fn test_prepare_requires_table<S: LeaseStore>(store: S) {
    let result = ElectionEngine::prepare(Arc::new(store), &options("a").with_create_table(false)).await;
    assert!(matches!(result, Err(PreFlightError::MissingTable(_))));
}

pub async fn test_server_info_detects_engine<S: LeaseStore>(store: S) {
    let store = Arc::new(store);
    let info = store.server_info().await.unwrap();
    assert!(!info.product_name.is_empty());
    assert!(!info.version.is_empty());

    let engine = candidate(&store, "a").await;
    assert_eq!(
        crate::core::dialect::DatabaseEngine::detect(&info).unwrap(),
        engine.database_engine()
    );
}

pub async fn test_single_candidate_assumes_and_confirms<S: LeaseStore>(store: S) {
    let store = Arc::new(store);
    let mut engine = candidate(&store, "a").await;

    let assumed = engine.elect(false).await;
    assert_eq!(assumed.event_type(), EventType::LeadershipAssumed, "{}", assumed);
    assert_eq!(assumed.candidate_id(), Some(NO_LEADER_CANDIDATE_ID));
    assert_eq!(assumed.lease_counter(), Some(1));
    assert!(engine.is_leader());

    for _ in 0..3 {
        let confirmed = engine.elect(false).await;
        assert_eq!(confirmed.event_type(), EventType::LeadershipConfirmed, "{}", confirmed);
        assert_eq!(confirmed.candidate_id(), Some("a"));
        assert_eq!(confirmed.lease_counter(), Some(1));
    }
    assert!(engine.is_leader());
}

pub async fn test_other_candidate_sees_noop<S: LeaseStore>(store: S) {
    let store = Arc::new(store);
    let mut a = candidate(&store, "a").await;
    let mut b = candidate(&store, "b").await;

    assert_eq!(a.elect(false).await.event_type(), EventType::LeadershipAssumed);
    let noop = b.elect(false).await;

    assert_eq!(noop.event_type(), EventType::LeadershipNoop, "{}", noop);
    assert_eq!(noop.candidate_id(), Some("a"));
    assert!(noop.last_seen().is_some());
    assert!(!b.is_leader());
}

pub async fn test_relinquish_lets_other_candidate_take_over<S: LeaseStore>(store: S) {
    let store = Arc::new(store);
    let mut a = candidate(&store, "a").await;
    let mut b = candidate(&store, "b").await;
    assert_eq!(a.elect(false).await.event_type(), EventType::LeadershipAssumed);

    let lost = a.elect(true).await;
    assert_eq!(lost.event_type(), EventType::LeadershipLost, "{}", lost);
    assert!(!lost.has_errors());
    assert!(!a.is_leader());

    // The one that just gave up does not grab it back right away.
    assert_eq!(a.elect(false).await.event_type(), EventType::LeadershipNoop);

    let assumed = b.elect(false).await;
    assert_eq!(assumed.event_type(), EventType::LeadershipAssumed, "{}", assumed);
    assert_eq!(assumed.candidate_id(), Some(NO_LEADER_CANDIDATE_ID));
    assert_eq!(assumed.lease_counter(), Some(2));
    assert!(b.is_leader());
}

pub async fn test_expired_lease_is_taken_over<S: LeaseStore>(store: S) {
    let store = Arc::new(store);
    let mut a = candidate(&store, "a").await;
    let mut b = candidate(&store, "b").await;
    assert_eq!(a.elect(false).await.event_type(), EventType::LeadershipAssumed);
    assert_eq!(b.elect(false).await.event_type(), EventType::LeadershipNoop);

    // "a" stops renewing.
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    let assumed = b.elect(false).await;
    assert_eq!(assumed.event_type(), EventType::LeadershipAssumed, "{}", assumed);
    assert_eq!(assumed.candidate_id(), Some("a"));
    assert_eq!(assumed.lease_counter(), Some(2));

    let stolen = a.elect(false).await;
    assert_eq!(stolen.event_type(), EventType::LeadershipLost, "{}", stolen);
    assert!(stolen.has_errors());
    assert!(!a.is_leader());
}

pub async fn test_roles_are_independent<S: LeaseStore>(store: S) {
    let store = Arc::new(store);
    let mut a = candidate(&store, "a").await;
    let mut b = ElectionEngine::prepare(store.clone(), &options("b").with_role_id("other-role"))
        .await
        .unwrap();

    assert_eq!(a.elect(false).await.event_type(), EventType::LeadershipAssumed);
    assert_eq!(b.elect(false).await.event_type(), EventType::LeadershipAssumed);
    assert!(a.is_leader() && b.is_leader());
}

pub async fn test_concurrent_candidates_elect_one_leader<S: LeaseStore>(store: S) {
    let store = Arc::new(store);
    let mut handles = Vec::new();
    for i in 0..5 {
        let mut engine = candidate(&store, &format!("candidate-{}", i)).await;
        handles.push(tokio::spawn(async move { engine.elect(false).await }));
    }

    let mut assumed = 0;
    for handle in handles {
        let event = handle.await.unwrap();
        assert!(!event.is_non_recoverable_error(), "{}", event);
        if event.event_type() == EventType::LeadershipAssumed {
            assumed += 1;
        }
    }
    assert_eq!(assumed, 1);
}
