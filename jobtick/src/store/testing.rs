//! Test suite for ensuring a correct implementation of a job store.
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use futures::future::join_all;
use serde_json::json;

use super::*;
use crate::job::{JobType, DEFAULT_MAX_RETRIES};

/// Create test suite for a [`JobStore`] implementation.
///
/// For store implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use jobtick::store::memory::InMemoryJobStore;
/// use jobtick::test_suite;
/// test_suite!(for: InMemoryJobStore::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead. For example when using `sqlx::test` you could do the following:
///
/// ```ignore
/// use jobtick::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     store: StoreImplementation::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $store:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        #[$attr]
        async fn save_and_get_by_id $args {
          let store = $store;
          $crate::store::testing::save_and_get_by_id(store).await;
        }
        #[$attr]
        async fn save_replaces_existing_record $args {
          let store = $store;
          $crate::store::testing::save_replaces_existing_record(store).await;
        }
        #[$attr]
        async fn get_by_id_not_found $args {
          let store = $store;
          $crate::store::testing::get_by_id_not_found(store).await;
        }
        #[$attr]
        async fn config_round_trips $args {
          let store = $store;
          $crate::store::testing::config_round_trips(store).await;
        }
        #[$attr]
        async fn list_active_orders_by_next_execution $args {
          let store = $store;
          $crate::store::testing::list_active_orders_by_next_execution(store).await;
        }
        #[$attr]
        async fn list_by_status_newest_first $args {
          let store = $store;
          $crate::store::testing::list_by_status_newest_first(store).await;
        }
        #[$attr]
        async fn list_all_newest_first $args {
          let store = $store;
          $crate::store::testing::list_all_newest_first(store).await;
        }
        #[$attr]
        async fn remove $args {
          let store = $store;
          $crate::store::testing::remove(store).await;
        }
        #[$attr]
        async fn remove_not_found $args {
          let store = $store;
          $crate::store::testing::remove_not_found(store).await;
        }
        #[$attr]
        async fn update_applies_transition $args {
          let store = $store;
          $crate::store::testing::update_applies_transition(store).await;
        }
        #[$attr]
        async fn update_declined_leaves_record $args {
          let store = $store;
          $crate::store::testing::update_declined_leaves_record(store).await;
        }
        #[$attr]
        async fn update_not_found $args {
          let store = $store;
          $crate::store::testing::update_not_found(store).await;
        }
        #[$attr]
        async fn concurrent_claims_admit_one $args {
          let store = $store;
          $crate::store::testing::concurrent_claims_admit_one(store).await;
        }
    };
}

pub use test_suite;

/// A job as a store would hold it, with timestamps at microsecond precision.
#[doc(hidden)]
pub fn stored_job(name: &str) -> Job {
    let now = Utc::now().trunc_subsecs(6);
    Job {
        id: JobId::new(),
        name: name.to_owned(),
        description: Some(format!("{name} description")),
        cron_expression: "*/5 * * * *".to_owned(),
        job_type: JobType::Notification,
        config: json!({"message": name}).to_string(),
        status: JobStatus::Pending,
        is_active: true,
        last_executed_at: None,
        next_execution_at: Some(now + TimeDelta::minutes(5)),
        success_count: 0,
        failure_count: 0,
        last_error: None,
        max_retries: DEFAULT_MAX_RETRIES,
        retry_count: 0,
        created_at: now,
        updated_at: now,
    }
}

fn created(job: Job, created_at: DateTime<Utc>) -> Job {
    Job { created_at, ..job }
}

fn names(jobs: &[Job]) -> Vec<&str> {
    jobs.iter().map(|job| job.name.as_str()).collect()
}

#[doc(hidden)]
pub async fn save_and_get_by_id(store: impl JobStore) {
    let job = Job {
        last_error: Some("timeout".to_owned()),
        last_executed_at: Some(Utc::now().trunc_subsecs(6)),
        success_count: 4,
        failure_count: 2,
        retry_count: 1,
        ..stored_job("report")
    };

    let saved = store.save(job.clone()).await.unwrap();
    assert!(saved.updated_at >= job.updated_at);

    let loaded = store.get_by_id(job.id).await.unwrap();
    assert_eq!(loaded, Job { updated_at: loaded.updated_at, ..job });
}

#[doc(hidden)]
pub async fn save_replaces_existing_record(store: impl JobStore) {
    let job = stored_job("report");
    store.save(job.clone()).await.unwrap();

    store
        .save(Job {
            status: JobStatus::Completed,
            success_count: 1,
            ..job.clone()
        })
        .await
        .unwrap();

    let loaded = store.get_by_id(job.id).await.unwrap();
    assert_eq!(loaded.status, JobStatus::Completed);
    assert_eq!(loaded.success_count, 1);
    assert_eq!(store.list_all().await.unwrap().len(), 1);
}

#[doc(hidden)]
pub async fn get_by_id_not_found(store: impl JobStore) {
    let id = JobId::new();

    let result = store.get_by_id(id).await;

    assert!(matches!(result, Err(StoreError::NotFound(missing)) if missing == id));
}

#[doc(hidden)]
pub async fn config_round_trips(store: impl JobStore) {
    let config = json!({
        "url": "https://example.com/hook",
        "headers": {"x-trace": "abc"},
        "data": {"nested": [1, {"deep": [true, null, 2.5]}], "empty": {}},
    });
    let job = Job {
        job_type: JobType::HttpRequest,
        config: config.to_string(),
        ..stored_job("hook")
    };
    store.save(job.clone()).await.unwrap();

    let loaded = store.get_by_id(job.id).await.unwrap();

    assert_eq!(
        serde_json::Value::Object(loaded.config_map().unwrap()),
        config
    );
}

#[doc(hidden)]
pub async fn list_active_orders_by_next_execution(store: impl JobStore) {
    let now = Utc::now().trunc_subsecs(6);
    let at = |minutes| Some(now + TimeDelta::minutes(minutes));
    for job in [
        Job {
            next_execution_at: at(10),
            ..stored_job("later")
        },
        Job {
            next_execution_at: None,
            ..stored_job("unscheduled")
        },
        Job {
            next_execution_at: at(-5),
            ..stored_job("overdue")
        },
        Job {
            next_execution_at: at(-10),
            is_active: false,
            ..stored_job("inactive")
        },
        Job {
            next_execution_at: at(1),
            status: JobStatus::Failed,
            ..stored_job("failed")
        },
    ] {
        store.save(job).await.unwrap();
    }

    let active = store.list_active().await.unwrap();

    assert_eq!(
        names(&active),
        vec!["overdue", "failed", "later", "unscheduled"]
    );
}

#[doc(hidden)]
pub async fn list_by_status_newest_first(store: impl JobStore) {
    let now = Utc::now().trunc_subsecs(6);
    for (name, status, age) in [
        ("old", JobStatus::Completed, 3),
        ("running", JobStatus::Running, 2),
        ("new", JobStatus::Completed, 1),
    ] {
        let job = Job {
            status,
            ..created(stored_job(name), now - TimeDelta::minutes(age))
        };
        store.save(job).await.unwrap();
    }

    let completed = store.list_by_status(JobStatus::Completed).await.unwrap();
    let failed = store.list_by_status(JobStatus::Failed).await.unwrap();

    assert_eq!(names(&completed), vec!["new", "old"]);
    assert!(failed.is_empty());
}

#[doc(hidden)]
pub async fn list_all_newest_first(store: impl JobStore) {
    let now = Utc::now().trunc_subsecs(6);
    for (name, age, is_active) in [("b", 2, true), ("c", 1, false), ("a", 3, true)] {
        let job = Job {
            is_active,
            ..created(stored_job(name), now - TimeDelta::minutes(age))
        };
        store.save(job).await.unwrap();
    }

    let all = store.list_all().await.unwrap();

    assert_eq!(names(&all), vec!["c", "b", "a"]);
}

#[doc(hidden)]
pub async fn remove(store: impl JobStore) {
    let job = stored_job("doomed");
    let other = stored_job("survivor");
    store.save(job.clone()).await.unwrap();
    store.save(other.clone()).await.unwrap();

    store.remove(job.id).await.unwrap();

    assert!(matches!(
        store.get_by_id(job.id).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(store.get_by_id(other.id).await.is_ok());
}

#[doc(hidden)]
pub async fn remove_not_found(store: impl JobStore) {
    assert!(matches!(
        store.remove(JobId::new()).await,
        Err(StoreError::NotFound(_))
    ));
}

#[doc(hidden)]
pub async fn update_applies_transition(store: impl JobStore) {
    let job = stored_job("claim");
    store.save(job.clone()).await.unwrap();

    let updated = store
        .update(
            job.id,
            Box::new(|job: Job| {
                Some(Job {
                    status: JobStatus::Running,
                    success_count: job.success_count + 1,
                    ..job
                })
            }),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(updated.status, JobStatus::Running);
    let loaded = store.get_by_id(job.id).await.unwrap();
    assert_eq!(loaded.status, JobStatus::Running);
    assert_eq!(loaded.success_count, 1);
}

#[doc(hidden)]
pub async fn update_declined_leaves_record(store: impl JobStore) {
    let job = stored_job("untouched");
    store.save(job.clone()).await.unwrap();

    let result = store.update(job.id, Box::new(|_: Job| None)).await.unwrap();

    assert!(result.is_none());
    let loaded = store.get_by_id(job.id).await.unwrap();
    assert_eq!(loaded.status, JobStatus::Pending);
}

#[doc(hidden)]
pub async fn update_not_found(store: impl JobStore) {
    let result = store.update(JobId::new(), Box::new(|job: Job| Some(job))).await;

    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[doc(hidden)]
pub async fn concurrent_claims_admit_one(store: impl JobStore) {
    let job = stored_job("contended");
    store.save(job.clone()).await.unwrap();

    let claims = (0..8).map(|_| {
        store.update(
            job.id,
            Box::new(|job: Job| {
                (job.status != JobStatus::Running).then(|| Job {
                    status: JobStatus::Running,
                    ..job
                })
            }),
        )
    });
    let results = join_all(claims).await;

    let claimed = results
        .into_iter()
        .map(Result::unwrap)
        .filter(Option::is_some)
        .count();
    assert_eq!(claimed, 1);
}
