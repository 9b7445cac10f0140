//! Suspending executor: the same contract as the blocking one, awaited.


use std::time::Duration;

use partition_exec::pool::{Priority, TaskStatus};
use partition_exec::scheduler::{Job, TaskJob};
use partition_exec::{AsyncJobExecutor, ConnectionConfig, ExecError, PoolConfig, TaskError};
use test_harness::{assert_eventually, index_job, IndexTask, ManualPool, SleepTask};
use tokio_stream::StreamExt;

#[tokio::test]
async fn test_stream_yields_in_completion_order() {
    let pool = ManualPool::new(2);
    let executor = AsyncJobExecutor::from_pool(pool.clone());
    let job = index_job(3);

    let mut results = executor.run_job(&job).unwrap();
    let runner = {
        let pool = pool.clone();
        tokio::spawn(async move {
            for index in [2, 1, 0] {
                tokio::time::sleep(Duration::from_millis(10)).await;
                pool.run(index);
            }
        })
    };

    let mut order = Vec::new();
    while let Some(result) = results.next().await {
        order.push(result.unwrap());
    }
    runner.await.unwrap();

    assert_eq!(order, vec![2, 1, 0]);
    assert!(executor.running_jobs().is_empty());
}

#[tokio::test]
async fn test_empty_locations_fail_without_submitting() {
    let pool = ManualPool::new(2);
    let executor = AsyncJobExecutor::from_pool(pool.clone());
    let job = TaskJob::new(vec![IndexTask::new(0), IndexTask::pinned(1, &[])]);

    assert!(matches!(
        executor.run_job(&job),
        Err(ExecError::NoEligibleWorkers { task_index: 1 })
    ));
    assert_eq!(pool.submit_calls(), 0);
}

#[tokio::test]
async fn test_duplicate_job_is_rejected() {
    let pool = ManualPool::new(1);
    let executor = AsyncJobExecutor::from_pool(pool.clone());
    let job = index_job(1);

    let _running = executor.run_job(&job).unwrap();
    assert!(matches!(
        executor.run_job(&job),
        Err(ExecError::DuplicateJob(id)) if id == job.id()
    ));
}

#[tokio::test]
async fn test_cancelled_job_ends_stream_with_cancellation() {
    let pool = ManualPool::new(2);
    let executor = AsyncJobExecutor::from_pool(pool.clone());
    let job = index_job(3);

    assert!(!executor.cancel_job(&job));

    let mut results = executor.run_job(&job).unwrap();
    pool.run(0);
    assert_eq!(results.next().await.unwrap().unwrap(), 0);

    let canceller = {
        let executor = executor.clone();
        let job_id = job.id();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            executor.cancel_job_id(job_id)
        })
    };

    let err = results.next().await.unwrap().unwrap_err();
    assert!(canceller.await.unwrap());
    assert!(matches!(err, ExecError::TaskCancelled(_)));
    assert!(results.next().await.is_none());

    let statuses: Vec<TaskStatus> = pool.handles().iter().map(|h| h.status()).collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Finished, TaskStatus::Cancelled, TaskStatus::Cancelled]
    );
    assert!(!executor.cancel_job(&job));
}

#[tokio::test]
async fn test_dropped_stream_forgets_job() {
    let pool = ManualPool::new(1);
    let executor = AsyncJobExecutor::from_pool(pool.clone());
    let job = index_job(2);

    let results = executor.run_job(&job).unwrap();
    assert_eq!(executor.running_jobs(), vec![job.id()]);
    drop(results);

    assert!(executor.running_jobs().is_empty());
    assert!(pool.handles().iter().all(|h| h.is_cancelled()));
}

#[tokio::test]
async fn test_run_function_awaits_high_priority_result() {
    let pool = ManualPool::new(1);
    let executor = AsyncJobExecutor::from_pool(pool.clone());

    let runner = {
        let pool = pool.clone();
        tokio::spawn(async move {
            assert_eventually(
                || {
                    let pool = pool.clone();
                    async move { pool.submit_calls() == 1 }
                },
                Duration::from_secs(5),
                "function was never submitted",
            )
            .await;
            pool.run(0);
        })
    };

    let value = executor.run_function(|| Ok(vec![1u8, 2, 3])).await.unwrap();
    runner.await.unwrap();
    assert_eq!(value, vec![1, 2, 3]);
    assert_eq!(pool.priorities(), vec![Priority::High]);
}

#[tokio::test]
async fn test_make_local_then_close() {
    let executor = AsyncJobExecutor::make_local(
        PoolConfig::from_json(r#"{"workers": 2}"#).unwrap(),
        ConnectionConfig::default(),
    )
    .await
    .unwrap();
    assert!(executor.is_local());
    assert_eq!(executor.workers().unwrap().len(), 2);

    executor.close().await;
    assert!(executor.is_closed());
    executor.close().await;
}

#[tokio::test]
async fn test_local_job_and_function() {
    let executor = AsyncJobExecutor::make_local(PoolConfig::new(3), ConnectionConfig::default())
        .await
        .unwrap();
    let job = TaskJob::new((0..3).map(|index| SleepTask {
        index,
        delay: Duration::from_millis(150 * (2 - index as u64)),
        locations: None,
    }));

    let order: Vec<usize> = executor
        .run_job(&job)
        .unwrap()
        .map(|r| r.unwrap().0)
        .collect()
        .await;
    assert_eq!(order, vec![2, 1, 0]);

    let err = executor
        .run_function(|| -> anyhow::Result<()> { anyhow::bail!("nope") })
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::Task(TaskError::Failed(_))));

    executor.close().await;
    assert!(matches!(
        executor.run_function(|| Ok(1)).await,
        Err(ExecError::PoolUnavailable(_))
    ));
}

#[tokio::test]
async fn test_connect_with_timeout() {
    let name = format!("async-{}", uuid::Uuid::new_v4().simple());
    let connection = ConnectionConfig::default().with_connect_timeout_ms(50);

    let err = AsyncJobExecutor::connect_with(&name, connection.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::PoolUnavailable(_)));

    let owner = AsyncJobExecutor::make_local(PoolConfig::new(1).with_name(&name), ConnectionConfig::default())
        .await
        .unwrap();
    let client = AsyncJobExecutor::connect_with(&format!("inproc://{name}"), connection)
        .await
        .unwrap();
    assert!(!client.is_local());
    assert_eq!(client.run_function(|| Ok("hi")).await.unwrap(), "hi");

    client.close().await;
    owner.close().await;
}
