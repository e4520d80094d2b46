//! Connection pool behaviour against a real loopback server.

use std::time::Duration;

use anyhow::Result;
use client::{Pool, PoolError};
use protocol::{ClientConfig, PoolConfig, ServerConfig, Value};
use server::{Handler, Server, ServerHandle};

async fn start_server() -> Result<ServerHandle> {
    let handler = Handler::builder()
        .function("sum", |(x, y): (i64, i64)| async move { Ok(x + y) })
        .function("sleep_ms", |(ms,): (u64,)| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        })
        .build();
    let config = ServerConfig {
        port: 0,
        ..ServerConfig::default()
    };
    Ok(Server::bind(&config, handler).await?.spawn()?)
}

fn client_config(server: &ServerHandle) -> ClientConfig {
    let addr = server.local_addr();
    ClientConfig::new(addr.ip().to_string(), addr.port())
}

fn pool_config(max_connections: usize, acquire_timeout_seconds: f64) -> PoolConfig {
    PoolConfig {
        max_connections,
        acquire_timeout_seconds,
        ..PoolConfig::default()
    }
}

#[tokio::test]
async fn ten_callers_share_two_connections() -> Result<()> {
    let server = start_server().await?;
    let pool = Pool::connect(client_config(&server), pool_config(2, 30.0)).await?;

    let mut tasks = Vec::new();
    for i in 0..10u64 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            pool.call("sleep_ms", vec![Value::from(20 + i)]).await
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await??, Value::from(20 + i as u64));
    }

    let status = pool.status();
    assert!(status.created <= 2, "created {} connections", status.created);
    assert!(status.open <= 2);
    assert_eq!(status.leased, 0);
    Ok(())
}

#[tokio::test]
async fn initial_connections_are_opened_eagerly() -> Result<()> {
    let server = start_server().await?;
    let config = PoolConfig {
        initial_connections: 3,
        ..pool_config(5, 1.0)
    };
    let pool = Pool::connect(client_config(&server), config).await?;

    let status = pool.status();
    assert_eq!(status.created, 3);
    assert_eq!(status.idle, 3);

    // Reuses an idle connection rather than opening a fourth.
    let sum = pool.call("sum", vec![Value::from(2), Value::from(3)]).await?;
    assert_eq!(sum, Value::from(5));
    assert_eq!(pool.status().created, 3);
    Ok(())
}

#[tokio::test]
async fn zero_acquire_timeout_reports_exhaustion() -> Result<()> {
    let server = start_server().await?;
    let pool = Pool::connect(client_config(&server), pool_config(1, 0.0)).await?;

    let lease = pool.acquire().await?;
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::Exhausted { max: 1 }));

    drop(lease);
    let again = pool.acquire().await?;
    assert!(again.is_alive());
    Ok(())
}

#[tokio::test]
async fn waiting_acquire_times_out() -> Result<()> {
    let server = start_server().await?;
    let pool = Pool::connect(client_config(&server), pool_config(1, 0.05)).await?;

    let _lease = pool.acquire().await?;
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::AcquireTimeout { .. }));
    Ok(())
}

#[tokio::test]
async fn waiter_receives_released_connection() -> Result<()> {
    let server = start_server().await?;
    let pool = Pool::connect(client_config(&server), pool_config(1, 5.0)).await?;

    let lease = pool.acquire().await?;
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.call("sum", vec![Value::from(1), Value::from(1)]).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(lease);

    assert_eq!(waiter.await??, Value::from(2));
    assert_eq!(pool.status().created, 1);
    Ok(())
}

#[tokio::test]
async fn dead_connections_are_replaced() -> Result<()> {
    let server = start_server().await?;
    let pool = Pool::connect(client_config(&server), pool_config(2, 1.0)).await?;

    {
        let lease = pool.acquire().await?;
        lease.close().await;
        assert!(!lease.is_alive());
    }
    let status = pool.status();
    assert_eq!(status.open, 0, "dead connection must not return to the idle set");

    let sum = pool.call("sum", vec![Value::from(1), Value::from(2)]).await?;
    assert_eq!(sum, Value::from(3));
    assert_eq!(pool.status().created, 2);
    Ok(())
}

#[tokio::test]
async fn discard_and_reap_drop_idle_connections() -> Result<()> {
    let server = start_server().await?;
    let config = PoolConfig {
        initial_connections: 2,
        max_idle_seconds: Some(0.2),
        ..pool_config(4, 1.0)
    };
    let pool = Pool::connect(client_config(&server), config).await?;

    let lease = pool.acquire().await?;
    lease.discard();
    assert_eq!(pool.status().open, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pool.reap_idle(), 1);
    assert_eq!(pool.status().open, 0);
    Ok(())
}

#[tokio::test]
async fn closed_pool_rejects_calls_and_returns_leases_closed() -> Result<()> {
    let server = start_server().await?;
    let pool = Pool::connect(client_config(&server), pool_config(2, 1.0)).await?;

    let lease = pool.acquire().await?;
    pool.close();
    assert!(matches!(pool.acquire().await.unwrap_err(), PoolError::Closed));

    drop(lease);
    let status = pool.status();
    assert_eq!(status.open, 0);
    assert_eq!(status.idle, 0);
    Ok(())
}

#[tokio::test]
async fn server_going_away_fails_the_call_not_the_pool() -> Result<()> {
    let server = start_server().await?;
    let pool = Pool::connect(client_config(&server), pool_config(2, 1.0)).await?;
    pool.call("sum", vec![Value::from(1), Value::from(1)]).await?;

    server.shutdown().await?;
    let err = pool
        .call("sum", vec![Value::from(1), Value::from(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Call(_) | PoolError::Connect(_)));
    Ok(())
}
