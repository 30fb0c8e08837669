use std::time::Duration;

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

use lendpool::{Manager, Pool, PoolConfig};

#[derive(Debug)]
struct NoopError;

struct NoopManager;

#[async_trait]
impl Manager<usize, NoopError> for NoopManager {
    async fn create(&self) -> Result<usize, NoopError> {
        Ok(0)
    }
}

fn config(idle_timeout: Option<Duration>) -> PoolConfig {
    PoolConfig {
        max_pool_size: 16,
        poll_timeout: Some(Duration::from_secs(1)),
        idle_timeout,
        ..PoolConfig::default()
    }
}

fn borrow_return(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let pool = Pool::from_config(NoopManager, config(None)).unwrap();
    c.bench_function("borrow_return", |b| {
        b.iter(|| {
            rt.block_on(async {
                let obj = pool.borrow().await.unwrap().unwrap();
                obj.release().await.unwrap();
            })
        })
    });

    let pool = Pool::from_config(NoopManager, config(Some(Duration::from_secs(60)))).unwrap();
    c.bench_function("borrow_return_with_eviction_timer", |b| {
        b.iter(|| {
            rt.block_on(async {
                let obj = pool.borrow().await.unwrap().unwrap();
                obj.release().await.unwrap();
            })
        })
    });
}

criterion_group!(benches, borrow_return);
criterion_main!(benches);
