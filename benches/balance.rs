use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fnv::FnvHashMap;
use std::time::Duration;

use relevo::balance::{
    BalanceStrategy, BestResponseTimeStrategy, PickContext, RandomStrategy, SequentialStrategy,
};
use relevo::conn::{
    ConnectProperties, ConnectionFactory, ExecuteOutcome, PhysicalConnection, SessionState,
};
use relevo::error::{DriverResult, FaultClassifier};
use relevo::topology::{HostRegistry, HostSpec};

struct NoopConnection {
    host: HostSpec,
    session: SessionState,
}

#[async_trait]
impl PhysicalConnection for NoopConnection {
    fn host(&self) -> &HostSpec {
        &self.host
    }

    async fn execute(&mut self, _statement: &str) -> DriverResult<ExecuteOutcome> {
        Ok(ExecuteOutcome::default())
    }

    async fn ping(&mut self) -> DriverResult<()> {
        Ok(())
    }

    async fn commit(&mut self) -> DriverResult<()> {
        Ok(())
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> DriverResult<()> {
        Ok(())
    }

    fn session(&self) -> &SessionState {
        &self.session
    }

    async fn apply_session(&mut self, session: &SessionState) -> DriverResult<()> {
        self.session = session.clone();
        Ok(())
    }
}

struct NoopFactory;

#[async_trait]
impl ConnectionFactory for NoopFactory {
    async fn connect(
        &self,
        host: &HostSpec,
        _props: &ConnectProperties,
    ) -> DriverResult<Box<dyn PhysicalConnection>> {
        Ok(Box::new(NoopConnection {
            host: host.clone(),
            session: SessionState::default(),
        }))
    }
}

fn bench_strategy(
    c: &mut Criterion,
    name: &str,
    mut strategy: Box<dyn BalanceStrategy>,
    host_count: usize,
) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let hosts: Vec<HostSpec> = (0..host_count)
        .map(|i| HostSpec::new(format!("host{}", i), 3306))
        .collect();
    let registry = HostRegistry::load_balanced(hosts.clone());
    let factory = NoopFactory;
    let props = ConnectProperties::default();
    let classifier = FaultClassifier::default();

    let mut response_times = FnvHashMap::default();
    for (i, host) in hosts.iter().enumerate() {
        response_times.insert(host.clone(), Duration::from_millis(10 + i as u64));
    }

    let mut live = FnvHashMap::default();

    c.bench_function(name, |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut ctx = PickContext {
                    registry: &registry,
                    role: None,
                    live: &mut live,
                    response_times: &response_times,
                    factory: &factory,
                    props: &props,
                    classifier: &classifier,
                    max_attempts: 8,
                    blacklist_ttl: Duration::from_secs(5),
                };
                black_box(strategy.pick(&mut ctx).await.unwrap());
            })
        })
    });
}

fn criterion_benchmark(c: &mut Criterion) {
    bench_strategy(
        c,
        "best_response_time_pick_16",
        Box::new(BestResponseTimeStrategy::new()),
        16,
    );
    bench_strategy(c, "random_pick_16", Box::new(RandomStrategy::new()), 16);
    bench_strategy(
        c,
        "sequential_pick_16",
        Box::new(SequentialStrategy::new()),
        16,
    );
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
