use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use steward_clients::{ClientCommand, ClientState};
use steward_core::{rehydrate, Aggregate, EntityId, ExpectedVersion};
use steward_events::{CommandMeta, EntityType, RoutedCommand};
use steward_infra::{spawn_entity, InMemoryJournal, Journal, PersistenceId, UnitConfig};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn meta() -> CommandMeta {
    CommandMeta::new("bench", "bench")
}

/// The commands an entity would log for one insert followed by `updates` renames.
fn accepted_history(id: EntityId, updates: usize) -> Vec<ClientCommand> {
    let mut state = ClientState::default();
    let mut logged = Vec::with_capacity(updates + 1);

    let submitted = std::iter::once(ClientCommand::insert(ClientState::named("Acme"), meta()))
        .map(|c| c.with_target(id))
        .chain((0..updates).map(|i| {
            ClientCommand::update(id, ClientState::named(format!("Acme {i}")), meta())
        }));
    for command in submitted {
        let accepted = state.handle(&command).unwrap();
        state.apply(&accepted);
        logged.push(accepted);
    }
    logged
}

fn seeded_journal(id: EntityId, updates: usize) -> Arc<InMemoryJournal> {
    let journal = Arc::new(InMemoryJournal::new());
    let pid = PersistenceId::entity(EntityType::Client, id);
    for (n, command) in accepted_history(id, updates).iter().enumerate() {
        journal
            .append(&pid, ExpectedVersion::Exact(n as u64), serde_json::to_value(command).unwrap())
            .unwrap();
    }
    journal
}

fn bench_command_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_latency");
    let rt = runtime();

    group.bench_function("update_live_entity", |b| {
        let journal: Arc<dyn Journal> = Arc::new(InMemoryJournal::new());
        let id = EntityId::new();
        let entity = rt.block_on(async {
            let entity = spawn_entity::<ClientState>(id, journal, UnitConfig::default());
            let insert = ClientCommand::insert(ClientState::named("Acme"), meta()).with_target(id);
            entity.execute(insert).await.unwrap();
            entity
        });

        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let update = ClientCommand::update(id, ClientState::named(format!("Acme {n}")), meta());
            black_box(rt.block_on(entity.execute(update)).unwrap());
        });
    });

    group.finish();
}

fn bench_journal_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("journal_append");

    for batch in [1usize, 10, 100, 1000] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("append", batch), &batch, |b, &batch| {
            let entry = serde_json::to_value(&accepted_history(EntityId::new(), 1)[1]).unwrap();
            b.iter(|| {
                let journal = InMemoryJournal::new();
                let pid = PersistenceId::entity(EntityType::Client, EntityId::new());
                for n in 0..batch {
                    journal
                        .append(&pid, ExpectedVersion::Exact(n as u64), black_box(entry.clone()))
                        .unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery");
    let rt = runtime();

    for updates in [10usize, 100, 1000] {
        let id = EntityId::new();

        let history = accepted_history(id, updates);
        group.bench_with_input(BenchmarkId::new("rehydrate", updates), &history, |b, history| {
            b.iter(|| black_box(rehydrate(ClientState::default(), history.iter())));
        });

        let journal = seeded_journal(id, updates);
        group.bench_with_input(BenchmarkId::new("spawn_and_replay", updates), &journal, |b, journal| {
            b.iter(|| {
                let journal: Arc<dyn Journal> = journal.clone();
                rt.block_on(async {
                    let entity = spawn_entity::<ClientState>(id, journal, UnitConfig::default());
                    black_box(entity.state().await.unwrap());
                    entity.stop();
                });
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_command_latency, bench_journal_append, bench_recovery);
criterion_main!(benches);
