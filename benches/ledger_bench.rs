use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use time::{macros::datetime, Duration, OffsetDateTime};

use susu_ledger::storage::{InMemoryStorage, StorageBackend};
use susu_ledger::{Ledger, LedgerSettings, TimeSource};
use susu_ledger_core::Money;

const START: OffsetDateTime = datetime!(2024-01-01 0:00 UTC);

fn setup() -> Ledger {
    let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
    let ledger = Ledger::new(storage, LedgerSettings::default(), TimeSource::mock(datetime!(2025-06-01 0:00 UTC))).unwrap();
    ledger.open_group("bench").unwrap();
    ledger
}

fn seed_data(ledger: &Ledger, members: usize) {
    // Monthly contributions from every member over one year
    for month in 0..12 {
        for m in 0..members {
            ledger
                .record_contribution(
                    "bench",
                    &format!("m{}", m),
                    Money::from_minor(5_000 + m as i64),
                    START + Duration::days(month * 30) + Duration::minutes(m as i64),
                )
                .unwrap();
        }
    }
}

fn bench_contribution(c: &mut Criterion) {
    let ledger = setup();
    let mut tick = 0i64;

    c.bench_function("record_contribution", |b| {
        b.iter(|| {
            tick += 1;
            ledger
                .record_contribution("bench", "m0", black_box(Money::from_minor(2_500)), START + Duration::seconds(tick))
                .unwrap()
        })
    });
}

fn bench_balance_replay(c: &mut Criterion) {
    let ledger = setup();
    seed_data(&ledger, 50);

    c.bench_function("balance_replay", |b| {
        b.iter(|| ledger.get_account_balance(black_box("bench:asset"), None).unwrap())
    });

    c.bench_function("balance_sheet", |b| {
        b.iter(|| ledger.get_group_balance_sheet(black_box("bench"), None).unwrap())
    });
}

fn bench_interest_accrual(c: &mut Criterion) {
    let ledger = setup();
    seed_data(&ledger, 200);
    let mut day = 0i64;

    c.bench_function("interest_accrual_200_members", |b| {
        b.iter(|| {
            day += 1;
            let end = START + Duration::days(360 + day);
            ledger
                .run_interest_accrual("bench", end - Duration::days(1), end, black_box(Money::from_minor(12_345)))
                .unwrap()
        })
    });
}

fn bench_reconcile(c: &mut Criterion) {
    let ledger = setup();
    seed_data(&ledger, 50);

    c.bench_function("reconcile_group", |b| {
        b.iter(|| ledger.reconcile_group(black_box("bench")).unwrap())
    });
}

criterion_group!(
    benches,
    bench_contribution,
    bench_balance_replay,
    bench_interest_accrual,
    bench_reconcile
);
criterion_main!(benches);
