use bitcoin::hashes::Hash;
use bitcoin::ScriptBuf;
use bitcoin::Txid;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;
use tempfile::TempDir;
use voltra_chain::amount::COIN;
use voltra_chain::staking::StakeEntry;
use voltra_chain::staking::StakesDb;
use voltra_chain::staking::StakesDbCache;

const NUM_STAKES: u64 = 50_000;

fn fill_cache<'a>(db: &'a StakesDb) -> StakesDbCache<'a> {
    let script = ScriptBuf::from_hex("76a9149206a30c09cc853bb03bd917a4f9f29b089c1bc788ac")
        .expect("valid script hex");
    let mut cache = StakesDbCache::new(db);
    for i in 0..NUM_STAKES {
        let mut id = [0u8; 32];
        id[..8].copy_from_slice(&i.to_le_bytes());
        let entry = StakeEntry::new(
            Txid::from_byte_array(id),
            10 * COIN,
            15,
            (i % 4) as u8,
            25_000 + (i % 1_000) as u32,
            1,
            script.clone(),
            true,
        );
        cache
            .add_new_stake_entry(entry)
            .expect("cache is editable");
    }
    cache
}

fn flush_bench(c: &mut Criterion) {
    c.bench_function("stakes_db_fill_and_flush", |b| {
        b.iter(|| {
            let dir = TempDir::new().expect("tempdir");
            let db = StakesDb::new(dir.path()).expect("open db");
            let mut cache = fill_cache(&db);
            cache.flush().expect("flush");
        })
    });
}

criterion_group!(benches, flush_bench);
criterion_main!(benches);
