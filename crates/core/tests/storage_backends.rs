// crates/core/tests/storage_backends.rs
//
// Every test body here runs against both backends.

use std::collections::BTreeSet;

use codematch_core::config::StorageConfig;
use codematch_core::model::{ContentHash, Report, ReportFunction};
use codematch_core::storage::{
    compute_pichash, CacheError, LibraryInfo, MemoryStorage, MinHash, SqliteStorage, Storage,
    StorageExt,
};
use serde_json::json;

macro_rules! backend_tests {
    ($($name:ident),* $(,)?) => {
        mod memory {
            use super::*;
            $(
                #[test]
                fn $name() {
                    let storage = MemoryStorage::default();
                    super::$name(&storage);
                }
            )*
        }

        mod sqlite {
            use super::*;
            $(
                #[test]
                fn $name() {
                    let dir = tempfile::tempdir().expect("tempdir");
                    let path = dir.path().join("store.db");
                    let storage = SqliteStorage::open(&path, &StorageConfig::sqlite(&path))
                        .expect("open sqlite storage");
                    super::$name(&storage);
                }
            )*
        }
    };
}

backend_tests!(
    empty_label_is_family_zero,
    add_family_is_idempotent,
    sample_ids_increase_and_are_never_reused,
    duplicate_sha256_is_rejected_while_live,
    functions_are_numbered_in_offset_order,
    delete_sample_cascades,
    two_reports_with_ten_functions_each,
    pichash_matches_are_exact,
    pichash_batch_forms_merge_and_dedup,
    minhash_candidates_follow_band_collisions,
    short_signatures_never_collide_on_missing_components,
    add_minhash_rejects_unknown_functions,
    add_minhash_overwrites_and_rebuckets,
    xcfg_purge_only_touches_payloads,
    matching_cache_snapshots_requested_samples,
    library_info_only_for_libraries,
    samples_by_family,
    clear_storage_resets_counters,
);

fn signature(seed: u32) -> Vec<u32> {
    (0..64).map(|i| seed * 1000 + i).collect()
}

/// A report whose functions are listed in descending offset order.
fn report(tag: &str, num_functions: usize) -> Report {
    let functions = (0..num_functions)
        .rev()
        .map(|i| {
            ReportFunction::new(0x1000 + (i as u64) * 0x10, format!("{tag}:{i}"))
                .with_xcfg(json!({"blocks": [i]}))
        })
        .collect();
    let mut report = Report::new(ContentHash::of(tag.as_bytes()), functions);
    report.family = "family".to_string();
    report.filename = format!("{tag}.bin");
    report
}

fn empty_label_is_family_zero(storage: &dyn Storage) {
    assert_eq!(storage.get_family_id("").expect("family id"), Some(0));
    assert_eq!(storage.get_family_ids().expect("family ids"), vec![0]);
    let family = storage.get_family(0).expect("family").expect("family 0 exists");
    assert_eq!(family.family_name, "");
}

fn add_family_is_idempotent(storage: &dyn Storage) {
    assert_eq!(storage.add_family("").expect("add"), 0);
    assert_eq!(storage.add_family("emotet").expect("add"), 1);
    assert_eq!(storage.add_family("emotet").expect("add again"), 1);
    assert_eq!(storage.add_family("qakbot").expect("add"), 2);
    assert_eq!(storage.get_family_ids().expect("family ids"), vec![0, 1, 2]);
    assert_eq!(storage.get_family_id("qakbot").expect("lookup"), Some(2));
    assert_eq!(storage.get_family_id("unknown").expect("lookup"), None);
    assert_eq!(storage.get_family(7).expect("lookup"), None);
}

fn sample_ids_increase_and_are_never_reused(storage: &dyn Storage) {
    let a = report("a", 3);
    let b = report("b", 2);

    let first = storage.add_report(&a).expect("add a").expect("a is new");
    let second = storage.add_report(&b).expect("add b").expect("b is new");
    assert_eq!(first.sample_id, 0);
    assert_eq!(second.sample_id, 1);
    assert_eq!(first.function_ids, vec![0, 1, 2]);
    assert_eq!(second.function_ids, vec![3, 4]);

    assert!(storage.delete_sample(first.sample_id).expect("delete"));
    let again = storage.add_report(&a).expect("re-add a").expect("a is new again");
    assert_eq!(again.sample_id, 2);
    assert_eq!(again.function_ids, vec![5, 6, 7]);
    assert_eq!(storage.get_sample_ids().expect("ids"), vec![1, 2]);
}

fn duplicate_sha256_is_rejected_while_live(storage: &dyn Storage) {
    let a = report("a", 2);
    storage.add_report(&a).expect("add").expect("new");
    let before = storage.get_stats().expect("stats");

    assert!(storage.add_report(&a).expect("add duplicate").is_none());
    assert!(storage.add_sample(&a, "other-family").expect("add duplicate").is_none());
    assert_eq!(storage.get_stats().expect("stats"), before);
    assert_eq!(storage.get_family_id("other-family").expect("lookup"), None);
}

fn functions_are_numbered_in_offset_order(storage: &dyn Storage) {
    let sample = storage.add_report(&report("a", 4)).expect("add").expect("new");
    let functions = storage
        .get_functions_by_sample_id(sample.sample_id)
        .expect("functions")
        .expect("sample exists");
    let offsets: Vec<u64> = functions.iter().map(|f| f.offset).collect();
    assert_eq!(offsets, vec![0x1000, 0x1010, 0x1020, 0x1030]);
    let ids: Vec<u64> = functions.iter().map(|f| f.function_id).collect();
    assert_eq!(ids, sample.function_ids);

    let first = &functions[0];
    assert_eq!(first.sample_id, sample.sample_id);
    assert_eq!(first.pichash, compute_pichash(b"a:0"));
    assert_eq!(first.binweight, 3);
    assert_eq!(first.xcfg, json!({"blocks": [0]}));
    assert_eq!(sample.binweight, 12);
    assert_eq!(sample.num_functions, 4);
    assert_eq!(sample.family, "family");
    assert_eq!(storage.get_sample_id_by_function_id(3).expect("lookup"), Some(0));
}

fn delete_sample_cascades(storage: &dyn Storage) {
    let mut a = report("a", 2);
    a.functions[0].minhash = Some(signature(1));
    let sample = storage.add_report(&a).expect("add").expect("new");
    let function_id = sample.function_ids[1];
    let pichash = storage.get_function_by_id(function_id).expect("get").expect("exists").pichash;
    assert_eq!(storage.get_minhash_by_function_id(function_id).expect("get"), Some(signature(1)));

    assert!(storage.delete_sample(sample.sample_id).expect("delete"));

    assert!(!storage.is_sample_id(sample.sample_id).expect("lookup"));
    assert_eq!(storage.get_sample_by_sha256(&a.sha256).expect("lookup"), None);
    assert_eq!(storage.get_functions_by_sample_id(sample.sample_id).expect("lookup"), None);
    for id in &sample.function_ids {
        assert!(!storage.is_function_id(*id).expect("lookup"));
        assert_eq!(storage.get_minhash_by_function_id(*id).expect("lookup"), None);
    }
    assert!(!storage.is_pichash(pichash).expect("lookup"));
    assert!(storage.get_matches_for_pichash(pichash).expect("lookup").is_empty());
    let candidates =
        storage.get_candidates_for_minhash(&MinHash::unbound(signature(1))).expect("lookup");
    assert!(candidates.is_empty());

    let stats = storage.get_stats().expect("stats");
    assert_eq!((stats.num_samples, stats.num_functions, stats.num_minhashes), (0, 0, 0));
    assert_eq!(stats.num_band_buckets, 0);

    assert!(!storage.delete_sample(sample.sample_id).expect("delete again"));
}

fn two_reports_with_ten_functions_each(storage: &dyn Storage) {
    let first = storage.add_report(&report("first", 10)).expect("add").expect("new");
    let second = storage.add_report(&report("second", 10)).expect("add").expect("new");

    let stats = storage.get_stats().expect("stats");
    assert_eq!(stats.num_samples, 2);
    assert_eq!(stats.num_functions, 20);
    assert!(stats.num_pichashes <= 20);

    assert!(storage.delete_sample(first.sample_id).expect("delete"));
    let kept = storage.get_sample_by_id(second.sample_id).expect("lookup").expect("kept");
    assert_eq!(kept.function_ids, second.function_ids);
    for id in &second.function_ids {
        assert!(storage.is_function_id(*id).expect("lookup"));
    }
    assert_eq!(storage.get_stats().expect("stats").num_functions, 10);
}

fn pichash_matches_are_exact(storage: &dyn Storage) {
    let mut a = report("a", 2);
    let mut b = report("b", 3);
    a.functions[0].code = "shared body".to_string();
    b.functions[2].code = "shared body".to_string();
    let sa = storage.add_report(&a).expect("add").expect("new");
    let sb = storage.add_report(&b).expect("add").expect("new");

    // a.functions[0] has the highest offset of a; b.functions[2] the lowest of b.
    let shared = compute_pichash(b"shared body");
    let expected: BTreeSet<(u32, u64)> =
        [(sa.sample_id, sa.function_ids[1]), (sb.sample_id, sb.function_ids[0])].into();
    assert!(storage.is_pichash(shared).expect("lookup"));
    assert_eq!(storage.get_matches_for_pichash(shared).expect("lookup"), expected);

    let unmatched = compute_pichash(b"nobody has this");
    assert!(!storage.is_pichash(unmatched).expect("lookup"));
    assert!(storage.get_matches_for_pichash(unmatched).expect("lookup").is_empty());

    let by_function = storage
        .get_pichash_matches_by_function_id(sb.function_ids[0])
        .expect("lookup")
        .expect("known function");
    assert_eq!(by_function.len(), 1);
    assert_eq!(by_function[&shared], expected);
    assert_eq!(storage.get_pichash_matches_by_function_id(999).expect("lookup"), None);
}

fn pichash_batch_forms_merge_and_dedup(storage: &dyn Storage) {
    let mut a = report("a", 3);
    a.functions[0].code = "dup".to_string();
    a.functions[1].code = "dup".to_string();
    let sample = storage.add_report(&a).expect("add").expect("new");

    let merged = storage
        .get_pichash_matches_by_function_ids(&[
            sample.function_ids[1],
            sample.function_ids[2],
            sample.function_ids[2],
            12345,
        ])
        .expect("lookup");
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[&compute_pichash(b"dup")].len(), 2);

    let by_sample = storage
        .get_pichash_matches_by_sample_id(sample.sample_id)
        .expect("lookup")
        .expect("known sample");
    assert_eq!(by_sample.len(), 2);
    let pairs: usize = by_sample.values().map(BTreeSet::len).sum();
    assert_eq!(pairs, 3);
    assert_eq!(storage.get_pichash_matches_by_sample_id(42).expect("lookup"), None);
}

fn minhash_candidates_follow_band_collisions(storage: &dyn Storage) {
    let mut a = report("a", 2);
    a.functions[1].minhash = Some(signature(1));
    a.functions[0].minhash = Some(signature(2));
    let sample = storage.add_report(&a).expect("add").expect("new");
    let (low, high) = (sample.function_ids[0], sample.function_ids[1]);

    let hits = storage.get_candidates_for_minhash(&MinHash::unbound(signature(1))).expect("query");
    assert_eq!(hits, BTreeSet::from([low]));

    // A partial overlap can only ever surface the overlapping function.
    let mut near = signature(2);
    near[32..].copy_from_slice(&signature(9)[32..]);
    let hits = storage.get_candidates_for_minhash(&MinHash::unbound(near.clone())).expect("query");
    assert!(hits.is_subset(&BTreeSet::from([high])));

    let misses = storage.get_candidates_for_minhash(&MinHash::unbound(signature(3))).expect("query");
    assert!(misses.is_empty());

    let batch = storage
        .get_candidates_for_minhashes(
            &[(10, MinHash::unbound(signature(1))), (11, MinHash::unbound(signature(2)))].into(),
        )
        .expect("batch");
    assert_eq!(batch[&10], BTreeSet::from([low]));
    assert_eq!(batch[&11], BTreeSet::from([high]));

    let named = storage
        .get_candidates_for_minhashes(
            &[("low-fn".to_string(), MinHash::unbound(signature(1)))].into(),
        )
        .expect("batch");
    assert_eq!(named["low-fn"], BTreeSet::from([low]));
}

fn short_signatures_never_collide_on_missing_components(storage: &dyn Storage) {
    let short = |seed: u32| -> Vec<u32> { (0..10).map(|i| seed * 1000 + i).collect() };
    let mut a = report("a", 2);
    a.functions[1].minhash = Some(short(1));
    a.functions[0].minhash = Some(short(2));
    storage.add_report(&a).expect("add").expect("new");
    assert_eq!(storage.get_stats().expect("stats").num_minhashes, 2);

    let disjoint = storage.get_candidates_for_minhash(&MinHash::unbound(short(3))).expect("query");
    assert!(disjoint.is_empty());
    let empty = storage.get_candidates_for_minhash(&MinHash::unbound(vec![])).expect("query");
    assert!(empty.is_empty());
    let full = storage.get_candidates_for_minhash(&MinHash::unbound(signature(3))).expect("query");
    assert!(full.is_empty());
}

fn add_minhash_rejects_unknown_functions(storage: &dyn Storage) {
    assert!(!storage.add_minhash(&MinHash::unbound(signature(1))).expect("add"));
    assert!(!storage.add_minhash(&MinHash::new(77, signature(1))).expect("add"));
    assert_eq!(storage.get_stats().expect("stats").num_minhashes, 0);
    assert!(storage
        .get_candidates_for_minhash(&MinHash::unbound(signature(1)))
        .expect("query")
        .is_empty());
}

fn add_minhash_overwrites_and_rebuckets(storage: &dyn Storage) {
    let sample = storage.add_report(&report("a", 1)).expect("add").expect("new");
    let function_id = sample.function_ids[0];

    assert!(storage.add_minhash(&MinHash::new(function_id, signature(1))).expect("add"));
    assert!(storage.add_minhash(&MinHash::new(function_id, signature(2))).expect("overwrite"));

    assert_eq!(storage.get_minhash_by_function_id(function_id).expect("get"), Some(signature(2)));
    assert!(storage
        .get_candidates_for_minhash(&MinHash::unbound(signature(1)))
        .expect("query")
        .is_empty());
    assert_eq!(
        storage.get_candidates_for_minhash(&MinHash::unbound(signature(2))).expect("query"),
        BTreeSet::from([function_id])
    );
    assert_eq!(storage.get_stats().expect("stats").num_minhashes, 1);
}

fn xcfg_purge_only_touches_payloads(storage: &dyn Storage) {
    let a = storage.add_report(&report("a", 2)).expect("add").expect("new");
    let b = storage.add_report(&report("b", 2)).expect("add").expect("new");

    storage.delete_xcfg_for_sample_id(a.sample_id).expect("purge");
    storage.delete_xcfg_for_sample_id(99).expect("purge unknown is a no-op");
    let purged = storage.get_function_by_id(a.function_ids[0]).expect("get").expect("exists");
    assert!(!purged.has_xcfg());
    assert_eq!(purged.offset, 0x1000);
    assert_eq!(purged.pichash, compute_pichash(b"a:0"));
    let kept = storage.get_function_by_id(b.function_ids[0]).expect("get").expect("exists");
    assert!(kept.has_xcfg());

    storage.delete_xcfg_data().expect("purge all");
    let functions = storage.get_functions_by_sample_id(b.sample_id).expect("get").expect("exists");
    assert!(functions.iter().all(|f| !f.has_xcfg()));
}

fn matching_cache_snapshots_requested_samples(storage: &dyn Storage) {
    let mut a = report("a", 2);
    a.functions[1].minhash = Some(signature(1));
    let sa = storage.add_report(&a).expect("add").expect("new");
    let sb = storage.add_report(&report("b", 1)).expect("add").expect("new");

    let cache = storage.create_matching_cache(&[sa.sample_id, 99]).expect("cache");
    assert_eq!(cache.sample_ids(), vec![sa.sample_id]);
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get_function_ids_by_sample_id(sa.sample_id), Ok(&sa.function_ids[..]));
    assert_eq!(cache.get_minhash_by_function_id(sa.function_ids[0]), Ok(Some(&signature(1)[..])));
    assert_eq!(cache.get_minhash_by_function_id(sa.function_ids[1]), Ok(None));
    assert_eq!(cache.get_sample_id_by_function_id(sa.function_ids[1]), Ok(sa.sample_id));

    assert!(!cache.is_sample_id(sb.sample_id));
    assert_eq!(
        cache.get_sample_id_by_function_id(sb.function_ids[0]),
        Err(CacheError::UnknownFunctionId(sb.function_ids[0]))
    );

    // Later mutations are invisible to the snapshot.
    storage.delete_sample(sa.sample_id).expect("delete");
    assert!(cache.is_sample_id(sa.sample_id));

    assert!(storage.create_matching_cache(&[]).expect("empty cache").is_empty());
}

fn library_info_only_for_libraries(storage: &dyn Storage) {
    let mut lib = report("zlib", 1);
    lib.is_library = true;
    lib.family = "zlib".to_string();
    lib.version = Some("1.2.13".to_string());
    let lib = storage.add_report(&lib).expect("add").expect("new");
    let plain = storage.add_report(&report("plain", 1)).expect("add").expect("new");

    assert_eq!(
        storage.get_library_info_for_sample_id(lib.sample_id).expect("lookup"),
        Some(LibraryInfo { family: "zlib".to_string(), version: Some("1.2.13".to_string()) })
    );
    assert_eq!(storage.get_library_info_for_sample_id(plain.sample_id).expect("lookup"), None);
    assert_eq!(storage.get_library_info_for_sample_id(50).expect("lookup"), None);
}

fn samples_by_family(storage: &dyn Storage) {
    let a = storage.add_sample(&report("a", 1), "alpha").expect("add").expect("new");
    storage.add_sample(&report("b", 1), "beta").expect("add").expect("new");
    let c = storage.add_sample(&report("c", 1), "alpha").expect("add").expect("new");
    let empty = storage.add_family("gamma").expect("family");

    let alpha = storage.get_family_id("alpha").expect("lookup").expect("alpha exists");
    let samples = storage.get_samples_by_family_id(alpha).expect("lookup").expect("known family");
    let ids: Vec<u32> = samples.iter().map(|s| s.sample_id).collect();
    assert_eq!(ids, vec![a.sample_id, c.sample_id]);
    assert!(samples.iter().all(|s| s.family == "alpha" && s.family_id == alpha));

    assert_eq!(storage.get_samples_by_family_id(empty).expect("lookup"), Some(Vec::new()));
    assert_eq!(storage.get_samples_by_family_id(1000).expect("lookup"), None);
}

fn clear_storage_resets_counters(storage: &dyn Storage) {
    storage.add_sample(&report("a", 3), "alpha").expect("add").expect("new");
    storage.clear_storage().expect("clear");

    assert_eq!(storage.get_stats().expect("stats").num_samples, 0);
    assert_eq!(storage.get_family_ids().expect("families"), vec![0]);
    let sample = storage.add_sample(&report("a", 1), "beta").expect("add").expect("new");
    assert_eq!(sample.sample_id, 0);
    assert_eq!(sample.family_id, 1);
    assert_eq!(sample.function_ids, vec![0]);
}
