use kdu_bin_cache::{Cache, Config};

const PRECINCT: u32 = 3;

#[test]
fn failed_growth_is_retried_and_lost_siblings_are_reported_deleted() {
    let cache = Cache::new(Config::new());

    assert!(cache.add_to_bin(PRECINCT, 0, 0, b"first", 0, true, false, false));

    // bin 200 falls outside the initial leaf's [0, 128) range and forces
    // the class-nav tree to grow by one level.
    cache.inject_alloc_failure();
    assert!(!cache.add_to_bin(PRECINCT, 0, 200, b"second", 0, true, false, false));

    // Retried without a forced failure, growth succeeds.
    assert!(cache.add_to_bin(PRECINCT, 0, 200, b"second", 0, true, false, false));

    let mut reader = cache.reader();
    let len = reader.set_read_scope(PRECINCT, 0, 0).unwrap();
    let mut out = vec![0u8; len as usize];
    reader.read(&mut out);
    assert_eq!(out.as_slice(), b"first");

    let len = reader.set_read_scope(PRECINCT, 0, 200).unwrap();
    let mut out = vec![0u8; len as usize];
    reader.read(&mut out);
    assert_eq!(out.as_slice(), b"second");
    drop(reader);

    let entries = cache.scan_bins(PRECINCT, 0);
    let deleted: Vec<_> = entries.iter().filter(|e| e.flags.deleted).collect();
    // The new level has 128 child ranges; slot 0 (bin 0's original leaf)
    // and slot 1 (the freshly grown leaf holding bin 200) are live, the
    // other 126 sibling ranges were never instantiated and are reported
    // once each as lost to the failed growth attempt.
    assert_eq!(deleted.len(), 126);
    for e in &deleted {
        assert_eq!(e.length, 0);
        assert!(!e.is_complete);
        assert_eq!(e.bin % 128, 0);
        assert!(e.bin >= 256);
    }

    let live: Vec<_> = entries.iter().filter(|e| !e.flags.deleted).collect();
    assert_eq!(live.len(), 2);
    assert!(live.iter().any(|e| e.bin == 0));
    assert!(live.iter().any(|e| e.bin == 200));
}
