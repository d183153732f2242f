use kdu_bin_cache::{Cache, Config};

const PRECINCT: u32 = 3;

#[test]
fn three_disjoint_ranges_merge_into_one_contiguous_run() {
    let cache = Cache::new(Config::new());

    assert!(cache.add_to_bin(PRECINCT, 0, 9, b"AAAA", 0, false, false, false));
    assert!(cache.add_to_bin(PRECINCT, 0, 9, b"CCCC", 8, false, false, false));
    assert!(cache.add_to_bin(PRECINCT, 0, 9, b"BBBB", 4, false, false, false));

    let mut reader = cache.reader();
    let len = reader.set_read_scope(PRECINCT, 0, 9).unwrap();
    assert_eq!(len, 12);

    let mut out = [0u8; 12];
    assert_eq!(reader.read(&mut out), 12);
    assert_eq!(&out, b"AAAABBBBCCCC");
    drop(reader);

    let info = cache.mark_bin(PRECINCT, 0, 9, false);
    assert!(!info.flags.augmented);
    assert!(!info.flags.marked);
    assert!(!info.flags.deleted);
}
