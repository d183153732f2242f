use kdu_bin_cache::{Cache, Config};

const PRECINCT: u32 = 3;

#[test]
fn tail_then_head_merges_and_marks_augmented() {
    let cache = Cache::new(Config::new());

    assert!(cache.add_to_bin(PRECINCT, 0, 7, b"world", 5, false, true, false));
    assert!(cache.add_to_bin(PRECINCT, 0, 7, b"hello", 0, true, true, false));

    let mut reader = cache.reader();
    let len = reader.set_read_scope(PRECINCT, 0, 7).unwrap();
    assert_eq!(len, 10);

    let mut out = [0u8; 10];
    assert_eq!(reader.read(&mut out), 10);
    assert_eq!(&out, b"helloworld");
    assert!(reader.is_complete());
    drop(reader);

    let info = cache.mark_bin(PRECINCT, 0, 7, false);
    assert!(info.flags.augmented);
    assert!(info.flags.marked);
    assert!(!info.flags.deleted);
}
