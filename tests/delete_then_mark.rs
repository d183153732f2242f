use kdu_bin_cache::{Cache, Config};

const PRECINCT: u32 = 3;

#[test]
fn deleting_a_non_empty_bin_reports_once_then_clears() {
    let cache = Cache::new(Config::new());

    assert!(cache.add_to_bin(PRECINCT, 0, 1, b"X", 0, true, false, false));
    cache.delete_bin(PRECINCT, 0, 1, true);

    let first = cache.mark_bin(PRECINCT, 0, 1, false);
    assert!(first.flags.deleted);
    assert!(first.flags.marked);
    assert_eq!(first.length, 0);

    let second = cache.mark_bin(PRECINCT, 0, 1, false);
    assert!(!second.flags.deleted);
    assert!(!second.flags.marked);
    assert_eq!(second.length, 0);
}
