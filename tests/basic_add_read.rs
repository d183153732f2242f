use kdu_bin_cache::{Cache, Config};

const PRECINCT: u32 = 3;

#[test]
fn add_then_read_whole_bin() {
    let cache = Cache::new(Config::new());

    assert!(cache.add_to_bin(PRECINCT, 0, 42, b"HELLO", 0, true, false, false));

    let mut reader = cache.reader();
    let len = reader.set_read_scope(PRECINCT, 0, 42).unwrap();
    assert_eq!(len, 5);

    let mut out = [0u8; 5];
    assert_eq!(reader.read(&mut out), 5);
    assert_eq!(&out, b"HELLO");

    assert_eq!(reader.get_bin_length(), 5);
    assert!(reader.is_complete());
}
