use kdu_bin_cache::{Cache, Config};

const PRECINCT: u32 = 3;
const CELL_BYTES: u64 = 64;

#[test]
fn preserved_bin_is_not_reclaimed_under_memory_pressure() {
    let cache = Cache::new(Config::new());

    assert!(cache.preserve_bin(PRECINCT, 0, 5));

    let payload = vec![0xABu8; 1024];
    assert!(cache.add_to_bin(PRECINCT, 0, 5, &payload, 0, true, false, false));

    cache.set_preferred_memory_limit(CELL_BYTES);
    cache.trim_to_preferred_memory_limit();

    let mut reader = cache.reader();
    let len = reader.set_read_scope(PRECINCT, 0, 5).unwrap();
    assert_eq!(len, payload.len() as u32);

    let mut out = vec![0u8; payload.len()];
    assert_eq!(reader.read(&mut out), payload.len());
    assert_eq!(out, payload);
}
