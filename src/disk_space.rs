/// Free-space probing for the `DISK_DATA_BUFFER_SIZE` admission checks used
/// by `add_chunk` and the sync scheduler's space timer (§4.2, §4.4).
use std::path::Path;

use fs2::available_space;

pub fn free_bytes(path: &Path) -> u64 {
    available_space(path).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_bytes_of_an_existing_directory_is_nonzero() {
        let dir = std::env::temp_dir();
        assert!(free_bytes(&dir) > 0);
    }

    #[test]
    fn free_bytes_of_a_missing_path_defaults_to_zero() {
        let bogus = Path::new("/this/path/does/not/exist/hopefully");
        assert_eq!(free_bytes(bogus), 0);
    }
}
