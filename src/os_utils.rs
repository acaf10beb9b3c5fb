//! Utilities pertaining to filesystem and other os-level settings
//!

use std::fs::File;
use std::io::{BufRead, BufReader, Read};

use camino::Utf8Path;
use flate2::read::MultiGzDecoder;
use simple_error::{SimpleResult, try_with};

/// Leading bytes of every gzip member
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Create a novel directory path if it does not exist already
///
/// If the directory already exists no operations are performed
///
/// * `label` - used to describe the error directory in an error message
///
pub fn create_dir_all(dir: &Utf8Path, label: &str) {
    if !dir.is_dir() {
        match std::fs::create_dir_all(dir) {
            Ok(_) => {}
            Err(e) => {
                panic!("Can't create new {} directory at '{}': {}", label, dir, e);
            }
        }
    }
}

/// Get a line reader for either a gzip-compressed or plain text file
///
/// Compression is detected from the leading bytes of the file rather than the file extension, and
/// bgzip files are read through as a series of gzip members.
///
/// * `label` - used to describe the file type in an error message
///
pub fn get_dynamic_reader(filename: &Utf8Path, label: &str) -> SimpleResult<Box<dyn BufRead>> {
    let mut file = try_with!(
        File::open(filename),
        "Unable to open {} file: '{}'",
        label,
        filename
    );

    let mut magic = [0u8; 2];
    let magic_len = try_with!(
        file.read(&mut magic),
        "Unable to read from {} file: '{}'",
        label,
        filename
    );
    let file = try_with!(
        File::open(filename),
        "Unable to open {} file: '{}'",
        label,
        filename
    );

    let reader: Box<dyn BufRead> = if magic_len == 2 && magic == GZIP_MAGIC {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use flate2::{Compression, write::GzEncoder};
    use std::io::Write;

    fn read_all_lines(filename: &Utf8Path) -> Vec<String> {
        get_dynamic_reader(filename, "test")
            .unwrap()
            .lines()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_dynamic_reader() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let plain = dir.join("plain.txt");
        std::fs::write(&plain, "a\tb\nc\n").unwrap();
        assert_eq!(read_all_lines(&plain), vec!["a\tb", "c"]);

        // No extension is needed to detect compression
        let compressed = dir.join("compressed.data");
        let mut encoder = GzEncoder::new(File::create(&compressed).unwrap(), Compression::default());
        encoder.write_all(b"x\ny\n").unwrap();
        encoder.finish().unwrap();
        assert_eq!(read_all_lines(&compressed), vec!["x", "y"]);

        let empty = dir.join("empty.txt");
        std::fs::write(&empty, "").unwrap();
        assert!(read_all_lines(&empty).is_empty());

        assert!(get_dynamic_reader(&dir.join("missing.txt"), "test").is_err());
    }
}
