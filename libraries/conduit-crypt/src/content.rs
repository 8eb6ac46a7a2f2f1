use std::io::{self, Read};
use std::path::Path;

/// MD5 digest of a byte slice, rendered as 32 lowercase hex characters.
///
/// Assets are content-addressed by this digest. MD5 is a naming scheme here,
/// not an integrity guarantee against an adversary holding upload rights.
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Streaming MD5 of a file on disk.
pub fn file_md5(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut ctx = md5::Context::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{file_md5, md5_hex};

    #[test]
    fn known_digests() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"hello world"), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn file_digest_matches_buffer_digest() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(b"hello world").expect("write");
        let digest = file_md5(file.path()).expect("hash file");
        assert_eq!(digest, md5_hex(b"hello world"));
    }
}
