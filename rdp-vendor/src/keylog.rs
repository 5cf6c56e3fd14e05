//! NSS-format TLS key-log sink, per spec §6 ("TLS key-log file").

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use log::warn;
use rustls::KeyLog;

/// Appends one NSS key-log line per key derivation event to a fixed path.
/// Writes are serialized with an internal lock; concurrent writers across
/// processes are not made atomic, matching spec §6's stated guarantee.
#[derive(Debug)]
pub struct NssKeyLogWriter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl NssKeyLogWriter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }
}

impl KeyLog for NssKeyLogWriter {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let line = format!(
            "{label} {} {}\n",
            hex_encode(client_random),
            hex_encode(secret)
        );
        let file = OpenOptions::new().create(true).append(true).open(&self.path);
        match file {
            Ok(mut f) => {
                if let Err(e) = f.write_all(line.as_bytes()) {
                    warn!("failed to append TLS key-log line: {e}");
                }
            }
            Err(e) => warn!("failed to open TLS key-log file {:?}: {e}", self.path),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn hex_encode_matches_known_vector() {
        assert_eq!(hex_encode(&[0xde, 0xad, 0xbe, 0xef]), "deadbeef");
    }

    #[test]
    fn hex_encode_empty_is_empty_string() {
        assert_eq!(hex_encode(&[]), "");
    }

    #[test]
    fn log_appends_a_line_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keylog.txt");
        let writer = NssKeyLogWriter::new(path.clone());
        writer.log("CLIENT_RANDOM", &[1, 2, 3], &[4, 5, 6]);

        let mut contents = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "CLIENT_RANDOM 010203 040506\n");
    }

    #[test]
    fn log_appends_multiple_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keylog.txt");
        let writer = NssKeyLogWriter::new(path.clone());
        writer.log("CLIENT_RANDOM", &[1], &[2]);
        writer.log("SERVER_HANDSHAKE_TRAFFIC_SECRET", &[3], &[4]);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
