//! Shared protocol constants for the ferry line protocol

// Listening port used when no bind address is configured
pub const DEFAULT_PORT: u16 = 8080;

// Hard cap on a single command/response line; longer lines are truncated
pub const MAX_LINE_LEN: usize = 16 * 1024;

// Chunk size for streaming file bodies in both directions
pub const CHUNK_SIZE: usize = 8192;

// Pending connections the listener queues before refusing
pub const DEFAULT_BACKLOG: u32 = 10;

// Concurrent connection handlers admitted before new peers are turned away
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

// Body sent for LIST when the shared root holds no files
pub const EMPTY_LIST: &str = "(no files)\n";

// Command verbs
pub mod verb {
    pub const LIST: &str = "LIST";
    pub const DOWNLOAD: &str = "DOWNLOAD";
    pub const UPLOAD: &str = "UPLOAD";
    pub const EXIT: &str = "EXIT";
}

// Response header prefixes (each followed by a space and a decimal byte count)
pub mod header {
    pub const FILESIZE: &str = "FILESIZE";
    pub const LISTSIZE: &str = "LISTSIZE";
}

// Complete response lines. Keep the text stable: clients match on it.
pub mod reply {
    pub const UPLOADED: &str = "OK Uploaded";
    pub const ERR_LIST_DIR: &str = "ERROR Cannot open directory";
    pub const ERR_INVALID_NAME: &str = "ERROR Invalid filename";
    pub const ERR_NOT_FOUND: &str = "ERROR File not found";
    pub const ERR_OPEN: &str = "ERROR Cannot open file";
    pub const ERR_UPLOAD_HEADER: &str = "ERROR Invalid UPLOAD header";
    pub const ERR_CREATE: &str = "ERROR Cannot create file";
    pub const ERR_WRITE: &str = "ERROR Cannot write file";
    pub const ERR_RENAME: &str = "ERROR Server rename failed";
    pub const ERR_UNKNOWN: &str = "ERROR Unknown command";
    pub const ERR_BUSY: &str = "ERROR Server busy";

    /// Prefix shared by every error line.
    pub const ERROR_PREFIX: &str = "ERROR";
}

// Centralized timeout defaults for server and client
pub mod timeouts {
    // Max wait for the next command line on an idle connection (s)
    pub const IDLE_SECS: u64 = 300;

    // Max stall for a single read or write while a transfer is in flight (s)
    pub const IO_SECS: u64 = 30;

    // Connection establishment timeout for the client (ms)
    pub const CONNECT_MS: u64 = 5_000;
}

/// Temp-file name an upload of `name` is staged under inside the root.
pub fn part_name(name: &str) -> String {
    format!(".{name}.part")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_name_is_hidden() {
        assert_eq!(part_name("report.pdf"), ".report.pdf.part");
        assert!(part_name("x").starts_with('.'));
    }

    #[test]
    fn error_lines_share_prefix() {
        for line in [
            reply::ERR_LIST_DIR,
            reply::ERR_INVALID_NAME,
            reply::ERR_NOT_FOUND,
            reply::ERR_OPEN,
            reply::ERR_UPLOAD_HEADER,
            reply::ERR_CREATE,
            reply::ERR_WRITE,
            reply::ERR_RENAME,
            reply::ERR_UNKNOWN,
            reply::ERR_BUSY,
        ] {
            assert!(line.starts_with(reply::ERROR_PREFIX));
        }
    }
}
