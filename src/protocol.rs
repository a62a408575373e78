//! Shared protocol constants for the Stash wire protocol
//!
//! Every request starts with a tag string, followed by the fixed field
//! sequence that tag defines. Integers are big-endian.

use std::fmt;

/// Default daemon port
pub const DEFAULT_PORT: u16 = 4321;

/// Strings are prefixed with a u16 length, so this is a hard ceiling
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Default ceiling for a single upload/download payload (2GB)
pub const DEFAULT_MAX_TRANSFER_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Chunk size used when streaming file bytes
pub const CHUNK_SIZE: usize = 8 * 1024;

/// LIST_DIR status codes (sent as i32)
pub const LIST_OK: i32 = 0;
pub const LIST_EMPTY: i32 = 1;

/// Request tags. Wire spellings are kept compatible with existing clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    UploadSimple,
    Register,
    LoginCheck,
    Reload,
    ListDir,
    Download,
    RenameFile,
    UploadToUser,
    DeleteEntry,
    MakeDir,
    DeleteDir,
    RenameDir,
}

impl Tag {
    pub const ALL: [Tag; 12] = [
        Tag::UploadSimple,
        Tag::Register,
        Tag::LoginCheck,
        Tag::Reload,
        Tag::ListDir,
        Tag::Download,
        Tag::RenameFile,
        Tag::UploadToUser,
        Tag::DeleteEntry,
        Tag::MakeDir,
        Tag::DeleteDir,
        Tag::RenameDir,
    ];

    pub fn as_wire(self) -> &'static str {
        match self {
            Tag::UploadSimple => "SEND_FILE",
            Tag::Register => "ADD_USER",
            Tag::LoginCheck => "EXISTED_CONNECTION",
            Tag::Reload => "RELOAD_SERVER",
            Tag::ListDir => "LOAD_DIRECTORY",
            Tag::Download => "DOWNLOAD_FILE",
            Tag::RenameFile => "RENAME_FILE",
            Tag::UploadToUser => "UPLOAD_FILE",
            Tag::DeleteEntry => "DELETE_FILE_DIR_USER",
            Tag::MakeDir => "CREATE_NEW_DIR",
            Tag::DeleteDir => "DELETE_DIR",
            Tag::RenameDir => "RENAME_DIR",
        }
    }

    pub fn from_wire(s: &str) -> Option<Tag> {
        Tag::ALL.into_iter().find(|t| t.as_wire() == s)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

// Status strings written back to the client
pub mod status {
    // REGISTER
    pub const CONNECTION_SAVED: &str = "CONNECTION_SAVED";
    pub const USER_EXISTS: &str = "USER_EXISTS";
    pub const INVALID_USERNAME: &str = "INVALID_USERNAME";

    // LOGIN_CHECK
    pub const EXIST_USER: &str = "EXIST_USER";
    pub const INVALID_USER: &str = "INVALID_USER";

    // UPLOAD_SIMPLE
    pub const SUCCESS: &str = "SUCCESS";
    pub const ERROR: &str = "ERROR";

    // DOWNLOAD
    pub const FILE_FOUND: &str = "FILE_FOUND";
    pub const FILE_NOT_FOUND: &str = "FILE_NOT_FOUND";

    // UPLOAD_TO_USER
    pub const READY_TO_RECEIVE: &str = "READY_TO_RECEIVE";
    pub const UPLOAD_SUCCESS: &str = "UPLOAD_SUCCESS";
    pub const UPLOAD_FAILED: &str = "UPLOAD_FAILED";
    pub const PATH_NOT_FOUND: &str = "PATH_NOT_FOUND";

    // RENAME_FILE / RENAME_DIR
    pub const RENAME_SUCCESS: &str = "RENAME_SUCCESS";
    pub const RENAME_FAILED: &str = "RENAME_FAILED";
    pub const FOLDER_NOT_FOUND: &str = "FOLDER_NOT_FOUND";

    // DELETE_ENTRY / DELETE_DIR
    pub const DELETE_SUCCESS: &str = "DELETE_SUCCESS";
    pub const DELETE_FAILED: &str = "DELETE_FAILED";
    pub const NOT_FOUND: &str = "NOT_FOUND";

    // MAKE_DIR
    pub const CREATE_SUCCESS: &str = "CREATE_SUCCESS";
    pub const CREATE_FAILED: &str = "CREATE_FAILED";
    pub const PARENT_DIR_NOT_FOUND: &str = "PARENT_DIR_NOT_FOUND";

    // Account store or hashing failure
    pub const SERVER_ERROR: &str = "SERVER_ERROR";
}

// Centralized timeout defaults
pub mod timeouts {
    // Idle bound on any single socket read or write (s)
    pub const IDLE_SECS: u64 = 300;

    // How long shutdown waits for in-flight connections (s)
    pub const SHUTDOWN_GRACE_SECS: u64 = 10;
}
