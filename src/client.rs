//! Async client for the Stash protocol.
//!
//! One method per request tag. Status strings are returned as-is so callers
//! can compare them against [`crate::protocol::status`].

use crate::codec::{FrameReader, FrameWriter};
use crate::file_store::DirectoryEntry;
use crate::protocol::{status, Tag, DEFAULT_MAX_TRANSFER_BYTES, LIST_EMPTY, LIST_OK};
use crate::transfer;
use anyhow::{bail, Context, Result};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

pub async fn connect<A: ToSocketAddrs + std::fmt::Display>(addr: A) -> Result<TcpStream> {
    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("connect {}", addr))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Result of a download request
#[derive(Debug)]
pub enum Download {
    Found(Vec<u8>),
    NotFound,
}

/// Result of an upload to a user directory
#[derive(Debug, PartialEq, Eq)]
pub enum Upload {
    /// Server refused before any bytes were sent
    Refused(String),
    /// Server's verdict after receiving the bytes
    Done(String),
}

pub struct Client {
    reader: FrameReader<ReadHalf<TcpStream>>,
    writer: FrameWriter<WriteHalf<TcpStream>>,
    max_download: u64,
}

impl Client {
    pub async fn connect<A: ToSocketAddrs + std::fmt::Display>(addr: A) -> Result<Self> {
        let stream = connect(addr).await?;
        let (r, w) = tokio::io::split(stream);
        Ok(Self {
            reader: FrameReader::new(r),
            writer: FrameWriter::new(w),
            max_download: DEFAULT_MAX_TRANSFER_BYTES,
        })
    }

    /// Refuse downloads announcing more than `limit` bytes
    pub fn with_max_download(mut self, limit: u64) -> Self {
        self.max_download = limit;
        self
    }

    async fn request(&mut self, tag: Tag, fields: &[&str]) -> Result<()> {
        self.writer.write_tag(tag.as_wire()).await?;
        for f in fields {
            self.writer.write_string(f).await?;
        }
        Ok(())
    }

    async fn status(&mut self) -> Result<String> {
        self.writer.flush().await?;
        Ok(self.reader.read_string().await?)
    }

    /// Anonymous upload into the server's inbox
    pub async fn send_file(&mut self, name: &str, bytes: &[u8]) -> Result<String> {
        self.request(Tag::UploadSimple, &[name]).await?;
        self.writer.write_u64(bytes.len() as u64).await?;
        self.writer.write_bytes(bytes).await?;
        self.status().await
    }

    /// Empty `email` is sent as absent
    pub async fn register(&mut self, username: &str, password: &str, email: &str) -> Result<String> {
        self.request(Tag::Register, &[username, password, email]).await?;
        self.status().await
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<String> {
        self.request(Tag::LoginCheck, &[username, password]).await?;
        self.status().await
    }

    /// Fire-and-forget; the server sends nothing back
    pub async fn reload(&mut self) -> Result<()> {
        self.request(Tag::Reload, &[]).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn list_dir(&mut self, username: &str) -> Result<Vec<DirectoryEntry>> {
        self.request(Tag::ListDir, &[username]).await?;
        self.writer.flush().await?;
        match self.reader.read_i32().await? {
            LIST_OK => {
                let json = self.reader.read_string().await?;
                serde_json::from_str(&json).context("decode directory listing")
            }
            LIST_EMPTY => Ok(Vec::new()),
            other => bail!("unexpected listing status {}", other),
        }
    }

    pub async fn download(&mut self, filename: &str, username: &str) -> Result<Download> {
        self.request(Tag::Download, &[filename, username]).await?;
        let s = self.status().await?;
        if s != status::FILE_FOUND {
            return Ok(Download::NotFound);
        }
        let len = self.reader.read_u64().await?;
        let bytes = transfer::receive(&mut self.reader, len, self.max_download).await?;
        Ok(Download::Found(bytes))
    }

    pub async fn upload(&mut self, filename: &str, username: &str, bytes: &[u8]) -> Result<Upload> {
        self.request(Tag::UploadToUser, &[filename, username]).await?;
        self.writer.write_u64(bytes.len() as u64).await?;
        let s = self.status().await?;
        if s != status::READY_TO_RECEIVE {
            return Ok(Upload::Refused(s));
        }
        self.writer.write_bytes(bytes).await?;
        Ok(Upload::Done(self.status().await?))
    }

    /// `path` is `<username>/<relative path>`, as reported by [`Client::list_dir`]
    pub async fn rename_file(&mut self, path: &str, new_name: &str) -> Result<String> {
        self.request(Tag::RenameFile, &[path, new_name]).await?;
        self.status().await
    }

    pub async fn rename_dir(&mut self, path: &str, new_name: &str) -> Result<String> {
        self.request(Tag::RenameDir, &[path, new_name]).await?;
        self.status().await
    }

    pub async fn delete(&mut self, path: &str) -> Result<String> {
        self.request(Tag::DeleteEntry, &[path]).await?;
        self.status().await
    }

    pub async fn delete_dir(&mut self, path: &str) -> Result<String> {
        self.request(Tag::DeleteDir, &[path]).await?;
        self.status().await
    }

    pub async fn make_dir(&mut self, username: &str, name: &str) -> Result<String> {
        self.request(Tag::MakeDir, &[username, name]).await?;
        self.status().await
    }

    /// Write raw bytes outside of any request
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_bytes(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Half-close and wait for the server to close its side. Returns any
    /// bytes the server still sent.
    pub async fn finish(self) -> Result<Vec<u8>> {
        let Client {
            reader, mut writer, ..
        } = self;
        // The server may already have closed; reading tells us what it sent
        let _ = writer.shutdown().await;
        let mut rest = Vec::new();
        let mut inner = reader.into_inner();
        tokio::io::AsyncReadExt::read_to_end(&mut inner, &mut rest).await?;
        Ok(rest)
    }
}
