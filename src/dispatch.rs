//! Request dispatch: one tag in, exactly one framed response out.
//!
//! Failures that map to a status string are answered and the connection
//! stays open. Errors returned from here (framing, transfer, task) close it.

use crate::accounts::CreateOutcome;
use crate::auth;
use crate::error::{ConnectionError, FsError, StoreError};
use crate::file_store::{EntryKind, FileStore};
use crate::protocol::{status, Tag, LIST_EMPTY, LIST_OK, MAX_STRING_LEN};
use crate::sandbox::single_component;
use crate::server::{Connection, ServerContext};
use crate::transfer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::spawn_blocking;
use tracing::{debug, error, warn};

type Result<T> = std::result::Result<T, ConnectionError>;

pub async fn dispatch<S>(ctx: &ServerContext, conn: &mut Connection<S>, tag: Tag) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    debug!(peer = conn.peer(), %tag, "dispatch");
    match tag {
        Tag::UploadSimple => upload_simple(ctx, conn).await,
        Tag::Register => register(ctx, conn).await,
        Tag::LoginCheck => login_check(ctx, conn).await,
        Tag::Reload => {
            ctx.console
                .log(&format!("Client requested to reload server: {}", conn.peer()));
            Ok(())
        }
        Tag::ListDir => list_dir(ctx, conn).await,
        Tag::Download => download(ctx, conn).await,
        Tag::RenameFile => rename(ctx, conn, EntryKind::File).await,
        Tag::RenameDir => rename(ctx, conn, EntryKind::Directory).await,
        Tag::UploadToUser => upload_to_user(ctx, conn).await,
        Tag::DeleteEntry => delete_entry(ctx, conn).await,
        Tag::DeleteDir => delete_dir(ctx, conn).await,
        Tag::MakeDir => make_dir(ctx, conn).await,
    }
}

async fn reply<S>(conn: &mut Connection<S>, s: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    conn.writer.write_string(s).await?;
    conn.writer.flush().await?;
    Ok(())
}

/// Run a FileStore call on the blocking pool
async fn with_files<T, F>(ctx: &ServerContext, f: F) -> Result<T>
where
    F: FnOnce(&FileStore) -> T + Send + 'static,
    T: Send + 'static,
{
    let files = ctx.files.clone();
    Ok(spawn_blocking(move || f(&files)).await?)
}

/// Pick the status for a FileStore failure. Escapes are reported to the
/// client exactly like a missing path.
fn fs_status(
    peer: &str,
    tag: Tag,
    err: &FsError,
    not_found: &'static str,
    failed: &'static str,
) -> &'static str {
    match err {
        FsError::PathEscape { path, reason } => {
            warn!(target: "stash::security", peer, %tag, path = %path, reason = %reason, "path escape rejected");
            not_found
        }
        FsError::NotFound(p) => {
            debug!(peer, %tag, path = %p.display(), "not found");
            not_found
        }
        FsError::AlreadyExists(_) | FsError::Io { .. } => {
            warn!(peer, %tag, error = %err, "filesystem operation failed");
            failed
        }
    }
}

async fn upload_simple<S>(ctx: &ServerContext, conn: &mut Connection<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let name = conn.reader.read_string().await?;
    let declared = conn.reader.read_u64().await?;
    ctx.console.log(&format!(
        "Receiving file: {} ({} bytes) from {}",
        name,
        declared,
        conn.peer()
    ));

    let bytes = transfer::receive(&mut conn.reader, declared, ctx.config.max_transfer_bytes).await?;
    let inbox = ctx.inbox.clone();
    let saved_name = name.clone();
    match spawn_blocking(move || inbox.save(&saved_name, &bytes)).await? {
        Ok(path) => {
            ctx.console
                .log(&format!("File received and saved to: {}", path.display()));
            ctx.console.notify_new_file(&name);
            reply(conn, status::SUCCESS).await
        }
        Err(e) => {
            let s = fs_status(conn.peer(), Tag::UploadSimple, &e, status::ERROR, status::ERROR);
            reply(conn, s).await
        }
    }
}

async fn register<S>(ctx: &ServerContext, conn: &mut Connection<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let username = conn.reader.read_string().await?;
    let password = conn.reader.read_string().await?;
    let email = conn.reader.read_string().await?;
    let email = (!email.is_empty()).then_some(email);

    // The username doubles as a directory name
    if single_component(&username).is_err() {
        warn!(target: "stash::security", peer = conn.peer(), username = %username, "registration with unusable username");
        return reply(conn, status::INVALID_USERNAME).await;
    }

    // Directory first: an account must never exist without its directory.
    // Creating it for a name that turns out to be taken is a no-op.
    let user = username.clone();
    if let Err(e) = with_files(ctx, move |f| f.ensure_user_root(&user)).await? {
        error!(user = %username, error = %e, "cannot create user directory");
        return reply(conn, status::SERVER_ERROR).await;
    }

    let accounts = ctx.accounts.clone();
    let user = username.clone();
    let outcome = spawn_blocking(move || -> std::result::Result<CreateOutcome, StoreError> {
        let digest = auth::hash_password(&password)?;
        accounts.create(&user, &digest, email.as_deref())
    })
    .await?;

    match outcome {
        Ok(CreateOutcome::Created) => {
            ctx.console.log(&format!(
                "Registered user {} from {}",
                username,
                conn.peer()
            ));
            reply(conn, status::CONNECTION_SAVED).await
        }
        Ok(CreateOutcome::AlreadyExists) => {
            ctx.console
                .log(&format!("Already existing user: {}", username));
            reply(conn, status::USER_EXISTS).await
        }
        Err(e) => {
            error!(user = %username, error = %e, "account store failure on register");
            reply(conn, status::SERVER_ERROR).await
        }
    }
}

async fn login_check<S>(ctx: &ServerContext, conn: &mut Connection<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let username = conn.reader.read_string().await?;
    let password = conn.reader.read_string().await?;

    let accounts = ctx.accounts.clone();
    let user = username.clone();
    match spawn_blocking(move || accounts.verify(&user, &password)).await? {
        Ok(true) => {
            ctx.console.log(&format!("User logged in: {}", username));
            reply(conn, status::EXIST_USER).await
        }
        Ok(false) => {
            ctx.console
                .log(&format!("Invalid user or password: {}", username));
            reply(conn, status::INVALID_USER).await
        }
        Err(e) => {
            error!(user = %username, error = %e, "account store failure on login");
            reply(conn, status::SERVER_ERROR).await
        }
    }
}

async fn list_dir<S>(ctx: &ServerContext, conn: &mut Connection<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let username = conn.reader.read_string().await?;
    ctx.console
        .log(&format!("User {} opened directory", username));

    let user = username.clone();
    let listing = match with_files(ctx, move |f| f.list(&user)).await? {
        Ok(entries) if !entries.is_empty() => match serde_json::to_string(&entries) {
            Ok(json) if json.len() <= MAX_STRING_LEN => Some(json),
            Ok(json) => {
                warn!(user = %username, bytes = json.len(), "listing too large for one frame");
                None
            }
            Err(e) => {
                error!(user = %username, error = %e, "listing serialization failed");
                None
            }
        },
        Ok(_) => None,
        Err(e) => {
            fs_status(conn.peer(), Tag::ListDir, &e, "", "");
            None
        }
    };

    match listing {
        Some(json) => {
            conn.writer.write_i32(LIST_OK).await?;
            conn.writer.write_string(&json).await?;
        }
        None => conn.writer.write_i32(LIST_EMPTY).await?,
    }
    conn.writer.flush().await?;
    Ok(())
}

async fn download<S>(ctx: &ServerContext, conn: &mut Connection<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let filename = conn.reader.read_string().await?;
    let username = conn.reader.read_string().await?;
    ctx.console.log(&format!(
        "Client requested download: {} from user: {}",
        filename, username
    ));

    let (user, name) = (username.clone(), filename.clone());
    let path = match with_files(ctx, move |f| f.file_for_read(&user, &name)).await? {
        Ok(p) => p,
        Err(e) => {
            let s = fs_status(conn.peer(), Tag::Download, &e, status::FILE_NOT_FOUND, status::FILE_NOT_FOUND);
            return reply(conn, s).await;
        }
    };
    // Open before announcing FILE_FOUND so a vanished file can still be reported
    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "open for download failed");
            return reply(conn, status::FILE_NOT_FOUND).await;
        }
    };

    conn.writer.write_string(status::FILE_FOUND).await?;
    let sent = transfer::send_file(&mut conn.writer, file, &path).await?;
    ctx.console
        .log(&format!("File sent: {} ({} bytes)", filename, sent));
    Ok(())
}

async fn upload_to_user<S>(ctx: &ServerContext, conn: &mut Connection<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let filename = conn.reader.read_string().await?;
    let username = conn.reader.read_string().await?;
    let declared = conn.reader.read_u64().await?;

    let limit = ctx.config.max_transfer_bytes;
    if declared > limit {
        return Err(crate::error::TransferError::TooLarge { declared, limit }.into());
    }
    let (user, name) = (username.clone(), filename.clone());
    if let Err(e) = with_files(ctx, move |f| f.file_for_write(&user, &name)).await? {
        let s = fs_status(conn.peer(), Tag::UploadToUser, &e, status::PATH_NOT_FOUND, status::PATH_NOT_FOUND);
        return reply(conn, s).await;
    }

    ctx.console.log(&format!(
        "Receiving file: {} ({} bytes) from user: {}",
        filename, declared, username
    ));
    reply(conn, status::READY_TO_RECEIVE).await?;

    let bytes = transfer::receive(&mut conn.reader, declared, limit).await?;
    let (user, name) = (username.clone(), filename.clone());
    match with_files(ctx, move |f| f.write(&user, &name, &bytes)).await? {
        Ok(path) => {
            ctx.console
                .log(&format!("File received and saved to: {}", path.display()));
            reply(conn, status::UPLOAD_SUCCESS).await
        }
        Err(e) => {
            let s = fs_status(conn.peer(), Tag::UploadToUser, &e, status::UPLOAD_FAILED, status::UPLOAD_FAILED);
            reply(conn, s).await
        }
    }
}

async fn rename<S>(ctx: &ServerContext, conn: &mut Connection<S>, kind: EntryKind) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let path = conn.reader.read_string().await?;
    let new_name = conn.reader.read_string().await?;
    let (tag, not_found) = match kind {
        EntryKind::File => (Tag::RenameFile, status::FILE_NOT_FOUND),
        EntryKind::Directory => (Tag::RenameDir, status::FOLDER_NOT_FOUND),
    };
    // A bad target name is a failed rename, not a missing source
    if single_component(&new_name).is_err() {
        warn!(target: "stash::security", peer = conn.peer(), %tag, new_name = %new_name, "rename target rejected");
        return reply(conn, status::RENAME_FAILED).await;
    }

    let (src, dst) = (path.clone(), new_name.clone());
    match with_files(ctx, move |f| f.rename(&src, &dst, kind)).await? {
        Ok(_) => {
            ctx.console
                .log(&format!("Renamed {} -> {}", path, new_name));
            reply(conn, status::RENAME_SUCCESS).await
        }
        Err(e) => {
            let s = fs_status(conn.peer(), tag, &e, not_found, status::RENAME_FAILED);
            reply(conn, s).await
        }
    }
}

async fn delete_entry<S>(ctx: &ServerContext, conn: &mut Connection<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let path = conn.reader.read_string().await?;
    let target = path.clone();
    match with_files(ctx, move |f| f.delete(&target)).await? {
        Ok(()) => {
            ctx.console.log(&format!("Deleted file or directory: {}", path));
            reply(conn, status::DELETE_SUCCESS).await
        }
        Err(e) => {
            let s = fs_status(conn.peer(), Tag::DeleteEntry, &e, status::NOT_FOUND, status::DELETE_FAILED);
            reply(conn, s).await
        }
    }
}

async fn delete_dir<S>(ctx: &ServerContext, conn: &mut Connection<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let path = conn.reader.read_string().await?;
    let target = path.clone();
    match with_files(ctx, move |f| f.delete_dir_recursive(&target)).await? {
        Ok(()) => {
            ctx.console.log(&format!("Deleted folder: {}", path));
            reply(conn, status::DELETE_SUCCESS).await
        }
        Err(e) => {
            let s = fs_status(conn.peer(), Tag::DeleteDir, &e, status::NOT_FOUND, status::DELETE_FAILED);
            reply(conn, s).await
        }
    }
}

async fn make_dir<S>(ctx: &ServerContext, conn: &mut Connection<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let username = conn.reader.read_string().await?;
    let name = conn.reader.read_string().await?;
    let (user, dir_name) = (username.clone(), name.clone());
    match with_files(ctx, move |f| f.make_dir(&user, &dir_name)).await? {
        Ok(dir) => {
            ctx.console
                .log(&format!("Directory created: {}", dir.display()));
            reply(conn, status::CREATE_SUCCESS).await
        }
        Err(e) => {
            let s = fs_status(
                conn.peer(),
                Tag::MakeDir,
                &e,
                status::PARENT_DIR_NOT_FOUND,
                status::CREATE_FAILED,
            );
            reply(conn, s).await
        }
    }
}
